//! Entry point for routing a client write batch through the cluster.

use crate::core::{ErrorCode, Status};
use crate::exec::{BatchAbort, BatchWriteExec, BatchWriteExecStats, ExecutionContext};
use crate::ops::BatchedCommandResponse;
use crate::ops::BatchedCommandRequest;
use crate::routing::{ChunkManagerTargeter, Epoch, NsTargeter};
use log::{debug, warn};

pub struct ClusterWriter;

impl ClusterWriter {
    /// Routes `request` to the shards owning its documents.
    ///
    /// `target_epoch` pins the collection incarnation the caller resolved
    /// earlier; a recreated collection then fails with `StaleEpoch` instead
    /// of silently writing into the new one.
    pub async fn write(
        ctx: &ExecutionContext,
        request: &BatchedCommandRequest,
        stats: &mut BatchWriteExecStats,
        target_epoch: Option<Epoch>,
    ) -> Result<BatchedCommandResponse, BatchAbort> {
        let ns = &request.namespace;
        if ns.is_admin_db() {
            return Ok(BatchedCommandResponse::from_status(Status::new(
                ErrorCode::InvalidNamespace,
                format!("writes to {} are not routed through shards", ns),
            )));
        }

        let mut targeter = ChunkManagerTargeter::new(ns.clone(), ctx.catalog_cache.clone());
        if let Some(epoch) = target_epoch {
            targeter = targeter.with_target_epoch(epoch);
        }

        let initialized = match targeter.init().await {
            Ok(()) => targeter.target_collection().map(|_| ()),
            Err(status) => Err(status),
        };
        if let Err(status) = initialized {
            warn!("Unable to initialize targeter for {}: {}", ns, status);
            return Ok(BatchedCommandResponse::from_status(status.with_context(format!(
                "unable to initialize targeter for write op for collection {}",
                ns
            ))));
        }

        debug!("Routing {} write ops into {}", request.len(), ns);
        BatchWriteExec::execute_batch(ctx, &mut targeter, request, stats).await
    }
}
