use super::context::ExecutionContext;
use super::stats::BatchWriteExecStats;
use crate::core::{ErrorCode, HostAndPort, ReadPreference, ShardId, Status};
use crate::ops::{BatchedCommandRequest, BatchedCommandResponse, WriteErrorDetail};
use crate::routing::{NsTargeter, ShardEndpoint, StaleConfigInfo};
use crate::sender::{RetryPolicy, ShardRequestSender, ShardResponse};
use crate::txn::{TRANSIENT_TRANSACTION_ERROR_LABEL, is_transient_transaction_error};
use crate::write_ops::{
    BatchWriteOp, ChildBatches, ShardError, TargetedWriteBatch, TrackedErrors, WriteOpState,
};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{Instrument, Level, event, info_span};

/// Failure that ends the surrounding transaction instead of producing a
/// client reply. The caller must abort the transaction; it may be retried
/// from the start.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchAbort {
    #[error("transaction aborted by transient error: {0}")]
    TransientTransaction(Status),
}

impl BatchAbort {
    pub fn status(&self) -> &Status {
        match self {
            BatchAbort::TransientTransaction(status) => status,
        }
    }

    /// Top-level error reply labelled as retryable transaction failure.
    pub fn to_response(&self) -> BatchedCommandResponse {
        BatchedCommandResponse::from_status(self.status().clone())
            .with_error_label(TRANSIENT_TRANSACTION_ERROR_LABEL)
    }
}

/// How handling one shard reply left the batch.
enum ReplyOutcome {
    Continue,
    /// The transaction failed; the batch is closed and no further replies
    /// are consumed.
    TransactionAborted,
}

/// Stale routing errors that point the targeter at newer metadata.
const STALE_CODES: [ErrorCode; 2] = [ErrorCode::StaleShardVersion, ErrorCode::StaleConfig];

/// Drives one client write batch to completion: targets, dispatches child
/// batches concurrently, folds replies back, refreshes routing metadata and
/// gives up once rounds stop making progress.
pub struct BatchWriteExec;

impl BatchWriteExec {
    /// Executes `request` against the shards chosen by `targeter`.
    ///
    /// Per-op failures end up in the returned reply's write errors. Only a
    /// transient failure inside a transaction escapes as [`BatchAbort`].
    pub async fn execute_batch(
        ctx: &ExecutionContext,
        targeter: &mut dyn NsTargeter,
        request: &BatchedCommandRequest,
        stats: &mut BatchWriteExecStats,
    ) -> Result<BatchedCommandResponse, BatchAbort> {
        let span = info_span!(
            "batch_write_exec",
            ns = %request.namespace,
            size = request.len(),
            ordered = request.ordered,
            in_transaction = ctx.in_transaction()
        );
        Self::run_rounds(ctx, targeter, request, stats)
            .instrument(span)
            .await
    }

    async fn run_rounds(
        ctx: &ExecutionContext,
        targeter: &mut dyn NsTargeter,
        request: &BatchedCommandRequest,
        stats: &mut BatchWriteExecStats,
    ) -> Result<BatchedCommandResponse, BatchAbort> {
        let mut batch_op = BatchWriteOp::new(ctx, request);
        let retry_policy = if ctx.is_retryable_write() {
            RetryPolicy::Idempotent
        } else {
            RetryPolicy::NoRetry
        };

        let mut rounds = 0u32;
        let mut refreshed_targeter = false;
        let mut completed_ops_last_round = 0usize;
        let mut rounds_without_progress = 0u32;

        while !batch_op.is_finished() {
            // Target errors are only blamed on ops once the targeter had a
            // chance to refresh.
            let child_batches = match batch_op.target_batch(&*targeter, refreshed_targeter) {
                Ok(batches) => batches,
                Err(status) => {
                    event!(Level::DEBUG, error = %status, "targeting failed");
                    targeter.note_could_not_target();
                    refreshed_targeter = true;
                    stats.num_target_errors += 1;

                    if ctx.in_transaction() {
                        batch_op.forget_targeted_batches_on_transaction_aborting_error();
                        if is_transient_transaction_error(status.code, false, false) {
                            return Err(BatchAbort::TransientTransaction(
                                status.with_context("Encountered targeting error during a transaction"),
                            ));
                        }
                        break;
                    }
                    ChildBatches::new()
                }
            };

            let outcome = Self::dispatch_child_batches(
                ctx,
                targeter,
                request,
                &mut batch_op,
                child_batches,
                retry_policy,
                stats,
            )
            .await?;

            rounds += 1;
            stats.num_rounds += 1;

            if matches!(outcome, ReplyOutcome::TransactionAborted) || batch_op.is_finished() {
                break;
            }

            let metadata_changed = match targeter.refresh_if_needed().await {
                Ok(changed) => changed,
                Err(status) => {
                    event!(
                        Level::WARN,
                        error = %status,
                        "could not refresh targeter, continuing with cached routing"
                    );
                    false
                }
            };

            let completed = batch_op.num_write_ops_in(WriteOpState::Completed);
            if completed == completed_ops_last_round && !metadata_changed {
                rounds_without_progress += 1;
            } else {
                rounds_without_progress = 0;
            }
            completed_ops_last_round = completed;
            event!(
                Level::DEBUG,
                round = rounds,
                completed,
                metadata_changed,
                rounds_without_progress,
                "write round finished"
            );

            let max_rounds = ctx.config.max_rounds_without_progress;
            if rounds_without_progress > max_rounds {
                let status = Status::new(
                    ErrorCode::NoProgressMade,
                    format!(
                        "no progress was made executing batch write op in {} after {} rounds \
                         ({} ops completed in {} rounds total)",
                        request.namespace, max_rounds, completed, rounds
                    ),
                );
                batch_op.abort_batch(&WriteErrorDetail::from_status(status));
                break;
            }
        }

        Ok(batch_op.build_client_response())
    }

    /// Sends every child batch, at most one per shard at a time, and folds
    /// each reply in as it arrives.
    async fn dispatch_child_batches(
        ctx: &ExecutionContext,
        targeter: &mut dyn NsTargeter,
        request: &BatchedCommandRequest,
        batch_op: &mut BatchWriteOp<'_>,
        mut child_batches: ChildBatches,
        retry_policy: RetryPolicy,
        stats: &mut BatchWriteExecStats,
    ) -> Result<ReplyOutcome, BatchAbort> {
        while !child_batches.is_empty() {
            let mut in_flight: HashMap<ShardId, ShardEndpoint> = HashMap::new();
            let mut requests = Vec::new();

            for (endpoint, batch) in &child_batches {
                if in_flight.contains_key(&endpoint.shard) {
                    continue;
                }
                let mut command = batch_op.build_batch_request(batch, ctx.is_retryable_write());
                ctx.session.attach(&mut command);
                if let Some(router) = ctx.transaction_router() {
                    router.attach_txn_fields(&endpoint.shard, &mut command);
                }

                event!(
                    Level::DEBUG,
                    endpoint = %endpoint,
                    ops = batch.len(),
                    "sending child batch"
                );
                stats.note_targeted_shard(&endpoint.shard);
                in_flight.insert(endpoint.shard.clone(), endpoint.clone());
                requests.push((endpoint.shard.clone(), Value::Object(command)));
            }

            let mut sender = ShardRequestSender::new(
                ctx,
                &request.namespace.db,
                requests,
                ReadPreference::Primary,
                retry_policy,
            );

            while let Some(response) = sender.next().await {
                let Some(endpoint) = in_flight.remove(&response.shard_id) else {
                    continue;
                };
                let Some(batch) = child_batches.remove(&endpoint) else {
                    continue;
                };

                let outcome =
                    Self::note_shard_response(ctx, targeter, request, batch_op, &batch, response, stats)
                        .await?;
                if matches!(outcome, ReplyOutcome::TransactionAborted) {
                    return Ok(ReplyOutcome::TransactionAborted);
                }
            }
        }
        Ok(ReplyOutcome::Continue)
    }

    async fn note_shard_response(
        ctx: &ExecutionContext,
        targeter: &mut dyn NsTargeter,
        request: &BatchedCommandRequest,
        batch_op: &mut BatchWriteOp<'_>,
        batch: &TargetedWriteBatch,
        response: ShardResponse,
        stats: &mut BatchWriteExecStats,
    ) -> Result<ReplyOutcome, BatchAbort> {
        let ShardResponse {
            shard_id,
            shard_host,
            sw_response,
        } = response;

        let Some(host) = shard_host else {
            let status = sw_response.err().unwrap_or_else(|| {
                Status::new(
                    ErrorCode::HostUnreachable,
                    format!("no host available for shard {}", shard_id),
                )
            });
            event!(Level::DEBUG, shard = %shard_id, error = %status, "no host for child batch");
            batch_op.note_batch_error(
                batch,
                &WriteErrorDetail::from_status(
                    status.with_context(format!("Could not find host for shard {}", shard_id)),
                ),
            );
            return Ok(ReplyOutcome::Continue);
        };

        let parsed = sw_response.and_then(|reply| BatchedCommandResponse::parse(&reply));
        let shard_response = match parsed {
            Ok(shard_response) => shard_response,
            Err(status) => return Self::note_dispatch_failure(ctx, batch_op, batch, &host, status),
        };

        event!(
            Level::DEBUG,
            host = %host,
            n = shard_response.n,
            write_errors = shard_response.write_errors.len(),
            "child batch reply received"
        );

        let mut tracked = TrackedErrors::new();
        for code in STALE_CODES {
            tracked.start_tracking(code);
        }
        tracked.start_tracking(ErrorCode::CannotImplicitlyCreateCollection);
        batch_op.note_batch_response(batch, &shard_response, Some(&mut tracked));

        if ctx.in_transaction() {
            let status = shard_response.to_status();
            if !status.is_ok() && status.code != ErrorCode::WouldChangeOwningShard {
                batch_op.forget_targeted_batches_on_transaction_aborting_error();
                if shard_response.has_error_label(TRANSIENT_TRANSACTION_ERROR_LABEL) {
                    return Err(BatchAbort::TransientTransaction(status.with_context(format!(
                        "Encountered error from {} during a transaction",
                        host
                    ))));
                }
                return Ok(ReplyOutcome::TransactionAborted);
            }
        }

        let stale_errors: Vec<&ShardError> = STALE_CODES
            .iter()
            .flat_map(|code| tracked.errors(*code))
            .collect();
        if !stale_errors.is_empty() {
            for stale in &stale_errors {
                let info = StaleConfigInfo::parse(stale.error.status.extra_info.as_ref());
                targeter.note_stale_response(&stale.endpoint, &info);
            }
            stats.num_stale_batches += 1;
            event!(
                Level::DEBUG,
                host = %host,
                errors = stale_errors.len(),
                "stale routing reported by shard"
            );
        }

        if !tracked
            .errors(ErrorCode::CannotImplicitlyCreateCollection)
            .is_empty()
        {
            targeter.note_could_not_target();
            ctx.catalog_cache
                .invalidate_database_entry(&request.namespace.db)
                .await;
        }

        // Replies without an opTime still record the host at the zero position.
        stats.note_write_at(
            &host,
            shard_response.last_op.unwrap_or_default(),
            shard_response.election_id.clone().unwrap_or_default(),
        );

        Ok(ReplyOutcome::Continue)
    }

    /// The request reached `host` but no usable reply came back.
    fn note_dispatch_failure(
        ctx: &ExecutionContext,
        batch_op: &mut BatchWriteOp<'_>,
        batch: &TargetedWriteBatch,
        host: &HostAndPort,
        status: Status,
    ) -> Result<ReplyOutcome, BatchAbort> {
        let status = status.with_context(format!("Write results unavailable from {}", host));
        event!(Level::DEBUG, host = %host, error = %status, "child batch failed");
        batch_op.note_batch_error(batch, &WriteErrorDetail::from_status(status.clone()));

        if ctx.in_transaction() {
            batch_op.forget_targeted_batches_on_transaction_aborting_error();
            if is_transient_transaction_error(status.code, false, false) {
                return Err(BatchAbort::TransientTransaction(status));
            }
            return Ok(ReplyOutcome::TransactionAborted);
        }
        Ok(ReplyOutcome::Continue)
    }
}
