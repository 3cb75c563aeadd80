use super::targeted::{ShardError, ShardWcError, TargetedWrite, TargetedWriteBatch, TrackedErrors};
use super::write_op::{WriteOp, WriteOpState};
use crate::config::WriteExecConfig;
use crate::core::{ErrorCode, ShardId, Status};
use crate::exec::ExecutionContext;
use crate::ops::{
    BatchType, BatchedCommandRequest, BatchedCommandResponse, UpsertDetail,
    WriteConcernErrorDetail, WriteErrorDetail,
};
use crate::routing::{NsTargeter, ShardEndpoint};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};

/// Child batches produced by one targeting pass, one per endpoint.
pub type ChildBatches = BTreeMap<ShardEndpoint, TargetedWriteBatch>;

#[derive(Debug, Default, Clone, Copy)]
struct BatchSize {
    ops: usize,
    bytes: usize,
}

/// State machine of one client write batch across rounds.
///
/// Owns one [`WriteOp`] per client operation, splits pending ops into
/// per-endpoint child batches, folds shard replies back into the ops and
/// assembles the final client reply.
pub struct BatchWriteOp<'a> {
    request: &'a BatchedCommandRequest,
    write_ops: Vec<WriteOp>,
    in_transaction: bool,
    max_batch_ops: usize,
    max_batch_bytes: usize,
    aborted: bool,
    wc_errors: Vec<ShardWcError>,
    upserted: Vec<UpsertDetail>,
    num_inserted: i64,
    num_upserted: i64,
    num_matched: i64,
    num_modified: Option<i64>,
    num_deleted: i64,
}

impl<'a> BatchWriteOp<'a> {
    pub fn new(ctx: &ExecutionContext, request: &'a BatchedCommandRequest) -> Self {
        Self::with_config(request, &ctx.config, ctx.in_transaction())
    }

    pub fn with_config(
        request: &'a BatchedCommandRequest,
        config: &WriteExecConfig,
        in_transaction: bool,
    ) -> Self {
        Self {
            request,
            write_ops: (0..request.len())
                .map(|index| WriteOp::new(index, in_transaction))
                .collect(),
            in_transaction,
            max_batch_ops: config.max_write_batch_size,
            max_batch_bytes: config.max_batch_size_bytes,
            aborted: false,
            wc_errors: Vec::new(),
            upserted: Vec::new(),
            num_inserted: 0,
            num_upserted: 0,
            num_matched: 0,
            num_modified: Some(0),
            num_deleted: 0,
        }
    }

    pub fn write_op(&self, index: usize) -> &WriteOp {
        &self.write_ops[index]
    }

    /// Targets every pending op and groups the child writes by endpoint.
    ///
    /// With `record_target_errors == false` a targeting failure cancels the
    /// whole pass and is returned, so the caller can refresh and retry
    /// before blaming the op. Ordered batches never mix endpoints in one pass.
    pub fn target_batch(
        &mut self,
        targeter: &dyn NsTargeter,
        record_target_errors: bool,
    ) -> Result<ChildBatches, Status> {
        let request = self.request;
        let ordered = request.ordered;
        let mut batches = ChildBatches::new();
        let mut sizes: HashMap<ShardId, BatchSize> = HashMap::new();

        for index in 0..self.write_ops.len() {
            if self.write_ops[index].state() != WriteOpState::Pending {
                continue;
            }
            let item = request.item(index);

            let writes = match self.write_ops[index].target_writes(targeter, item) {
                Ok(writes) => writes,
                Err(status) => {
                    if self.in_transaction {
                        self.write_ops[index].set_op_error(status.clone());
                        self.cancel_batches(&batches);
                        return Err(status);
                    }
                    if !record_target_errors {
                        self.cancel_batches(&batches);
                        return Err(status);
                    }
                    if !ordered || batches.is_empty() {
                        self.write_ops[index].set_op_error(status);
                        if ordered {
                            // An ordered batch stops at its first error.
                            return Ok(batches);
                        }
                        continue;
                    }
                    // Send what precedes the failure; the op is retargeted next round.
                    break;
                }
            };

            if ordered
                && !batches.is_empty()
                && writes.iter().any(|w| !batches.contains_key(&w.endpoint))
            {
                self.write_ops[index].cancel_writes();
                break;
            }

            let size = item.estimated_size();
            if self.would_exceed_limits(&writes, size, &sizes) {
                self.write_ops[index].cancel_writes();
                break;
            }

            for write in writes {
                let entry = sizes.entry(write.endpoint.shard.clone()).or_default();
                entry.ops += 1;
                entry.bytes += size;
                batches
                    .entry(write.endpoint.clone())
                    .or_insert_with(|| TargetedWriteBatch::new(write.endpoint.clone()))
                    .add_write(write, size);
            }

            if ordered && batches.len() > 1 {
                break;
            }
        }

        Ok(batches)
    }

    /// True if adding a write of `size` bytes overflows a shard's batch.
    /// The first write for a shard always fits.
    fn would_exceed_limits(
        &self,
        writes: &[TargetedWrite],
        size: usize,
        sizes: &HashMap<ShardId, BatchSize>,
    ) -> bool {
        writes.iter().any(|write| match sizes.get(&write.endpoint.shard) {
            Some(current) if current.ops > 0 => {
                current.ops >= self.max_batch_ops
                    || current.bytes + size > self.max_batch_bytes
            }
            _ => false,
        })
    }

    fn cancel_batches(&mut self, batches: &ChildBatches) {
        for batch in batches.values() {
            for write in batch.writes() {
                self.write_ops[write.op_index].cancel_writes();
            }
        }
    }

    /// Serializes a child batch as a shard write command.
    ///
    /// Carries the batch's items, the endpoint's `shardVersion` and, for
    /// retryable writes, the client indices as `stmtIds`. Session and
    /// transaction fields are attached by the caller.
    pub fn build_batch_request(
        &self,
        batch: &TargetedWriteBatch,
        retryable_write: bool,
    ) -> Map<String, Value> {
        let indices: Vec<usize> = batch.writes().iter().map(|w| w.op_index).collect();
        let mut command = self
            .request
            .to_command_for_items(&indices, !self.in_transaction);
        command.insert(
            "shardVersion".to_string(),
            batch.endpoint().shard_version.to_json(),
        );
        if retryable_write {
            command.insert("stmtIds".to_string(), json!(indices));
        }
        command
    }

    /// Folds a shard reply into the ops of `batch`.
    ///
    /// A command-level failure fails the batch's writes as a whole. Item
    /// errors are mapped back to client indices; in ordered batches every
    /// write after the first error was not executed and returns to `Pending`.
    pub fn note_batch_response(
        &mut self,
        batch: &TargetedWriteBatch,
        response: &BatchedCommandResponse,
        mut tracked: Option<&mut TrackedErrors>,
    ) {
        if !response.is_ok() {
            self.note_batch_error(batch, &WriteErrorDetail::from_status(response.status.clone()));
            return;
        }

        self.inc_batch_stats(batch, response);

        if let Some(wc) = &response.write_concern_error {
            self.wc_errors.push(ShardWcError {
                endpoint: batch.endpoint().clone(),
                error: wc.clone(),
            });
        }

        let mut item_errors: Vec<&WriteErrorDetail> = response.write_errors.iter().collect();
        item_errors.sort_by_key(|e| e.index);
        let mut item_errors = item_errors.into_iter().peekable();
        let ordered = self.request.ordered;
        let mut first_error_at: Option<usize> = None;

        for (position, write) in batch.writes().iter().enumerate() {
            while item_errors.peek().is_some_and(|e| e.index < position) {
                item_errors.next();
            }

            if ordered && first_error_at.is_some() {
                self.write_ops[write.op_index].cancel_writes();
                continue;
            }

            match item_errors.next_if(|e| e.index == position) {
                Some(shard_error) => {
                    let error = WriteErrorDetail::new(write.op_index, shard_error.status.clone());
                    if let Some(tracked) = tracked.as_deref_mut() {
                        if tracked.is_tracking(error.code()) {
                            tracked.add_error(ShardError {
                                endpoint: batch.endpoint().clone(),
                                error: error.clone(),
                            });
                        }
                    }
                    self.write_ops[write.op_index].note_write_error(write.child_index, error);
                    first_error_at.get_or_insert(position);
                }
                None => self.write_ops[write.op_index].note_write_complete(write.child_index),
            }
        }
    }

    /// Fails a whole child batch, e.g. when no reply could be obtained.
    ///
    /// Ordered batches blame only the first write; the rest are retried.
    pub fn note_batch_error(&mut self, batch: &TargetedWriteBatch, error: &WriteErrorDetail) {
        let num_errors = if self.request.ordered {
            1
        } else {
            batch.len()
        };
        let mut emulated = BatchedCommandResponse::ok_with_n(0);
        if self.request.batch_type == BatchType::Update {
            emulated.n_modified = Some(0);
        }
        for index in 0..num_errors {
            emulated.add_write_error(WriteErrorDetail::new(index, error.status.clone()));
        }
        self.note_batch_response(batch, &emulated, None);
    }

    fn inc_batch_stats(&mut self, batch: &TargetedWriteBatch, response: &BatchedCommandResponse) {
        match self.request.batch_type {
            BatchType::Insert => self.num_inserted += response.n,
            BatchType::Update => {
                let upserted = response.upserted.len() as i64;
                self.num_upserted += upserted;
                self.num_matched += response.n - upserted;
                self.num_modified = match (self.num_modified, response.n_modified) {
                    (Some(total), Some(n_modified)) => Some(total + n_modified),
                    _ => None,
                };
            }
            BatchType::Delete => self.num_deleted += response.n,
        }

        for upsert in &response.upserted {
            if let Some(write) = batch.writes().get(upsert.index) {
                self.upserted.push(UpsertDetail {
                    index: write.op_index,
                    id: upsert.id.clone(),
                });
            }
        }
    }

    /// Returns in-flight ops to `Pending` and closes the batch after a
    /// transaction-aborting error. Ops that already failed keep their error.
    pub fn forget_targeted_batches_on_transaction_aborting_error(&mut self) {
        for op in &mut self.write_ops {
            op.cancel_writes();
        }
        self.aborted = true;
    }

    /// Fails every non-terminal op with `error` and closes the batch.
    pub fn abort_batch(&mut self, error: &WriteErrorDetail) {
        for op in &mut self.write_ops {
            if !op.state().is_terminal() {
                op.set_op_error(error.status.clone());
            }
        }
        self.aborted = true;
    }

    /// True once every op is terminal, the batch was aborted, or an ordered
    /// batch hit its first error.
    pub fn is_finished(&self) -> bool {
        if self.aborted {
            return true;
        }
        for op in &self.write_ops {
            match op.state() {
                WriteOpState::Pending | WriteOpState::Targeted => return false,
                WriteOpState::Error if self.request.ordered => return true,
                _ => {}
            }
        }
        true
    }

    pub fn num_write_ops_in(&self, state: WriteOpState) -> usize {
        self.write_ops.iter().filter(|op| op.state() == state).count()
    }

    /// Assembles the client reply from the ops' final states and the
    /// accumulated shard statistics.
    pub fn build_client_response(&self) -> BatchedCommandResponse {
        let mut response = BatchedCommandResponse::default();

        let errors: Vec<WriteErrorDetail> = self
            .write_ops
            .iter()
            .filter(|op| op.state() == WriteOpState::Error)
            .filter_map(|op| op.error().cloned())
            .collect();

        // Surface write concern errors only if some write could have been
        // affected by them.
        let report_wc_errors = errors.is_empty()
            || (!self.request.ordered && errors.len() < self.write_ops.len());
        if report_wc_errors {
            response.write_concern_error = Self::merge_wc_errors(&self.wc_errors);
        }
        response.write_errors = errors;

        response.n = self.num_inserted + self.num_upserted + self.num_matched + self.num_deleted;
        if self.request.batch_type == BatchType::Update {
            response.n_modified = self.num_modified;
        }
        let mut upserted = self.upserted.clone();
        upserted.sort_by_key(|u| u.index);
        response.upserted = upserted;
        response
    }

    fn merge_wc_errors(wc_errors: &[ShardWcError]) -> Option<WriteConcernErrorDetail> {
        match wc_errors {
            [] => None,
            [single] => Some(WriteConcernErrorDetail {
                status: single.error.status.with_reason(format!(
                    "{} at {}",
                    single.error.status.reason, single.endpoint.shard
                )),
            }),
            many => {
                let reasons: Vec<String> = many
                    .iter()
                    .map(|e| format!("{} at {}", e.error.status.reason, e.endpoint.shard))
                    .collect();
                Some(WriteConcernErrorDetail {
                    status: Status::new(
                        ErrorCode::WriteConcernFailed,
                        format!("multiple errors reported : {}", reasons.join(" :: and :: ")),
                    ),
                })
            }
        }
    }
}
