use super::targeted::TargetedWrite;
use crate::core::{ErrorCode, Status};
use crate::ops::{WriteErrorDetail, WriteItem};
use crate::routing::{NsTargeter, ShardEndpoint};

/// Lifecycle of one client write operation.
///
/// `Pending -> Targeted -> {Completed | Error}`; a retryable failure or a
/// cancellation moves a targeted op back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WriteOpState {
    Pending,
    Targeted,
    Completed,
    Error,
}

impl WriteOpState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WriteOpState::Completed | WriteOpState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildState {
    Targeted,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
struct ChildWriteOp {
    endpoint: ShardEndpoint,
    state: ChildState,
    error: Option<WriteErrorDetail>,
}

/// Per-operation codes that send an op back to `Pending` outside a
/// transaction: routing was stale or no shard host could be reached.
pub fn is_retryable_op_error(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::StaleShardVersion
            | ErrorCode::StaleConfig
            | ErrorCode::CannotImplicitlyCreateCollection
            | ErrorCode::FailedToSatisfyReadPreference
    )
}

/// One client write operation and its children (one per endpoint).
#[derive(Debug, Clone)]
pub struct WriteOp {
    index: usize,
    in_transaction: bool,
    state: WriteOpState,
    children: Vec<ChildWriteOp>,
    error: Option<WriteErrorDetail>,
}

impl WriteOp {
    pub fn new(index: usize, in_transaction: bool) -> Self {
        Self {
            index,
            in_transaction,
            state: WriteOpState::Pending,
            children: Vec::new(),
            error: None,
        }
    }

    pub fn state(&self) -> WriteOpState {
        self.state
    }

    /// Terminal error, set only in `Error` state.
    pub fn error(&self) -> Option<&WriteErrorDetail> {
        self.error.as_ref()
    }

    /// Targets the op and moves it to `Targeted`.
    ///
    /// On failure the op stays `Pending`; the caller decides whether the
    /// error is recorded.
    pub fn target_writes(
        &mut self,
        targeter: &dyn NsTargeter,
        item: &WriteItem,
    ) -> Result<Vec<TargetedWrite>, Status> {
        let endpoints = targeter.target_write(item)?;
        if endpoints.is_empty() {
            // Nothing can match on any shard.
            self.state = WriteOpState::Completed;
            return Ok(Vec::new());
        }

        self.children = endpoints
            .into_iter()
            .map(|endpoint| ChildWriteOp {
                endpoint,
                state: ChildState::Targeted,
                error: None,
            })
            .collect();
        self.state = WriteOpState::Targeted;

        Ok(self
            .children
            .iter()
            .enumerate()
            .map(|(child_index, child)| TargetedWrite {
                endpoint: child.endpoint.clone(),
                op_index: self.index,
                child_index,
            })
            .collect())
    }

    pub fn note_write_complete(&mut self, child_index: usize) {
        if let Some(child) = self.children.get_mut(child_index) {
            child.state = ChildState::Completed;
            self.update_state();
        }
    }

    pub fn note_write_error(&mut self, child_index: usize, error: WriteErrorDetail) {
        if let Some(child) = self.children.get_mut(child_index) {
            child.state = ChildState::Error;
            child.error = Some(WriteErrorDetail::new(self.index, error.status));
            self.update_state();
        }
    }

    /// Drops in-flight children and returns the op to `Pending`.
    ///
    /// Only targeted ops are affected; terminal ops keep their outcome.
    pub fn cancel_writes(&mut self) {
        if self.state == WriteOpState::Targeted {
            self.children.clear();
            self.state = WriteOpState::Pending;
        }
    }

    /// Fails the op directly (targeting failure or batch abort).
    pub fn set_op_error(&mut self, status: Status) {
        self.children.clear();
        self.error = Some(WriteErrorDetail::new(self.index, status));
        self.state = WriteOpState::Error;
    }

    fn update_state(&mut self) {
        let mut has_targeted_child = false;
        let mut first_error: Option<WriteErrorDetail> = None;
        let mut first_terminal_error: Option<WriteErrorDetail> = None;

        for child in &self.children {
            match (child.state, child.error.as_ref()) {
                (ChildState::Targeted, _) => has_targeted_child = true,
                (ChildState::Error, Some(error)) => {
                    if first_error.is_none() {
                        first_error = Some(error.clone());
                    }
                    if first_terminal_error.is_none() && !is_retryable_op_error(error.code()) {
                        first_terminal_error = Some(error.clone());
                    }
                }
                _ => {}
            }
        }

        // Inside a transaction every error is final and reported at once.
        if self.in_transaction && first_error.is_some() {
            self.fail_with(first_error);
            return;
        }
        if has_targeted_child {
            return;
        }

        if first_terminal_error.is_some() {
            self.fail_with(first_terminal_error);
        } else if first_error.is_some() {
            self.children.clear();
            self.state = WriteOpState::Pending;
        } else {
            self.state = WriteOpState::Completed;
        }
    }

    fn fail_with(&mut self, error: Option<WriteErrorDetail>) {
        self.children.clear();
        self.error = error;
        self.state = WriteOpState::Error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Namespace;
    use crate::routing::{ChunkVersion, StaleConfigInfo};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    /// Targets every write at a fixed list of endpoints.
    struct FixedTargeter {
        ns: Namespace,
        endpoints: Vec<ShardEndpoint>,
    }

    #[async_trait]
    impl NsTargeter for FixedTargeter {
        fn namespace(&self) -> &Namespace {
            &self.ns
        }
        fn target_insert(&self, _doc: &Value) -> Result<ShardEndpoint, Status> {
            Ok(self.endpoints[0].clone())
        }
        fn target_update(
            &self,
            _q: &Value,
            _u: &Value,
            _multi: bool,
            _upsert: bool,
        ) -> Result<Vec<ShardEndpoint>, Status> {
            Ok(self.endpoints.clone())
        }
        fn target_delete(&self, _q: &Value, _multi: bool) -> Result<Vec<ShardEndpoint>, Status> {
            Ok(self.endpoints.clone())
        }
        fn target_collection(&self) -> Result<Vec<ShardEndpoint>, Status> {
            Ok(self.endpoints.clone())
        }
        fn target_all_shards(&self) -> Result<Vec<ShardEndpoint>, Status> {
            Ok(self.endpoints.clone())
        }
        fn note_could_not_target(&mut self) {}
        fn note_stale_response(&mut self, _endpoint: &ShardEndpoint, _info: &StaleConfigInfo) {}
        async fn refresh_if_needed(&mut self) -> Result<bool, Status> {
            Ok(false)
        }
    }

    fn two_shards() -> FixedTargeter {
        FixedTargeter {
            ns: Namespace::new("foo", "bar"),
            endpoints: vec![
                ShardEndpoint::new("shardA", ChunkVersion::IGNORED),
                ShardEndpoint::new("shardB", ChunkVersion::IGNORED),
            ],
        }
    }

    fn multi_delete() -> WriteItem {
        WriteItem::delete(json!({"y": 1}), true)
    }

    #[test]
    fn multi_shard_op_completes_after_all_children() {
        let mut op = WriteOp::new(0, false);
        let writes = op.target_writes(&two_shards(), &multi_delete()).unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(op.state(), WriteOpState::Targeted);

        op.note_write_complete(0);
        assert_eq!(op.state(), WriteOpState::Targeted);
        op.note_write_complete(1);
        assert_eq!(op.state(), WriteOpState::Completed);
    }

    #[test]
    fn retryable_child_error_waits_then_returns_to_pending() {
        let mut op = WriteOp::new(0, false);
        op.target_writes(&two_shards(), &multi_delete()).unwrap();

        op.note_write_error(
            0,
            WriteErrorDetail::new(0, Status::new(ErrorCode::StaleShardVersion, "stale")),
        );
        assert_eq!(op.state(), WriteOpState::Targeted);
        op.note_write_complete(1);
        assert_eq!(op.state(), WriteOpState::Pending);
        assert!(op.error().is_none());
    }

    #[test]
    fn terminal_child_error_fails_op_with_client_index() {
        let mut op = WriteOp::new(4, false);
        op.target_writes(&two_shards(), &multi_delete()).unwrap();
        op.note_write_complete(0);
        op.note_write_error(
            1,
            WriteErrorDetail::new(0, Status::new(ErrorCode::UnknownError, "boom")),
        );
        assert_eq!(op.state(), WriteOpState::Error);
        let error = op.error().unwrap();
        assert_eq!(error.index, 4);
        assert_eq!(error.code(), ErrorCode::UnknownError);
    }

    #[test]
    fn transaction_errors_are_immediate_and_final() {
        let mut op = WriteOp::new(0, true);
        op.target_writes(&two_shards(), &multi_delete()).unwrap();
        op.note_write_error(
            0,
            WriteErrorDetail::new(0, Status::new(ErrorCode::StaleShardVersion, "stale")),
        );
        assert_eq!(op.state(), WriteOpState::Error);

        op.cancel_writes();
        assert_eq!(op.state(), WriteOpState::Error);
    }

    #[test]
    fn cancel_returns_targeted_op_to_pending() {
        let mut op = WriteOp::new(0, false);
        op.target_writes(&two_shards(), &WriteItem::insert(json!({"x": 1})))
            .unwrap();
        op.cancel_writes();
        assert_eq!(op.state(), WriteOpState::Pending);
        assert_eq!(
            op.target_writes(&two_shards(), &WriteItem::insert(json!({"x": 1})))
                .unwrap()
                .len(),
            1
        );
    }
}
