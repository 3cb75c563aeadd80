use crate::core::ErrorCode;
use crate::ops::{WriteConcernErrorDetail, WriteErrorDetail};
use crate::routing::ShardEndpoint;
use std::collections::HashMap;

/// One child write: operation `op_index` of the client batch, sent to
/// `endpoint` as that operation's `child_index`-th child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetedWrite {
    pub endpoint: ShardEndpoint,
    pub op_index: usize,
    pub child_index: usize,
}

/// Child writes destined for one endpoint in one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetedWriteBatch {
    endpoint: ShardEndpoint,
    writes: Vec<TargetedWrite>,
    estimated_size_bytes: usize,
}

impl TargetedWriteBatch {
    pub fn new(endpoint: ShardEndpoint) -> Self {
        Self {
            endpoint,
            writes: Vec::new(),
            estimated_size_bytes: 0,
        }
    }

    pub fn endpoint(&self) -> &ShardEndpoint {
        &self.endpoint
    }

    /// Writes in the order they are sent; position `i` is the shard-side index.
    pub fn writes(&self) -> &[TargetedWrite] {
        &self.writes
    }

    pub fn estimated_size_bytes(&self) -> usize {
        self.estimated_size_bytes
    }

    pub fn add_write(&mut self, write: TargetedWrite, estimated_size: usize) {
        self.writes.push(write);
        self.estimated_size_bytes += estimated_size;
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// A write error together with the endpoint that reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardError {
    pub endpoint: ShardEndpoint,
    pub error: WriteErrorDetail,
}

/// A write concern error together with the endpoint that reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardWcError {
    pub endpoint: ShardEndpoint,
    pub error: WriteConcernErrorDetail,
}

/// Collects selected error codes out of a shard reply so the caller can
/// react to them after the reply has been applied.
#[derive(Debug, Default)]
pub struct TrackedErrors {
    errors: HashMap<ErrorCode, Vec<ShardError>>,
}

impl TrackedErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_tracking(&mut self, code: ErrorCode) {
        self.errors.entry(code).or_default();
    }

    pub fn is_tracking(&self, code: ErrorCode) -> bool {
        self.errors.contains_key(&code)
    }

    /// Records `error` if its code is tracked; returns whether it was.
    pub fn add_error(&mut self, error: ShardError) -> bool {
        match self.errors.get_mut(&error.error.code()) {
            Some(errors) => {
                errors.push(error);
                true
            }
            None => false,
        }
    }

    pub fn errors(&self, code: ErrorCode) -> &[ShardError] {
        self.errors.get(&code).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Status;
    use crate::routing::ChunkVersion;

    #[test]
    fn tracked_errors_only_keep_tracked_codes() {
        let endpoint = ShardEndpoint::new("shardA", ChunkVersion::IGNORED);
        let mut tracked = TrackedErrors::new();
        tracked.start_tracking(ErrorCode::StaleShardVersion);

        assert!(tracked.add_error(ShardError {
            endpoint: endpoint.clone(),
            error: WriteErrorDetail::new(0, Status::new(ErrorCode::StaleShardVersion, "stale")),
        }));
        assert!(!tracked.add_error(ShardError {
            endpoint,
            error: WriteErrorDetail::new(1, Status::new(ErrorCode::DuplicateKey, "dup")),
        }));
        assert_eq!(tracked.errors(ErrorCode::StaleShardVersion).len(), 1);
        assert!(tracked.errors(ErrorCode::DuplicateKey).is_empty());
    }
}
