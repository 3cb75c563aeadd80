use crate::core::{ConnectionString, ElectionId, HostAndPort, OpTime, ShardId};
use std::collections::{BTreeSet, HashMap};

/// Last write applied on one host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostOpTime {
    pub op_time: OpTime,
    pub election_id: ElectionId,
}

/// What one `execute_batch` call did, for the caller's diagnostics and
/// causal-consistency bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct BatchWriteExecStats {
    pub num_rounds: u32,
    pub num_target_errors: u32,
    pub num_stale_batches: u32,
    targeted_shards: BTreeSet<ShardId>,
    write_op_times: HashMap<ConnectionString, HostOpTime>,
}

impl BatchWriteExecStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_targeted_shard(&mut self, shard: &ShardId) {
        self.targeted_shards.insert(shard.clone());
    }

    /// Records the latest write position reported by `host`.
    pub fn note_write_at(&mut self, host: &HostAndPort, op_time: OpTime, election_id: ElectionId) {
        self.write_op_times.insert(
            ConnectionString::from(host),
            HostOpTime {
                op_time,
                election_id,
            },
        );
    }

    pub fn targeted_shards(&self) -> &BTreeSet<ShardId> {
        &self.targeted_shards
    }

    pub fn write_op_times(&self) -> &HashMap<ConnectionString, HostOpTime> {
        &self.write_op_times
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_write_replaces_earlier() {
        let mut stats = BatchWriteExecStats::new();
        let host = HostAndPort::new("a0", 27017);
        stats.note_write_at(&host, OpTime::new(1, 0, 1), ElectionId("e1".into()));
        stats.note_write_at(&host, OpTime::new(2, 0, 1), ElectionId("e1".into()));
        stats.note_targeted_shard(&ShardId::new("shardA"));
        stats.note_targeted_shard(&ShardId::new("shardA"));

        assert_eq!(stats.targeted_shards().len(), 1);
        let recorded = &stats.write_op_times()[&ConnectionString::from(&host)];
        assert_eq!(recorded.op_time, OpTime::new(2, 0, 1));
    }
}
