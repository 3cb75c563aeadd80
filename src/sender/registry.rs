use crate::core::{ErrorCode, HostAndPort, ReadPreference, ShardId, Status};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Resolves a shard to the host a request should go to.
#[async_trait]
pub trait ShardRegistry: Send + Sync {
    async fn find_host(
        &self,
        shard: &ShardId,
        read_preference: ReadPreference,
    ) -> Result<HostAndPort, Status>;
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Members per shard, primary first.
    members: HashMap<ShardId, Vec<HostAndPort>>,
    unreachable: HashSet<ShardId>,
}

/// Static shard registry for tests and embedded routers.
#[derive(Clone, Default)]
pub struct InMemoryShardRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl InMemoryShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a shard's members; the first host is the primary.
    pub async fn add_shard(&self, shard: impl Into<ShardId>, hosts: Vec<HostAndPort>) {
        let mut state = self.state.write().await;
        state.members.insert(shard.into(), hosts);
    }

    /// While set, no host of `shard` satisfies any read preference.
    pub async fn set_unreachable(&self, shard: impl Into<ShardId>, unreachable: bool) {
        let shard = shard.into();
        let mut state = self.state.write().await;
        if unreachable {
            state.unreachable.insert(shard);
        } else {
            state.unreachable.remove(&shard);
        }
    }

    pub async fn shard_ids(&self) -> Vec<ShardId> {
        let state = self.state.read().await;
        let mut shards: Vec<ShardId> = state.members.keys().cloned().collect();
        shards.sort();
        shards
    }
}

#[async_trait]
impl ShardRegistry for InMemoryShardRegistry {
    async fn find_host(
        &self,
        shard: &ShardId,
        read_preference: ReadPreference,
    ) -> Result<HostAndPort, Status> {
        let state = self.state.read().await;
        let members = state.members.get(shard).ok_or_else(|| {
            Status::new(
                ErrorCode::ShardNotFound,
                format!("Shard {} not found", shard),
            )
        })?;

        let candidate = if state.unreachable.contains(shard) {
            None
        } else if read_preference.requires_primary() {
            members.first()
        } else {
            members.get(1).or_else(|| members.first())
        };

        candidate.cloned().ok_or_else(|| {
            Status::new(
                ErrorCode::FailedToSatisfyReadPreference,
                format!(
                    "Could not find host matching read preference {:?} for set {}",
                    read_preference, shard
                ),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_primary_and_reports_unreachable() {
        let registry = InMemoryShardRegistry::new();
        let primary = HostAndPort::new("a0", 27017);
        registry
            .add_shard("shardA", vec![primary.clone(), HostAndPort::new("a1", 27017)])
            .await;

        let shard = ShardId::new("shardA");
        assert_eq!(
            registry.find_host(&shard, ReadPreference::Primary).await.unwrap(),
            primary
        );
        assert_eq!(
            registry
                .find_host(&shard, ReadPreference::Secondary)
                .await
                .unwrap()
                .host,
            "a1"
        );

        registry.set_unreachable("shardA", true).await;
        let err = registry
            .find_host(&shard, ReadPreference::Primary)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FailedToSatisfyReadPreference);

        let err = registry
            .find_host(&ShardId::new("shardZ"), ReadPreference::Primary)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ShardNotFound);
    }
}
