use super::chunk::{ChunkManager, CollectionRoutingInfo};
use super::shard_key::ShardKeyValue;
use crate::core::{ErrorCode, ExecError, Namespace, Result, ShardId, Status};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Source of routing metadata for the write path.
///
/// `get_collection_routing_info` may answer from cache;
/// `get_collection_routing_info_with_refresh` must consult the authoritative
/// metadata first.
#[async_trait]
pub trait CatalogCache: Send + Sync {
    async fn get_collection_routing_info(
        &self,
        ns: &Namespace,
    ) -> Result<CollectionRoutingInfo, Status>;

    async fn get_collection_routing_info_with_refresh(
        &self,
        ns: &Namespace,
    ) -> Result<CollectionRoutingInfo, Status>;

    /// Drops everything cached for `db`; the next lookup reloads it.
    async fn invalidate_database_entry(&self, db: &str);
}

/// Routing metadata as the config servers would hold it.
#[derive(Debug, Clone, Default)]
struct CatalogSnapshot {
    databases: HashMap<String, ShardId>,
    collections: HashMap<Namespace, ChunkManager>,
}

impl CatalogSnapshot {
    fn routing_info(&self, ns: &Namespace) -> Result<CollectionRoutingInfo, Status> {
        if let Some(cm) = self.collections.get(ns) {
            return Ok(CollectionRoutingInfo::Sharded(cm.clone()));
        }
        self.databases
            .get(&ns.db)
            .map(|primary| CollectionRoutingInfo::Unsharded {
                primary: primary.clone(),
            })
            .ok_or_else(|| {
                Status::new(
                    ErrorCode::NamespaceNotFound,
                    format!("database {} not found", ns.db),
                )
            })
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    authoritative: CatalogSnapshot,
    cached: HashMap<Namespace, CollectionRoutingInfo>,
    refresh_failure: Option<Status>,
    refresh_count: u64,
    invalidated: Vec<String>,
}

/// An in-memory `CatalogCache` for tests and embedded routers.
///
/// Holds an authoritative catalog plus a per-namespace cache. Metadata
/// changes only touch the authoritative side, so a router keeps targeting
/// with stale routing until it refreshes.
#[derive(Clone, Default)]
pub struct InMemoryCatalogCache {
    state: Arc<RwLock<CatalogState>>,
}

impl InMemoryCatalogCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a database whose unsharded collections live on `primary`.
    pub async fn create_database(&self, db: impl Into<String>, primary: impl Into<ShardId>) {
        let mut state = self.state.write().await;
        state.authoritative.databases.insert(db.into(), primary.into());
    }

    /// Installs (or replaces) the routing table of a sharded collection.
    ///
    /// The owning database must exist.
    pub async fn shard_collection(&self, cm: ChunkManager) -> Result<()> {
        cm.validate()?;
        let mut state = self.state.write().await;
        if !state.authoritative.databases.contains_key(&cm.namespace().db) {
            return Err(ExecError::Config(format!(
                "database {} must exist before sharding {}",
                cm.namespace().db,
                cm.namespace()
            )));
        }
        state
            .authoritative
            .collections
            .insert(cm.namespace().clone(), cm);
        Ok(())
    }

    /// Removes the routing table; the collection becomes unsharded.
    pub async fn drop_collection(&self, ns: &Namespace) -> bool {
        let mut state = self.state.write().await;
        state.authoritative.collections.remove(ns).is_some()
    }

    /// Splits a chunk in the authoritative metadata.
    pub async fn split_chunk(&self, ns: &Namespace, at: ShardKeyValue) -> Result<()> {
        let mut state = self.state.write().await;
        Self::authoritative_collection(&mut state, ns)?.split_chunk(at)
    }

    /// Migrates a chunk in the authoritative metadata.
    pub async fn move_chunk(
        &self,
        ns: &Namespace,
        key: &ShardKeyValue,
        to: impl Into<ShardId>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        Self::authoritative_collection(&mut state, ns)?.move_chunk(key, to)
    }

    /// Authoritative routing, bypassing the cache.
    pub async fn authoritative_routing_info(
        &self,
        ns: &Namespace,
    ) -> Result<CollectionRoutingInfo, Status> {
        self.state.read().await.authoritative.routing_info(ns)
    }

    /// Makes every forced refresh fail with `status` until cleared.
    pub async fn set_refresh_failure(&self, status: Option<Status>) {
        self.state.write().await.refresh_failure = status;
    }

    /// Number of forced refreshes that reached the authoritative metadata.
    pub async fn refresh_count(&self) -> u64 {
        self.state.read().await.refresh_count
    }

    /// Databases invalidated so far, in order.
    pub async fn invalidated_databases(&self) -> Vec<String> {
        self.state.read().await.invalidated.clone()
    }

    fn authoritative_collection<'a>(
        state: &'a mut CatalogState,
        ns: &Namespace,
    ) -> Result<&'a mut ChunkManager> {
        state
            .authoritative
            .collections
            .get_mut(ns)
            .ok_or_else(|| ExecError::Config(format!("collection {} is not sharded", ns)))
    }
}

#[async_trait]
impl CatalogCache for InMemoryCatalogCache {
    async fn get_collection_routing_info(
        &self,
        ns: &Namespace,
    ) -> Result<CollectionRoutingInfo, Status> {
        {
            let state = self.state.read().await;
            if let Some(info) = state.cached.get(ns) {
                return Ok(info.clone());
            }
        }
        let mut state = self.state.write().await;
        let info = state.authoritative.routing_info(ns)?;
        state.cached.insert(ns.clone(), info.clone());
        Ok(info)
    }

    async fn get_collection_routing_info_with_refresh(
        &self,
        ns: &Namespace,
    ) -> Result<CollectionRoutingInfo, Status> {
        let mut state = self.state.write().await;
        if let Some(status) = state.refresh_failure.clone() {
            return Err(status);
        }
        state.refresh_count += 1;
        let info = state.authoritative.routing_info(ns)?;
        state.cached.insert(ns.clone(), info.clone());
        Ok(info)
    }

    async fn invalidate_database_entry(&self, db: &str) {
        let mut state = self.state.write().await;
        state.cached.retain(|ns, _| ns.db != db);
        state.invalidated.push(db.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::shard_key::ShardKeyPattern;

    #[tokio::test]
    async fn cached_routing_stays_stale_until_refresh() {
        let cache = InMemoryCatalogCache::new();
        let ns = Namespace::new("app", "users");
        cache.create_database("app", "shardA").await;
        cache
            .shard_collection(
                ChunkManager::single_chunk(ns.clone(), ShardKeyPattern::ranged("x"), "shardA")
                    .unwrap(),
            )
            .await
            .unwrap();

        let first = cache.get_collection_routing_info(&ns).await.unwrap();
        cache.split_chunk(&ns, ShardKeyValue::Int(0)).await.unwrap();
        cache
            .move_chunk(&ns, &ShardKeyValue::Int(5), "shardB")
            .await
            .unwrap();

        let cached = cache.get_collection_routing_info(&ns).await.unwrap();
        assert!(!first.differs_from(&cached));

        let refreshed = cache
            .get_collection_routing_info_with_refresh(&ns)
            .await
            .unwrap();
        assert!(first.differs_from(&refreshed));
        assert_eq!(cache.refresh_count().await, 1);
    }

    #[tokio::test]
    async fn invalidation_reloads_database() {
        let cache = InMemoryCatalogCache::new();
        let ns = Namespace::new("app", "events");
        cache.create_database("app", "shardA").await;
        let before = cache.get_collection_routing_info(&ns).await.unwrap();
        assert_eq!(
            before,
            CollectionRoutingInfo::Unsharded {
                primary: ShardId::new("shardA")
            }
        );

        cache
            .shard_collection(
                ChunkManager::single_chunk(ns.clone(), ShardKeyPattern::hashed("_id"), "shardB")
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(!cache.get_collection_routing_info(&ns).await.unwrap().is_sharded());

        cache.invalidate_database_entry("app").await;
        assert!(cache.get_collection_routing_info(&ns).await.unwrap().is_sharded());
        assert_eq!(cache.invalidated_databases().await, vec!["app".to_string()]);
    }

    #[tokio::test]
    async fn unknown_database_and_refresh_failure() {
        let cache = InMemoryCatalogCache::new();
        let ns = Namespace::new("nope", "c");
        let err = cache.get_collection_routing_info(&ns).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NamespaceNotFound);

        cache.create_database("nope", "shardA").await;
        cache
            .set_refresh_failure(Some(Status::new(ErrorCode::HostUnreachable, "config down")))
            .await;
        let err = cache
            .get_collection_routing_info_with_refresh(&ns)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HostUnreachable);
    }
}
