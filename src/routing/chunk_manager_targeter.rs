use super::catalog_cache::CatalogCache;
use super::chunk::{ChunkManager, ChunkVersion, CollectionRoutingInfo, Epoch};
use super::shard_key::{QueryKeyPredicate, query_has_exact_id};
use super::targeter::{NsTargeter, ShardEndpoint, StaleConfigInfo};
use crate::core::{ErrorCode, Namespace, ShardId, Status};
use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Targeter backed by the catalog cache's routing tables.
pub struct ChunkManagerTargeter {
    ns: Namespace,
    cache: Arc<dyn CatalogCache>,
    target_epoch: Option<Epoch>,
    routing_info: Option<CollectionRoutingInfo>,
    needs_targeting_refresh: bool,
    remote_shard_versions: BTreeMap<ShardId, ChunkVersion>,
}

impl ChunkManagerTargeter {
    pub fn new(ns: Namespace, cache: Arc<dyn CatalogCache>) -> Self {
        Self {
            ns,
            cache,
            target_epoch: None,
            routing_info: None,
            needs_targeting_refresh: false,
            remote_shard_versions: BTreeMap::new(),
        }
    }

    /// Pins the collection incarnation; routing from another epoch fails
    /// with `StaleEpoch`.
    pub fn with_target_epoch(mut self, epoch: Epoch) -> Self {
        self.target_epoch = Some(epoch);
        self
    }

    /// Loads routing from the cache. Must succeed before targeting.
    pub async fn init(&mut self) -> Result<(), Status> {
        let info = self.cache.get_collection_routing_info(&self.ns).await?;
        self.check_epoch(&info)?;
        self.routing_info = Some(info);
        Ok(())
    }

    pub fn routing_info(&self) -> Option<&CollectionRoutingInfo> {
        self.routing_info.as_ref()
    }

    fn routing(&self) -> Result<&CollectionRoutingInfo, Status> {
        self.routing_info.as_ref().ok_or_else(|| {
            Status::new(
                ErrorCode::InternalError,
                format!("targeter for {} was not initialized", self.ns),
            )
        })
    }

    fn check_epoch(&self, info: &CollectionRoutingInfo) -> Result<(), Status> {
        let Some(target) = self.target_epoch else {
            return Ok(());
        };
        match info {
            CollectionRoutingInfo::Sharded(cm) if cm.epoch() == target => Ok(()),
            CollectionRoutingInfo::Sharded(cm) => Err(Status::new(
                ErrorCode::StaleEpoch,
                format!(
                    "collection {} was recreated: epoch {} does not match expected {}",
                    self.ns,
                    cm.epoch(),
                    target
                ),
            )),
            CollectionRoutingInfo::Unsharded { .. } => Err(Status::new(
                ErrorCode::StaleEpoch,
                format!("collection {} is no longer sharded", self.ns),
            )),
        }
    }

    fn endpoint_for(cm: &ChunkManager, shard: &ShardId) -> ShardEndpoint {
        ShardEndpoint::new(shard.clone(), cm.shard_version(shard))
    }

    fn primary_endpoint(primary: &ShardId) -> Vec<ShardEndpoint> {
        vec![ShardEndpoint::new(primary.clone(), ChunkVersion::UNSHARDED)]
    }

    fn broadcast(cm: &ChunkManager) -> Vec<ShardEndpoint> {
        cm.all_shards()
            .into_iter()
            .map(|shard| ShardEndpoint::new(shard, ChunkVersion::IGNORED))
            .collect()
    }

    /// Endpoints for a query, or `None` if it does not constrain the key.
    fn target_query(
        cm: &ChunkManager,
        query: &Value,
    ) -> Result<Option<Vec<ShardEndpoint>>, Status> {
        match cm.shard_key().extract_from_query(query)? {
            QueryKeyPredicate::Exact(key) => {
                let chunk = cm.find_chunk(&key)?;
                Ok(Some(vec![Self::endpoint_for(cm, &chunk.shard)]))
            }
            QueryKeyPredicate::Range(range) => Ok(Some(
                cm.shards_for_range(&range)
                    .iter()
                    .map(|shard| Self::endpoint_for(cm, shard))
                    .collect(),
            )),
            QueryKeyPredicate::Unconstrained => Ok(None),
        }
    }

    fn is_exact(cm: &ChunkManager, query: &Value) -> bool {
        matches!(
            cm.shard_key().extract_from_query(query),
            Ok(QueryKeyPredicate::Exact(_))
        )
    }

    fn target_single_or_multi(
        &self,
        cm: &ChunkManager,
        query: &Value,
        multi: bool,
        kind: &str,
    ) -> Result<Vec<ShardEndpoint>, Status> {
        let endpoints = match Self::target_query(cm, query)? {
            Some(endpoints) => endpoints,
            None if multi => return Ok(Self::broadcast(cm)),
            None => Vec::new(),
        };
        if multi || endpoints.len() == 1 {
            return Ok(endpoints);
        }
        // A single-document write spanning several shards is allowed only
        // when `_id` pins it to one document.
        if query_has_exact_id(query) {
            return Ok(if endpoints.is_empty() {
                Self::broadcast(cm)
            } else {
                endpoints
            });
        }
        Err(Status::new(
            ErrorCode::ShardKeyNotFound,
            format!(
                "A single {} on a sharded collection must contain an exact match on _id or contain the shard key {}; query was {}",
                kind,
                cm.shard_key().field,
                query
            ),
        ))
    }

    /// Whether a shard reported a version other than the one we route with.
    fn remote_versions_differ(&self) -> bool {
        let Ok(info) = self.routing() else {
            return true;
        };
        self.remote_shard_versions
            .iter()
            .any(|(shard, remote)| info.shard_version(shard) != *remote)
    }
}

#[async_trait]
impl NsTargeter for ChunkManagerTargeter {
    fn namespace(&self) -> &Namespace {
        &self.ns
    }

    fn target_insert(&self, doc: &Value) -> Result<ShardEndpoint, Status> {
        match self.routing()? {
            CollectionRoutingInfo::Unsharded { primary } => {
                Ok(ShardEndpoint::new(primary.clone(), ChunkVersion::UNSHARDED))
            }
            CollectionRoutingInfo::Sharded(cm) => {
                let key = cm.shard_key().extract_from_document(doc)?;
                let chunk = cm.find_chunk(&key)?;
                Ok(Self::endpoint_for(cm, &chunk.shard))
            }
        }
    }

    fn target_update(
        &self,
        q: &Value,
        u: &Value,
        multi: bool,
        upsert: bool,
    ) -> Result<Vec<ShardEndpoint>, Status> {
        let cm = match self.routing()? {
            CollectionRoutingInfo::Unsharded { primary } => {
                return Ok(Self::primary_endpoint(primary));
            }
            CollectionRoutingInfo::Sharded(cm) => cm,
        };

        let is_replacement = u
            .as_object()
            .is_some_and(|obj| !obj.keys().any(|k| k.starts_with('$')));

        if !multi && is_replacement && !Self::is_exact(cm, q) {
            // Replacement documents must carry the full shard key.
            if let Ok(key) = cm.shard_key().extract_from_document(u) {
                let chunk = cm.find_chunk(&key)?;
                return Ok(vec![Self::endpoint_for(cm, &chunk.shard)]);
            }
        }

        if upsert && !multi && !Self::is_exact(cm, q) {
            return Err(Status::new(
                ErrorCode::ShardKeyNotFound,
                format!(
                    "An upsert on a sharded collection must contain the shard key {} in the query; query was {}",
                    cm.shard_key().field,
                    q
                ),
            ));
        }

        self.target_single_or_multi(cm, q, multi, "update")
    }

    fn target_delete(&self, q: &Value, multi: bool) -> Result<Vec<ShardEndpoint>, Status> {
        match self.routing()? {
            CollectionRoutingInfo::Unsharded { primary } => Ok(Self::primary_endpoint(primary)),
            CollectionRoutingInfo::Sharded(cm) => {
                self.target_single_or_multi(cm, q, multi, "delete")
            }
        }
    }

    fn target_collection(&self) -> Result<Vec<ShardEndpoint>, Status> {
        match self.routing()? {
            CollectionRoutingInfo::Unsharded { primary } => Ok(Self::primary_endpoint(primary)),
            CollectionRoutingInfo::Sharded(cm) => Ok(cm
                .all_shards()
                .iter()
                .map(|shard| Self::endpoint_for(cm, shard))
                .collect()),
        }
    }

    fn target_all_shards(&self) -> Result<Vec<ShardEndpoint>, Status> {
        match self.routing()? {
            CollectionRoutingInfo::Unsharded { primary } => Ok(vec![ShardEndpoint::new(
                primary.clone(),
                ChunkVersion::IGNORED,
            )]),
            CollectionRoutingInfo::Sharded(cm) => Ok(Self::broadcast(cm)),
        }
    }

    fn note_could_not_target(&mut self) {
        self.needs_targeting_refresh = true;
    }

    fn note_stale_response(&mut self, endpoint: &ShardEndpoint, info: &StaleConfigInfo) {
        let Some(wanted) = info.wanted else {
            // Without the shard's version nothing can be compared; reload everything.
            self.needs_targeting_refresh = true;
            return;
        };
        match self.remote_shard_versions.get(&endpoint.shard) {
            Some(previous) if previous.is_same_epoch(&wanted) && !previous.is_older_than(&wanted) => {}
            _ => {
                self.remote_shard_versions
                    .insert(endpoint.shard.clone(), wanted);
            }
        }
    }

    async fn refresh_if_needed(&mut self) -> Result<bool, Status> {
        if !self.needs_targeting_refresh && self.remote_shard_versions.is_empty() {
            return Ok(false);
        }

        let previous = self.routing_info.clone();
        let needs_targeting_refresh = self.needs_targeting_refresh;
        let must_refresh = needs_targeting_refresh || self.remote_versions_differ();

        let refreshed = if must_refresh {
            self.cache
                .get_collection_routing_info_with_refresh(&self.ns)
                .await
        } else {
            self.cache.get_collection_routing_info(&self.ns).await
        };
        let info = refreshed?;

        self.needs_targeting_refresh = false;
        self.remote_shard_versions.clear();
        self.check_epoch(&info)?;

        let changed = match &previous {
            Some(previous) => previous.differs_from(&info),
            None => true,
        };
        debug!(
            "Refreshed routing for {} (forced: {}, changed: {})",
            self.ns, must_refresh, changed
        );
        self.routing_info = Some(info);
        Ok(changed)
    }
}
