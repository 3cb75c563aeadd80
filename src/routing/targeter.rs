use super::chunk::ChunkVersion;
use crate::core::{Namespace, ShardId, Status};
use crate::ops::WriteItem;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::fmt;

/// Destination of a child batch: a shard plus the routing version the
/// request was targeted with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardEndpoint {
    pub shard: ShardId,
    pub shard_version: ChunkVersion,
}

impl ShardEndpoint {
    pub fn new(shard: impl Into<ShardId>, shard_version: ChunkVersion) -> Self {
        Self {
            shard: shard.into(),
            shard_version,
        }
    }
}

impl fmt::Display for ShardEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.shard, self.shard_version)
    }
}

/// Details a shard attaches to a stale routing error (`errInfo`).
///
/// ```text
/// { ns, vReceived: [major, minor, epoch], vWanted: [major, minor, epoch], shardId }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleConfigInfo {
    pub ns: Option<Namespace>,
    pub received: Option<ChunkVersion>,
    pub wanted: Option<ChunkVersion>,
    pub shard: Option<ShardId>,
}

impl StaleConfigInfo {
    /// Lenient parse: missing or malformed fields are left empty.
    pub fn parse(info: Option<&Value>) -> Self {
        let Some(info) = info else {
            return Self {
                ns: None,
                received: None,
                wanted: None,
                shard: None,
            };
        };
        Self {
            ns: info
                .get("ns")
                .and_then(Value::as_str)
                .and_then(|ns| Namespace::parse(ns).ok()),
            received: info
                .get("vReceived")
                .and_then(|v| ChunkVersion::from_json(v).ok()),
            wanted: info
                .get("vWanted")
                .and_then(|v| ChunkVersion::from_json(v).ok()),
            shard: info
                .get("shardId")
                .and_then(Value::as_str)
                .map(ShardId::new),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut info = json!({});
        if let Some(ns) = &self.ns {
            info["ns"] = json!(ns.to_string());
        }
        if let Some(received) = &self.received {
            info["vReceived"] = received.to_json();
        }
        if let Some(wanted) = &self.wanted {
            info["vWanted"] = wanted.to_json();
        }
        if let Some(shard) = &self.shard {
            info["shardId"] = json!(shard.as_str());
        }
        info
    }
}

/// Maps write operations of one namespace to shard endpoints and tracks
/// evidence that its routing metadata is stale.
///
/// Targeting is synchronous against the loaded metadata; only
/// [`NsTargeter::refresh_if_needed`] reaches out to the catalog.
#[async_trait]
pub trait NsTargeter: Send + Sync {
    fn namespace(&self) -> &Namespace;

    fn target_insert(&self, doc: &Value) -> Result<ShardEndpoint, Status>;

    fn target_update(
        &self,
        q: &Value,
        u: &Value,
        multi: bool,
        upsert: bool,
    ) -> Result<Vec<ShardEndpoint>, Status>;

    fn target_delete(&self, q: &Value, multi: bool) -> Result<Vec<ShardEndpoint>, Status>;

    /// Every shard holding data of the collection.
    fn target_collection(&self) -> Result<Vec<ShardEndpoint>, Status>;

    /// Every shard, with versioning ignored.
    fn target_all_shards(&self) -> Result<Vec<ShardEndpoint>, Status>;

    /// Targeting failed; the next refresh must reload metadata.
    fn note_could_not_target(&mut self);

    /// A shard rejected a request sent to `endpoint` as stale.
    fn note_stale_response(&mut self, endpoint: &ShardEndpoint, info: &StaleConfigInfo);

    /// Reloads metadata if any stale evidence was noted.
    ///
    /// Returns whether the routing actually changed.
    async fn refresh_if_needed(&mut self) -> Result<bool, Status>;

    /// Targets one client write item.
    fn target_write(&self, item: &WriteItem) -> Result<Vec<ShardEndpoint>, Status> {
        match item {
            WriteItem::Insert { document } => Ok(vec![self.target_insert(document)?]),
            WriteItem::Update { q, u, multi, upsert } => self.target_update(q, u, *multi, *upsert),
            WriteItem::Delete { q, multi } => self.target_delete(q, *multi),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::chunk::Epoch;

    #[test]
    fn stale_info_parse() {
        let epoch = Epoch::new();
        let wanted = ChunkVersion::new(2, 0, epoch);
        let info = StaleConfigInfo {
            ns: Some(Namespace::new("app", "users")),
            received: Some(ChunkVersion::new(1, 0, epoch)),
            wanted: Some(wanted),
            shard: Some(ShardId::new("shardA")),
        };
        let parsed = StaleConfigInfo::parse(Some(&info.to_json()));
        assert_eq!(parsed, info);

        let partial = StaleConfigInfo::parse(Some(&json!({"vWanted": "junk"})));
        assert!(partial.wanted.is_none());
        assert!(StaleConfigInfo::parse(None).shard.is_none());
    }
}
