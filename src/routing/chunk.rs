use super::shard_key::{KeyRange, ShardKeyPattern, ShardKeyValue};
use crate::core::{ErrorCode, ExecError, Namespace, Result, ShardId, Status};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Identity of one incarnation of a sharded collection.
///
/// Dropping and re-sharding a collection produces a new epoch; versions from
/// different epochs are never comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epoch(pub Uuid);

impl Epoch {
    pub fn new() -> Self {
        Epoch(Uuid::new_v4())
    }

    const fn unsharded() -> Self {
        Epoch(Uuid::nil())
    }

    const fn ignored() -> Self {
        Epoch(Uuid::from_u128(u128::MAX))
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of the routing metadata a request was targeted with.
///
/// `major` changes when chunks move between shards, `minor` on splits.
/// Derived ordering exists only so endpoints can key ordered maps; use
/// [`ChunkVersion::is_older_than`] to compare metadata freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkVersion {
    pub major: u32,
    pub minor: u32,
    pub epoch: Epoch,
}

impl ChunkVersion {
    /// Marker for collections that are not sharded.
    pub const UNSHARDED: ChunkVersion = ChunkVersion {
        major: 0,
        minor: 0,
        epoch: Epoch::unsharded(),
    };

    /// Marker telling the shard to skip the version check.
    pub const IGNORED: ChunkVersion = ChunkVersion {
        major: 0,
        minor: 0,
        epoch: Epoch::ignored(),
    };

    pub fn new(major: u32, minor: u32, epoch: Epoch) -> Self {
        Self {
            major,
            minor,
            epoch,
        }
    }

    pub fn is_ignored(&self) -> bool {
        *self == Self::IGNORED
    }

    pub fn is_unsharded(&self) -> bool {
        *self == Self::UNSHARDED
    }

    /// True if both versions belong to the same collection incarnation.
    pub fn is_same_epoch(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch
    }

    /// Same epoch and strictly lower `(major, minor)`.
    pub fn is_older_than(&self, other: &ChunkVersion) -> bool {
        self.is_same_epoch(other) && (self.major, self.minor) < (other.major, other.minor)
    }

    /// A shard accepts writes versioned with the same epoch and major version.
    pub fn is_write_compatible_with(&self, other: &ChunkVersion) -> bool {
        self.is_same_epoch(other) && self.major == other.major
    }

    /// Wire form: `[major, minor, "epoch"]`.
    pub fn to_json(&self) -> Value {
        json!([self.major, self.minor, self.epoch.0.to_string()])
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let parts = value.as_array().filter(|parts| parts.len() == 3).ok_or_else(|| {
            ExecError::InvalidRequest(format!("malformed chunk version {}", value))
        })?;
        let major = parts[0].as_u64().ok_or_else(|| {
            ExecError::InvalidRequest(format!("malformed major version in {}", value))
        })?;
        let minor = parts[1].as_u64().ok_or_else(|| {
            ExecError::InvalidRequest(format!("malformed minor version in {}", value))
        })?;
        let epoch = parts[2]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| ExecError::InvalidRequest(format!("malformed epoch in {}", value)))?;
        Ok(Self::new(major as u32, minor as u32, Epoch(epoch)))
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ignored() {
            f.write_str("IGNORED")
        } else if self.is_unsharded() {
            f.write_str("UNSHARDED")
        } else {
            write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
        }
    }
}

/// A contiguous `[min, max)` range of shard keys owned by one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub min: ShardKeyValue,
    pub max: ShardKeyValue,
    pub shard: ShardId,
    pub version: ChunkVersion,
}

impl Chunk {
    pub fn contains(&self, key: &ShardKeyValue) -> bool {
        &self.min <= key && key < &self.max
    }
}

/// Routing table of one sharded collection: chunks sorted by `min`,
/// covering the whole key space without gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkManager {
    namespace: Namespace,
    shard_key: ShardKeyPattern,
    epoch: Epoch,
    chunks: Vec<Chunk>,
}

impl ChunkManager {
    /// Builds a routing table from explicit chunks and validates it.
    pub fn new(
        namespace: Namespace,
        shard_key: ShardKeyPattern,
        epoch: Epoch,
        mut chunks: Vec<Chunk>,
    ) -> Result<Self> {
        chunks.sort_by(|a, b| a.min.cmp(&b.min));
        let manager = Self {
            namespace,
            shard_key,
            epoch,
            chunks,
        };
        manager.validate()?;
        Ok(manager)
    }

    /// Single chunk covering the whole key space, owned by `shard`.
    pub fn single_chunk(
        namespace: Namespace,
        shard_key: ShardKeyPattern,
        shard: impl Into<ShardId>,
    ) -> Result<Self> {
        Self::from_split_points(namespace, shard_key, &[], &[shard.into()])
    }

    /// Builds chunks from sorted split points; `shards[i]` owns chunk `i`.
    ///
    /// Each chunk gets version `(1, i)` in a fresh epoch.
    pub fn from_split_points(
        namespace: Namespace,
        shard_key: ShardKeyPattern,
        split_points: &[ShardKeyValue],
        shards: &[ShardId],
    ) -> Result<Self> {
        if shards.len() != split_points.len() + 1 {
            return Err(ExecError::Config(format!(
                "{} split points need {} owning shards, got {}",
                split_points.len(),
                split_points.len() + 1,
                shards.len()
            )));
        }
        let epoch = Epoch::new();
        let mut bounds = Vec::with_capacity(split_points.len() + 2);
        bounds.push(ShardKeyValue::MinKey);
        bounds.extend(split_points.iter().cloned());
        bounds.push(ShardKeyValue::MaxKey);

        let chunks = bounds
            .windows(2)
            .zip(shards)
            .enumerate()
            .map(|(i, (range, shard))| Chunk {
                min: range[0].clone(),
                max: range[1].clone(),
                shard: shard.clone(),
                version: ChunkVersion::new(1, i as u32, epoch),
            })
            .collect();
        Self::new(namespace, shard_key, epoch, chunks)
    }

    /// Validates the integrity of the routing table.
    ///
    /// Checks for:
    /// - at least one chunk,
    /// - full coverage from `MinKey` to `MaxKey` without gaps or overlaps,
    /// - non-empty shard names,
    /// - versions from this epoch with `major >= 1`.
    pub fn validate(&self) -> Result<()> {
        let (first, last) = match (self.chunks.first(), self.chunks.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(ExecError::Config(format!(
                    "routing table for {} must have at least one chunk",
                    self.namespace
                )));
            }
        };
        if first.min != ShardKeyValue::MinKey || last.max != ShardKeyValue::MaxKey {
            return Err(ExecError::Config(format!(
                "routing table for {} does not cover the whole key space",
                self.namespace
            )));
        }
        for pair in self.chunks.windows(2) {
            if pair[0].max != pair[1].min {
                return Err(ExecError::Config(format!(
                    "chunks [{}, {}) and [{}, {}) of {} are not contiguous",
                    pair[0].min, pair[0].max, pair[1].min, pair[1].max, self.namespace
                )));
            }
        }
        for chunk in &self.chunks {
            if chunk.min >= chunk.max {
                return Err(ExecError::Config(format!(
                    "chunk [{}, {}) of {} is empty",
                    chunk.min, chunk.max, self.namespace
                )));
            }
            if chunk.shard.as_str().trim().is_empty() {
                return Err(ExecError::Config(format!(
                    "chunk [{}, {}) of {} has no owning shard",
                    chunk.min, chunk.max, self.namespace
                )));
            }
            if chunk.version.epoch != self.epoch || chunk.version.major == 0 {
                return Err(ExecError::Config(format!(
                    "chunk [{}, {}) of {} has invalid version {}",
                    chunk.min, chunk.max, self.namespace, chunk.version
                )));
            }
        }
        Ok(())
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn shard_key(&self) -> &ShardKeyPattern {
        &self.shard_key
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Chunk owning `key`.
    pub fn find_chunk(&self, key: &ShardKeyValue) -> Result<&Chunk, Status> {
        let pos = self.chunks.partition_point(|chunk| &chunk.min <= key);
        pos.checked_sub(1)
            .and_then(|i| self.chunks.get(i))
            .filter(|chunk| chunk.contains(key))
            .ok_or_else(|| {
                Status::new(
                    ErrorCode::ShardKeyNotFound,
                    format!("no chunk of {} contains key {}", self.namespace, key),
                )
            })
    }

    /// Shards owning at least one chunk overlapping `range`.
    pub fn shards_for_range(&self, range: &KeyRange) -> BTreeSet<ShardId> {
        self.chunks
            .iter()
            .filter(|chunk| range.overlaps(&chunk.min, &chunk.max))
            .map(|chunk| chunk.shard.clone())
            .collect()
    }

    /// Every shard owning a chunk.
    pub fn all_shards(&self) -> BTreeSet<ShardId> {
        self.chunks.iter().map(|chunk| chunk.shard.clone()).collect()
    }

    /// Highest chunk version on `shard`; `(0, 0)` when the shard owns nothing.
    pub fn shard_version(&self, shard: &ShardId) -> ChunkVersion {
        self.chunks
            .iter()
            .filter(|chunk| &chunk.shard == shard)
            .map(|chunk| chunk.version)
            .max_by_key(|version| (version.major, version.minor))
            .unwrap_or(ChunkVersion::new(0, 0, self.epoch))
    }

    /// Highest chunk version in the collection.
    pub fn collection_version(&self) -> ChunkVersion {
        self.chunks
            .iter()
            .map(|chunk| chunk.version)
            .max_by_key(|version| (version.major, version.minor))
            .unwrap_or(ChunkVersion::new(0, 0, self.epoch))
    }

    /// Splits the chunk containing `at` in two; both halves get new minor versions.
    pub fn split_chunk(&mut self, at: ShardKeyValue) -> Result<()> {
        let index = self.chunk_index(&at)?;
        if self.chunks[index].min == at {
            return Err(ExecError::InvalidRequest(format!(
                "{} is already a chunk boundary of {}",
                at, self.namespace
            )));
        }
        let collection_version = self.collection_version();
        let left_version =
            ChunkVersion::new(collection_version.major, collection_version.minor + 1, self.epoch);
        let right_version =
            ChunkVersion::new(collection_version.major, collection_version.minor + 2, self.epoch);

        let original = self.chunks[index].clone();
        self.chunks[index] = Chunk {
            min: original.min,
            max: at.clone(),
            shard: original.shard.clone(),
            version: left_version,
        };
        self.chunks.insert(
            index + 1,
            Chunk {
                min: at,
                max: original.max,
                shard: original.shard,
                version: right_version,
            },
        );
        Ok(())
    }

    /// Moves the chunk containing `key` to `to`.
    ///
    /// The moved chunk gets the next major version. If the donor still owns
    /// chunks, one of them is bumped too so the donor's version also changes.
    pub fn move_chunk(&mut self, key: &ShardKeyValue, to: impl Into<ShardId>) -> Result<()> {
        let to = to.into();
        let index = self.chunk_index(key)?;
        let donor = self.chunks[index].shard.clone();
        if donor == to {
            return Err(ExecError::InvalidRequest(format!(
                "chunk containing {} of {} is already on {}",
                key, self.namespace, to
            )));
        }
        let next_major = self.collection_version().major + 1;
        self.chunks[index].shard = to;
        self.chunks[index].version = ChunkVersion::new(next_major, 0, self.epoch);
        if let Some(donor_chunk) = self.chunks.iter_mut().find(|chunk| chunk.shard == donor) {
            donor_chunk.version = ChunkVersion::new(next_major, 1, self.epoch);
        }
        Ok(())
    }

    fn chunk_index(&self, key: &ShardKeyValue) -> Result<usize> {
        let pos = self.chunks.partition_point(|chunk| &chunk.min <= key);
        pos.checked_sub(1)
            .filter(|i| self.chunks[*i].contains(key))
            .ok_or_else(|| {
                ExecError::InvalidRequest(format!(
                    "no chunk of {} contains key {}",
                    self.namespace, key
                ))
            })
    }
}

/// Cached routing state for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionRoutingInfo {
    /// Not sharded: every write goes to the database's primary shard.
    Unsharded { primary: ShardId },
    Sharded(ChunkManager),
}

impl CollectionRoutingInfo {
    pub fn is_sharded(&self) -> bool {
        matches!(self, CollectionRoutingInfo::Sharded(_))
    }

    pub fn chunk_manager(&self) -> Option<&ChunkManager> {
        match self {
            CollectionRoutingInfo::Sharded(cm) => Some(cm),
            CollectionRoutingInfo::Unsharded { .. } => None,
        }
    }

    /// Version a request to `shard` must carry.
    pub fn shard_version(&self, shard: &ShardId) -> ChunkVersion {
        match self {
            CollectionRoutingInfo::Sharded(cm) => cm.shard_version(shard),
            CollectionRoutingInfo::Unsharded { .. } => ChunkVersion::UNSHARDED,
        }
    }

    /// True if `other` routes differently: another primary, sharding state,
    /// epoch or collection version.
    pub fn differs_from(&self, other: &CollectionRoutingInfo) -> bool {
        match (self, other) {
            (
                CollectionRoutingInfo::Unsharded { primary: a },
                CollectionRoutingInfo::Unsharded { primary: b },
            ) => a != b,
            (CollectionRoutingInfo::Sharded(a), CollectionRoutingInfo::Sharded(b)) => {
                a.epoch() != b.epoch() || a.collection_version() != b.collection_version()
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_shard_manager() -> ChunkManager {
        ChunkManager::from_split_points(
            Namespace::new("app", "users"),
            ShardKeyPattern::ranged("x"),
            &[ShardKeyValue::Int(0)],
            &[ShardId::new("shardA"), ShardId::new("shardB")],
        )
        .unwrap()
    }

    #[test]
    fn lookups_find_owning_chunk() {
        let cm = two_shard_manager();
        assert_eq!(
            cm.find_chunk(&ShardKeyValue::Int(-5)).unwrap().shard,
            ShardId::new("shardA")
        );
        assert_eq!(
            cm.find_chunk(&ShardKeyValue::Int(0)).unwrap().shard,
            ShardId::new("shardB")
        );
        assert_eq!(cm.all_shards().len(), 2);
        assert_eq!(cm.shard_version(&ShardId::new("shardB")).minor, 1);
        assert_eq!(
            cm.shard_version(&ShardId::new("shardC")),
            ChunkVersion::new(0, 0, cm.epoch())
        );
    }

    #[test]
    fn validate_rejects_gaps() {
        let epoch = Epoch::new();
        let err = ChunkManager::new(
            Namespace::new("app", "users"),
            ShardKeyPattern::ranged("x"),
            epoch,
            vec![
                Chunk {
                    min: ShardKeyValue::MinKey,
                    max: ShardKeyValue::Int(0),
                    shard: ShardId::new("a"),
                    version: ChunkVersion::new(1, 0, epoch),
                },
                Chunk {
                    min: ShardKeyValue::Int(5),
                    max: ShardKeyValue::MaxKey,
                    shard: ShardId::new("b"),
                    version: ChunkVersion::new(1, 1, epoch),
                },
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("not contiguous"));
    }

    #[test]
    fn move_chunk_bumps_major_on_both_shards() {
        let mut cm = two_shard_manager();
        let before_a = cm.shard_version(&ShardId::new("shardA"));
        cm.split_chunk(ShardKeyValue::Int(-10)).unwrap();
        cm.move_chunk(&ShardKeyValue::Int(-5), "shardB").unwrap();
        cm.validate().unwrap();

        let after_a = cm.shard_version(&ShardId::new("shardA"));
        let after_b = cm.shard_version(&ShardId::new("shardB"));
        assert!(before_a.is_older_than(&after_a));
        assert!(!before_a.is_write_compatible_with(&after_a));
        assert_eq!(after_b.major, 2);
    }

    #[test]
    fn version_wire_form() {
        let version = ChunkVersion::new(3, 4, Epoch::new());
        assert_eq!(ChunkVersion::from_json(&version.to_json()).unwrap(), version);
        assert!(ChunkVersion::IGNORED.is_ignored());
        assert!(!ChunkVersion::IGNORED.is_same_epoch(&ChunkVersion::UNSHARDED));
        assert!(ChunkVersion::from_json(&json!([1, 2])).is_err());
    }
}
