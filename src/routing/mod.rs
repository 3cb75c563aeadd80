//! Routing metadata and write targeting.

pub mod catalog_cache;
pub mod chunk;
pub mod chunk_manager_targeter;
pub mod shard_key;
pub mod targeter;

pub use catalog_cache::{CatalogCache, InMemoryCatalogCache};
pub use chunk::{Chunk, ChunkManager, ChunkVersion, CollectionRoutingInfo, Epoch};
pub use chunk_manager_targeter::ChunkManagerTargeter;
pub use shard_key::{KeyRange, QueryKeyPredicate, ShardKeyPattern, ShardKeyValue};
pub use targeter::{NsTargeter, ShardEndpoint, StaleConfigInfo};
