#![allow(dead_code)]

use serde_json::Value;
use shard_write_exec::core::{HostAndPort, Namespace, ShardId};
use shard_write_exec::routing::{
    ChunkManager, ChunkManagerTargeter, InMemoryCatalogCache, ShardKeyPattern, ShardKeyValue,
};
use shard_write_exec::sender::{InMemoryShardRegistry, InMemoryShardTransport};
use shard_write_exec::{BatchedCommandRequest, ExecutionContext};
use std::sync::Arc;

pub const SHARD_A: &str = "shardA";
pub const SHARD_B: &str = "shardB";

pub fn host_a() -> HostAndPort {
    HostAndPort::new("a0.cluster.local", 27018)
}

pub fn host_b() -> HostAndPort {
    HostAndPort::new("b0.cluster.local", 27018)
}

/// `app.users`, sharded on `x`: negative keys on shardA, the rest on shardB.
pub fn sharded_ns() -> Namespace {
    Namespace::new("app", "users")
}

/// `app.logs`, unsharded; lives on shardA, the primary of `app`.
pub fn unsharded_ns() -> Namespace {
    Namespace::new("app", "logs")
}

/// Two single-host shards behind an in-memory catalog.
pub struct TestCluster {
    pub catalog: InMemoryCatalogCache,
    pub registry: InMemoryShardRegistry,
    pub transport: InMemoryShardTransport,
}

impl TestCluster {
    pub async fn new() -> Self {
        let catalog = InMemoryCatalogCache::new();
        catalog.create_database("app", SHARD_A).await;
        let cm = ChunkManager::from_split_points(
            sharded_ns(),
            ShardKeyPattern::ranged("x"),
            &[ShardKeyValue::Int(0)],
            &[ShardId::new(SHARD_A), ShardId::new(SHARD_B)],
        )
        .unwrap();
        catalog.shard_collection(cm).await.unwrap();

        let registry = InMemoryShardRegistry::new();
        registry.add_shard(SHARD_A, vec![host_a()]).await;
        registry.add_shard(SHARD_B, vec![host_b()]).await;

        let transport = InMemoryShardTransport::with_catalog(catalog.clone());
        transport.add_host(host_a(), SHARD_A).await;
        transport.add_host(host_b(), SHARD_B).await;

        Self {
            catalog,
            registry,
            transport,
        }
    }

    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(
            Arc::new(self.catalog.clone()),
            Arc::new(self.registry.clone()),
            Arc::new(self.transport.clone()),
        )
    }

    /// Targeter with routing for `ns` loaded (and cached) now.
    pub async fn targeter(&self, ns: Namespace) -> ChunkManagerTargeter {
        let mut targeter = ChunkManagerTargeter::new(ns, Arc::new(self.catalog.clone()));
        targeter.init().await.unwrap();
        targeter
    }
}

pub fn insert(ns: Namespace, docs: Vec<Value>, ordered: bool) -> BatchedCommandRequest {
    BatchedCommandRequest::insert(ns, docs).unwrap().ordered(ordered)
}
