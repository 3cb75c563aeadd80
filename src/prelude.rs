//! Common imports grouped by how the crate is used.
//!
//! `client` covers running writes against a cluster.
//! `testing` adds the in-memory collaborators for wiring a cluster in tests.

pub mod client {
    //! Types needed to issue a write and read its outcome.
    pub use crate::cluster_write::ClusterWriter;
    pub use crate::config::WriteExecConfig;
    pub use crate::core::{ErrorCode, Namespace, ShardId, Status};
    pub use crate::exec::{BatchAbort, BatchWriteExecStats, ExecutionContext};
    pub use crate::ops::{BatchedCommandRequest, BatchedCommandResponse, WriteItem};
    pub use crate::txn::TransactionRouter;
}

pub mod testing {
    //! In-memory catalog, registry and shards.
    pub use crate::core::HostAndPort;
    pub use crate::routing::{ChunkManager, InMemoryCatalogCache, ShardKeyPattern, ShardKeyValue};
    pub use crate::sender::{InMemoryShardRegistry, InMemoryShardTransport, ScriptedReply};
}
