// ============================================================================
// shard_write_exec Library
// ============================================================================
//
// Routes a client write batch (insert / update / delete) through a sharded
// cluster: targets every op at the shards owning its documents, dispatches
// child batches concurrently, reacts to stale routing and partial failures,
// and assembles one client reply.
//
// ============================================================================

pub mod cluster_write;
pub mod config;
pub mod core;
pub mod exec;
pub mod ops;
pub mod prelude;
pub mod routing;
pub mod sender;
pub mod txn;
pub mod write_ops;

// Re-export main types for convenience
pub use cluster_write::ClusterWriter;
pub use config::{SenderRetryPolicyConfig, WriteExecConfig};
pub use core::{ErrorCode, ExecError, Namespace, Result, ShardId, Status};
pub use exec::{BatchAbort, BatchWriteExec, BatchWriteExecStats, ExecutionContext};
pub use ops::{BatchType, BatchedCommandRequest, BatchedCommandResponse, WriteItem};
pub use routing::{CatalogCache, ChunkManagerTargeter, NsTargeter};
pub use sender::{ShardRegistry, ShardTransport};
