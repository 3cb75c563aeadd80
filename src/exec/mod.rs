//! Orchestration of one client write batch.

pub mod batch_write_exec;
pub mod context;
pub mod stats;

pub use batch_write_exec::{BatchAbort, BatchWriteExec};
pub use context::{ExecutionContext, OperationSessionInfo};
pub use stats::{BatchWriteExecStats, HostOpTime};
