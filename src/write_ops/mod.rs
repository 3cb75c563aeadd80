pub mod batch_write_op;
pub mod targeted;
pub mod write_op;

pub use batch_write_op::{BatchWriteOp, ChildBatches};
pub use targeted::{ShardError, ShardWcError, TargetedWrite, TargetedWriteBatch, TrackedErrors};
pub use write_op::{WriteOp, WriteOpState, is_retryable_op_error};
