pub mod error;
pub mod status;
pub mod types;

pub use error::{ExecError, Result};
pub use status::{ErrorCode, Status};
pub use types::{
    ConnectionString, ElectionId, HostAndPort, Namespace, OpTime, ReadPreference, ShardId,
    Timestamp,
};
