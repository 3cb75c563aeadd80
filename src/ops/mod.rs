pub mod request;
pub mod response;

pub use request::{BatchType, BatchedCommandRequest, WriteItem};
pub use response::{
    BatchedCommandResponse, UpsertDetail, WriteConcernErrorDetail, WriteErrorDetail,
};
