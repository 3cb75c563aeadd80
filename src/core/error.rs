use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = ExecError> = std::result::Result<T, E>;

impl From<serde_json::Error> for ExecError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
