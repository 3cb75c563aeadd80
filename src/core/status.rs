// ============================================================================
// Status & Error Codes
// ============================================================================
//
// Shards report failures as (code, message, extra info) triples. The engine
// reasons about a closed set of codes; anything else is carried through as
// `ErrorCode::Other` so it still reaches the client untouched.
//
// ============================================================================

use serde_json::{Map, Value, json};
use std::fmt;
use thiserror::Error;

macro_rules! error_codes {
    ($($variant:ident = $code:literal),+ $(,)?) => {
        /// Server error codes understood by the write path.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ErrorCode {
            $($variant,)+
            /// A code this engine has no special handling for.
            Other(i32),
        }

        impl ErrorCode {
            /// Numeric wire code.
            pub fn code(&self) -> i32 {
                match self {
                    $(ErrorCode::$variant => $code,)+
                    ErrorCode::Other(code) => *code,
                }
            }

            /// Maps a numeric wire code back to a variant.
            pub fn from_code(code: i32) -> Self {
                match code {
                    $($code => ErrorCode::$variant,)+
                    other => ErrorCode::Other(other),
                }
            }

            /// Wire name (`codeName`).
            pub fn name(&self) -> String {
                match self {
                    $(ErrorCode::$variant => stringify!($variant).to_string(),)+
                    ErrorCode::Other(code) => format!("Location{}", code),
                }
            }
        }
    };
}

error_codes! {
    OK = 0,
    InternalError = 1,
    BadValue = 2,
    NoSuchKey = 4,
    HostUnreachable = 6,
    HostNotFound = 7,
    UnknownError = 8,
    FailedToParse = 9,
    TypeMismatch = 14,
    LockTimeout = 24,
    NamespaceNotFound = 26,
    ExceededTimeLimit = 50,
    ShardKeyNotFound = 61,
    StaleShardVersion = 63,
    WriteConcernFailed = 64,
    ShardNotFound = 70,
    InvalidOptions = 72,
    InvalidNamespace = 73,
    NoProgressMade = 82,
    NetworkTimeout = 89,
    CallbackCanceled = 90,
    ShutdownInProgress = 91,
    WriteConflict = 112,
    FailedToSatisfyReadPreference = 133,
    StaleEpoch = 150,
    PrimarySteppedDown = 189,
    CannotImplicitlyCreateCollection = 227,
    SnapshotTooOld = 239,
    SnapshotUnavailable = 246,
    StaleDbVersion = 249,
    NoSuchTransaction = 251,
    PreparedTransactionInProgress = 267,
    WouldChangeOwningShard = 283,
    SocketException = 9001,
    NotMaster = 10107,
    DuplicateKey = 11000,
    InterruptedAtShutdown = 11600,
    InterruptedDueToReplStateChange = 11602,
    StaleConfig = 13388,
    NotMasterNoSlaveOk = 13435,
    NotMasterOrSecondary = 13436,
}

impl ErrorCode {
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::HostUnreachable
                | ErrorCode::HostNotFound
                | ErrorCode::NetworkTimeout
                | ErrorCode::SocketException
        )
    }

    pub fn is_not_primary_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::NotMaster
                | ErrorCode::NotMasterNoSlaveOk
                | ErrorCode::NotMasterOrSecondary
                | ErrorCode::PrimarySteppedDown
                | ErrorCode::InterruptedDueToReplStateChange
        )
    }

    pub fn is_shutdown_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::ShutdownInProgress | ErrorCode::InterruptedAtShutdown
        )
    }

    pub fn is_snapshot_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::SnapshotTooOld | ErrorCode::SnapshotUnavailable
        )
    }

    /// Shard-side routing version mismatches.
    pub fn is_stale_shard_version(&self) -> bool {
        matches!(
            self,
            ErrorCode::StaleShardVersion | ErrorCode::StaleEpoch | ErrorCode::StaleConfig
        )
    }

    /// Errors a sender may retry on its own when the request is idempotent.
    pub fn is_retriable_for_idempotent(&self) -> bool {
        self.is_network_error() || self.is_not_primary_error() || self.is_shutdown_error()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// An error code paired with a human readable reason.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {reason}")]
pub struct Status {
    pub code: ErrorCode,
    pub reason: String,
    /// Structured details attached by the reporter (`errInfo` on the wire).
    pub extra_info: Option<Value>,
}

impl Status {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            extra_info: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(ErrorCode::OK, "")
    }

    pub fn with_extra_info(mut self, info: Value) -> Self {
        self.extra_info = Some(info);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::OK
    }

    /// Prefixes the reason with `context`, keeping code and extra info.
    pub fn with_context(&self, context: impl fmt::Display) -> Self {
        Self {
            code: self.code,
            reason: format!("{} :: caused by :: {}", context, self.reason),
            extra_info: self.extra_info.clone(),
        }
    }

    /// Replaces the reason, keeping code and extra info.
    pub fn with_reason(&self, reason: impl Into<String>) -> Self {
        Self {
            code: self.code,
            reason: reason.into(),
            extra_info: self.extra_info.clone(),
        }
    }

    /// Serializes as `{code, codeName, errmsg, errInfo?}`.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("code".to_string(), json!(self.code.code()));
        obj.insert("codeName".to_string(), json!(self.code.name()));
        obj.insert("errmsg".to_string(), json!(self.reason));
        if let Some(info) = &self.extra_info {
            obj.insert("errInfo".to_string(), info.clone());
        }
        Value::Object(obj)
    }

    /// Reads `{code, errmsg, errInfo?}`; a missing code is `UnknownError`.
    pub fn from_json(value: &Value) -> Self {
        let code = value
            .get("code")
            .and_then(|c| c.as_i64())
            .map(|c| ErrorCode::from_code(c as i32))
            .unwrap_or(ErrorCode::UnknownError);
        let reason = value
            .get("errmsg")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        Self {
            code,
            reason,
            extra_info: value.get("errInfo").cloned(),
        }
    }
}

impl PartialEq<ErrorCode> for Status {
    fn eq(&self, other: &ErrorCode) -> bool {
        self.code == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_numbers() {
        assert_eq!(ErrorCode::from_code(63), ErrorCode::StaleShardVersion);
        assert_eq!(ErrorCode::StaleShardVersion.code(), 63);
        assert_eq!(ErrorCode::from_code(424242), ErrorCode::Other(424242));
        assert_eq!(ErrorCode::NoProgressMade.name(), "NoProgressMade");
    }

    #[test]
    fn context_is_prefixed_and_code_kept() {
        let status = Status::new(ErrorCode::HostUnreachable, "connection refused");
        let wrapped = status.with_context("Write results unavailable from shard0:27017");
        assert_eq!(wrapped.code, ErrorCode::HostUnreachable);
        assert!(wrapped.reason.starts_with("Write results unavailable"));
        assert!(wrapped.reason.ends_with("connection refused"));
    }

    #[test]
    fn retriable_classification() {
        assert!(ErrorCode::NotMaster.is_retriable_for_idempotent());
        assert!(ErrorCode::InterruptedAtShutdown.is_retriable_for_idempotent());
        assert!(!ErrorCode::StaleEpoch.is_retriable_for_idempotent());
        assert!(!ErrorCode::DuplicateKey.is_retriable_for_idempotent());
    }

    #[test]
    fn json_shape() {
        let status = Status::new(ErrorCode::DuplicateKey, "dup").with_extra_info(json!({"k": 1}));
        let value = status.to_json();
        assert_eq!(value["code"], json!(11000));
        assert_eq!(value["codeName"], json!("DuplicateKey"));
        assert_eq!(Status::from_json(&value), status);
    }
}
