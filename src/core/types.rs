use super::{ExecError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of one shard (a partition of a sharded collection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    pub fn new(name: impl Into<String>) -> Self {
        ShardId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(value: &str) -> Self {
        ShardId(value.to_string())
    }
}

/// Network address of one shard member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`; a missing port defaults to 27017.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ExecError::InvalidRequest(
                "host must not be empty".to_string(),
            ));
        }
        match input.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ExecError::InvalidRequest(format!("Invalid port in host '{}'", input))
                })?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(input, 27017)),
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection string identifying the replica set a write landed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionString(pub String);

impl From<&HostAndPort> for ConnectionString {
    fn from(host: &HostAndPort) -> Self {
        ConnectionString(host.to_string())
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully qualified collection name: `db.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub const ADMIN_DB: &'static str = "admin";

    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parses `db.collection`; the collection part may itself contain dots.
    pub fn parse(ns: &str) -> Result<Self> {
        let (db, coll) = ns.split_once('.').ok_or_else(|| {
            ExecError::InvalidRequest(format!("Invalid namespace '{}'", ns))
        })?;
        if db.is_empty() || coll.is_empty() {
            return Err(ExecError::InvalidRequest(format!(
                "Invalid namespace '{}'",
                ns
            )));
        }
        Ok(Self::new(db, coll))
    }

    pub fn is_admin_db(&self) -> bool {
        self.db == Self::ADMIN_DB
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Logical replication timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

/// Position of a write in a shard's replication log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct OpTime {
    pub ts: Timestamp,
    pub term: i64,
}

impl OpTime {
    pub fn new(secs: u32, inc: u32, term: i64) -> Self {
        Self {
            ts: Timestamp { secs, inc },
            term,
        }
    }

    pub fn is_null(&self) -> bool {
        self.ts == Timestamp::default()
    }
}

/// Opaque id of the primary's election term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ElectionId(pub String);

impl ElectionId {
    pub fn is_unset(&self) -> bool {
        self.0.is_empty()
    }
}

/// Replica-set member role a request may be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreference {
    pub fn requires_primary(&self) -> bool {
        matches!(self, ReadPreference::Primary)
    }
}
