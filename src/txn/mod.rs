//! Router-side state of a multi-statement transaction.

use crate::core::{ErrorCode, ShardId, Timestamp};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

/// Error label marking a failure after which the whole transaction may be retried.
pub const TRANSIENT_TRANSACTION_ERROR_LABEL: &str = "TransientTransactionError";

/// True if a transaction that failed with `code` can be retried from the start.
pub fn is_transient_transaction_error(
    code: ErrorCode,
    has_write_concern_error: bool,
    is_commit_or_abort: bool,
) -> bool {
    let mut transient = matches!(
        code,
        ErrorCode::WriteConflict | ErrorCode::LockTimeout | ErrorCode::PreparedTransactionInProgress
    );
    transient |= code.is_snapshot_error()
        || code.is_stale_shard_version()
        || code == ErrorCode::CannotImplicitlyCreateCollection
        || code == ErrorCode::StaleDbVersion;

    if is_commit_or_abort {
        // Retrying is only safe if the outcome cannot be rolled back.
        transient |= code == ErrorCode::NoSuchTransaction && !has_write_concern_error;
    } else {
        transient |= code.is_retriable_for_idempotent() || code == ErrorCode::NoSuchTransaction;
    }
    transient
}

/// Transaction number plus the shards that have joined the transaction.
///
/// Participants are recorded the first time a request is sent to them; only
/// that first request carries `startTransaction`.
#[derive(Debug)]
pub struct TransactionRouter {
    txn_number: i64,
    at_cluster_time: Option<Timestamp>,
    participants: Mutex<BTreeSet<ShardId>>,
}

impl TransactionRouter {
    pub fn new(txn_number: i64) -> Self {
        Self {
            txn_number,
            at_cluster_time: None,
            participants: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reads inside the transaction observe this snapshot.
    pub fn with_at_cluster_time(mut self, ts: Timestamp) -> Self {
        self.at_cluster_time = Some(ts);
        self
    }

    pub fn txn_number(&self) -> i64 {
        self.txn_number
    }

    pub fn participants(&self) -> Vec<ShardId> {
        self.participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Adds the transaction fields for a request to `shard`.
    pub fn attach_txn_fields(&self, shard: &ShardId, command: &mut Map<String, Value>) {
        let first_contact = self
            .participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(shard.clone());

        command.insert("autocommit".to_string(), json!(false));
        if first_contact {
            command.insert("startTransaction".to_string(), json!(true));
            let mut read_concern = Map::new();
            read_concern.insert("level".to_string(), json!("snapshot"));
            if let Some(ts) = self.at_cluster_time {
                read_concern.insert("atClusterTime".to_string(), json!(ts));
            }
            command.insert("readConcern".to_string(), Value::Object(read_concern));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(is_transient_transaction_error(ErrorCode::WriteConflict, false, false));
        assert!(is_transient_transaction_error(ErrorCode::InterruptedAtShutdown, false, false));
        assert!(is_transient_transaction_error(ErrorCode::StaleShardVersion, false, false));
        assert!(!is_transient_transaction_error(ErrorCode::CallbackCanceled, false, false));
        assert!(!is_transient_transaction_error(ErrorCode::DuplicateKey, false, false));

        assert!(is_transient_transaction_error(ErrorCode::NoSuchTransaction, false, true));
        assert!(!is_transient_transaction_error(ErrorCode::NoSuchTransaction, true, true));
        assert!(!is_transient_transaction_error(ErrorCode::HostUnreachable, false, true));
    }

    #[test]
    fn start_transaction_only_on_first_contact() {
        let router = TransactionRouter::new(3).with_at_cluster_time(Timestamp { secs: 5, inc: 1 });
        let shard = ShardId::new("shardA");

        let mut first = Map::new();
        router.attach_txn_fields(&shard, &mut first);
        assert_eq!(first["startTransaction"], json!(true));
        assert_eq!(first["readConcern"]["atClusterTime"], json!({"secs": 5, "inc": 1}));
        assert_eq!(first["autocommit"], json!(false));

        let mut second = Map::new();
        router.attach_txn_fields(&shard, &mut second);
        assert!(!second.contains_key("startTransaction"));
        assert_eq!(router.participants(), vec![shard]);
    }
}
