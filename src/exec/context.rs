use crate::config::WriteExecConfig;
use crate::routing::CatalogCache;
use crate::sender::{ShardRegistry, ShardTransport};
use crate::txn::TransactionRouter;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use uuid::Uuid;

/// Logical session a write runs under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationSessionInfo {
    pub lsid: Option<Uuid>,
    pub txn_number: Option<i64>,
}

impl OperationSessionInfo {
    /// Adds `lsid` / `txnNumber` to a shard command.
    pub fn attach(&self, command: &mut Map<String, Value>) {
        if let Some(lsid) = self.lsid {
            command.insert("lsid".to_string(), json!({"id": lsid.to_string()}));
        }
        if let Some(txn_number) = self.txn_number {
            command.insert("txnNumber".to_string(), json!(txn_number));
        }
    }
}

/// Everything one write call needs from its surroundings: metadata,
/// shard resolution, the network, limits and the session.
#[derive(Clone)]
pub struct ExecutionContext {
    pub catalog_cache: Arc<dyn CatalogCache>,
    pub shard_registry: Arc<dyn ShardRegistry>,
    pub transport: Arc<dyn ShardTransport>,
    pub config: WriteExecConfig,
    pub session: OperationSessionInfo,
    pub transaction: Option<Arc<TransactionRouter>>,
}

impl ExecutionContext {
    pub fn new(
        catalog_cache: Arc<dyn CatalogCache>,
        shard_registry: Arc<dyn ShardRegistry>,
        transport: Arc<dyn ShardTransport>,
    ) -> Self {
        Self {
            catalog_cache,
            shard_registry,
            transport,
            config: WriteExecConfig::default(),
            session: OperationSessionInfo::default(),
            transaction: None,
        }
    }

    /// Set the limits
    pub fn with_config(mut self, config: WriteExecConfig) -> Self {
        self.config = config;
        self
    }

    /// Run as a retryable write: a session with a transaction number.
    pub fn with_retryable_write(mut self, lsid: Uuid, txn_number: i64) -> Self {
        self.session = OperationSessionInfo {
            lsid: Some(lsid),
            txn_number: Some(txn_number),
        };
        self
    }

    /// Run inside a multi-statement transaction.
    pub fn with_transaction(mut self, lsid: Uuid, router: TransactionRouter) -> Self {
        self.session = OperationSessionInfo {
            lsid: Some(lsid),
            txn_number: Some(router.txn_number()),
        };
        self.transaction = Some(Arc::new(router));
        self
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn transaction_router(&self) -> Option<&TransactionRouter> {
        self.transaction.as_deref()
    }

    /// A txn number outside a transaction makes every statement idempotent.
    pub fn is_retryable_write(&self) -> bool {
        self.session.txn_number.is_some() && self.transaction.is_none()
    }
}
