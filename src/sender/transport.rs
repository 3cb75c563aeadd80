use crate::core::{HostAndPort, Status};
use async_trait::async_trait;
use serde_json::Value;

/// Executes a command against one shard host.
///
/// `Ok` carries whatever the host replied, including `ok: 0` replies;
/// `Err` means no reply was obtained (network, timeout, shutdown).
#[async_trait]
pub trait ShardTransport: Send + Sync {
    async fn run_command(
        &self,
        host: &HostAndPort,
        db: &str,
        command: Value,
    ) -> Result<Value, Status>;
}
