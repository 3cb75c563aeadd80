//! Concurrent dispatch of per-shard requests.

pub mod in_memory;
pub mod registry;
pub mod transport;

pub use in_memory::{InMemoryShardTransport, ReceivedCommand, ScriptedReply};
pub use registry::{InMemoryShardRegistry, ShardRegistry};
pub use transport::ShardTransport;

use crate::config::SenderRetryPolicyConfig;
use crate::core::{ErrorCode, HostAndPort, ReadPreference, ShardId, Status};
use crate::exec::ExecutionContext;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event};

/// Whether the sender may resend a request on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Resend on network, not-primary and shutdown errors.
    Idempotent,
    NoRetry,
}

/// Outcome of one shard request.
///
/// `shard_host` is `None` when no host could be resolved for the shard;
/// then `sw_response` always carries the resolution error.
#[derive(Debug, Clone)]
pub struct ShardResponse {
    pub shard_id: ShardId,
    pub shard_host: Option<HostAndPort>,
    pub sw_response: Result<Value, Status>,
}

/// Everything a single request future needs, detached from the context.
#[derive(Clone)]
struct RequestEnv {
    registry: Arc<dyn ShardRegistry>,
    transport: Arc<dyn ShardTransport>,
    db: String,
    read_preference: ReadPreference,
    retry_policy: RetryPolicy,
    retry: SenderRetryPolicyConfig,
    timeout: Option<Duration>,
}

/// Sends a set of `(shard, command)` requests concurrently and yields the
/// responses in completion order.
///
/// Dropping the sender abandons every response not yet consumed.
pub struct ShardRequestSender {
    pending: FuturesUnordered<BoxFuture<'static, ShardResponse>>,
}

impl ShardRequestSender {
    /// Starts every request immediately.
    pub fn new(
        ctx: &ExecutionContext,
        db: &str,
        requests: Vec<(ShardId, Value)>,
        read_preference: ReadPreference,
        retry_policy: RetryPolicy,
    ) -> Self {
        let env = RequestEnv {
            registry: ctx.shard_registry.clone(),
            transport: ctx.transport.clone(),
            db: db.to_string(),
            read_preference,
            retry_policy,
            retry: ctx.config.sender_retry.clone(),
            timeout: ctx.config.shard_request_timeout_duration(),
        };

        let pending = FuturesUnordered::new();
        for (shard_id, command) in requests {
            let env = env.clone();
            let request: BoxFuture<'static, ShardResponse> =
                Box::pin(async move { run_request(env, shard_id, command).await });
            pending.push(request);
        }
        Self { pending }
    }

    /// True once every response has been returned.
    pub fn done(&self) -> bool {
        self.pending.is_empty()
    }

    /// Next completed response, or `None` when `done()`.
    pub async fn next(&mut self) -> Option<ShardResponse> {
        self.pending.next().await
    }
}

/// Error code carried by a failed attempt: the transport error, or the
/// code of an `ok: 0` reply.
fn attempt_error_code(result: &Result<Value, Status>) -> Option<ErrorCode> {
    match result {
        Err(status) => Some(status.code),
        Ok(reply) => {
            let ok = match reply.get("ok") {
                Some(Value::Bool(ok)) => *ok,
                Some(ok) => ok.as_f64().is_some_and(|ok| ok != 0.0),
                None => true,
            };
            if ok {
                None
            } else {
                Some(Status::from_json(reply).code)
            }
        }
    }
}

async fn run_request(env: RequestEnv, shard_id: ShardId, command: Value) -> ShardResponse {
    let mut attempt = 1u32;
    loop {
        let host = match env.registry.find_host(&shard_id, env.read_preference).await {
            Ok(host) => host,
            Err(status) => {
                return ShardResponse {
                    shard_id,
                    shard_host: None,
                    sw_response: Err(status),
                };
            }
        };

        let call = env.transport.run_command(&host, &env.db, command.clone());
        let result = match env.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                Err(Status::new(
                    ErrorCode::ExceededTimeLimit,
                    format!("Request to {} timed out after {:?}", host, limit),
                ))
            }),
            None => call.await,
        };

        let retriable = env.retry_policy == RetryPolicy::Idempotent
            && attempt_error_code(&result).is_some_and(|code| code.is_retriable_for_idempotent());
        if retriable && attempt < env.retry.max_attempts {
            event!(
                Level::DEBUG,
                shard = %shard_id,
                host = %host,
                attempt,
                code = ?attempt_error_code(&result),
                "retrying shard request"
            );
            tokio::time::sleep(env.retry.backoff_for(attempt)).await;
            attempt += 1;
            continue;
        }

        return ShardResponse {
            shard_id,
            shard_host: Some(host),
            sw_response: result,
        };
    }
}
