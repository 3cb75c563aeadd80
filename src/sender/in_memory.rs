use super::transport::ShardTransport;
use crate::core::{ErrorCode, HostAndPort, Namespace, ShardId, Status};
use crate::ops::BatchType;
use crate::routing::shard_key::lookup_path;
use crate::routing::{ChunkVersion, CollectionRoutingInfo, InMemoryCatalogCache, StaleConfigInfo};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A canned reply served instead of executing the command.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// The host replies with this document (possibly `ok: 0`).
    Reply(Value),
    /// No reply is obtained.
    Fail(Status),
    /// Serve the inner reply after a delay.
    Delayed(Duration, Box<ScriptedReply>),
}

/// A command as the host received it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedCommand {
    pub host: HostAndPort,
    pub db: String,
    pub command: Value,
}

/// Data of one shard host.
#[derive(Debug)]
struct InMemoryShard {
    shard_id: ShardId,
    collections: HashMap<Namespace, Vec<Value>>,
    next_op: u32,
}

#[derive(Debug, Default)]
struct TransportState {
    shards: HashMap<HostAndPort, InMemoryShard>,
    scripted: HashMap<HostAndPort, VecDeque<ScriptedReply>>,
    received: Vec<ReceivedCommand>,
}

/// An in-memory implementation of `ShardTransport` for testing.
///
/// Each registered host runs a tiny document store that applies insert,
/// update and delete commands. When built with a catalog, hosts fence
/// writes on `shardVersion` against the authoritative routing and answer
/// stale requests with `StaleShardVersion`, the way a real shard would.
/// Scripted replies queued for a host take precedence over execution.
#[derive(Clone, Default)]
pub struct InMemoryShardTransport {
    state: Arc<Mutex<TransportState>>,
    catalog: Option<InMemoryCatalogCache>,
}

impl InMemoryShardTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fences writes against `catalog`'s authoritative routing.
    pub fn with_catalog(catalog: InMemoryCatalogCache) -> Self {
        Self {
            state: Arc::default(),
            catalog: Some(catalog),
        }
    }

    /// Starts a shard host serving `shard`.
    pub async fn add_host(&self, host: HostAndPort, shard: impl Into<ShardId>) {
        let mut state = self.state.lock().await;
        state.shards.insert(
            host,
            InMemoryShard {
                shard_id: shard.into(),
                collections: HashMap::new(),
                next_op: 0,
            },
        );
    }

    /// Queues a reply for the next command sent to `host`.
    pub async fn script(&self, host: &HostAndPort, reply: ScriptedReply) {
        let mut state = self.state.lock().await;
        state
            .scripted
            .entry(host.clone())
            .or_default()
            .push_back(reply);
    }

    pub async fn received(&self) -> Vec<ReceivedCommand> {
        self.state.lock().await.received.clone()
    }

    pub async fn received_by(&self, host: &HostAndPort) -> Vec<ReceivedCommand> {
        self.state
            .lock()
            .await
            .received
            .iter()
            .filter(|cmd| &cmd.host == host)
            .cloned()
            .collect()
    }

    /// Documents stored on `host` for `ns`.
    pub async fn documents(&self, host: &HostAndPort, ns: &Namespace) -> Vec<Value> {
        let state = self.state.lock().await;
        state
            .shards
            .get(host)
            .and_then(|shard| shard.collections.get(ns))
            .cloned()
            .unwrap_or_default()
    }

    async fn expected_version(&self, ns: &Namespace, shard: &ShardId) -> Option<ChunkVersion> {
        let catalog = self.catalog.as_ref()?;
        match catalog.authoritative_routing_info(ns).await {
            Ok(CollectionRoutingInfo::Sharded(cm)) => Some(cm.shard_version(shard)),
            Ok(CollectionRoutingInfo::Unsharded { .. }) => Some(ChunkVersion::UNSHARDED),
            Err(_) => None,
        }
    }

    async fn resolve(mut reply: ScriptedReply) -> Result<Value, Status> {
        loop {
            match reply {
                ScriptedReply::Reply(value) => return Ok(value),
                ScriptedReply::Fail(status) => return Err(status),
                ScriptedReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }
}

#[async_trait]
impl ShardTransport for InMemoryShardTransport {
    async fn run_command(
        &self,
        host: &HostAndPort,
        db: &str,
        command: Value,
    ) -> Result<Value, Status> {
        let scripted = {
            let mut state = self.state.lock().await;
            state.received.push(ReceivedCommand {
                host: host.clone(),
                db: db.to_string(),
                command: command.clone(),
            });
            state.scripted.get_mut(host).and_then(VecDeque::pop_front)
        };
        if let Some(reply) = scripted {
            return Self::resolve(reply).await;
        }

        let parsed = ParsedWrite::parse(db, &command)?;
        let shard_id = {
            let state = self.state.lock().await;
            match state.shards.get(host) {
                Some(shard) => shard.shard_id.clone(),
                None => {
                    return Err(Status::new(
                        ErrorCode::HostUnreachable,
                        format!("Connection refused by {}", host),
                    ));
                }
            }
        };

        if let (Some(received), Some(wanted)) = (
            parsed.shard_version,
            self.expected_version(&parsed.ns, &shard_id).await,
        ) {
            if !version_matches(&received, &wanted) {
                return Ok(stale_reply(&parsed, &shard_id, received, wanted));
            }
        }

        let mut state = self.state.lock().await;
        let shard = state.shards.get_mut(host).ok_or_else(|| {
            Status::new(
                ErrorCode::HostUnreachable,
                format!("Connection refused by {}", host),
            )
        })?;
        Ok(shard.execute(&parsed))
    }
}

fn version_matches(received: &ChunkVersion, wanted: &ChunkVersion) -> bool {
    if received.is_ignored() {
        return true;
    }
    if wanted.is_unsharded() || received.is_unsharded() {
        return received == wanted;
    }
    received.is_write_compatible_with(wanted)
}

fn stale_reply(
    parsed: &ParsedWrite,
    shard: &ShardId,
    received: ChunkVersion,
    wanted: ChunkVersion,
) -> Value {
    let info = StaleConfigInfo {
        ns: Some(parsed.ns.clone()),
        received: Some(received),
        wanted: Some(wanted),
        shard: Some(shard.clone()),
    };
    let failed = if parsed.ordered {
        1
    } else {
        parsed.items.len()
    };
    let errors: Vec<Value> = (0..failed)
        .map(|index| {
            json!({
                "index": index,
                "code": ErrorCode::StaleShardVersion.code(),
                "errmsg": format!(
                    "version mismatch detected for {}: received {} but shard has {}",
                    parsed.ns, received, wanted
                ),
                "errInfo": info.to_json(),
            })
        })
        .collect();
    json!({"ok": 1, "n": 0, "writeErrors": errors})
}

/// The parts of a write command the in-memory shard needs.
struct ParsedWrite {
    ns: Namespace,
    batch_type: BatchType,
    items: Vec<Value>,
    ordered: bool,
    shard_version: Option<ChunkVersion>,
}

impl ParsedWrite {
    fn parse(db: &str, command: &Value) -> Result<Self, Status> {
        let bad = |msg: &str| Status::new(ErrorCode::FailedToParse, msg.to_string());
        let batch_type = [BatchType::Insert, BatchType::Update, BatchType::Delete]
            .into_iter()
            .find(|t| command.get(t.command_name()).is_some())
            .ok_or_else(|| bad("unknown write command"))?;
        let coll = command
            .get(batch_type.command_name())
            .and_then(Value::as_str)
            .ok_or_else(|| bad("collection name must be a string"))?;
        let items = command
            .get(batch_type.items_field())
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| bad("write items must be an array"))?;
        let shard_version = match command.get("shardVersion") {
            Some(v) => Some(
                ChunkVersion::from_json(v).map_err(|err| bad(&err.to_string()))?,
            ),
            None => None,
        };
        Ok(Self {
            ns: Namespace::new(db, coll),
            batch_type,
            items,
            ordered: command
                .get("ordered")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            shard_version,
        })
    }
}

impl InMemoryShard {
    fn execute(&mut self, parsed: &ParsedWrite) -> Value {
        self.next_op += 1;
        let docs = self.collections.entry(parsed.ns.clone()).or_default();
        let mut n = 0i64;
        let mut n_modified = 0i64;
        let mut upserted = Vec::new();
        let mut write_errors = Vec::new();

        for (index, item) in parsed.items.iter().enumerate() {
            let result = match parsed.batch_type {
                BatchType::Insert => insert_one(docs, &parsed.ns, item).map(|()| n += 1),
                BatchType::Update => update_one(docs, item).map(|outcome| {
                    n += outcome.matched;
                    n_modified += outcome.modified;
                    if let Some(id) = outcome.upserted_id {
                        n += 1;
                        upserted.push(json!({"index": index, "_id": id}));
                    }
                }),
                BatchType::Delete => delete_matching(docs, item).map(|removed| n += removed),
            };
            if let Err(status) = result {
                let mut error = status.to_json();
                error["index"] = json!(index);
                write_errors.push(error);
                if parsed.ordered {
                    break;
                }
            }
        }

        let mut reply = Map::new();
        reply.insert("ok".to_string(), json!(1));
        reply.insert("n".to_string(), json!(n));
        if parsed.batch_type == BatchType::Update {
            reply.insert("nModified".to_string(), json!(n_modified));
        }
        if !upserted.is_empty() {
            reply.insert("upserted".to_string(), Value::Array(upserted));
        }
        if !write_errors.is_empty() {
            reply.insert("writeErrors".to_string(), Value::Array(write_errors));
        }
        reply.insert(
            "opTime".to_string(),
            json!({"ts": {"secs": self.next_op, "inc": 1}, "term": 1}),
        );
        reply.insert(
            "electionId".to_string(),
            json!(format!("{}-election-1", self.shard_id)),
        );
        Value::Object(reply)
    }
}

fn insert_one(docs: &mut Vec<Value>, ns: &Namespace, doc: &Value) -> Result<(), Status> {
    let mut doc = doc.clone();
    let id = match doc.get("_id") {
        Some(id) => id.clone(),
        None => {
            let id = json!(uuid::Uuid::new_v4().to_string());
            if let Some(obj) = doc.as_object_mut() {
                obj.insert("_id".to_string(), id.clone());
            }
            id
        }
    };
    if docs.iter().any(|existing| existing.get("_id") == Some(&id)) {
        return Err(Status::new(
            ErrorCode::DuplicateKey,
            format!(
                "E11000 duplicate key error collection: {} index: _id_ dup key: {{ _id: {} }}",
                ns, id
            ),
        ));
    }
    docs.push(doc);
    Ok(())
}

struct UpdateOutcome {
    matched: i64,
    modified: i64,
    upserted_id: Option<Value>,
}

fn update_one(docs: &mut Vec<Value>, item: &Value) -> Result<UpdateOutcome, Status> {
    let empty = json!({});
    let q = item.get("q").unwrap_or(&empty);
    let u = item.get("u").unwrap_or(&empty);
    let multi = item.get("multi").and_then(Value::as_bool).unwrap_or(false);
    let upsert = item.get("upsert").and_then(Value::as_bool).unwrap_or(false);

    let mut outcome = UpdateOutcome {
        matched: 0,
        modified: 0,
        upserted_id: None,
    };
    for doc in docs.iter_mut().filter(|doc| matches_query(doc, q)) {
        let updated = apply_update(doc, u)?;
        outcome.matched += 1;
        if updated != *doc {
            outcome.modified += 1;
            *doc = updated;
        }
        if !multi {
            break;
        }
    }

    if outcome.matched == 0 && upsert {
        let mut seed = Map::new();
        if let Some(query) = q.as_object() {
            for (field, cond) in query {
                let is_operator = cond
                    .as_object()
                    .is_some_and(|obj| obj.keys().any(|k| k.starts_with('$')));
                if !field.starts_with('$') && !is_operator {
                    seed.insert(field.clone(), cond.clone());
                }
            }
        }
        let mut doc = apply_update(&Value::Object(seed.clone()), u)?;
        let id = seed
            .get("_id")
            .cloned()
            .unwrap_or_else(|| json!(uuid::Uuid::new_v4().to_string()));
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("_id".to_string(), id.clone());
        }
        docs.push(doc);
        outcome.upserted_id = Some(id);
    }
    Ok(outcome)
}

fn apply_update(doc: &Value, u: &Value) -> Result<Value, Status> {
    let update = u.as_object().ok_or_else(|| {
        Status::new(ErrorCode::FailedToParse, "update must be an object")
    })?;
    let is_operator_update = update.keys().any(|k| k.starts_with('$'));
    if !is_operator_update {
        let mut replacement = update.clone();
        if let Some(id) = doc.get("_id") {
            replacement.insert("_id".to_string(), id.clone());
        }
        return Ok(Value::Object(replacement));
    }

    let mut result = doc.as_object().cloned().unwrap_or_default();
    for (op, fields) in update {
        let fields = fields.as_object().ok_or_else(|| {
            Status::new(ErrorCode::FailedToParse, format!("{} needs an object", op))
        })?;
        for (field, value) in fields {
            match op.as_str() {
                "$set" => {
                    result.insert(field.clone(), value.clone());
                }
                "$unset" => {
                    result.remove(field);
                }
                "$inc" => {
                    let current = result.get(field).and_then(Value::as_f64).unwrap_or(0.0);
                    let delta = value.as_f64().ok_or_else(|| {
                        Status::new(
                            ErrorCode::TypeMismatch,
                            format!("Cannot increment with non-numeric argument {}", value),
                        )
                    })?;
                    let sum = current + delta;
                    let sum = if sum.fract() == 0.0 {
                        json!(sum as i64)
                    } else {
                        json!(sum)
                    };
                    result.insert(field.clone(), sum);
                }
                other => {
                    return Err(Status::new(
                        ErrorCode::FailedToParse,
                        format!("Unknown modifier: {}", other),
                    ));
                }
            }
        }
    }
    Ok(Value::Object(result))
}

fn delete_matching(docs: &mut Vec<Value>, item: &Value) -> Result<i64, Status> {
    let empty = json!({});
    let q = item.get("q").unwrap_or(&empty);
    let limit = item.get("limit").and_then(Value::as_i64).unwrap_or(0);
    let before = docs.len();
    if limit == 1 {
        if let Some(pos) = docs.iter().position(|doc| matches_query(doc, q)) {
            docs.remove(pos);
        }
    } else {
        docs.retain(|doc| !matches_query(doc, q));
    }
    Ok((before - docs.len()) as i64)
}

fn matches_query(doc: &Value, query: &Value) -> bool {
    let Some(query) = query.as_object() else {
        return false;
    };
    query.iter().all(|(field, cond)| {
        let value = lookup_path(doc, field);
        match cond.as_object() {
            Some(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => ops
                .iter()
                .all(|(op, operand)| matches_operator(value, op, operand)),
            _ => value.is_some_and(|v| compare_values(v, cond) == Some(Ordering::Equal)),
        }
    })
}

fn matches_operator(value: Option<&Value>, op: &str, operand: &Value) -> bool {
    let ordering = value.and_then(|v| compare_values(v, operand));
    match op {
        "$eq" => ordering == Some(Ordering::Equal),
        "$ne" => ordering != Some(Ordering::Equal),
        "$gt" => ordering == Some(Ordering::Greater),
        "$gte" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => ordering == Some(Ordering::Less),
        "$lte" => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        "$in" => operand.as_array().is_some_and(|candidates| {
            candidates.iter().any(|candidate| {
                value.and_then(|v| compare_values(v, candidate)) == Some(Ordering::Equal)
            })
        }),
        "$exists" => value.is_some() == operand.as_bool().unwrap_or(true),
        _ => false,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (x, y) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostAndPort {
        HostAndPort::new("a0", 27017)
    }

    async fn transport() -> InMemoryShardTransport {
        let transport = InMemoryShardTransport::new();
        transport.add_host(host(), "shardA").await;
        transport
    }

    #[tokio::test]
    async fn insert_reports_duplicate_keys() {
        let transport = transport().await;
        let reply = transport
            .run_command(
                &host(),
                "app",
                json!({"insert": "users", "documents": [{"_id": 1}, {"_id": 1}, {"_id": 2}], "ordered": false}),
            )
            .await
            .unwrap();
        assert_eq!(reply["n"], json!(2));
        assert_eq!(reply["writeErrors"][0]["index"], json!(1));
        assert_eq!(reply["writeErrors"][0]["code"], json!(11000));
        assert_eq!(
            transport
                .documents(&host(), &Namespace::new("app", "users"))
                .await
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn update_and_upsert() {
        let transport = transport().await;
        transport
            .run_command(
                &host(),
                "app",
                json!({"insert": "users", "documents": [{"_id": 1, "x": 1, "c": 0}, {"_id": 2, "x": 5, "c": 0}]}),
            )
            .await
            .unwrap();
        let reply = transport
            .run_command(
                &host(),
                "app",
                json!({"update": "users", "updates": [
                    {"q": {"x": {"$gte": 0}}, "u": {"$inc": {"c": 1}}, "multi": true, "upsert": false},
                    {"q": {"_id": 9}, "u": {"$set": {"x": 9}}, "multi": false, "upsert": true}
                ]}),
            )
            .await
            .unwrap();
        assert_eq!(reply["n"], json!(3));
        assert_eq!(reply["nModified"], json!(2));
        assert_eq!(reply["upserted"][0], json!({"index": 1, "_id": 9}));
    }

    #[tokio::test]
    async fn delete_respects_limit() {
        let transport = transport().await;
        transport
            .run_command(
                &host(),
                "app",
                json!({"insert": "users", "documents": [{"_id": 1, "k": "a"}, {"_id": 2, "k": "a"}, {"_id": 3, "k": "b"}]}),
            )
            .await
            .unwrap();
        let reply = transport
            .run_command(
                &host(),
                "app",
                json!({"delete": "users", "deletes": [{"q": {"k": "a"}, "limit": 1}, {"q": {"k": {"$in": ["a", "b"]}}, "limit": 0}]}),
            )
            .await
            .unwrap();
        assert_eq!(reply["n"], json!(3));
    }

    #[tokio::test]
    async fn scripted_replies_take_precedence() {
        let transport = transport().await;
        transport
            .script(
                &host(),
                ScriptedReply::Delayed(
                    Duration::from_millis(1),
                    Box::new(ScriptedReply::Fail(Status::new(
                        ErrorCode::HostUnreachable,
                        "down",
                    ))),
                ),
            )
            .await;
        let err = transport
            .run_command(&host(), "app", json!({"insert": "users", "documents": [{}]}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HostUnreachable);
        assert_eq!(transport.received().await.len(), 1);

        let unknown = HostAndPort::new("nowhere", 1);
        let err = transport
            .run_command(&unknown, "app", json!({"insert": "users", "documents": [{}]}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HostUnreachable);
    }
}
