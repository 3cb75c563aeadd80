use crate::core::{ElectionId, ErrorCode, OpTime, Status};
use serde_json::{Map, Value, json};

/// A failure attributed to one write operation.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteErrorDetail {
    /// Index within the request the error was reported against.
    pub index: usize,
    pub status: Status,
}

impl WriteErrorDetail {
    pub fn new(index: usize, status: Status) -> Self {
        Self { index, status }
    }

    /// An error not yet tied to a position (dispatch or targeting failures).
    pub fn from_status(status: Status) -> Self {
        Self { index: 0, status }
    }

    pub fn code(&self) -> ErrorCode {
        self.status.code
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("index".to_string(), json!(self.index));
        obj.insert("code".to_string(), json!(self.status.code.code()));
        obj.insert("codeName".to_string(), json!(self.status.code.name()));
        obj.insert("errmsg".to_string(), json!(self.status.reason));
        if let Some(info) = &self.status.extra_info {
            obj.insert("errInfo".to_string(), info.clone());
        }
        Value::Object(obj)
    }
}

/// Write concern could not be satisfied even though the writes applied.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteConcernErrorDetail {
    pub status: Status,
}

/// A document inserted by an upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertDetail {
    pub index: usize,
    pub id: Value,
}

/// Reply to a write command, both from shards and to the client
///
/// ```text
/// { ok, n, nModified?, upserted?, writeErrors?, writeConcernError?,
///   errorLabels?, opTime?, electionId?, code?/errmsg? }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedCommandResponse {
    /// Top-level command status; `OK` when `ok: 1`.
    pub status: Status,
    pub n: i64,
    pub n_modified: Option<i64>,
    pub upserted: Vec<UpsertDetail>,
    pub write_errors: Vec<WriteErrorDetail>,
    pub write_concern_error: Option<WriteConcernErrorDetail>,
    pub error_labels: Vec<String>,
    pub last_op: Option<OpTime>,
    pub election_id: Option<ElectionId>,
}

impl Default for BatchedCommandResponse {
    fn default() -> Self {
        Self {
            status: Status::ok(),
            n: 0,
            n_modified: None,
            upserted: Vec::new(),
            write_errors: Vec::new(),
            write_concern_error: None,
            error_labels: Vec::new(),
            last_op: None,
            election_id: None,
        }
    }
}

impl BatchedCommandResponse {
    /// Successful reply affecting `n` documents.
    pub fn ok_with_n(n: i64) -> Self {
        Self {
            n,
            ..Self::default()
        }
    }

    /// Command-level failure (`ok: 0`).
    pub fn from_status(status: Status) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn add_write_error(&mut self, error: WriteErrorDetail) {
        self.write_errors.push(error);
    }

    pub fn with_error_label(mut self, label: impl Into<String>) -> Self {
        self.error_labels.push(label.into());
        self
    }

    pub fn has_error_label(&self, label: &str) -> bool {
        self.error_labels.iter().any(|l| l == label)
    }

    /// First failure carried by the reply, or OK.
    ///
    /// Precedence: command error, then the first write error, then the
    /// write concern error.
    pub fn to_status(&self) -> Status {
        if !self.status.is_ok() {
            return self.status.clone();
        }
        if let Some(first) = self.write_errors.first() {
            return first.status.clone();
        }
        if let Some(wc) = &self.write_concern_error {
            return wc.status.clone();
        }
        Status::ok()
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        if self.status.is_ok() {
            obj.insert("ok".to_string(), json!(1));
        } else {
            obj.insert("ok".to_string(), json!(0));
            obj.insert("code".to_string(), json!(self.status.code.code()));
            obj.insert("codeName".to_string(), json!(self.status.code.name()));
            obj.insert("errmsg".to_string(), json!(self.status.reason));
            if let Some(info) = &self.status.extra_info {
                obj.insert("errInfo".to_string(), info.clone());
            }
        }
        obj.insert("n".to_string(), json!(self.n));
        if let Some(n_modified) = self.n_modified {
            obj.insert("nModified".to_string(), json!(n_modified));
        }
        if !self.upserted.is_empty() {
            obj.insert(
                "upserted".to_string(),
                Value::Array(
                    self.upserted
                        .iter()
                        .map(|u| json!({"index": u.index, "_id": u.id}))
                        .collect(),
                ),
            );
        }
        if !self.write_errors.is_empty() {
            obj.insert(
                "writeErrors".to_string(),
                Value::Array(self.write_errors.iter().map(|e| e.to_json()).collect()),
            );
        }
        if let Some(wc) = &self.write_concern_error {
            obj.insert("writeConcernError".to_string(), wc.status.to_json());
        }
        if !self.error_labels.is_empty() {
            obj.insert("errorLabels".to_string(), json!(self.error_labels));
        }
        if let Some(op_time) = &self.last_op {
            obj.insert("opTime".to_string(), json!(op_time));
        }
        if let Some(election_id) = &self.election_id {
            obj.insert("electionId".to_string(), json!(election_id.0));
        }
        Value::Object(obj)
    }

    /// Parses a shard reply, rejecting anything that is not a well formed
    /// write command response with `FailedToParse`.
    pub fn parse(value: &Value) -> Result<Self, Status> {
        let obj = value.as_object().ok_or_else(|| {
            Status::new(ErrorCode::FailedToParse, "write response must be an object")
        })?;
        let ok = match obj.get("ok") {
            Some(Value::Bool(ok)) => *ok,
            Some(Value::Number(num)) => num.as_f64().map(|n| n != 0.0).unwrap_or(false),
            _ => {
                return Err(Status::new(
                    ErrorCode::FailedToParse,
                    "write response is missing field 'ok'",
                ));
            }
        };

        let mut response = Self::default();
        if !ok {
            response.status = Status::from_json(value);
            if response.status.is_ok() {
                response.status = Status::new(ErrorCode::UnknownError, "command failed");
            }
        }
        response.n = match obj.get("n") {
            None => 0,
            Some(n) => n.as_i64().ok_or_else(|| {
                Status::new(ErrorCode::FailedToParse, "field 'n' must be an integer")
            })?,
        };
        response.n_modified = obj.get("nModified").and_then(Value::as_i64);

        if let Some(errors) = obj.get("writeErrors") {
            let errors = errors.as_array().ok_or_else(|| {
                Status::new(ErrorCode::FailedToParse, "field 'writeErrors' must be an array")
            })?;
            for error in errors {
                let index = error
                    .get("index")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        Status::new(ErrorCode::FailedToParse, "write error is missing 'index'")
                    })?;
                response
                    .write_errors
                    .push(WriteErrorDetail::new(index as usize, Status::from_json(error)));
            }
        }

        if let Some(wc) = obj.get("writeConcernError") {
            if !wc.is_object() {
                return Err(Status::new(
                    ErrorCode::FailedToParse,
                    "field 'writeConcernError' must be an object",
                ));
            }
            response.write_concern_error = Some(WriteConcernErrorDetail {
                status: Status::from_json(wc),
            });
        }

        if let Some(upserted) = obj.get("upserted").and_then(Value::as_array) {
            for entry in upserted {
                let index = entry.get("index").and_then(Value::as_u64).ok_or_else(|| {
                    Status::new(ErrorCode::FailedToParse, "upserted entry is missing 'index'")
                })?;
                response.upserted.push(UpsertDetail {
                    index: index as usize,
                    id: entry.get("_id").cloned().unwrap_or(Value::Null),
                });
            }
        }

        if let Some(labels) = obj.get("errorLabels").and_then(Value::as_array) {
            response.error_labels = labels
                .iter()
                .filter_map(|l| l.as_str().map(str::to_string))
                .collect();
        }
        if let Some(op_time) = obj.get("opTime") {
            response.last_op = Some(serde_json::from_value(op_time.clone()).map_err(|err| {
                Status::new(
                    ErrorCode::FailedToParse,
                    format!("field 'opTime' is malformed: {}", err),
                )
            })?);
        }
        if let Some(election_id) = obj.get("electionId").and_then(Value::as_str) {
            response.election_id = Some(ElectionId(election_id.to_string()));
        }
        Ok(response)
    }
}
