use crate::core::{ExecError, Namespace, Result};
use serde_json::{Map, Value, json};

/// Kind of write command a batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchType {
    Insert,
    Update,
    Delete,
}

impl BatchType {
    /// Command name, also the field carrying the collection name.
    pub fn command_name(&self) -> &'static str {
        match self {
            BatchType::Insert => "insert",
            BatchType::Update => "update",
            BatchType::Delete => "delete",
        }
    }

    /// Field carrying the array of write items.
    pub fn items_field(&self) -> &'static str {
        match self {
            BatchType::Insert => "documents",
            BatchType::Update => "updates",
            BatchType::Delete => "deletes",
        }
    }
}

/// One insert, update or delete from the client batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteItem {
    Insert {
        document: Value,
    },
    Update {
        q: Value,
        u: Value,
        multi: bool,
        upsert: bool,
    },
    Delete {
        q: Value,
        multi: bool,
    },
}

impl WriteItem {
    pub fn insert(document: Value) -> Self {
        WriteItem::Insert { document }
    }

    pub fn update(q: Value, u: Value, multi: bool, upsert: bool) -> Self {
        WriteItem::Update { q, u, multi, upsert }
    }

    pub fn delete(q: Value, multi: bool) -> Self {
        WriteItem::Delete { q, multi }
    }

    pub fn batch_type(&self) -> BatchType {
        match self {
            WriteItem::Insert { .. } => BatchType::Insert,
            WriteItem::Update { .. } => BatchType::Update,
            WriteItem::Delete { .. } => BatchType::Delete,
        }
    }

    /// Wire shape of the item inside `documents`/`updates`/`deletes`.
    pub fn to_json(&self) -> Value {
        match self {
            WriteItem::Insert { document } => document.clone(),
            WriteItem::Update { q, u, multi, upsert } => json!({
                "q": q,
                "u": u,
                "multi": multi,
                "upsert": upsert,
            }),
            WriteItem::Delete { q, multi } => json!({
                "q": q,
                "limit": if *multi { 0 } else { 1 },
            }),
        }
    }

    /// Serialized size plus array-entry overhead, used to split batches.
    pub fn estimated_size(&self) -> usize {
        const ARRAY_ENTRY_OVERHEAD: usize = 8;
        serde_json::to_vec(&self.to_json())
            .map(|bytes| bytes.len())
            .unwrap_or(0)
            + ARRAY_ENTRY_OVERHEAD
    }

    fn parse(batch_type: BatchType, value: &Value) -> Result<Self> {
        match batch_type {
            BatchType::Insert => Ok(WriteItem::insert(value.clone())),
            BatchType::Update => {
                let q = value.get("q").cloned().ok_or_else(|| {
                    ExecError::InvalidRequest("update entry is missing 'q'".to_string())
                })?;
                let u = value.get("u").cloned().ok_or_else(|| {
                    ExecError::InvalidRequest("update entry is missing 'u'".to_string())
                })?;
                let multi = value.get("multi").and_then(Value::as_bool).unwrap_or(false);
                let upsert = value.get("upsert").and_then(Value::as_bool).unwrap_or(false);
                Ok(WriteItem::update(q, u, multi, upsert))
            }
            BatchType::Delete => {
                let q = value.get("q").cloned().ok_or_else(|| {
                    ExecError::InvalidRequest("delete entry is missing 'q'".to_string())
                })?;
                let limit = value.get("limit").and_then(Value::as_i64).ok_or_else(|| {
                    ExecError::InvalidRequest("delete entry is missing 'limit'".to_string())
                })?;
                if limit != 0 && limit != 1 {
                    return Err(ExecError::InvalidRequest(format!(
                        "delete limit must be 0 or 1, got {}",
                        limit
                    )));
                }
                Ok(WriteItem::delete(q, limit == 0))
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            WriteItem::Insert { document } => {
                let doc = document.as_object().ok_or_else(|| {
                    ExecError::InvalidRequest("insert document must be an object".to_string())
                })?;
                if let Some(field) = doc.keys().find(|k| k.starts_with('$')) {
                    return Err(ExecError::InvalidRequest(format!(
                        "insert document field '{}' must not start with '$'",
                        field
                    )));
                }
                Ok(())
            }
            WriteItem::Update { q, u, .. } => {
                if !q.is_object() {
                    return Err(ExecError::InvalidRequest(
                        "update query must be an object".to_string(),
                    ));
                }
                let u = u.as_object().ok_or_else(|| {
                    ExecError::InvalidRequest("update modifier must be an object".to_string())
                })?;
                let operators = u.keys().filter(|k| k.starts_with('$')).count();
                if operators != 0 && operators != u.len() {
                    return Err(ExecError::InvalidRequest(
                        "update document mixes operators and replacement fields".to_string(),
                    ));
                }
                Ok(())
            }
            WriteItem::Delete { q, .. } => {
                if !q.is_object() {
                    return Err(ExecError::InvalidRequest(
                        "delete query must be an object".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// The client-submitted write command
///
/// Immutable once built; the batch write op reads items by index.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedCommandRequest {
    pub namespace: Namespace,
    pub batch_type: BatchType,
    pub items: Vec<WriteItem>,
    pub ordered: bool,
    pub bypass_document_validation: bool,
    pub write_concern: Option<Value>,
}

impl BatchedCommandRequest {
    pub fn new(namespace: Namespace, batch_type: BatchType, items: Vec<WriteItem>) -> Result<Self> {
        let request = Self {
            namespace,
            batch_type,
            items,
            ordered: true,
            bypass_document_validation: false,
            write_concern: None,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn insert(namespace: Namespace, documents: Vec<Value>) -> Result<Self> {
        Self::new(
            namespace,
            BatchType::Insert,
            documents.into_iter().map(WriteItem::insert).collect(),
        )
    }

    pub fn update(namespace: Namespace, updates: Vec<WriteItem>) -> Result<Self> {
        Self::new(namespace, BatchType::Update, updates)
    }

    pub fn delete(namespace: Namespace, deletes: Vec<WriteItem>) -> Result<Self> {
        Self::new(namespace, BatchType::Delete, deletes)
    }

    /// Set ordered execution (default `true`)
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Set the write concern forwarded to shards
    pub fn write_concern(mut self, write_concern: Value) -> Self {
        self.write_concern = Some(write_concern);
        self
    }

    /// Set document validation bypass
    pub fn bypass_document_validation(mut self, bypass: bool) -> Self {
        self.bypass_document_validation = bypass;
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item(&self, index: usize) -> &WriteItem {
        &self.items[index]
    }

    /// Parses a client write command such as
    /// `{insert: "coll", documents: [...], ordered: false}` against `db`.
    pub fn parse(db: &str, command: &Value) -> Result<Self> {
        let obj = command.as_object().ok_or_else(|| {
            ExecError::InvalidRequest("write command must be an object".to_string())
        })?;
        let batch_type = [BatchType::Insert, BatchType::Update, BatchType::Delete]
            .into_iter()
            .find(|t| obj.contains_key(t.command_name()))
            .ok_or_else(|| {
                ExecError::InvalidRequest(
                    "write command must be one of insert, update or delete".to_string(),
                )
            })?;
        let coll = obj
            .get(batch_type.command_name())
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ExecError::InvalidRequest(format!(
                    "'{}' must name a collection",
                    batch_type.command_name()
                ))
            })?;
        let items = obj
            .get(batch_type.items_field())
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ExecError::InvalidRequest(format!(
                    "'{}' must be an array",
                    batch_type.items_field()
                ))
            })?
            .iter()
            .map(|item| WriteItem::parse(batch_type, item))
            .collect::<Result<Vec<_>>>()?;

        let mut request = Self::new(Namespace::new(db, coll), batch_type, items)?;
        if let Some(ordered) = obj.get("ordered").and_then(Value::as_bool) {
            request.ordered = ordered;
        }
        if let Some(bypass) = obj.get("bypassDocumentValidation").and_then(Value::as_bool) {
            request.bypass_document_validation = bypass;
        }
        if let Some(wc) = obj.get("writeConcern") {
            request.write_concern = Some(wc.clone());
        }
        Ok(request)
    }

    /// Builds the command body for a subset of items, in the given order.
    ///
    /// Session, shard version and statement ids are appended by the caller.
    pub fn to_command_for_items(&self, indices: &[usize], include_write_concern: bool) -> Map<String, Value> {
        let mut command = Map::new();
        command.insert(
            self.batch_type.command_name().to_string(),
            json!(self.namespace.coll),
        );
        command.insert(
            self.batch_type.items_field().to_string(),
            Value::Array(indices.iter().map(|i| self.items[*i].to_json()).collect()),
        );
        command.insert("ordered".to_string(), json!(self.ordered));
        if self.bypass_document_validation {
            command.insert("bypassDocumentValidation".to_string(), json!(true));
        }
        if include_write_concern {
            if let Some(wc) = &self.write_concern {
                command.insert("writeConcern".to_string(), wc.clone());
            }
        }
        command
    }

    fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            return Err(ExecError::InvalidRequest(format!(
                "Write batch for {} must contain at least one operation",
                self.namespace
            )));
        }
        for (index, item) in self.items.iter().enumerate() {
            if item.batch_type() != self.batch_type {
                return Err(ExecError::InvalidRequest(format!(
                    "Operation {} is a {} in a {} batch",
                    index,
                    item.batch_type().command_name(),
                    self.batch_type.command_name()
                )));
            }
            item.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("foo", "bar")
    }

    #[test]
    fn test_insert_request_defaults_to_ordered() {
        let request = BatchedCommandRequest::insert(ns(), vec![json!({"x": 1})]).unwrap();
        assert!(request.ordered);
        assert_eq!(request.len(), 1);
        assert_eq!(request.batch_type, BatchType::Insert);
    }

    #[test]
    fn test_empty_and_mixed_batches_are_rejected() {
        assert!(BatchedCommandRequest::insert(ns(), vec![]).is_err());
        assert!(
            BatchedCommandRequest::new(
                ns(),
                BatchType::Insert,
                vec![WriteItem::delete(json!({"x": 1}), false)],
            )
            .is_err()
        );
        assert!(BatchedCommandRequest::insert(ns(), vec![json!({"$set": {"x": 1}})]).is_err());
        assert!(
            BatchedCommandRequest::update(
                ns(),
                vec![WriteItem::update(json!({}), json!({"$set": {"a": 1}, "b": 2}), false, false)],
            )
            .is_err()
        );
    }

    #[test]
    fn test_parse_client_command() {
        let command = json!({
            "delete": "bar",
            "deletes": [{"q": {"x": 1}, "limit": 1}, {"q": {"x": {"$gt": 5}}, "limit": 0}],
            "ordered": false,
            "writeConcern": {"w": "majority"}
        });
        let request = BatchedCommandRequest::parse("foo", &command).unwrap();
        assert_eq!(request.namespace, ns());
        assert!(!request.ordered);
        assert_eq!(request.items[0], WriteItem::delete(json!({"x": 1}), false));
        assert_eq!(
            request.items[1],
            WriteItem::delete(json!({"x": {"$gt": 5}}), true)
        );
        assert_eq!(request.write_concern, Some(json!({"w": "majority"})));
    }

    #[test]
    fn test_command_for_subset_keeps_given_order() {
        let request = BatchedCommandRequest::insert(
            ns(),
            vec![json!({"x": 1}), json!({"x": 2}), json!({"x": 3})],
        )
        .unwrap()
        .write_concern(json!({"w": 1}));
        let command = request.to_command_for_items(&[2, 0], false);
        assert_eq!(command["insert"], json!("bar"));
        assert_eq!(command["documents"], json!([{"x": 3}, {"x": 1}]));
        assert!(!command.contains_key("writeConcern"));
        assert!(request.to_command_for_items(&[0], true).contains_key("writeConcern"));
    }
}
