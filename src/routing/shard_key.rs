use crate::core::{ErrorCode, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A point in shard-key space.
///
/// Variant order is the key order: `MinKey < Int < Text < MaxKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShardKeyValue {
    MinKey,
    Int(i64),
    Text(String),
    MaxKey,
}

impl ShardKeyValue {
    /// Converts a raw field value; only integers and strings can be shard keys.
    pub fn from_json(value: &Value) -> Result<Self, Status> {
        match value {
            Value::Number(num) => {
                if let Some(i) = num.as_i64() {
                    return Ok(ShardKeyValue::Int(i));
                }
                match num.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Ok(ShardKeyValue::Int(f as i64))
                    }
                    _ => Err(Status::new(
                        ErrorCode::BadValue,
                        format!("shard key value {} is not an integer", num),
                    )),
                }
            }
            Value::String(s) => Ok(ShardKeyValue::Text(s.clone())),
            other => Err(Status::new(
                ErrorCode::BadValue,
                format!("unsupported shard key value {}", other),
            )),
        }
    }
}

impl fmt::Display for ShardKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKeyValue::MinKey => f.write_str("MinKey"),
            ShardKeyValue::Int(i) => write!(f, "{}", i),
            ShardKeyValue::Text(s) => write!(f, "\"{}\"", s),
            ShardKeyValue::MaxKey => f.write_str("MaxKey"),
        }
    }
}

/// Computes a stable 64-bit hash of a shard key value using FNV-1a.
///
/// The value is hashed through its canonical JSON text, so the result is
/// identical on every router and across restarts.
pub fn stable_hash_key(value: &Value) -> i64 {
    let mut hash = 14695981039346656037u64;
    for byte in value.to_string().as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash as i64
}

/// Closed-open or closed interval of shard keys a query can match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub min: ShardKeyValue,
    pub max: ShardKeyValue,
    pub max_inclusive: bool,
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            min: ShardKeyValue::MinKey,
            max: ShardKeyValue::MaxKey,
            max_inclusive: true,
        }
    }

    /// True if the chunk `[chunk_min, chunk_max)` can hold a key in this range.
    pub fn overlaps(&self, chunk_min: &ShardKeyValue, chunk_max: &ShardKeyValue) -> bool {
        if chunk_max <= &self.min {
            return false;
        }
        if self.max_inclusive {
            chunk_min <= &self.max
        } else {
            chunk_min < &self.max
        }
    }
}

/// What a query predicate says about the shard key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKeyPredicate {
    /// Equality on the shard key: targets exactly one chunk.
    Exact(ShardKeyValue),
    /// Range on the shard key: targets every overlapping chunk.
    Range(KeyRange),
    /// The query does not constrain the shard key.
    Unconstrained,
}

/// The field a collection is partitioned on, optionally hashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    pub field: String,
    #[serde(default)]
    pub hashed: bool,
}

impl ShardKeyPattern {
    pub fn ranged(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            hashed: false,
        }
    }

    pub fn hashed(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            hashed: true,
        }
    }

    /// Maps a raw field value to its position in key space.
    pub fn key_for(&self, raw: &Value) -> Result<ShardKeyValue, Status> {
        if self.hashed {
            Ok(ShardKeyValue::Int(stable_hash_key(raw)))
        } else {
            ShardKeyValue::from_json(raw)
        }
    }

    /// Extracts the shard key from a full document.
    pub fn extract_from_document(&self, doc: &Value) -> Result<ShardKeyValue, Status> {
        let raw = lookup_path(doc, &self.field).ok_or_else(|| {
            Status::new(
                ErrorCode::ShardKeyNotFound,
                format!(
                    "document {} does not contain shard key for pattern {{ {}: {} }}",
                    doc,
                    self.field,
                    if self.hashed { "\"hashed\"" } else { "1" }
                ),
            )
        })?;
        self.key_for(raw)
    }

    /// Classifies the constraint a query puts on the shard key.
    pub fn extract_from_query(&self, query: &Value) -> Result<QueryKeyPredicate, Status> {
        let Some(condition) = lookup_path(query, &self.field) else {
            return Ok(QueryKeyPredicate::Unconstrained);
        };

        let operators = match condition.as_object() {
            Some(obj) if obj.keys().all(|k| k.starts_with('$')) && !obj.is_empty() => obj,
            _ => return Ok(QueryKeyPredicate::Exact(self.key_for(condition)?)),
        };

        if let Some(eq) = operators.get("$eq") {
            return Ok(QueryKeyPredicate::Exact(self.key_for(eq)?));
        }
        // Hashing does not preserve order, so ranges on hashed keys target everything.
        if self.hashed {
            return Ok(QueryKeyPredicate::Unconstrained);
        }

        let mut range = KeyRange::all();
        let mut constrained = false;
        for (op, bound) in operators {
            match op.as_str() {
                "$gt" | "$gte" => {
                    let key = ShardKeyValue::from_json(bound)?;
                    if key > range.min {
                        range.min = key;
                    }
                    constrained = true;
                }
                "$lt" | "$lte" => {
                    let key = ShardKeyValue::from_json(bound)?;
                    let inclusive = op == "$lte";
                    if key < range.max || (key == range.max && !inclusive) {
                        range.max = key;
                        range.max_inclusive = inclusive;
                    }
                    constrained = true;
                }
                _ => {}
            }
        }
        if constrained {
            Ok(QueryKeyPredicate::Range(range))
        } else {
            Ok(QueryKeyPredicate::Unconstrained)
        }
    }
}

/// Resolves a dotted path (`a.b.c`) inside a JSON document.
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(direct) = doc.get(path) {
        return Some(direct);
    }
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// True if the query pins `_id` to a single value.
pub fn query_has_exact_id(query: &Value) -> bool {
    match query.get("_id") {
        None => false,
        Some(Value::Object(obj)) => {
            let operator_doc = !obj.is_empty() && obj.keys().all(|k| k.starts_with('$'));
            !operator_doc || obj.contains_key("$eq")
        }
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_follows_variants() {
        assert!(ShardKeyValue::MinKey < ShardKeyValue::Int(i64::MIN));
        assert!(ShardKeyValue::Int(i64::MAX) < ShardKeyValue::Text(String::new()));
        assert!(ShardKeyValue::Text("zzz".into()) < ShardKeyValue::MaxKey);
    }

    #[test]
    fn stable_hash_is_deterministic() {
        let a = stable_hash_key(&json!("user-42"));
        let b = stable_hash_key(&json!("user-42"));
        assert_eq!(a, b);
        assert_ne!(a, stable_hash_key(&json!("user-43")));
    }

    #[test]
    fn extract_from_document_supports_dotted_paths() {
        let pattern = ShardKeyPattern::ranged("user.id");
        assert_eq!(
            pattern
                .extract_from_document(&json!({"user": {"id": 7}}))
                .unwrap(),
            ShardKeyValue::Int(7)
        );
        let err = pattern.extract_from_document(&json!({"x": 1})).unwrap_err();
        assert_eq!(err.code, ErrorCode::ShardKeyNotFound);
    }

    #[test]
    fn query_predicates() {
        let pattern = ShardKeyPattern::ranged("x");
        assert_eq!(
            pattern.extract_from_query(&json!({"x": 5})).unwrap(),
            QueryKeyPredicate::Exact(ShardKeyValue::Int(5))
        );
        assert_eq!(
            pattern.extract_from_query(&json!({"x": {"$eq": 5}})).unwrap(),
            QueryKeyPredicate::Exact(ShardKeyValue::Int(5))
        );
        assert_eq!(
            pattern
                .extract_from_query(&json!({"x": {"$gte": -2, "$lt": -1}}))
                .unwrap(),
            QueryKeyPredicate::Range(KeyRange {
                min: ShardKeyValue::Int(-2),
                max: ShardKeyValue::Int(-1),
                max_inclusive: false,
            })
        );
        assert_eq!(
            pattern.extract_from_query(&json!({"y": 1})).unwrap(),
            QueryKeyPredicate::Unconstrained
        );
        assert_eq!(
            ShardKeyPattern::hashed("x")
                .extract_from_query(&json!({"x": {"$gt": 1}}))
                .unwrap(),
            QueryKeyPredicate::Unconstrained
        );
    }

    #[test]
    fn range_overlap_respects_open_upper_bound() {
        let range = KeyRange {
            min: ShardKeyValue::Int(0),
            max: ShardKeyValue::Int(10),
            max_inclusive: false,
        };
        assert!(range.overlaps(&ShardKeyValue::MinKey, &ShardKeyValue::Int(1)));
        assert!(!range.overlaps(&ShardKeyValue::MinKey, &ShardKeyValue::Int(0)));
        assert!(!range.overlaps(&ShardKeyValue::Int(10), &ShardKeyValue::MaxKey));
        let inclusive = KeyRange {
            max_inclusive: true,
            ..range
        };
        assert!(inclusive.overlaps(&ShardKeyValue::Int(10), &ShardKeyValue::MaxKey));
    }

    #[test]
    fn exact_id_detection() {
        assert!(query_has_exact_id(&json!({"_id": 3})));
        assert!(query_has_exact_id(&json!({"_id": {"$eq": 3}})));
        assert!(!query_has_exact_id(&json!({"_id": {"$gt": 3}})));
        assert!(!query_has_exact_id(&json!({"y": 3})));
    }
}
