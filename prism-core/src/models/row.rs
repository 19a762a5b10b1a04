//! Row values and row fingerprints.
//!
//! Row payloads are heterogeneous column maps coming out of SQL. They are
//! carried as a sum type over the SQL value kinds and serialized to JSON so
//! any primary-key shape round-trips through the `row_key` jsonb column.

use serde::{de::Deserializer, ser::SerializeMap, Deserialize, Serialize, Serializer};
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
};

/// Name of the per-row version column maintained by the replica ingester.
/// Every replicated row must carry it; it never reaches clients.
pub const ROW_VERSION_COLUMN: &str = "_0_version";

/// One SQL column value.
///
/// JSON encoding: `Null`/`Bool`/`Int`/`Float`/`Text` map to the native JSON
/// scalar; `Bytes` wraps hex in `{"b": "…"}` and `Json` wraps the payload in
/// `{"j": …}` so that decoding stays unambiguous.
#[derive(Clone, Debug)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl SqlValue {
    fn rank(&self) -> u8 {
        match self {
            SqlValue::Null => 0,
            SqlValue::Bool(_) => 1,
            SqlValue::Int(_) => 2,
            SqlValue::Float(_) => 3,
            SqlValue::Text(_) => 4,
            SqlValue::Bytes(_) => 5,
            SqlValue::Json(_) => 6,
        }
    }

    fn from_json(value: serde_json::Value) -> SqlValue {
        match value {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Int(i)
                } else {
                    SqlValue::Float(n.as_f64().unwrap_or(f64::MAX))
                }
            }
            serde_json::Value::String(s) => SqlValue::Text(s),
            serde_json::Value::Object(mut map) if map.len() == 1 => {
                if let Some(serde_json::Value::String(h)) = map.get("b") {
                    if let Ok(bytes) = hex::decode(h) {
                        return SqlValue::Bytes(bytes);
                    }
                }
                if let Some(inner) = map.remove("j") {
                    return SqlValue::Json(inner);
                }
                SqlValue::Json(serde_json::Value::Object(map))
            }
            other => SqlValue::Json(other),
        }
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_unit(),
            SqlValue::Bool(b) => serializer.serialize_bool(*b),
            SqlValue::Int(i) => serializer.serialize_i64(*i),
            SqlValue::Float(f) => serializer.serialize_f64(*f),
            SqlValue::Text(s) => serializer.serialize_str(s),
            SqlValue::Bytes(b) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("b", &hex::encode(b))?;
                map.end()
            }
            SqlValue::Json(v) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("j", v)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(SqlValue::from_json(serde_json::Value::deserialize(deserializer)?))
    }
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SqlValue {}

impl PartialOrd for SqlValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SqlValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SqlValue::Null, SqlValue::Null) => Ordering::Equal,
            (SqlValue::Bool(a), SqlValue::Bool(b)) => a.cmp(b),
            (SqlValue::Int(a), SqlValue::Int(b)) => a.cmp(b),
            (SqlValue::Float(a), SqlValue::Float(b)) => a.total_cmp(b),
            (SqlValue::Text(a), SqlValue::Text(b)) => a.cmp(b),
            (SqlValue::Bytes(a), SqlValue::Bytes(b)) => a.cmp(b),
            (SqlValue::Json(a), SqlValue::Json(b)) => {
                // Deterministic but otherwise meaningless order.
                a.to_string().cmp(&b.to_string())
            }
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl Hash for SqlValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.rank());
        match self {
            SqlValue::Null => {}
            SqlValue::Bool(b) => b.hash(state),
            SqlValue::Int(i) => i.hash(state),
            SqlValue::Float(f) => f.to_bits().hash(state),
            SqlValue::Text(s) => s.hash(state),
            SqlValue::Bytes(b) => b.hash(state),
            SqlValue::Json(v) => v.to_string().hash(state),
        }
    }
}

/// One row's column map. Ordered so canonical encodings are stable.
pub type Row = BTreeMap<String, SqlValue>;

/// The primary-key column map identifying a row within its table.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RowKey(pub BTreeMap<String, SqlValue>);

impl RowKey {
    pub fn single(column: &str, value: SqlValue) -> Self {
        RowKey(BTreeMap::from([(column.to_string(), value)]))
    }

    /// Canonical JSON text of the key, used for ordering tie-breaks and as
    /// part of the storage primary key.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).expect("row keys are valid json")
    }
}

/// The row fingerprint `(schema, table, rowKey)` used throughout row
/// patches.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct RowId {
    pub schema: String,
    pub table: String,
    pub key: RowKey,
}

impl RowId {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, key: RowKey) -> Self {
        RowId { schema: schema.into(), table: table.into(), key }
    }

    /// `schema.table`, the entity type carried in entity patches.
    pub fn entity_type(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}[{}]", self.schema, self.table, self.key.canonical())
    }
}

/// Splits a replicated row into its version token and client-facing
/// contents. Returns `None` when the version column is missing, empty or
/// not text.
pub fn split_row_version(row: &Row) -> Option<(String, Row)> {
    match row.get(ROW_VERSION_COLUMN) {
        Some(SqlValue::Text(v)) if !v.is_empty() => {
            let mut contents = row.clone();
            contents.remove(ROW_VERSION_COLUMN);
            Some((v.clone(), contents))
        }
        _ => None,
    }
}
