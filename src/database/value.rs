//! Row Values
//!
//! SQL values as exchanged between member databases, with a total order so
//! rows can be keyed and compared across backends.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// A table row, aligned with [`super::TableSchema::columns`]
pub type Row = Vec<Value>;

/// Primary key values of a row, aligned with [`super::TableSchema::key_columns`]
pub type RowKey = Vec<Value>;

/// SQL Value representation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(chrono::DateTime<chrono::Utc>),
}

impl Value {
    /// Convert to SQL literal
    pub fn to_sql(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''")),
            Value::Bytes(b) => format!("X'{}'", hex::encode(b)),
            Value::Timestamp(t) => format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.6f")),
        }
    }

    /// Check if value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of the value, used for identity columns
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::UInt(_) => 3,
            Value::Float(_) => 4,
            Value::String(_) => 5,
            Value::Bytes(_) => 6,
            Value::Timestamp(_) => 7,
        }
    }

    /// Feed a canonical, type-tagged encoding of the value into a hasher
    fn digest_into(&self, hasher: &mut Sha1) {
        hasher.update([self.rank()]);
        match self {
            Value::Null => {}
            Value::Bool(b) => hasher.update([*b as u8]),
            Value::Int(i) => hasher.update(i.to_le_bytes()),
            Value::UInt(u) => hasher.update(u.to_le_bytes()),
            Value::Float(f) => hasher.update(f.to_bits().to_le_bytes()),
            Value::String(s) => {
                hasher.update((s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
            Value::Bytes(b) => {
                hasher.update((b.len() as u64).to_le_bytes());
                hasher.update(b);
            }
            Value::Timestamp(t) => {
                hasher.update(t.timestamp().to_le_bytes());
                hasher.update(t.timestamp_subsec_nanos().to_le_bytes());
            }
        }
    }
}

/// SHA-1 fingerprint of a row's contents
pub fn fingerprint(row: &[Value]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update((row.len() as u64).to_le_bytes());
    for value in row {
        value.digest_into(&mut hasher);
    }
    hasher.finalize().into()
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::UInt(a), Value::UInt(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::UInt(u) => u.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Timestamp(t) => t.timestamp_nanos_opt().hash(state),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
