//! Dynamic field values and primary keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A dynamically-typed field value.
///
/// Entities store their scalar fields as `Value`s and backends receive them
/// as bound parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Strict equality used by dirty checking and identity keys.
    ///
    /// Unlike `PartialEq`, floats compare by bit pattern so a NaN that was
    /// never touched does not make its field permanently dirty.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }

    /// Feed this value into a hasher, tagged by variant.
    pub fn hash_into<H: Hasher>(&self, hasher: &mut H) {
        match self {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => {
                1u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Int(i) => {
                2u8.hash(hasher);
                i.hash(hasher);
            }
            Value::BigInt(i) => {
                3u8.hash(hasher);
                i.hash(hasher);
            }
            Value::Double(f) => {
                4u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Decimal(s) => {
                5u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Text(s) => {
                6u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Bytes(b) => {
                7u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Date(d) => {
                8u8.hash(hasher);
                d.hash(hasher);
            }
            Value::Timestamp(ts) => {
                9u8.hash(hasher);
                ts.hash(hasher);
            }
            Value::Uuid(u) => {
                10u8.hash(hasher);
                u.hash(hasher);
            }
            Value::Json(j) => {
                11u8.hash(hasher);
                j.to_string().hash(hasher);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::BigInt(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::Decimal(s) | Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Date(d) => write!(f, "date:{}", d),
            Value::Timestamp(ts) => write!(f, "ts:{}", ts),
            Value::Uuid(u) => {
                for byte in u {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Json(j) => write!(f, "{}", j),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// The primary-key value tuple of one row.
///
/// Composite keys keep the column order declared in the entity metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryKey(Vec<Value>);

impl PrimaryKey {
    /// Create a primary key from its component values.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Single-column primary key.
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// The component values.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Consume into the component values.
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// A key is complete when it has at least one component and none is NULL.
    pub fn is_complete(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|v| !v.is_null())
    }
}

impl PartialEq for PrimaryKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a.same_as(b))
    }
}

impl Eq for PrimaryKey {}

impl Hash for PrimaryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for v in &self.0 {
            v.hash_into(state);
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [single] = self.0.as_slice() {
            return write!(f, "{}", single);
        }
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

impl From<Vec<Value>> for PrimaryKey {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_same_as_treats_nan_as_equal_to_itself() {
        let nan = Value::Double(f64::NAN);
        assert_ne!(nan, nan.clone());
        assert!(nan.same_as(&nan.clone()));
    }

    #[test]
    fn test_primary_key_equality_and_hash() {
        let mut set = HashSet::new();
        set.insert(PrimaryKey::single(42_i64));
        assert!(set.contains(&PrimaryKey::single(42_i64)));
        assert!(!set.contains(&PrimaryKey::single(43_i64)));
        // Different variants are different keys.
        assert!(!set.contains(&PrimaryKey::single("42")));
    }

    #[test]
    fn test_primary_key_completeness() {
        assert!(PrimaryKey::new(vec![Value::BigInt(1), Value::Text("a".into())]).is_complete());
        assert!(!PrimaryKey::new(vec![Value::BigInt(1), Value::Null]).is_complete());
        assert!(!PrimaryKey::new(vec![]).is_complete());
    }

    #[test]
    fn test_primary_key_display() {
        assert_eq!(PrimaryKey::single(7_i64).to_string(), "7");
        let composite = PrimaryKey::new(vec![Value::BigInt(1), Value::Text("x".into())]);
        assert_eq!(composite.to_string(), "(1, x)");
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<i64> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some(5_i64)), Value::BigInt(5));
    }
}
