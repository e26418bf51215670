//! Record trait and index values

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current time in Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A value usable as a secondary index
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    Text(String),
    Int(i64),
}

impl IndexValue {
    pub fn as_json(&self) -> serde_json::Value {
        match self {
            IndexValue::Text(s) => serde_json::Value::String(s.clone()),
            IndexValue::Int(i) => serde_json::Value::Number((*i).into()),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        IndexValue::Text(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        IndexValue::Text(s)
    }
}

impl From<i64> for IndexValue {
    fn from(i: i64) -> Self {
        IndexValue::Int(i)
    }
}

/// A persistable record
///
/// Types implementing `Record` are stored as JSON payloads under
/// `(collection, id)` and can declare index values for filtered listing.
pub trait Record: Serialize + DeserializeOwned {
    /// Collection (logical table) this record belongs to
    fn collection() -> &'static str;

    /// Unique identifier within the collection
    fn id(&self) -> &str;

    /// Secondary index values for filtered queries
    fn indexes(&self) -> Vec<(&'static str, IndexValue)> {
        Vec::new()
    }
}
