use serde::{Deserialize, Serialize};

use crate::{Timestamp, Window};

/// Element payloads are plain JSON values.
pub type Value = serde_json::Value;

/// Key bytes produced by a [`crate::Coder`].
pub type EncodedKey = Vec<u8>;

/// A value with its event timestamp and the windows it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedValue {
    pub value: Value,
    pub timestamp: Timestamp,
    pub windows: Vec<Window>,
}

impl WindowedValue {
    pub fn new(value: Value, timestamp: Timestamp, windows: Vec<Window>) -> Self {
        Self { value, timestamp, windows }
    }

    /// Global window at -inf, how bounded sources emit.
    pub fn in_global_window(value: Value) -> Self {
        Self::new(value, Timestamp::MIN, vec![Window::Global])
    }

    pub fn timestamped(value: Value, timestamp: Timestamp) -> Self {
        Self::new(value, timestamp, vec![Window::Global])
    }

    /// Same timestamp and windows, new payload.
    pub fn with_value(&self, value: Value) -> Self {
        Self { value, timestamp: self.timestamp, windows: self.windows.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedValue {
    pub value: Value,
    pub timestamp: Timestamp,
}

impl TimestampedValue {
    pub fn new(value: Value, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }
}

/// Views a `[key, value]` pair.
pub fn as_kv(v: &Value) -> Option<(&Value, &Value)> {
    match v.as_array() {
        Some(pair) if pair.len() == 2 => Some((&pair[0], &pair[1])),
        _ => None,
    }
}

pub fn kv(key: impl Into<Value>, value: impl Into<Value>) -> Value {
    Value::Array(vec![key.into(), value.into()])
}
