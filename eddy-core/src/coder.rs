use std::fmt::Debug;

use crate::{Result, Value};

/// Encode/decode capability used to turn grouping keys into comparable bytes.
pub trait Coder: Send + Sync + Debug {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Canonical JSON. Object keys are sorted, so equal values encode equally.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCoder;

impl Coder for JsonCoder {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
