//! Conversion between caller data and the JSON payloads carried by slots.

use crate::error::{Result, ShmtaskError};
use serde_json::{Map, Value};

/// Data handed to a transformation.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestData {
    /// A row source: one JSON object per row.
    Rows(Vec<Map<String, Value>>),
    /// A scalar or array literal.
    Literal(Value),
}

impl RequestData {
    /// Interpret raw caller text: JSON if it parses, otherwise a string literal.
    ///
    /// An array made only of objects is treated as rows.
    pub fn from_json_str(text: &str) -> Self {
        match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Array(items)) if !items.is_empty() && items.iter().all(Value::is_object) => {
                Self::Rows(
                    items
                        .into_iter()
                        .filter_map(|v| match v {
                            Value::Object(map) => Some(map),
                            _ => None,
                        })
                        .collect(),
                )
            }
            Ok(value) => Self::Literal(value),
            Err(_) => Self::Literal(Value::String(text.to_string())),
        }
    }

    /// Serialize for an input buffer.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Self::Rows(rows) => serde_json::to_vec(rows)?,
            Self::Literal(value) => serde_json::to_vec(value)?,
        };
        Ok(bytes)
    }
}

impl From<Value> for RequestData {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

/// Turn a result payload back into a set of records.
///
/// An array yields its elements and any other JSON value is a single record.
/// Output that is not JSON at all, such as plain text from a command
/// transform, becomes one string record. An empty payload is no records.
pub fn parse_records(payload: &[u8]) -> Result<Vec<Value>> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| ShmtaskError::Execution {
            kind: crate::queue::ErrorKind::Failed,
            message: format!("result is not valid UTF-8: {e}"),
        })?
        .trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(other) => Ok(vec![other]),
        Err(_) => Ok(vec![Value::String(text.to_string())]),
    }
}
