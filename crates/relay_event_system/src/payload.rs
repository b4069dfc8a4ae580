//! Outbound payload representation.

use crate::EventError;
use serde::Serialize;
use serde_json::{Map, Value};

/// Data handed to a connection for sending.
///
/// The variant is chosen when the payload is built, which fixes how it is
/// turned into bytes: scalars go out as-is, sequences and mappings are
/// serialized to JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Text or bytes sent verbatim.
    Scalar(Vec<u8>),
    /// A JSON array.
    Sequence(Vec<Value>),
    /// A JSON object.
    Mapping(Map<String, Value>),
}

impl Payload {
    /// Builds a payload from any serializable value.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, EventError> {
        Ok(Self::from(serde_json::to_value(value)?))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    /// Borrowed scalar bytes, or `None` for containers.
    pub fn as_scalar(&self) -> Option<&[u8]> {
        match self {
            Self::Scalar(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Consumes the payload and returns its wire bytes.
    pub fn into_bytes(self) -> Result<Vec<u8>, EventError> {
        match self {
            Self::Scalar(bytes) => Ok(bytes),
            Self::Sequence(items) => Ok(serde_json::to_vec(&items)?),
            Self::Mapping(map) => Ok(serde_json::to_vec(&map)?),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Scalar(text.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Scalar(text.into_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Scalar(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Scalar(bytes.to_vec())
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self::Mapping(map)
    }
}

impl From<Value> for Payload {
    /// Scalars use their textual form: `null` and `false` become empty,
    /// `true` becomes `1`, numbers and strings are written out plainly.
    fn from(value: Value) -> Self {
        match value {
            Value::Null | Value::Bool(false) => Self::Scalar(Vec::new()),
            Value::Bool(true) => Self::Scalar(b"1".to_vec()),
            Value::Number(number) => Self::Scalar(number.to_string().into_bytes()),
            Value::String(text) => Self::Scalar(text.into_bytes()),
            Value::Array(items) => Self::Sequence(items),
            Value::Object(map) => Self::Mapping(map),
        }
    }
}
