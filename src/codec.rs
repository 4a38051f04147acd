//! Pluggable document serialization.
//!
//! The engine treats serialization as an external collaborator: callers
//! supply a [`Serializer`] implementation, or use the default
//! [`JsonSerializer`]. Compression is not modeled here — a caller that
//! wants it composes its own `Serializer` around a codec of its choice.

use std::path::PathBuf;

use bytes::Bytes;
use serde_json::Value;

use crate::error::{Result, StoreError};

pub trait Serializer: Send + Sync {
    fn serialize(&self, doc: &Value) -> Result<Bytes>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

/// Default serializer: documents are JSON values, encoded compactly.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, doc: &Value) -> Result<Bytes> {
        let bytes = serde_json::to_vec(doc)
            .map_err(|e| StoreError::InvalidArgument(format!("document not serializable: {e}")))?;
        Ok(Bytes::from(bytes))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| StoreError::CorruptFile {
                path: PathBuf::new(),
                reason: format!("document is not valid JSON: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_roundtrip() {
        let codec = JsonSerializer;
        let doc = json!({"a": 1, "b": "two"});
        let bytes = codec.serialize(&doc).unwrap();
        let back = codec.deserialize(&bytes).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn corrupt_bytes_fail() {
        let codec = JsonSerializer;
        assert!(codec.deserialize(b"not json").is_err());
    }
}
