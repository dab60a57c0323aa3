//! User-supplied object metadata.
//!
//! Metadata is a schema-less key/value document. It is encoded to JSON text
//! when written and decoded when read; nothing in between looks inside it.

use serde_json::{Map, Value};

/// Ordered key/value document attached to an object.
pub type Metadata = Map<String, Value>;

/// Encode metadata for storage.
pub fn encode(metadata: &Metadata) -> serde_json::Result<String> {
    serde_json::to_string(metadata)
}

/// Decode stored metadata. An empty column decodes to an empty document.
pub fn decode(raw: &str) -> serde_json::Result<Metadata> {
    if raw.trim().is_empty() {
        return Ok(Metadata::new());
    }
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preserves_insertion_order_and_nested_values() {
        let mut metadata = Metadata::new();
        metadata.insert("zeta".into(), json!(1));
        metadata.insert("alpha".into(), json!({"nested": [true, null]}));

        let decoded = decode(&encode(&metadata).unwrap()).unwrap();
        let keys: Vec<_> = decoded.keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
        assert_eq!(decoded["alpha"], json!({"nested": [true, null]}));
    }

    #[test]
    fn blank_column_is_empty_document() {
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn non_object_documents_are_rejected() {
        assert!(decode("[1,2]").is_err());
    }
}
