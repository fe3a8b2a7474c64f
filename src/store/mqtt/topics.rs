//! Mapping between store paths and MQTT topics/payloads.
//!
//! A document lives as the retained JSON payload of its topic. An empty
//! retained payload means the document does not exist. Field writes below a
//! document republish the whole document with that field replaced.

use crate::store::{StorePath, ensure_object};
use serde_json::{Map, Value};

/// Retained-state topic of the document at `path`.
pub fn document_topic(prefix: &str, path: &StorePath) -> String {
    let prefix = prefix.trim_end_matches('/');
    if path.is_root() {
        prefix.to_string()
    } else if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}/{path}")
    }
}

/// `document` with the field at `relative` set to `value`. A `Value::Null`
/// removes the field. Missing intermediate objects are created.
///
/// `["pillCounts", "A"]` with `3` sets `{"pillCounts": {"A": 3}}` and keeps
/// every other field.
pub fn merge_field(document: Option<Value>, relative: &[String], value: Value) -> Value {
    let mut document = document.unwrap_or_else(|| Value::Object(Map::new()));
    let Some((last, parents)) = relative.split_last() else {
        return value;
    };

    let mut node = &mut document;
    for segment in parents {
        node = ensure_object(node)
            .entry(segment.clone())
            .or_insert(Value::Null);
    }
    let object = ensure_object(node);
    if value.is_null() {
        object.remove(last);
    } else {
        object.insert(last.clone(), value);
    }
    document
}

/// Bytes of a retained document. Removing a document clears the retained
/// message, which MQTT expresses as an empty payload.
pub fn encode_document(value: &Value) -> Vec<u8> {
    if value.is_null() {
        Vec::new()
    } else {
        value.to_string().into_bytes()
    }
}

/// Decode a retained document. Empty payloads and `null` mean absent.
pub fn decode_document(payload: &[u8]) -> Result<Option<Value>, serde_json::Error> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(payload)?;
    Ok((!value.is_null()).then_some(value))
}
