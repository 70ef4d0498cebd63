// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Value encoding policy.
//
// Decides how an application value is persisted. Raw bytes that already hold
// a JSON document are stored as native structured content, exactly like a
// structured value would be, so that document backends never embed JSON as a
// base64 or escaped string. Everything else keeps its original bytes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::StateError;
use crate::request::StateValue;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// How a content type string is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Text,
    Binary,
}

/// Classify a MIME content type. Parameters such as `; charset=utf-8` are
/// ignored.
pub fn classify_content_type(content_type: &str) -> ContentKind {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if essence == "application/json" || essence == "text/json" || essence.ends_with("+json") {
        ContentKind::Json
    } else if essence.starts_with("text/") {
        ContentKind::Text
    } else {
        ContentKind::Binary
    }
}

/// Return the parsed document if `bytes` is already serialized JSON.
///
/// Only complete, non-empty documents whose top level is an object or an
/// array qualify. Scalars are rejected: `42` or `true` are as likely to be
/// opaque payloads as JSON, and storing them natively would change their
/// bytes on read (`"x"` vs `x`).
pub fn parse_serialized_json(bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        _ => None,
    }
}

/// A value in its persisted form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "lowercase")]
pub enum EncodedValue {
    Json(Value),
    Text(String),
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
}

impl EncodedValue {
    pub fn is_json(&self) -> bool {
        matches!(self, EncodedValue::Json(_))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            EncodedValue::Json(value) => Some(value),
            _ => None,
        }
    }

    /// The caller-facing bytes for this value.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            // Serializing a `Value` cannot fail: its map keys are always strings.
            EncodedValue::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
            EncodedValue::Text(text) => text.as_bytes().to_vec(),
            EncodedValue::Binary(bytes) => bytes.clone(),
        }
    }

    /// Size of the caller-facing bytes.
    pub fn byte_len(&self) -> usize {
        match self {
            EncodedValue::Json(_) => self.to_bytes().len(),
            EncodedValue::Text(text) => text.len(),
            EncodedValue::Binary(bytes) => bytes.len(),
        }
    }
}

/// Serde adapter storing bytes as a base64 string.
pub(crate) mod base64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Encodes request values and decodes stored ones.
#[derive(Debug, Clone)]
pub struct ValueEncoder {
    default_content_type: String,
}

impl ValueEncoder {
    pub fn new(default_content_type: impl Into<String>) -> Self {
        Self {
            default_content_type: default_content_type.into(),
        }
    }

    pub fn default_content_type(&self) -> &str {
        &self.default_content_type
    }

    /// Produce the persisted form of `value`.
    ///
    /// `content_type` is the request's `contentType` metadata, if any.
    pub fn encode(
        &self,
        key: &str,
        value: &StateValue,
        content_type: Option<&str>,
    ) -> Result<EncodedValue, StateError> {
        match value {
            StateValue::Object(value) => Ok(EncodedValue::Json(value.clone())),
            StateValue::Raw(bytes) => {
                let content_type = content_type.unwrap_or(&self.default_content_type);
                trace!(key, content_type, len = bytes.len(), "encoding raw value");
                Ok(match classify_content_type(content_type) {
                    ContentKind::Json => match parse_serialized_json(bytes) {
                        Some(doc) => EncodedValue::Json(doc),
                        None => EncodedValue::Binary(bytes.clone()),
                    },
                    ContentKind::Text => match std::str::from_utf8(bytes) {
                        Ok(text) => EncodedValue::Text(text.to_string()),
                        Err(_) => EncodedValue::Binary(bytes.clone()),
                    },
                    ContentKind::Binary => EncodedValue::Binary(bytes.clone()),
                })
            }
        }
    }

    /// Serialize a structured application value and encode it.
    pub fn encode_serialize<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<EncodedValue, StateError> {
        let value = StateValue::from_serialize(key, value)?;
        self.encode(key, &value, None)
    }

    /// Invert [`ValueEncoder::encode`] into caller-facing bytes.
    pub fn decode(&self, value: &EncodedValue) -> Vec<u8> {
        value.to_bytes()
    }
}

impl Default for ValueEncoder {
    fn default() -> Self {
        Self::new(JSON_CONTENT_TYPE)
    }
}
