// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Item construction.
//!
//! Turns an encoded value into the record a driver persists. Nothing here
//! performs I/O; the only failure is an empty key.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::encoding::{classify_content_type, ContentKind, EncodedValue};
use crate::error::{Operation, StateError};
use crate::request::{metadata, StateOptions};

/// A validated, encoded write as handed to a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct StateItem {
    pub key: String,
    pub value: EncodedValue,
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
    pub options: StateOptions,
    /// `None` means the item never expires.
    pub ttl: Option<Duration>,
}

impl StateItem {
    pub fn new(key: impl Into<String>, value: EncodedValue) -> Result<Self, StateError> {
        let key = key.into();
        if key.is_empty() {
            return Err(StateError::validation(Operation::Set, &key, "key must not be empty"));
        }
        Ok(Self {
            key,
            value,
            etag: None,
            metadata: HashMap::new(),
            options: StateOptions::default(),
            ttl: None,
        })
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_options(mut self, options: StateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Pick the placement key for `key`: request metadata first, then the
/// driver's configured default, then the key itself. The chosen value is
/// used verbatim.
pub fn resolve_partition_key(
    key: &str,
    metadata: &HashMap<String, String>,
    default: Option<&str>,
) -> String {
    metadata
        .get(metadata::PARTITION_KEY)
        .map(String::as_str)
        .or(default)
        .unwrap_or(key)
        .to_string()
}

/// The document-database record shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentItem {
    pub id: String,
    #[serde(rename = "partitionKey")]
    pub partition_key: String,
    pub value: Value,
    #[serde(rename = "isBinary", default)]
    pub is_binary: bool,
    /// Set for text values so they read back as text rather than JSON.
    #[serde(rename = "contentType", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Seconds until expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl DocumentItem {
    /// Build the upsert document for `key`.
    ///
    /// JSON content is embedded natively, text as a JSON string and binary
    /// content as base64 with `isBinary` set.
    pub fn upsert(
        key: &str,
        value: &EncodedValue,
        partition_key: &str,
        ttl: Option<Duration>,
    ) -> Result<Self, StateError> {
        if key.is_empty() {
            return Err(StateError::validation(Operation::Set, key, "key must not be empty"));
        }

        let (value, is_binary, content_type) = match value {
            EncodedValue::Json(doc) => (doc.clone(), false, None),
            EncodedValue::Text(text) => (
                Value::String(text.clone()),
                false,
                Some("text/plain".to_string()),
            ),
            EncodedValue::Binary(bytes) => (Value::String(STANDARD.encode(bytes)), true, None),
        };

        Ok(Self {
            id: key.to_string(),
            partition_key: partition_key.to_string(),
            value,
            is_binary,
            content_type,
            ttl: ttl.map(|d| d.as_secs()),
            etag: None,
        })
    }

    /// Recover the encoded value this document was built from.
    pub fn to_encoded(&self) -> Result<EncodedValue, StateError> {
        if self.is_binary {
            let encoded = self
                .value
                .as_str()
                .ok_or_else(|| StateError::encoding(Operation::Get, &self.id, "binary value is not a string"))?;
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|err| StateError::encoding(Operation::Get, &self.id, err))?;
            return Ok(EncodedValue::Binary(bytes));
        }

        let is_text = self
            .content_type
            .as_deref()
            .is_some_and(|ct| classify_content_type(ct) == ContentKind::Text);
        match (&self.value, is_text) {
            (Value::String(text), true) => Ok(EncodedValue::Text(text.clone())),
            (doc, _) => Ok(EncodedValue::Json(doc.clone())),
        }
    }
}

/// Build the upsert document for a validated item.
pub fn create_upsert_item(item: &StateItem, partition_key: &str) -> Result<DocumentItem, StateError> {
    DocumentItem::upsert(&item.key, &item.value, partition_key, item.ttl)
}
