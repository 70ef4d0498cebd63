// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Request and response envelopes.
//!
//! These are the caller-facing shapes. They are identical for every backend;
//! drivers only ever see them after validation and value encoding.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{Operation, StateError};
use crate::query::Filter;

/// Metadata keys understood by every driver. Drivers ignore keys they do not
/// know about.
pub mod metadata {
    /// Placement key for partitioned backends.
    pub const PARTITION_KEY: &str = "partitionKey";
    /// Expiry in seconds; `-1` means never expire.
    pub const TTL_IN_SECONDS: &str = "ttlInSeconds";
    /// Content type of a raw value.
    pub const CONTENT_TYPE: &str = "contentType";
    /// RFC 3339 expiry instant, returned on reads of expiring keys.
    pub const TTL_EXPIRE_TIME: &str = "ttlExpireTime";
}

/// An application value before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    /// Bytes supplied by the caller, possibly already serialized.
    Raw(Vec<u8>),
    /// A structured value.
    Object(serde_json::Value),
}

impl StateValue {
    /// Serialize any `T` into a structured value. Failures name `key`.
    pub fn from_serialize<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<Self, StateError> {
        serde_json::to_value(value)
            .map(StateValue::Object)
            .map_err(|err| StateError::encoding(Operation::Set, key, err))
    }
}

impl From<Vec<u8>> for StateValue {
    fn from(bytes: Vec<u8>) -> Self {
        StateValue::Raw(bytes)
    }
}

impl From<&[u8]> for StateValue {
    fn from(bytes: &[u8]) -> Self {
        StateValue::Raw(bytes.to_vec())
    }
}

impl From<&str> for StateValue {
    fn from(text: &str) -> Self {
        StateValue::Raw(text.as_bytes().to_vec())
    }
}

impl From<String> for StateValue {
    fn from(text: String) -> Self {
        StateValue::Raw(text.into_bytes())
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(value: serde_json::Value) -> Self {
        StateValue::Object(value)
    }
}

/// Read consistency hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    #[default]
    Eventual,
    Strong,
}

/// An option string that names no known policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {option} '{value}'")]
pub struct InvalidOption {
    pub option: &'static str,
    pub value: String,
}

impl InvalidOption {
    fn new(option: &'static str, value: &str) -> Self {
        Self {
            option,
            value: value.to_string(),
        }
    }

    /// Report against the request that carried the option.
    pub fn for_request(self, operation: Operation, key: &str) -> StateError {
        StateError::validation(operation, key, self.to_string())
    }
}

impl FromStr for Consistency {
    type Err = InvalidOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eventual" => Ok(Consistency::Eventual),
            "strong" => Ok(Consistency::Strong),
            other => Err(InvalidOption::new("consistency", other)),
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Consistency::Eventual => f.write_str("eventual"),
            Consistency::Strong => f.write_str("strong"),
        }
    }
}

/// Write concurrency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Concurrency {
    /// Updates must present the current etag; blind overwrites are conflicts.
    FirstWrite,
    /// Writes without an etag always win.
    #[default]
    LastWrite,
}

impl FromStr for Concurrency {
    type Err = InvalidOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-write" => Ok(Concurrency::FirstWrite),
            "last-write" => Ok(Concurrency::LastWrite),
            other => Err(InvalidOption::new("concurrency", other)),
        }
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concurrency::FirstWrite => f.write_str("first-write"),
            Concurrency::LastWrite => f.write_str("last-write"),
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateOptions {
    pub consistency: Consistency,
    pub concurrency: Concurrency,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetRequest {
    pub key: String,
    pub metadata: HashMap<String, String>,
    pub consistency: Consistency,
}

impl GetRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetRequest {
    pub key: String,
    /// `None` is rejected by validation.
    pub value: Option<StateValue>,
    pub etag: Option<String>,
    pub options: StateOptions,
    pub metadata: HashMap<String, String>,
}

impl SetRequest {
    pub fn new(key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// Build a request whose value is `value` serialized as a structured object.
    pub fn json<T: Serialize + ?Sized>(key: impl Into<String>, value: &T) -> Result<Self, StateError> {
        let key = key.into();
        let value = StateValue::from_serialize(&key, value)?;
        Ok(Self {
            key,
            value: Some(value),
            ..Default::default()
        })
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_options(mut self, options: StateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.options.concurrency = concurrency;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.metadata.get(metadata::CONTENT_TYPE).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteRequest {
    pub key: String,
    pub etag: Option<String>,
    pub options: StateOptions,
    pub metadata: HashMap<String, String>,
}

impl DeleteRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.options.concurrency = concurrency;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// One step of a transactional request.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOperation {
    Set(SetRequest),
    Delete(DeleteRequest),
}

impl TransactionOperation {
    pub fn key(&self) -> &str {
        match self {
            TransactionOperation::Set(req) => &req.key,
            TransactionOperation::Delete(req) => &req.key,
        }
    }
}

/// Operations meant to commit together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionalRequest {
    pub operations: Vec<TransactionOperation>,
    pub metadata: HashMap<String, String>,
}

impl TransactionalRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, req: SetRequest) -> Self {
        self.operations.push(TransactionOperation::Set(req));
        self
    }

    pub fn delete(mut self, req: DeleteRequest) -> Self {
        self.operations.push(TransactionOperation::Delete(req));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub filter: Option<Filter>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl QueryRequest {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A successful read.
#[derive(Debug, Clone, PartialEq)]
pub struct GetResponse {
    pub key: String,
    /// The value as the caller sees it: JSON text for structured content,
    /// the original bytes otherwise.
    pub data: Vec<u8>,
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl GetResponse {
    /// Deserialize the value as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, StateError> {
        serde_json::from_slice(&self.data).map_err(|err| StateError::encoding(Operation::Get, &self.key, err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetResponse {
    /// The etag the backend assigned to the new version.
    pub etag: String,
}

/// One match yielded by a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryItem {
    pub key: String,
    pub data: Vec<u8>,
    pub etag: Option<String>,
}

impl QueryItem {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, StateError> {
        serde_json::from_slice(&self.data).map_err(|err| StateError::encoding(Operation::Query, &self.key, err))
    }
}

/// Caller-supplied cancellation and deadline for a single call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub cancel: Option<CancellationToken>,
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
