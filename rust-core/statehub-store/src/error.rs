// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error taxonomy shared by every state-store driver.
//
// Drivers report failures in these terms so that application code sees the
// same error for the same situation regardless of the backend behind a store.
// Each variant names the backend, operation and/or key it concerns.

use std::fmt;

use thiserror::Error;

use crate::store::LifecycleState;

/// The state-store operation an error (or log line) refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Set,
    Delete,
    BulkGet,
    BulkSet,
    BulkDelete,
    Transaction,
    Query,
    Init,
    Close,
}

impl Operation {
    /// Stable lowercase name used in messages and tracing fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Set => "set",
            Operation::Delete => "delete",
            Operation::BulkGet => "bulk-get",
            Operation::BulkSet => "bulk-set",
            Operation::BulkDelete => "bulk-delete",
            Operation::Transaction => "transaction",
            Operation::Query => "query",
            Operation::Init => "init",
            Operation::Close => "close",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a [`StateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    NotSupported,
    Lifecycle,
    Encoding,
    Cancelled,
    Transport,
    Transaction,
    UnknownBackend,
    Config,
}

/// Errors returned by state stores, drivers and the registry.
#[derive(Debug, Error)]
pub enum StateError {
    /// The request is malformed (empty key, missing value, bad option string).
    /// `backend` is empty when raised outside a store.
    #[error("invalid {operation} request for key '{key}'{}: {reason}", backend_suffix(.backend))]
    Validation {
        backend: String,
        operation: Operation,
        key: String,
        reason: String,
    },

    /// The key does not exist in the backend.
    #[error("key '{key}' not found in {backend} during {operation}")]
    NotFound {
        backend: String,
        operation: Operation,
        key: String,
    },

    /// The supplied etag does not match the stored one, or a first-write
    /// update arrived without an etag. Nothing was written.
    #[error("etag mismatch for key '{key}' in {backend} during {operation}")]
    Conflict {
        backend: String,
        operation: Operation,
        key: String,
    },

    /// The backend does not declare the capability the request needs.
    #[error("{backend} does not support {feature} (requested by {operation})")]
    NotSupported {
        backend: String,
        operation: Operation,
        feature: String,
    },

    /// The store is not in the `Ready` state.
    #[error("{backend} cannot {operation} while {state}")]
    Lifecycle {
        backend: String,
        operation: Operation,
        state: LifecycleState,
    },

    /// A value could not be serialized or deserialized.
    #[error("failed to encode value for key '{key}' during {operation}{}: {reason}", backend_suffix(.backend))]
    Encoding {
        backend: String,
        operation: Operation,
        key: String,
        reason: String,
    },

    /// The caller cancelled the operation or its deadline elapsed.
    #[error("{operation} on {backend} cancelled: {reason}")]
    Cancelled {
        backend: String,
        operation: Operation,
        reason: String,
    },

    /// Backend I/O failed. May be retried by the caller; the core never
    /// retries on its own.
    #[error("{backend} transport failure during {operation}: {message}")]
    Transport {
        backend: String,
        operation: Operation,
        message: String,
    },

    /// A transactional batch was rejected as a whole. `index` is the position
    /// of the operation that caused the abort.
    #[error("transaction on {backend} aborted at operation {index}: {source}")]
    TransactionAborted {
        backend: String,
        index: usize,
        source: Box<StateError>,
    },

    /// No component with this name is configured.
    #[error("unknown state store: {0}")]
    UnknownBackend(String),

    /// The registry or a component configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn backend_suffix(backend: &str) -> String {
    if backend.is_empty() {
        String::new()
    } else {
        format!(" on {backend}")
    }
}

impl StateError {
    pub fn validation(operation: Operation, key: &str, reason: impl Into<String>) -> Self {
        StateError::Validation {
            backend: String::new(),
            operation,
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_found(backend: &str, operation: Operation, key: &str) -> Self {
        StateError::NotFound {
            backend: backend.to_string(),
            operation,
            key: key.to_string(),
        }
    }

    pub fn conflict(backend: &str, operation: Operation, key: &str) -> Self {
        StateError::Conflict {
            backend: backend.to_string(),
            operation,
            key: key.to_string(),
        }
    }

    pub fn not_supported(backend: &str, operation: Operation, feature: impl fmt::Display) -> Self {
        StateError::NotSupported {
            backend: backend.to_string(),
            operation,
            feature: feature.to_string(),
        }
    }

    pub fn encoding(operation: Operation, key: &str, reason: impl fmt::Display) -> Self {
        StateError::Encoding {
            backend: String::new(),
            operation,
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Name the backend on validation and encoding errors raised before one
    /// was known. Errors that already carry a backend are left untouched.
    pub fn on_backend(mut self, name: &str) -> Self {
        if let StateError::Validation { backend, .. } | StateError::Encoding { backend, .. } = &mut self {
            if backend.is_empty() {
                *backend = name.to_string();
            }
        }
        self
    }

    pub fn transport(backend: &str, operation: Operation, message: impl fmt::Display) -> Self {
        StateError::Transport {
            backend: backend.to_string(),
            operation,
            message: message.to_string(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateError::Validation { .. } => ErrorKind::Validation,
            StateError::NotFound { .. } => ErrorKind::NotFound,
            StateError::Conflict { .. } => ErrorKind::Conflict,
            StateError::NotSupported { .. } => ErrorKind::NotSupported,
            StateError::Lifecycle { .. } => ErrorKind::Lifecycle,
            StateError::Encoding { .. } => ErrorKind::Encoding,
            StateError::Cancelled { .. } => ErrorKind::Cancelled,
            StateError::Transport { .. } => ErrorKind::Transport,
            StateError::TransactionAborted { .. } => ErrorKind::Transaction,
            StateError::UnknownBackend(_) => ErrorKind::UnknownBackend,
            StateError::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    /// Whether a caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::Transport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = StateError::validation(Operation::Set, "", "key must not be empty");
        assert_eq!(
            err.to_string(),
            "invalid set request for key '': key must not be empty"
        );
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_conflict_names_backend_operation_and_key() {
        let err = StateError::conflict("orders", Operation::Delete, "order-7");
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("delete"));
        assert!(msg.contains("order-7"));
    }

    #[test]
    fn test_not_supported_display() {
        let err = StateError::not_supported("cache", Operation::Query, "query");
        assert_eq!(
            err.to_string(),
            "cache does not support query (requested by query)"
        );
    }

    #[test]
    fn test_lifecycle_display() {
        let err = StateError::Lifecycle {
            backend: "orders".to_string(),
            operation: Operation::Get,
            state: LifecycleState::Closed,
        };
        assert_eq!(err.to_string(), "orders cannot get while closed");
    }

    #[test]
    fn test_transaction_aborted_wraps_cause() {
        let err = StateError::TransactionAborted {
            backend: "orders".to_string(),
            index: 2,
            source: Box::new(StateError::conflict("orders", Operation::Transaction, "k")),
        };
        assert!(err.to_string().contains("operation 2"));
        assert!(err.to_string().contains("etag mismatch"));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.kind(), ErrorKind::Transaction);
    }

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(StateError::transport("redb", Operation::Set, "disk full").is_retryable());
        assert!(!StateError::not_found("redb", Operation::Get, "k").is_retryable());
        assert!(!StateError::conflict("redb", Operation::Set, "k").is_retryable());
        assert!(!StateError::encoding(Operation::Get, "k", "bad json").is_retryable());
    }

    #[test]
    fn test_errors_name_backend_operation_and_key() {
        let err = StateError::not_found("orders", Operation::BulkGet, "order-7");
        assert_eq!(err.to_string(), "key 'order-7' not found in orders during bulk-get");

        let err = StateError::validation(Operation::Set, "k", "value is required").on_backend("orders");
        assert_eq!(err.to_string(), "invalid set request for key 'k' on orders: value is required");

        let err = StateError::encoding(Operation::Set, "k", "bad map key").on_backend("orders");
        assert_eq!(err.to_string(), "failed to encode value for key 'k' during set on orders: bad map key");
    }

    #[test]
    fn test_on_backend_keeps_existing_backend() {
        let err = StateError::validation(Operation::Get, "k", "empty")
            .on_backend("first")
            .on_backend("second");
        assert!(matches!(err, StateError::Validation { ref backend, .. } if backend == "first"));

        let err = StateError::conflict("orders", Operation::Set, "k").on_backend("other");
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::BulkSet.to_string(), "bulk-set");
        assert_eq!(Operation::Transaction.as_str(), "transaction");
    }
}
