// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The backend driver contract.
//
// Every storage technology plugs in by implementing `StateDriver`. Requests
// reach a driver already validated and encoded; the driver owns I/O, etag
// bookkeeping and conflict detection. Optional operations have defaults that
// either fan out over the single-item calls (bulk) or report `NotSupported`
// (transactions, queries).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::capability::{Capabilities, Feature};
use crate::coordinator::{fan_out, BulkOutcome};
use crate::encoding::EncodedValue;
use crate::error::{Operation, StateError};
use crate::item::StateItem;
use crate::query::QueryStream;
use crate::request::{Concurrency, DeleteRequest, GetRequest, QueryRequest};

/// A value as read back from a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredState {
    pub key: String,
    pub value: EncodedValue,
    pub etag: String,
    pub metadata: HashMap<String, String>,
}

/// One validated operation of a transactional batch.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionItem {
    Upsert(StateItem),
    Delete(DeleteRequest),
}

impl TransactionItem {
    pub fn key(&self) -> &str {
        match self {
            TransactionItem::Upsert(item) => &item.key,
            TransactionItem::Delete(req) => &req.key,
        }
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        match self {
            TransactionItem::Upsert(item) => &item.metadata,
            TransactionItem::Delete(req) => &req.metadata,
        }
    }
}

/// Decide whether a write may replace the current version of `key`.
///
/// - a supplied etag must equal the stored one (an absent key never matches);
/// - without an etag, last-write always wins;
/// - without an etag, first-write only allows creating a new key.
pub fn check_write_etag(
    backend: &str,
    operation: Operation,
    key: &str,
    current: Option<&str>,
    supplied: Option<&str>,
    concurrency: Concurrency,
) -> Result<(), StateError> {
    match (supplied, current) {
        (Some(supplied), Some(current)) if supplied == current => Ok(()),
        (Some(_), _) => Err(StateError::conflict(backend, operation, key)),
        (None, Some(_)) if concurrency == Concurrency::FirstWrite => {
            Err(StateError::conflict(backend, operation, key))
        }
        (None, _) => Ok(()),
    }
}

/// Decide whether `key` may be deleted. Deleting an absent key without an
/// etag is `NotFound`; with an etag it is a conflict.
pub fn check_delete_etag(
    backend: &str,
    operation: Operation,
    key: &str,
    current: Option<&str>,
    supplied: Option<&str>,
    concurrency: Concurrency,
) -> Result<(), StateError> {
    match (supplied, current) {
        (None, None) => Err(StateError::not_found(backend, operation, key)),
        _ => check_write_etag(backend, operation, key, current, supplied, concurrency),
    }
}

/// Wall-clock instant at which a write made at `now` with `ttl` expires.
/// A `ttl` that overflows the calendar is a validation error.
pub fn expire_time(
    backend: &str,
    operation: Operation,
    key: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<DateTime<Utc>, StateError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| ttl_out_of_range(backend, operation, key, ttl))
}

/// Expiry of a write made at `now` on the runtime clock, paired with the
/// wall-clock time reported as `ttlExpireTime`.
pub fn expiry_after(
    backend: &str,
    operation: Operation,
    key: &str,
    now: Instant,
    ttl: Duration,
) -> Result<(Instant, DateTime<Utc>), StateError> {
    let at = now
        .checked_add(ttl)
        .ok_or_else(|| ttl_out_of_range(backend, operation, key, ttl))?;
    Ok((at, expire_time(backend, operation, key, Utc::now(), ttl)?))
}

fn ttl_out_of_range(backend: &str, operation: Operation, key: &str, ttl: Duration) -> StateError {
    StateError::validation(operation, key, format!("ttl of {}s is out of range", ttl.as_secs()))
        .on_backend(backend)
}

/// A pluggable state-store backend.
///
/// Implementations must be safe to share across threads and tokio tasks, and
/// must honor the etag rules of [`check_write_etag`] / [`check_delete_etag`]
/// identically.
#[async_trait]
pub trait StateDriver: Send + Sync {
    /// Human-readable backend name, used in errors and logs.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Backend handshake. Called once before the store becomes ready.
    async fn init(&self) -> Result<(), StateError> {
        Ok(())
    }

    /// Read `key`. `Ok(None)` when absent or expired.
    async fn get(&self, req: &GetRequest) -> Result<Option<StoredState>, StateError>;

    /// Write `item`, returning the new etag.
    async fn set(&self, item: StateItem) -> Result<String, StateError>;

    async fn delete(&self, req: &DeleteRequest) -> Result<(), StateError>;

    /// Read many keys. Each request carries its position in the caller's batch.
    async fn bulk_get(
        &self,
        requests: Vec<(usize, GetRequest)>,
        parallelism: usize,
    ) -> Vec<BulkOutcome<Option<StoredState>>> {
        fan_out(requests, parallelism, |req| req.key.clone(), move |req| async move {
            self.get(&req).await
        })
        .await
    }

    async fn bulk_set(
        &self,
        items: Vec<(usize, StateItem)>,
        parallelism: usize,
    ) -> Vec<BulkOutcome<String>> {
        fan_out(items, parallelism, |item| item.key.clone(), move |item| self.set(item)).await
    }

    async fn bulk_delete(
        &self,
        requests: Vec<(usize, DeleteRequest)>,
        parallelism: usize,
    ) -> Vec<BulkOutcome<()>> {
        fan_out(requests, parallelism, |req| req.key.clone(), move |req| async move {
            self.delete(&req).await
        })
        .await
    }

    /// Apply `items` atomically.
    async fn transact(&self, items: Vec<TransactionItem>) -> Result<(), StateError> {
        let _ = items;
        Err(StateError::not_supported(
            self.name(),
            Operation::Transaction,
            Feature::Transaction,
        ))
    }

    async fn query(&self, req: &QueryRequest) -> Result<QueryStream, StateError> {
        let _ = req;
        Err(StateError::not_supported(
            self.name(),
            Operation::Query,
            Feature::Query,
        ))
    }

    /// Release backend resources.
    async fn close(&self) -> Result<(), StateError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn kind(result: Result<(), StateError>) -> Option<ErrorKind> {
        result.err().map(|e| e.kind())
    }

    #[test]
    fn test_write_etag_rules() {
        let lw = Concurrency::LastWrite;
        let fw = Concurrency::FirstWrite;
        let check = |current, supplied, c| check_write_etag("b", Operation::Set, "k", current, supplied, c);

        // Matching etag applies under both policies.
        assert!(check(Some("1"), Some("1"), lw).is_ok());
        assert!(check(Some("1"), Some("1"), fw).is_ok());
        // Stale etag or etag for an absent key conflicts.
        assert_eq!(kind(check(Some("2"), Some("1"), lw)), Some(ErrorKind::Conflict));
        assert_eq!(kind(check(None, Some("1"), lw)), Some(ErrorKind::Conflict));
        // No etag: last-write always wins.
        assert!(check(Some("2"), None, lw).is_ok());
        assert!(check(None, None, lw).is_ok());
        // No etag: first-write may only create.
        assert!(check(None, None, fw).is_ok());
        assert_eq!(kind(check(Some("2"), None, fw)), Some(ErrorKind::Conflict));
    }

    #[test]
    fn test_delete_etag_rules() {
        let lw = Concurrency::LastWrite;
        let check = |current, supplied, c| check_delete_etag("b", Operation::Delete, "k", current, supplied, c);

        assert_eq!(kind(check(None, None, lw)), Some(ErrorKind::NotFound));
        assert_eq!(kind(check(None, Some("1"), lw)), Some(ErrorKind::Conflict));
        assert!(check(Some("1"), None, lw).is_ok());
        assert!(check(Some("1"), Some("1"), lw).is_ok());
        assert_eq!(kind(check(Some("1"), Some("0"), lw)), Some(ErrorKind::Conflict));
        assert_eq!(
            kind(check(Some("1"), None, Concurrency::FirstWrite)),
            Some(ErrorKind::Conflict)
        );
    }

    #[test]
    fn test_expire_time_rejects_overflow() {
        let now = Utc::now();
        let at = expire_time("b", Operation::Set, "k", now, Duration::from_secs(90)).unwrap();
        assert_eq!(at - now, chrono::Duration::seconds(90));

        let err = expire_time("b", Operation::Set, "k", now, Duration::from_secs(10_000_000_000_000))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("out of range"));
        assert!(err.to_string().contains("on b"));

        let err = expiry_after("b", Operation::Set, "k", Instant::now(), Duration::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_transaction_item_accessors() {
        let del = TransactionItem::Delete(DeleteRequest::new("gone"));
        assert_eq!(del.key(), "gone");
        assert!(del.metadata().is_empty());
    }
}
