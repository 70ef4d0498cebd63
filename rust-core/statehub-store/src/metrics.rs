// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Metrics-collecting wrapper for state drivers.
//
// Wraps any `StateDriver` and transparently counts the calls that actually
// reach the backend, along with latency sums, bytes moved and etag
// conflicts. Because validation and capability checks happen in the store
// before a driver is called, the counters also show which requests never
// caused I/O.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::capability::Capabilities;
use crate::coordinator::BulkOutcome;
use crate::driver::{StateDriver, StoredState, TransactionItem};
use crate::error::{ErrorKind, StateError};
use crate::item::StateItem;
use crate::query::QueryStream;
use crate::request::{DeleteRequest, GetRequest, QueryRequest};

/// Accumulated statistics for a driver.
///
/// Bulk calls count once per item.
#[derive(Debug, Clone, Default)]
pub struct DriverStats {
    pub get_count: u64,
    pub set_count: u64,
    pub delete_count: u64,
    pub transaction_count: u64,
    pub query_count: u64,
    /// Writes and deletes rejected for an etag mismatch.
    pub conflict_count: u64,
    /// Cumulative wall-clock latency of all reads, in milliseconds.
    pub get_latency_sum_ms: f64,
    /// Cumulative wall-clock latency of all writes, in milliseconds.
    pub set_latency_sum_ms: f64,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
}

/// A driver wrapper that collects operation metrics.
///
/// # Example
///
/// ```rust
/// use statehub_store::driver::StateDriver;
/// use statehub_store::encoding::EncodedValue;
/// use statehub_store::item::StateItem;
/// use statehub_store::memory::InMemoryDriver;
/// use statehub_store::metrics::MetricsDriver;
/// use statehub_store::request::GetRequest;
///
/// # tokio_test::block_on(async {
/// let metered = MetricsDriver::new(InMemoryDriver::new("cache"));
/// let item = StateItem::new("key", EncodedValue::Text("value".into())).unwrap();
/// metered.set(item).await.unwrap();
/// metered.get(&GetRequest::new("key")).await.unwrap();
///
/// let stats = metered.stats().await;
/// assert_eq!(stats.set_count, 1);
/// assert_eq!(stats.get_count, 1);
/// # });
/// ```
pub struct MetricsDriver<D: StateDriver> {
    inner: D,
    stats: Arc<RwLock<DriverStats>>,
}

impl<D: StateDriver> MetricsDriver<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            stats: Arc::new(RwLock::new(DriverStats::default())),
        }
    }

    /// Return a snapshot of the current statistics.
    pub async fn stats(&self) -> DriverStats {
        self.stats.read().await.clone()
    }

    pub async fn reset_stats(&self) {
        let mut s = self.stats.write().await;
        *s = DriverStats::default();
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    async fn record_conflict<T>(&self, result: &Result<T, StateError>) {
        if is_conflict(result) {
            self.stats.write().await.conflict_count += 1;
        }
    }
}

fn is_conflict<T>(result: &Result<T, StateError>) -> bool {
    match result {
        Err(StateError::TransactionAborted { source, .. }) => source.kind() == ErrorKind::Conflict,
        Err(err) => err.kind() == ErrorKind::Conflict,
        Ok(_) => false,
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[async_trait]
impl<D: StateDriver> StateDriver for MetricsDriver<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn init(&self) -> Result<(), StateError> {
        self.inner.init().await
    }

    async fn get(&self, req: &GetRequest) -> Result<Option<StoredState>, StateError> {
        let start = Instant::now();
        let result = self.inner.get(req).await;

        let mut s = self.stats.write().await;
        s.get_count += 1;
        s.get_latency_sum_ms += elapsed_ms(start);
        if let Ok(Some(ref stored)) = result {
            s.total_bytes_read += stored.value.byte_len() as u64;
        }
        result
    }

    async fn set(&self, item: StateItem) -> Result<String, StateError> {
        let bytes = item.value.byte_len() as u64;
        let start = Instant::now();
        let result = self.inner.set(item).await;

        let mut s = self.stats.write().await;
        s.set_count += 1;
        s.set_latency_sum_ms += elapsed_ms(start);
        if result.is_ok() {
            s.total_bytes_written += bytes;
        }
        if is_conflict(&result) {
            s.conflict_count += 1;
        }
        result
    }

    async fn delete(&self, req: &DeleteRequest) -> Result<(), StateError> {
        let mut s = self.stats.write().await;
        s.delete_count += 1;
        drop(s);
        let result = self.inner.delete(req).await;
        self.record_conflict(&result).await;
        result
    }

    async fn bulk_get(
        &self,
        requests: Vec<(usize, GetRequest)>,
        parallelism: usize,
    ) -> Vec<BulkOutcome<Option<StoredState>>> {
        let count = requests.len() as u64;
        let start = Instant::now();
        let outcomes = self.inner.bulk_get(requests, parallelism).await;

        let mut s = self.stats.write().await;
        s.get_count += count;
        s.get_latency_sum_ms += elapsed_ms(start);
        s.total_bytes_read += outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().and_then(Option::as_ref))
            .map(|stored| stored.value.byte_len() as u64)
            .sum::<u64>();
        outcomes
    }

    async fn bulk_set(&self, items: Vec<(usize, StateItem)>, parallelism: usize) -> Vec<BulkOutcome<String>> {
        let sizes: Vec<(usize, u64)> = items
            .iter()
            .map(|(index, item)| (*index, item.value.byte_len() as u64))
            .collect();
        let start = Instant::now();
        let outcomes = self.inner.bulk_set(items, parallelism).await;

        let mut s = self.stats.write().await;
        s.set_count += sizes.len() as u64;
        s.set_latency_sum_ms += elapsed_ms(start);
        for outcome in &outcomes {
            if outcome.is_ok() {
                s.total_bytes_written += sizes
                    .iter()
                    .find(|(index, _)| *index == outcome.index)
                    .map_or(0, |(_, bytes)| *bytes);
            } else if is_conflict(&outcome.result) {
                s.conflict_count += 1;
            }
        }
        outcomes
    }

    async fn bulk_delete(
        &self,
        requests: Vec<(usize, DeleteRequest)>,
        parallelism: usize,
    ) -> Vec<BulkOutcome<()>> {
        let count = requests.len() as u64;
        let outcomes = self.inner.bulk_delete(requests, parallelism).await;

        let mut s = self.stats.write().await;
        s.delete_count += count;
        s.conflict_count += outcomes.iter().filter(|o| is_conflict(&o.result)).count() as u64;
        outcomes
    }

    async fn transact(&self, items: Vec<TransactionItem>) -> Result<(), StateError> {
        let start = Instant::now();
        let result = self.inner.transact(items).await;

        let mut s = self.stats.write().await;
        s.transaction_count += 1;
        s.set_latency_sum_ms += elapsed_ms(start);
        if is_conflict(&result) {
            s.conflict_count += 1;
        }
        result
    }

    async fn query(&self, req: &QueryRequest) -> Result<QueryStream, StateError> {
        self.stats.write().await.query_count += 1;
        self.inner.query(req).await
    }

    async fn close(&self) -> Result<(), StateError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::EncodedValue;
    use crate::memory::InMemoryDriver;
    use crate::query::Filter;

    fn text(key: &str, value: &str) -> StateItem {
        StateItem::new(key, EncodedValue::Text(value.into())).unwrap()
    }

    #[tokio::test]
    async fn test_get_and_set_counts() {
        let metered = MetricsDriver::new(InMemoryDriver::default());

        metered.set(text("a", "hello")).await.unwrap();
        metered.set(text("b", "world!")).await.unwrap();
        metered.get(&GetRequest::new("a")).await.unwrap();
        metered.get(&GetRequest::new("missing")).await.unwrap();

        let stats = metered.stats().await;
        assert_eq!(stats.set_count, 2);
        assert_eq!(stats.get_count, 2);
        assert_eq!(stats.total_bytes_written, 11);
        assert_eq!(stats.total_bytes_read, 5);
        assert!(stats.get_latency_sum_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_conflicts_are_counted() {
        let metered = MetricsDriver::new(InMemoryDriver::default());
        metered.set(text("a", "1")).await.unwrap();

        let stale = text("a", "2").with_etag(Some("nope".into()));
        assert!(metered.set(stale).await.is_err());
        let stale_delete = DeleteRequest::new("a").with_etag("nope");
        assert!(metered.delete(&stale_delete).await.is_err());

        let stats = metered.stats().await;
        assert_eq!(stats.conflict_count, 2);
        // The rejected write moved no bytes.
        assert_eq!(stats.total_bytes_written, 1);
    }

    #[tokio::test]
    async fn test_bulk_counts_per_item() {
        let metered = MetricsDriver::new(InMemoryDriver::default());
        metered
            .bulk_set(vec![(0, text("a", "1")), (1, text("b", "22"))], 2)
            .await;
        let outcomes = metered
            .bulk_get(
                vec![(0, GetRequest::new("a")), (1, GetRequest::new("b")), (2, GetRequest::new("c"))],
                2,
            )
            .await;
        assert_eq!(outcomes.len(), 3);

        let stats = metered.stats().await;
        assert_eq!(stats.set_count, 2);
        assert_eq!(stats.get_count, 3);
        assert_eq!(stats.total_bytes_written, 3);
        assert_eq!(stats.total_bytes_read, 3);
    }

    #[tokio::test]
    async fn test_transaction_and_query_counts() {
        let metered = MetricsDriver::new(InMemoryDriver::default());
        metered
            .transact(vec![TransactionItem::Upsert(text("a", "1"))])
            .await
            .unwrap();
        let _ = metered.query(&QueryRequest::new(Filter::eq("x", 1))).await.unwrap();

        let stats = metered.stats().await;
        assert_eq!(stats.transaction_count, 1);
        assert_eq!(stats.query_count, 1);
    }

    #[tokio::test]
    async fn test_reset_stats() {
        let metered = MetricsDriver::new(InMemoryDriver::default());
        metered.set(text("a", "1")).await.unwrap();
        metered.reset_stats().await;

        let after = metered.stats().await;
        assert_eq!(after.set_count, 0);
        assert_eq!(after.total_bytes_written, 0);
    }

    #[test]
    fn test_name_and_capabilities_delegate() {
        let inner = InMemoryDriver::new("cache").with_capabilities(Capabilities::none());
        let metered = MetricsDriver::new(inner);
        assert_eq!(metered.name(), "cache");
        assert_eq!(metered.capabilities(), Capabilities::none());
    }
}
