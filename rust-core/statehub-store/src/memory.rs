// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory state driver.
//
// Uses an ordered map wrapped in a tokio `RwLock`, so queries and snapshots
// come back in key order. Etags are a process-local counter. Expiry runs on
// the tokio clock, which lets tests drive TTLs with a paused runtime; expired
// entries are hidden immediately and reclaimed on the next access. Intended
// for testing, development and ephemeral state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::capability::Capabilities;
use crate::coordinator::BulkOutcome;
use crate::driver::{
    check_delete_etag, check_write_etag, expiry_after, StateDriver, StoredState, TransactionItem,
};
use crate::encoding::EncodedValue;
use crate::error::{Operation, StateError};
use crate::expiry::{Expiring, ExpiringMap};
use crate::item::StateItem;
use crate::query::QueryStream;
use crate::request::{metadata, DeleteRequest, GetRequest, QueryRequest};

#[derive(Debug, Clone)]
struct Entry {
    value: EncodedValue,
    etag: String,
    expires_at: Option<Instant>,
    expire_time: Option<DateTime<Utc>>,
}

impl Expiring for Entry {
    fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }
}

impl Entry {
    fn to_stored(&self, key: &str) -> StoredState {
        let mut md = HashMap::new();
        if let Some(at) = self.expire_time {
            md.insert(
                metadata::TTL_EXPIRE_TIME.to_string(),
                at.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
        StoredState {
            key: key.to_string(),
            value: self.value.clone(),
            etag: self.etag.clone(),
            metadata: md,
        }
    }
}

/// A state driver keeping everything in process memory.
///
/// Clones share the same data.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use statehub_store::memory::InMemoryDriver;
/// use statehub_store::request::{CallOptions, GetRequest, SetRequest};
/// use statehub_store::store::StateStore;
///
/// # tokio_test::block_on(async {
/// let store = StateStore::new("cache", Arc::new(InMemoryDriver::new("cache")));
/// store.init().await.unwrap();
/// let call = CallOptions::new();
/// store.set(SetRequest::new("hello", "{\"n\":1}"), &call).await.unwrap();
/// let got = store.get(GetRequest::new("hello"), &call).await.unwrap();
/// assert_eq!(got.data, b"{\"n\":1}".to_vec());
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryDriver {
    name: String,
    capabilities: Capabilities,
    data: Arc<RwLock<ExpiringMap<String, Entry>>>,
    next_etag: Arc<AtomicU64>,
    /// Simulated per-call latency, for exercising deadlines.
    latency: Option<Duration>,
}

impl InMemoryDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Capabilities::all(),
            data: Arc::new(RwLock::new(ExpiringMap::default())),
            next_etag: Arc::new(AtomicU64::new(1)),
            latency: None,
        }
    }

    /// Restrict the declared capabilities. Requests needing a withdrawn
    /// feature are then rejected before reaching this driver.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.data.read().await.iter_live(now).count()
    }

    /// Number of stored entries, counting expired ones not yet reclaimed.
    pub async fn stored_len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Reclaim every expired entry now, returning how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let mut map = self.data.write().await;
        self.purge(&mut map, Instant::now())
    }

    fn purge(&self, map: &mut ExpiringMap<String, Entry>, now: Instant) -> usize {
        let purged = map.purge_expired(now);
        if purged > 0 {
            debug!(backend = %self.name, purged, "expired entries reclaimed");
        }
        purged
    }

    /// Shared access for reads. Expired entries found on the way in are
    /// reclaimed first.
    async fn read_live(&self, now: Instant) -> RwLockReadGuard<'_, ExpiringMap<String, Entry>> {
        let map = self.data.read().await;
        if !map.has_expired(now) {
            return map;
        }
        drop(map);
        let mut map = self.data.write().await;
        self.purge(&mut map, now);
        map.downgrade()
    }

    async fn write_live(&self, now: Instant) -> RwLockWriteGuard<'_, ExpiringMap<String, Entry>> {
        let mut map = self.data.write().await;
        self.purge(&mut map, now);
        map
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn issue_etag(&self) -> String {
        self.next_etag.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn read(&self, map: &ExpiringMap<String, Entry>, key: &str, now: Instant) -> Option<StoredState> {
        map.get_live(key, now).map(|e| e.to_stored(key))
    }

    /// Check `item` against `current` and build its replacement entry.
    fn upsert_entry(
        &self,
        operation: Operation,
        item: &StateItem,
        current: Option<&Entry>,
        now: Instant,
    ) -> Result<Entry, StateError> {
        check_write_etag(
            &self.name,
            operation,
            &item.key,
            current.map(|e| e.etag.as_str()),
            item.etag.as_deref(),
            item.options.concurrency,
        )?;
        let expiry = item
            .ttl
            .map(|ttl| expiry_after(&self.name, operation, &item.key, now, ttl))
            .transpose()?;
        Ok(Entry {
            value: item.value.clone(),
            etag: self.issue_etag(),
            expires_at: expiry.map(|(at, _)| at),
            expire_time: expiry.map(|(_, time)| time),
        })
    }

    fn check_delete(
        &self,
        operation: Operation,
        req: &DeleteRequest,
        current: Option<&Entry>,
    ) -> Result<(), StateError> {
        check_delete_etag(
            &self.name,
            operation,
            &req.key,
            current.map(|e| e.etag.as_str()),
            req.etag.as_deref(),
            req.options.concurrency,
        )
    }
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new("in-memory")
    }
}

#[async_trait]
impl StateDriver for InMemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn get(&self, req: &GetRequest) -> Result<Option<StoredState>, StateError> {
        self.pause().await;
        let now = Instant::now();
        let map = self.read_live(now).await;
        Ok(self.read(&map, &req.key, now))
    }

    async fn set(&self, item: StateItem) -> Result<String, StateError> {
        self.pause().await;
        let now = Instant::now();
        let mut map = self.write_live(now).await;
        let current = map.get_live(&item.key, now);
        let entry = self.upsert_entry(Operation::Set, &item, current, now)?;
        let etag = entry.etag.clone();
        map.insert(item.key, entry);
        Ok(etag)
    }

    async fn delete(&self, req: &DeleteRequest) -> Result<(), StateError> {
        self.pause().await;
        let now = Instant::now();
        let mut map = self.write_live(now).await;
        let current = map.get_live(&req.key, now);
        self.check_delete(Operation::Delete, req, current)?;
        map.remove(&req.key);
        Ok(())
    }

    /// All reads share one snapshot of the map.
    async fn bulk_get(
        &self,
        requests: Vec<(usize, GetRequest)>,
        _parallelism: usize,
    ) -> Vec<BulkOutcome<Option<StoredState>>> {
        self.pause().await;
        let now = Instant::now();
        let map = self.read_live(now).await;
        requests
            .into_iter()
            .map(|(index, req)| BulkOutcome {
                index,
                result: Ok(self.read(&map, &req.key, now)),
                key: req.key,
            })
            .collect()
    }

    /// Stages every operation against an overlay of the map and applies the
    /// overlay only if all of them pass.
    async fn transact(&self, items: Vec<TransactionItem>) -> Result<(), StateError> {
        self.pause().await;
        let now = Instant::now();
        let mut map = self.write_live(now).await;
        let mut staged: BTreeMap<String, Option<Entry>> = BTreeMap::new();

        for (index, item) in items.iter().enumerate() {
            let key = item.key().to_string();
            let current = match staged.get(&key) {
                Some(overlay) => overlay.as_ref(),
                None => map.get_live(&key, now),
            };
            let next = match item {
                TransactionItem::Upsert(state) => self
                    .upsert_entry(Operation::Transaction, state, current, now)
                    .map(Some),
                TransactionItem::Delete(req) => self
                    .check_delete(Operation::Transaction, req, current)
                    .map(|()| None),
            };
            match next {
                Ok(next) => {
                    staged.insert(key, next);
                }
                Err(source) => {
                    debug!(backend = %self.name, index, key = item.key(), "transaction aborted");
                    return Err(StateError::TransactionAborted {
                        backend: self.name.clone(),
                        index,
                        source: Box::new(source),
                    });
                }
            }
        }

        for (key, entry) in staged {
            match entry {
                Some(entry) => map.insert(key, entry),
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn query(&self, req: &QueryRequest) -> Result<QueryStream, StateError> {
        self.pause().await;
        let now = Instant::now();
        let map = self.read_live(now).await;
        let matches: Vec<Result<StoredState, StateError>> = map
            .iter_live(now)
            .filter(|(_, e)| match (&req.filter, e.value.as_json()) {
                (None, _) => true,
                (Some(filter), Some(doc)) => filter.matches(doc),
                (Some(_), None) => false,
            })
            .map(|(key, e)| Ok(e.to_stored(key)))
            .collect();
        debug!(backend = %self.name, matches = matches.len(), "query snapshot");
        Ok(stream::iter(matches).boxed())
    }

    async fn close(&self) -> Result<(), StateError> {
        self.data.write().await.clear();
        Ok(())
    }
}
