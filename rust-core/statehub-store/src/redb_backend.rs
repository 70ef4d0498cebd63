// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// redb-backed persistent state driver.
//
// Uses redb (pure Rust, B-tree, ACID, single-file database) for durable
// state. No C/C++ dependencies.
//
// # Design
//
// - One `state` table mapping keys to JSON-encoded `StoredRecord`s, which
//   carry the encoded value, its etag and an optional wall-clock expiry.
// - One `expiry` index table keyed by big-endian expiry milliseconds
//   followed by the record key, so due records sort first.
// - Read transactions for reads and queries (concurrent). Expired records
//   are hidden from reads.
// - Write transactions for set/delete/transact. The etag check and the
//   write happen inside the same write transaction, so redb's writer lock
//   serializes conflicting updates. Every write transaction first removes
//   the records that have expired.
// - All redb calls run on the blocking pool via `spawn_blocking`.
// - Expiry uses the wall clock so it survives restarts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition, TableError, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::Capabilities;
use crate::config::ComponentConfig;
use crate::driver::{
    check_delete_etag, check_write_etag, expire_time, StateDriver, StoredState, TransactionItem,
};
use crate::encoding::EncodedValue;
use crate::error::{Operation, StateError};
use crate::item::StateItem;
use crate::query::QueryStream;
use crate::request::{metadata, DeleteRequest, GetRequest, QueryRequest};

/// Component metadata key naming the database file.
pub const PATH: &str = "path";

const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("state");
const EXPIRY_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("expiry");

type StateTable<'txn> = Table<'txn, &'static str, &'static [u8]>;
type ExpiryTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

/// Index key for a record of `key` expiring at `at`.
fn expiry_key(at: DateTime<Utc>, key: &str) -> Vec<u8> {
    let millis = u64::try_from(at.timestamp_millis()).unwrap_or(0);
    let mut buf = Vec::with_capacity(8 + key.len());
    buf.extend_from_slice(&millis.to_be_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf
}

/// Split an index key back into expiry milliseconds and record key.
fn split_expiry_key(index_key: &[u8]) -> Option<(u64, &str)> {
    let (millis, key) = index_key.split_first_chunk::<8>()?;
    Some((u64::from_be_bytes(*millis), std::str::from_utf8(key).ok()?))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    value: EncodedValue,
    etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expire_time: Option<DateTime<Utc>>,
}

impl StoredRecord {
    fn decode(backend: &str, operation: Operation, key: &str, bytes: &[u8]) -> Result<Self, StateError> {
        serde_json::from_slice(bytes)
            .map_err(|err| StateError::encoding(operation, key, err).on_backend(backend))
    }

    fn encode(&self, backend: &str, operation: Operation, key: &str) -> Result<Vec<u8>, StateError> {
        serde_json::to_vec(self).map_err(|err| StateError::encoding(operation, key, err).on_backend(backend))
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expire_time.map_or(true, |at| now < at)
    }

    fn into_stored(self, key: &str) -> StoredState {
        let mut md = std::collections::HashMap::new();
        if let Some(at) = self.expire_time {
            md.insert(
                metadata::TTL_EXPIRE_TIME.to_string(),
                at.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
        StoredState {
            key: key.to_string(),
            value: self.value,
            etag: self.etag,
            metadata: md,
        }
    }
}

/// A persistent state driver powered by redb.
///
/// # Example
///
/// ```rust,no_run
/// use statehub_store::driver::StateDriver;
/// use statehub_store::encoding::EncodedValue;
/// use statehub_store::item::StateItem;
/// use statehub_store::redb_backend::RedbDriver;
/// use statehub_store::request::GetRequest;
///
/// # tokio_test::block_on(async {
/// let driver = RedbDriver::open("sessions", "/tmp/statehub-sessions.redb").unwrap();
/// driver.init().await.unwrap();
/// let item = StateItem::new("hello", EncodedValue::Text("world".into())).unwrap();
/// driver.set(item).await.unwrap();
/// let stored = driver.get(&GetRequest::new("hello")).await.unwrap();
/// assert!(stored.is_some());
/// # });
/// ```
pub struct RedbDriver {
    name: String,
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbDriver {
    /// Open or create a database at `path`, creating parent directories.
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, StateError> {
        let name = name.into();
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StateError::transport(&name, Operation::Init, e))?;
        }

        let db = Database::create(&path).map_err(|e| {
            StateError::transport(
                &name,
                Operation::Init,
                format!("failed to open redb at {}: {}", path.display(), e),
            )
        })?;

        debug!(path = %path.display(), "opened redb state driver");

        Ok(Self {
            name,
            db: Arc::new(db),
            path,
        })
    }

    /// Open the database named by the component's `path` metadata.
    pub fn from_config(config: &ComponentConfig) -> Result<Self, StateError> {
        let path = config.metadata_value(PATH).ok_or_else(|| {
            StateError::InvalidConfig(format!("component '{}' requires metadata '{PATH}'", config.name))
        })?;
        Self::open(&config.name, path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the database on the blocking pool.
    async fn blocking<T, F>(&self, operation: Operation, f: F) -> Result<T, StateError>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &str) -> Result<T, StateError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || f(&db, &name))
            .await
            .map_err(|e| StateError::transport(&self.name, operation, format!("task join: {e}")))?
    }

    /// Stage `items` in one write transaction and commit only if every item
    /// passes its etag check. Returns the etags of the upserts, in order.
    async fn write(&self, operation: Operation, items: Vec<TransactionItem>) -> Result<Vec<String>, StateError> {
        self.blocking(operation, move |db, backend| {
            in_write_txn(db, backend, operation, |txn| {
                stage(txn, backend, operation, &items, Utc::now())
            })
        })
        .await
    }

    /// Remove every record that has expired, returning how many.
    pub async fn purge_expired(&self) -> Result<usize, StateError> {
        self.purge_expired_at(Utc::now()).await
    }

    async fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<usize, StateError> {
        self.blocking(Operation::Delete, move |db, backend| {
            in_write_txn(db, backend, Operation::Delete, |txn| {
                let (mut state, mut expiry) = open_tables(txn, backend, Operation::Delete)?;
                reclaim_expired(&mut state, &mut expiry, backend, Operation::Delete, now)
            })
        })
        .await
    }
}

/// Run `f` in a write transaction, committing on success. On failure the
/// transaction is aborted and `f`'s error returned.
fn in_write_txn<T>(
    db: &Database,
    backend: &str,
    operation: Operation,
    f: impl FnOnce(&WriteTransaction) -> Result<T, StateError>,
) -> Result<T, StateError> {
    let txn = db
        .begin_write()
        .map_err(|e| StateError::transport(backend, operation, format!("write txn: {e}")))?;
    match f(&txn) {
        Ok(value) => {
            txn.commit()
                .map_err(|e| StateError::transport(backend, operation, format!("commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(abort) = txn.abort() {
                warn!(backend, %operation, error = %abort, "failed to abort redb write transaction");
            }
            Err(err)
        }
    }
}

fn open_tables<'txn>(
    txn: &'txn WriteTransaction,
    backend: &str,
    operation: Operation,
) -> Result<(StateTable<'txn>, ExpiryTable<'txn>), StateError> {
    let state = txn
        .open_table(STATE_TABLE)
        .map_err(|e| StateError::transport(backend, operation, format!("open table: {e}")))?;
    let expiry = txn
        .open_table(EXPIRY_TABLE)
        .map_err(|e| StateError::transport(backend, operation, format!("open expiry table: {e}")))?;
    Ok((state, expiry))
}

/// Delete every record whose expiry is strictly before the millisecond of
/// `now`, along with its index entry.
fn reclaim_expired(
    state: &mut StateTable<'_>,
    expiry: &mut ExpiryTable<'_>,
    backend: &str,
    operation: Operation,
    now: DateTime<Utc>,
) -> Result<usize, StateError> {
    let fail = |what: &str, e: &dyn std::fmt::Display| {
        StateError::transport(backend, operation, format!("{what}: {e}"))
    };
    let cutoff = u64::try_from(now.timestamp_millis()).unwrap_or(0);

    let mut due: Vec<(Vec<u8>, String)> = Vec::new();
    for entry in expiry.iter().map_err(|e| fail("expiry scan", &e))? {
        let (index_key, _) = entry.map_err(|e| fail("expiry entry", &e))?;
        let index_key = index_key.value();
        let Some((millis, key)) = split_expiry_key(index_key) else {
            continue;
        };
        if millis >= cutoff {
            break;
        }
        due.push((index_key.to_vec(), key.to_string()));
    }

    for (index_key, key) in &due {
        expiry
            .remove(index_key.as_slice())
            .map_err(|e| fail("expiry remove", &e))?;
        state.remove(key.as_str()).map_err(|e| fail("remove", &e))?;
    }
    if !due.is_empty() {
        debug!(backend, purged = due.len(), "expired records reclaimed");
    }
    Ok(due.len())
}

fn stage(
    txn: &WriteTransaction,
    backend: &str,
    operation: Operation,
    items: &[TransactionItem],
    now: DateTime<Utc>,
) -> Result<Vec<String>, StateError> {
    let (mut state, mut expiry) = open_tables(txn, backend, operation)?;
    reclaim_expired(&mut state, &mut expiry, backend, operation, now)?;
    let mut etags = Vec::new();

    for (index, item) in items.iter().enumerate() {
        match stage_one(&mut state, &mut expiry, backend, operation, item, now) {
            Ok(Some(etag)) => etags.push(etag),
            Ok(None) => {}
            Err(source) if operation == Operation::Transaction => {
                return Err(StateError::TransactionAborted {
                    backend: backend.to_string(),
                    index,
                    source: Box::new(source),
                })
            }
            Err(err) => return Err(err),
        }
    }
    Ok(etags)
}

fn stage_one(
    table: &mut StateTable<'_>,
    expiry: &mut ExpiryTable<'_>,
    backend: &str,
    operation: Operation,
    item: &TransactionItem,
    now: DateTime<Utc>,
) -> Result<Option<String>, StateError> {
    let key = item.key();
    let stored = table
        .get(key)
        .map_err(|e| StateError::transport(backend, operation, format!("get: {e}")))?
        .map(|guard| StoredRecord::decode(backend, operation, key, guard.value()))
        .transpose()?;
    let current_etag = stored
        .as_ref()
        .filter(|record| record.is_live(now))
        .map(|r| r.etag.as_str());
    // The replaced or deleted record no longer needs its index entry.
    let unindex = |expiry: &mut ExpiryTable<'_>| -> Result<(), StateError> {
        if let Some(at) = stored.as_ref().and_then(|r| r.expire_time) {
            expiry
                .remove(expiry_key(at, key).as_slice())
                .map_err(|e| StateError::transport(backend, operation, format!("expiry remove: {e}")))?;
        }
        Ok(())
    };

    match item {
        TransactionItem::Upsert(state) => {
            check_write_etag(
                backend,
                operation,
                key,
                current_etag,
                state.etag.as_deref(),
                state.options.concurrency,
            )?;
            let record = StoredRecord {
                value: state.value.clone(),
                etag: Uuid::new_v4().to_string(),
                expire_time: state
                    .ttl
                    .map(|ttl| expire_time(backend, operation, key, now, ttl))
                    .transpose()?,
            };
            let bytes = record.encode(backend, operation, key)?;
            unindex(expiry)?;
            if let Some(at) = record.expire_time {
                expiry
                    .insert(expiry_key(at, key).as_slice(), b"".as_slice())
                    .map_err(|e| StateError::transport(backend, operation, format!("expiry insert: {e}")))?;
            }
            table
                .insert(key, bytes.as_slice())
                .map_err(|e| StateError::transport(backend, operation, format!("insert: {e}")))?;
            Ok(Some(record.etag))
        }
        TransactionItem::Delete(req) => {
            check_delete_etag(
                backend,
                operation,
                key,
                current_etag,
                req.etag.as_deref(),
                req.options.concurrency,
            )?;
            unindex(expiry)?;
            table
                .remove(key)
                .map_err(|e| StateError::transport(backend, operation, format!("remove: {e}")))?;
            Ok(None)
        }
    }
}

impl std::fmt::Debug for RedbDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbDriver")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

#[async_trait]
impl StateDriver for RedbDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    /// Create the state table so later reads never see it missing.
    async fn init(&self) -> Result<(), StateError> {
        self.blocking(Operation::Init, |db, backend| {
            let transport = |e: &dyn std::fmt::Display| StateError::transport(backend, Operation::Init, e.to_string());
            let txn = db.begin_write().map_err(|e| transport(&e))?;
            txn.open_table(STATE_TABLE).map_err(|e| transport(&e))?;
            txn.open_table(EXPIRY_TABLE).map_err(|e| transport(&e))?;
            txn.commit().map_err(|e| transport(&e))
        })
        .await?;
        info!(backend = %self.name, path = %self.path.display(), "redb state driver ready");
        Ok(())
    }

    async fn get(&self, req: &GetRequest) -> Result<Option<StoredState>, StateError> {
        let key = req.key.clone();
        self.blocking(Operation::Get, move |db, backend| {
            let txn = db
                .begin_read()
                .map_err(|e| StateError::transport(backend, Operation::Get, format!("read txn: {e}")))?;
            let table = match txn.open_table(STATE_TABLE) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(StateError::transport(backend, Operation::Get, format!("open table: {e}"))),
            };
            let record = match table.get(key.as_str()) {
                Ok(Some(guard)) => StoredRecord::decode(backend, Operation::Get, &key, guard.value())?,
                Ok(None) => return Ok(None),
                Err(e) => return Err(StateError::transport(backend, Operation::Get, format!("get: {e}"))),
            };
            Ok(record.is_live(Utc::now()).then(|| record.into_stored(&key)))
        })
        .await
    }

    async fn set(&self, item: StateItem) -> Result<String, StateError> {
        let key = item.key.clone();
        let etags = self
            .write(Operation::Set, vec![TransactionItem::Upsert(item)])
            .await?;
        etags
            .into_iter()
            .next()
            .ok_or_else(|| StateError::transport(&self.name, Operation::Set, format!("no etag issued for '{key}'")))
    }

    async fn delete(&self, req: &DeleteRequest) -> Result<(), StateError> {
        self.write(Operation::Delete, vec![TransactionItem::Delete(req.clone())])
            .await
            .map(|_| ())
    }

    async fn transact(&self, items: Vec<TransactionItem>) -> Result<(), StateError> {
        let count = items.len();
        self.write(Operation::Transaction, items).await?;
        debug!(backend = %self.name, operations = count, "transaction committed");
        Ok(())
    }

    /// Full-table scan in key order under one read transaction.
    async fn query(&self, req: &QueryRequest) -> Result<QueryStream, StateError> {
        let filter = req.filter.clone();
        let matches = self
            .blocking(Operation::Query, move |db, backend| {
                let fail = |what: &str, e: &dyn std::fmt::Display| {
                    StateError::transport(backend, Operation::Query, format!("{what}: {e}"))
                };
                let txn = db.begin_read().map_err(|e| fail("read txn", &e))?;
                let table = match txn.open_table(STATE_TABLE) {
                    Ok(t) => t,
                    Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                    Err(e) => return Err(fail("open table", &e)),
                };

                let now = Utc::now();
                let mut results = Vec::new();
                for entry in table.iter().map_err(|e| fail("scan", &e))? {
                    let (key, value) = entry.map_err(|e| fail("scan entry", &e))?;
                    let key = key.value().to_string();
                    let record = match StoredRecord::decode(backend, Operation::Query, &key, value.value()) {
                        Ok(record) => record,
                        Err(err) => {
                            results.push(Err(err));
                            continue;
                        }
                    };
                    if !record.is_live(now) {
                        continue;
                    }
                    let keep = match (&filter, record.value.as_json()) {
                        (None, _) => true,
                        (Some(filter), Some(doc)) => filter.matches(doc),
                        (Some(_), None) => false,
                    };
                    if keep {
                        results.push(Ok(record.into_stored(&key)));
                    }
                }
                Ok(results)
            })
            .await?;
        Ok(stream::iter(matches).boxed())
    }

    async fn close(&self) -> Result<(), StateError> {
        info!(backend = %self.name, "closing redb state driver");
        Ok(())
    }
}
