// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Partitioned document-collection driver.
//!
//! Models a document database: every key is stored as a [`DocumentItem`]
//! record inside a logical partition, addressed by `(partitionKey, id)`.
//! JSON values are embedded natively, so filters can look inside them.
//!
//! The partition key for a request comes from its `partitionKey` metadata,
//! then from the component's configured `partitionKey`, then from the key
//! itself. Transactions are scoped to a single partition, as they are in the
//! document stores this mirrors.
//!
//! Component metadata:
//!
//! | key            | meaning                               | default          |
//! |----------------|---------------------------------------|------------------|
//! | `collection`   | collection name used in logs          | component name   |
//! | `partitionKey` | default partition for every request   | the request key  |

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::capability::Capabilities;
use crate::config::ComponentConfig;
use crate::driver::{
    check_delete_etag, check_write_etag, expiry_after, StateDriver, StoredState, TransactionItem,
};
use crate::error::{Operation, StateError};
use crate::expiry::{Expiring, ExpiringMap};
use crate::item::{create_upsert_item, resolve_partition_key, DocumentItem, StateItem};
use crate::query::QueryStream;
use crate::request::{metadata, DeleteRequest, GetRequest, QueryRequest};

/// Component metadata key naming the collection.
pub const COLLECTION: &str = "collection";

type DocumentId = (String, String);

#[derive(Debug, Clone)]
struct StoredDocument {
    /// The serialized `DocumentItem`, etag included.
    body: Value,
    expires_at: Option<Instant>,
    expire_time: Option<DateTime<Utc>>,
}

impl Expiring for StoredDocument {
    fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }
}

impl StoredDocument {
    fn etag(&self) -> Option<&str> {
        self.body.get("etag").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct DocumentDriver {
    name: String,
    collection: String,
    default_partition: Option<String>,
    documents: Arc<RwLock<ExpiringMap<DocumentId, StoredDocument>>>,
}

impl DocumentDriver {
    pub fn new(name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            default_partition: None,
            documents: Arc::new(RwLock::new(ExpiringMap::default())),
        }
    }

    /// Build a driver from component configuration.
    pub fn from_config(config: &ComponentConfig) -> Result<Self, StateError> {
        let collection = config.metadata_value(COLLECTION).unwrap_or(&config.name);
        if collection.is_empty() {
            return Err(StateError::InvalidConfig(format!(
                "component '{}': collection must not be empty",
                config.name
            )));
        }
        let mut driver = Self::new(&config.name, collection);
        driver.default_partition = config
            .metadata_value(metadata::PARTITION_KEY)
            .map(str::to_string);
        Ok(driver)
    }

    pub fn with_default_partition(mut self, partition: impl Into<String>) -> Self {
        self.default_partition = Some(partition.into());
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Number of live documents in `partition`.
    pub async fn partition_len(&self, partition: &str) -> usize {
        let now = Instant::now();
        self.documents
            .read()
            .await
            .iter_live(now)
            .filter(|((pk, _), _)| pk == partition)
            .count()
    }

    /// Reclaim every expired document now, returning how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let mut documents = self.documents.write().await;
        self.purge(&mut documents, Instant::now())
    }

    fn purge(&self, documents: &mut ExpiringMap<DocumentId, StoredDocument>, now: Instant) -> usize {
        let purged = documents.purge_expired(now);
        if purged > 0 {
            debug!(backend = %self.name, collection = %self.collection, purged, "expired documents reclaimed");
        }
        purged
    }

    /// Shared access for reads, reclaiming expired documents first.
    async fn read_live(&self, now: Instant) -> RwLockReadGuard<'_, ExpiringMap<DocumentId, StoredDocument>> {
        let documents = self.documents.read().await;
        if !documents.has_expired(now) {
            return documents;
        }
        drop(documents);
        let mut documents = self.documents.write().await;
        self.purge(&mut documents, now);
        documents.downgrade()
    }

    async fn write_live(&self, now: Instant) -> RwLockWriteGuard<'_, ExpiringMap<DocumentId, StoredDocument>> {
        let mut documents = self.documents.write().await;
        self.purge(&mut documents, now);
        documents
    }

    fn partition_for(&self, key: &str, md: &HashMap<String, String>) -> String {
        resolve_partition_key(key, md, self.default_partition.as_deref())
    }

    fn decode(&self, operation: Operation, id: &str, doc: &StoredDocument) -> Result<StoredState, StateError> {
        let item: DocumentItem = serde_json::from_value(doc.body.clone())
            .map_err(|err| StateError::encoding(operation, id, err).on_backend(&self.name))?;
        let mut md = HashMap::new();
        md.insert(metadata::PARTITION_KEY.to_string(), item.partition_key.clone());
        if let Some(at) = doc.expire_time {
            md.insert(
                metadata::TTL_EXPIRE_TIME.to_string(),
                at.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
        Ok(StoredState {
            key: item.id.clone(),
            value: item.to_encoded().map_err(|err| err.on_backend(&self.name))?,
            etag: item.etag.unwrap_or_default(),
            metadata: md,
        })
    }

    /// Check the etag rules and serialize the replacement document.
    fn upsert_document(
        &self,
        operation: Operation,
        item: &StateItem,
        partition: &str,
        current: Option<&StoredDocument>,
        now: Instant,
    ) -> Result<StoredDocument, StateError> {
        check_write_etag(
            &self.name,
            operation,
            &item.key,
            current.and_then(StoredDocument::etag),
            item.etag.as_deref(),
            item.options.concurrency,
        )?;

        let expiry = item
            .ttl
            .map(|ttl| expiry_after(&self.name, operation, &item.key, now, ttl))
            .transpose()?;
        let mut document = create_upsert_item(item, partition).map_err(|err| err.on_backend(&self.name))?;
        document.etag = Some(Uuid::new_v4().to_string());
        let body = serde_json::to_value(&document)
            .map_err(|err| StateError::encoding(operation, &item.key, err).on_backend(&self.name))?;
        Ok(StoredDocument {
            body,
            expires_at: expiry.map(|(at, _)| at),
            expire_time: expiry.map(|(_, time)| time),
        })
    }
}

#[async_trait]
impl StateDriver for DocumentDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn init(&self) -> Result<(), StateError> {
        info!(backend = %self.name, collection = %self.collection, "document collection ready");
        Ok(())
    }

    async fn get(&self, req: &GetRequest) -> Result<Option<StoredState>, StateError> {
        let id = (self.partition_for(&req.key, &req.metadata), req.key.clone());
        let now = Instant::now();
        let documents = self.read_live(now).await;
        documents
            .get_live(&id, now)
            .map(|doc| self.decode(Operation::Get, &req.key, doc))
            .transpose()
    }

    async fn set(&self, item: StateItem) -> Result<String, StateError> {
        let partition = self.partition_for(&item.key, &item.metadata);
        let id = (partition, item.key.clone());
        let now = Instant::now();
        let mut documents = self.write_live(now).await;

        let current = documents.get_live(&id, now);
        let next = self.upsert_document(Operation::Set, &item, &id.0, current, now)?;
        let etag = next.etag().unwrap_or_default().to_string();
        debug!(backend = %self.name, partition = %id.0, key = %id.1, "document upserted");
        documents.insert(id, next);
        Ok(etag)
    }

    async fn delete(&self, req: &DeleteRequest) -> Result<(), StateError> {
        let id = (self.partition_for(&req.key, &req.metadata), req.key.clone());
        let now = Instant::now();
        let mut documents = self.write_live(now).await;
        let current = documents.get_live(&id, now);
        check_delete_etag(
            &self.name,
            Operation::Delete,
            &req.key,
            current.and_then(StoredDocument::etag),
            req.etag.as_deref(),
            req.options.concurrency,
        )?;
        documents.remove(&id);
        Ok(())
    }

    /// Every operation must resolve to the same partition; a batch spanning
    /// partitions is rejected before anything is read.
    async fn transact(&self, items: Vec<TransactionItem>) -> Result<(), StateError> {
        let partitions: Vec<String> = items
            .iter()
            .map(|item| self.partition_for(item.key(), item.metadata()))
            .collect();
        if partitions.windows(2).any(|pair| pair[0] != pair[1]) {
            return Err(StateError::not_supported(
                &self.name,
                Operation::Transaction,
                "transactions spanning partitions",
            ));
        }

        let now = Instant::now();
        let mut documents = self.write_live(now).await;
        let mut staged: BTreeMap<DocumentId, Option<StoredDocument>> = BTreeMap::new();

        for (index, (item, partition)) in items.iter().zip(&partitions).enumerate() {
            let id = (partition.clone(), item.key().to_string());
            let current = match staged.get(&id) {
                Some(overlay) => overlay.as_ref(),
                None => documents.get_live(&id, now),
            };
            let next = match item {
                TransactionItem::Upsert(state) => self
                    .upsert_document(Operation::Transaction, state, partition, current, now)
                    .map(Some),
                TransactionItem::Delete(req) => check_delete_etag(
                    &self.name,
                    Operation::Transaction,
                    &req.key,
                    current.and_then(StoredDocument::etag),
                    req.etag.as_deref(),
                    req.options.concurrency,
                )
                .map(|()| None),
            };
            match next {
                Ok(next) => {
                    staged.insert(id, next);
                }
                Err(source) => {
                    return Err(StateError::TransactionAborted {
                        backend: self.name.clone(),
                        index,
                        source: Box::new(source),
                    })
                }
            }
        }

        for (id, doc) in staged {
            match doc {
                Some(doc) => documents.insert(id, doc),
                None => {
                    documents.remove(&id);
                }
            }
        }
        Ok(())
    }

    /// Scans one partition when the query names one in its metadata, the
    /// whole collection otherwise. Binary documents never match a filter.
    async fn query(&self, req: &QueryRequest) -> Result<QueryStream, StateError> {
        let partition = req.metadata.get(metadata::PARTITION_KEY).cloned();
        let now = Instant::now();
        let documents = self.read_live(now).await;

        let results: Vec<Result<StoredState, StateError>> = documents
            .iter_live(now)
            .filter(|((pk, _), _)| partition.as_ref().map_or(true, |p| p == pk))
            .filter(|(_, doc)| {
                let binary = doc.body.get("isBinary").and_then(Value::as_bool).unwrap_or(false);
                match (&req.filter, doc.body.get("value")) {
                    (None, _) => true,
                    (Some(filter), Some(value)) if !binary => filter.matches(value),
                    _ => false,
                }
            })
            .map(|((_, id), doc)| self.decode(Operation::Query, id, doc))
            .collect();
        Ok(stream::iter(results).boxed())
    }
}
