// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! The state store handle.
//!
//! A [`StateStore`] wraps one driver and is what callers talk to. It runs the
//! request pipeline in front of the driver:
//!
//! ```text
//! request ─> lifecycle check ─> validate ─> encode ─> driver ─> decode ─> response
//!                                                       ▲
//!                              cancellation / deadline ─┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! ┌───────────────┐  init()  ┌───────┐  close()  ┌────────┐
//! │ Uninitialized │ ───────> │ Ready │ ────────> │ Closed │
//! └───────────────┘          └───────┘           └────────┘
//! ```
//!
//! Only `Ready` accepts operations. `Closed` is terminal; closing twice is a
//! no-op. Calls hold a shared lock on the state for their whole duration, so
//! `close()` waits for in-flight calls to finish.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::capability::{Capabilities, Feature};
use crate::config::StoreOptions;
use crate::coordinator::{self, merge_outcomes, BulkOutcome};
use crate::driver::{StateDriver, StoredState};
use crate::encoding::ValueEncoder;
use crate::error::{Operation, StateError};
use crate::request::{
    CallOptions, DeleteRequest, GetRequest, GetResponse, QueryItem, QueryRequest, SetRequest,
    SetResponse, TransactionalRequest,
};
use crate::validation;

/// Caller-facing query results.
pub type QueryItemStream = BoxStream<'static, Result<QueryItem, StateError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Uninitialized => f.write_str("uninitialized"),
            LifecycleState::Ready => f.write_str("ready"),
            LifecycleState::Closed => f.write_str("closed"),
        }
    }
}

pub struct StateStore {
    name: String,
    driver: Arc<dyn StateDriver>,
    encoder: ValueEncoder,
    options: StoreOptions,
    state: RwLock<LifecycleState>,
}

impl StateStore {
    /// Wrap `driver`. The store starts `Uninitialized`.
    pub fn new(name: impl Into<String>, driver: Arc<dyn StateDriver>) -> Self {
        Self {
            name: name.into(),
            driver,
            encoder: ValueEncoder::default(),
            options: StoreOptions::default(),
            state: RwLock::new(LifecycleState::Uninitialized),
        }
    }

    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_encoder(mut self, encoder: ValueEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the underlying driver.
    pub fn backend(&self) -> &str {
        self.driver.name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.driver.capabilities()
    }

    pub fn encoder(&self) -> &ValueEncoder {
        &self.encoder
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    /// Run the driver handshake and move to `Ready`. Idempotent once ready.
    pub async fn init(&self) -> Result<(), StateError> {
        let mut state = self.state.write().await;
        match *state {
            LifecycleState::Ready => Ok(()),
            LifecycleState::Closed => Err(self.lifecycle_error(Operation::Init, LifecycleState::Closed)),
            LifecycleState::Uninitialized => {
                self.driver.init().await?;
                *state = LifecycleState::Ready;
                info!(store = %self.name, backend = %self.driver.name(), "state store ready");
                Ok(())
            }
        }
    }

    /// Move to `Closed`, releasing driver resources if the store was ready.
    /// The store is closed afterwards even if the driver reports an error.
    pub async fn close(&self) -> Result<(), StateError> {
        let mut state = self.state.write().await;
        let previous = std::mem::replace(&mut *state, LifecycleState::Closed);
        if previous == LifecycleState::Ready {
            info!(store = %self.name, "closing state store");
            self.driver.close().await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(store = %self.name, key = %req.key))]
    pub async fn get(&self, req: GetRequest, call: &CallOptions) -> Result<GetResponse, StateError> {
        let _ready = self.ready(Operation::Get).await?;
        validation::prepare_get(&self.name, Operation::Get, &req)?;

        match self.run(Operation::Get, call, self.driver.get(&req)).await? {
            Some(stored) => Ok(self.respond(stored)),
            None => Err(StateError::not_found(&self.name, Operation::Get, &req.key)),
        }
    }

    #[instrument(skip_all, fields(store = %self.name, key = %req.key))]
    pub async fn set(&self, req: SetRequest, call: &CallOptions) -> Result<SetResponse, StateError> {
        let _ready = self.ready(Operation::Set).await?;
        let item = validation::prepare_set(
            &self.name,
            self.capabilities(),
            &self.encoder,
            Operation::Set,
            req,
        )?;

        let etag = self.run(Operation::Set, call, self.driver.set(item)).await?;
        debug!(etag = %etag, "value stored");
        Ok(SetResponse { etag })
    }

    #[instrument(skip_all, fields(store = %self.name, key = %req.key))]
    pub async fn delete(&self, req: DeleteRequest, call: &CallOptions) -> Result<(), StateError> {
        let _ready = self.ready(Operation::Delete).await?;
        validation::prepare_delete(&self.name, self.capabilities(), Operation::Delete, &req)?;

        self.run(Operation::Delete, call, self.driver.delete(&req)).await
    }

    /// Read many keys. Returns one outcome per request, in request order.
    pub async fn bulk_get(
        &self,
        requests: Vec<GetRequest>,
        call: &CallOptions,
    ) -> Result<Vec<BulkOutcome<GetResponse>>, StateError> {
        let _ready = self.ready(Operation::BulkGet).await?;
        self.require(Operation::BulkGet, Feature::Bulk)?;

        let mut rejected = Vec::new();
        let mut valid = Vec::with_capacity(requests.len());
        for (index, req) in requests.into_iter().enumerate() {
            match validation::prepare_get(&self.name, Operation::BulkGet, &req) {
                Ok(()) => valid.push((index, req)),
                Err(err) => rejected.push(BulkOutcome::failed(index, req.key, err)),
            }
        }

        debug!(store = %self.name, items = valid.len(), rejected = rejected.len(), "bulk get");
        let parallelism = self.options.bulk_parallelism;
        let dispatched = self
            .run(Operation::BulkGet, call, async {
                Ok(self.driver.bulk_get(valid, parallelism).await)
            })
            .await?;

        let dispatched = dispatched
            .into_iter()
            .map(|outcome| {
                let key = outcome.key.clone();
                outcome.map(|found| {
                    found
                        .map(|stored| self.respond(stored))
                        .ok_or_else(|| StateError::not_found(&self.name, Operation::BulkGet, &key))
                })
            })
            .collect();
        Ok(merge_outcomes(rejected, dispatched))
    }

    /// Write many keys independently. A failing item does not stop the others.
    pub async fn bulk_set(
        &self,
        requests: Vec<SetRequest>,
        call: &CallOptions,
    ) -> Result<Vec<BulkOutcome<SetResponse>>, StateError> {
        let _ready = self.ready(Operation::BulkSet).await?;
        self.require(Operation::BulkSet, Feature::Bulk)?;

        let capabilities = self.capabilities();
        let mut rejected = Vec::new();
        let mut valid = Vec::with_capacity(requests.len());
        for (index, req) in requests.into_iter().enumerate() {
            let key = req.key.clone();
            match validation::prepare_set(&self.name, capabilities, &self.encoder, Operation::BulkSet, req) {
                Ok(item) => valid.push((index, item)),
                Err(err) => rejected.push(BulkOutcome::failed(index, key, err)),
            }
        }

        debug!(store = %self.name, items = valid.len(), rejected = rejected.len(), "bulk set");
        let parallelism = self.options.bulk_parallelism;
        let dispatched = self
            .run(Operation::BulkSet, call, async {
                Ok(self.driver.bulk_set(valid, parallelism).await)
            })
            .await?;

        let dispatched = dispatched
            .into_iter()
            .map(|outcome| outcome.map(|etag| Ok(SetResponse { etag })))
            .collect();
        Ok(merge_outcomes(rejected, dispatched))
    }

    pub async fn bulk_delete(
        &self,
        requests: Vec<DeleteRequest>,
        call: &CallOptions,
    ) -> Result<Vec<BulkOutcome<()>>, StateError> {
        let _ready = self.ready(Operation::BulkDelete).await?;
        self.require(Operation::BulkDelete, Feature::Bulk)?;

        let capabilities = self.capabilities();
        let mut rejected = Vec::new();
        let mut valid = Vec::with_capacity(requests.len());
        for (index, req) in requests.into_iter().enumerate() {
            match validation::prepare_delete(&self.name, capabilities, Operation::BulkDelete, &req) {
                Ok(()) => valid.push((index, req)),
                Err(err) => rejected.push(BulkOutcome::failed(index, req.key, err)),
            }
        }

        let parallelism = self.options.bulk_parallelism;
        let dispatched = self
            .run(Operation::BulkDelete, call, async {
                Ok(self.driver.bulk_delete(valid, parallelism).await)
            })
            .await?;
        Ok(merge_outcomes(rejected, dispatched))
    }

    /// Apply every operation or none of them.
    #[instrument(skip_all, fields(store = %self.name, operations = req.operations.len()))]
    pub async fn transact(&self, req: TransactionalRequest, call: &CallOptions) -> Result<(), StateError> {
        let _ready = self.ready(Operation::Transaction).await?;
        let items = coordinator::prepare_transaction(&self.name, self.capabilities(), &self.encoder, req)?;
        if items.is_empty() {
            return Ok(());
        }

        self.run(Operation::Transaction, call, self.driver.transact(items)).await
    }

    /// Start a query. Results are produced lazily; `limit` caps how many are
    /// yielded, and a cancelled token ends the stream with `Cancelled`.
    pub async fn query(&self, req: QueryRequest, call: &CallOptions) -> Result<QueryItemStream, StateError> {
        let _ready = self.ready(Operation::Query).await?;
        validation::prepare_query(&self.name, self.capabilities(), &req)?;

        let results = self.run(Operation::Query, call, self.driver.query(&req)).await?;
        let encoder = self.encoder.clone();
        let items = results.map(move |result| {
            result.map(|stored| QueryItem {
                data: encoder.decode(&stored.value),
                key: stored.key,
                etag: Some(stored.etag),
            })
        });
        let items = match req.limit {
            Some(limit) => items.take(limit).boxed(),
            None => items.boxed(),
        };

        Ok(match &call.cancel {
            Some(token) => until_cancelled(items, token.clone(), self.name.clone()),
            None => items,
        })
    }

    async fn ready(&self, operation: Operation) -> Result<RwLockReadGuard<'_, LifecycleState>, StateError> {
        let state = self.state.read().await;
        if *state != LifecycleState::Ready {
            return Err(self.lifecycle_error(operation, *state));
        }
        Ok(state)
    }

    fn require(&self, operation: Operation, feature: Feature) -> Result<(), StateError> {
        self.capabilities().require(&self.name, operation, feature)
    }

    fn lifecycle_error(&self, operation: Operation, state: LifecycleState) -> StateError {
        StateError::Lifecycle {
            backend: self.name.clone(),
            operation,
            state,
        }
    }

    fn respond(&self, stored: StoredState) -> GetResponse {
        GetResponse {
            data: self.encoder.decode(&stored.value),
            key: stored.key,
            etag: Some(stored.etag),
            metadata: stored.metadata,
        }
    }

    /// Drive `pending` to completion unless the caller cancels or the
    /// deadline passes first. Losing the race drops the driver future.
    async fn run<T, Fut>(&self, operation: Operation, call: &CallOptions, pending: Fut) -> Result<T, StateError>
    where
        Fut: Future<Output = Result<T, StateError>>,
    {
        let timeout = call.timeout.or_else(|| self.options.default_timeout());
        let bounded = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, pending).await {
                    Ok(result) => result,
                    Err(_) => Err(cancelled(&self.name, operation, format!("deadline of {limit:?} elapsed"))),
                },
                None => pending.await,
            }
        };

        match &call.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(cancelled(&self.name, operation, "cancelled by caller")),
                result = bounded => result,
            },
            None => bounded.await,
        }
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("name", &self.name)
            .field("backend", &self.driver.name())
            .field("options", &self.options)
            .finish()
    }
}

fn cancelled(backend: &str, operation: Operation, reason: impl Into<String>) -> StateError {
    StateError::Cancelled {
        backend: backend.to_string(),
        operation,
        reason: reason.into(),
    }
}

/// Yield from `items` until `token` fires, then emit one `Cancelled` error
/// and stop.
fn until_cancelled(items: QueryItemStream, token: CancellationToken, backend: String) -> QueryItemStream {
    stream::unfold(Some((items, token)), move |state| {
        let backend = backend.clone();
        async move {
            let (mut items, token) = state?;
            let stop = || cancelled(&backend, Operation::Query, "cancelled by caller");
            if token.is_cancelled() {
                return Some((Err(stop()), None));
            }
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                next = items.next() => Some(next),
            };
            match next {
                None => Some((Err(stop()), None)),
                Some(next) => next.map(|item| (item, Some((items, token)))),
            }
        }
    })
    .boxed()
}
