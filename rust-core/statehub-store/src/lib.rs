// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// StateHub state-store abstraction
//
// This crate gives applications one key-value state API with etag-based
// optimistic concurrency over interchangeable backends. The `StateDriver`
// trait is the contract every backend implements; `StateStore` is the
// caller-facing handle that validates, encodes and dispatches requests; the
// `StateStoreRegistry` resolves named stores from configuration.
//
// # Modules
//
// - [`store`] -- `StateStore` handle: lifecycle, validation, cancellation.
// - [`registry`] -- Named, lazily created stores and driver factories.
// - [`driver`] -- The `StateDriver` trait and shared etag rules.
// - [`request`] -- Request/response envelopes and per-call options.
// - [`encoding`] -- How values are persisted (JSON, text or binary).
// - [`item`] -- Persistable items and the document record shape.
// - [`coordinator`] -- Bulk fan-out and transaction preparation.
// - [`query`] -- Structured filters and result streams.
// - [`memory`] / [`document`] -- Built-in drivers.
// - [`metrics`] -- A transparent wrapper that collects driver statistics.
// - [`typed`] -- A serde-based typed view with namespace prefixing.
//
// # Example
//
// ```rust
// use statehub_store::config::{ComponentConfig, RegistryConfig};
// use statehub_store::registry::{StateStoreRegistry, IN_MEMORY};
// use statehub_store::request::{CallOptions, GetRequest, SetRequest};
//
// # tokio_test::block_on(async {
// let config = RegistryConfig::default().with_component(ComponentConfig::new("cache", IN_MEMORY));
// let registry = StateStoreRegistry::new(config).unwrap();
//
// let store = registry.resolve("cache").await.unwrap();
// let call = CallOptions::new();
// let set = store.set(SetRequest::new("order-1", r#"{"total": 12}"#), &call).await.unwrap();
//
// // A stale etag is rejected and leaves the value untouched.
// let stale = SetRequest::new("order-1", r#"{"total": 0}"#).with_etag("stale");
// assert!(store.set(stale, &call).await.is_err());
//
// let got = store.get(GetRequest::new("order-1"), &call).await.unwrap();
// assert_eq!(got.etag, Some(set.etag));
// assert_eq!(got.json::<serde_json::Value>().unwrap()["total"], 12);
//
// registry.close().await.unwrap();
// # });
// ```

pub mod capability;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod driver;
pub mod encoding;
pub mod error;
mod expiry;
pub mod item;
pub mod memory;
pub mod metrics;
pub mod query;
pub mod registry;
pub mod request;
pub mod store;
pub mod typed;
pub mod validation;

// Optional persistent drivers, feature-gated to keep the default build lean.
#[cfg(feature = "redb-backend")]
pub mod redb_backend;

pub use capability::{Capabilities, Feature};
pub use config::{ComponentConfig, RegistryConfig, StoreOptions};
pub use coordinator::BulkOutcome;
pub use document::DocumentDriver;
pub use driver::{StateDriver, StoredState, TransactionItem};
pub use encoding::{EncodedValue, ValueEncoder};
pub use error::{ErrorKind, Operation, StateError};
pub use item::{DocumentItem, StateItem};
pub use memory::InMemoryDriver;
pub use metrics::{DriverStats, MetricsDriver};
pub use query::Filter;
pub use registry::{CloseError, StateStoreRegistry};
pub use request::{
    CallOptions, Concurrency, Consistency, DeleteRequest, GetRequest, GetResponse, InvalidOption,
    QueryItem, QueryRequest, SetRequest, SetResponse, StateValue, TransactionalRequest,
};
pub use store::{LifecycleState, StateStore};
pub use typed::TypedStateStore;

#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbDriver;
