// SPDX-License-Identifier: PMPL-1.0-or-later
//! Backend contract tests.
//!
//! Every built-in driver must behave identically through a [`StateStore`]:
//! the same etag rules, the same bulk and transaction semantics and the same
//! lifecycle. Each test runs against every driver compiled into the crate.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use statehub_store::request::metadata;
use statehub_store::{
    CallOptions, Capabilities, Concurrency, DeleteRequest, DocumentDriver, ErrorKind, Feature,
    Filter, GetRequest, InMemoryDriver, MetricsDriver, QueryRequest, SetRequest, StateDriver,
    StateError, StateStore, TransactionalRequest,
};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Fixture {
    store: StateStore,
    _dir: Option<tempfile::TempDir>,
}

async fn ready(driver: Arc<dyn StateDriver>, dir: Option<tempfile::TempDir>) -> Fixture {
    let store = StateStore::new(driver.name().to_string(), driver);
    store.init().await.unwrap();
    Fixture { store, _dir: dir }
}

/// Drivers whose expiry follows the tokio clock.
async fn ephemeral_fixtures() -> Vec<Fixture> {
    vec![
        ready(Arc::new(InMemoryDriver::new("memory")), None).await,
        ready(
            Arc::new(DocumentDriver::new("document", "state").with_default_partition("tenant")),
            None,
        )
        .await,
    ]
}

async fn fixtures() -> Vec<Fixture> {
    init_tracing();
    #[allow(unused_mut)]
    let mut all = ephemeral_fixtures().await;
    #[cfg(feature = "redb-backend")]
    {
        let dir = tempfile::tempdir().unwrap();
        let driver = statehub_store::RedbDriver::open("redb", dir.path().join("state.redb")).unwrap();
        all.push(ready(Arc::new(driver), Some(dir)).await);
    }
    all
}

fn call() -> CallOptions {
    CallOptions::new()
}

// ===========================================================================
// Value encoding
// ===========================================================================

#[tokio::test]
async fn test_serialized_json_reads_back_as_structure() {
    for f in fixtures().await {
        let s = &f.store;
        s.set(SetRequest::new("w", r#"{"color": "red"}"#), &call()).await.unwrap();
        let got = s.get(GetRequest::new("w"), &call()).await.unwrap();
        assert_eq!(got.json::<serde_json::Value>().unwrap(), json!({"color": "red"}), "{}", s.name());
    }
}

#[tokio::test]
async fn test_text_and_binary_keep_their_bytes() {
    for f in fixtures().await {
        let s = &f.store;
        let text = SetRequest::new("t", "hello").with_metadata(metadata::CONTENT_TYPE, "text/plain");
        s.set(text, &call()).await.unwrap();
        let raw = SetRequest::new("b", vec![0u8, 1, 2, 255])
            .with_metadata(metadata::CONTENT_TYPE, "application/octet-stream");
        s.set(raw, &call()).await.unwrap();
        // Not JSON under the default content type: kept as bytes.
        s.set(SetRequest::new("n", "42"), &call()).await.unwrap();

        assert_eq!(s.get(GetRequest::new("t"), &call()).await.unwrap().data, b"hello".to_vec());
        assert_eq!(s.get(GetRequest::new("b"), &call()).await.unwrap().data, vec![0, 1, 2, 255]);
        assert_eq!(s.get(GetRequest::new("n"), &call()).await.unwrap().data, b"42".to_vec());
    }
}

// ===========================================================================
// Etag concurrency
// ===========================================================================

#[tokio::test]
async fn test_stale_etag_conflicts_and_keeps_value() {
    for f in fixtures().await {
        let s = &f.store;
        let first = s.set(SetRequest::new("k", r#"{"v": 1}"#), &call()).await.unwrap();
        let second = s
            .set(SetRequest::new("k", r#"{"v": 2}"#).with_etag(first.etag.clone()), &call())
            .await
            .unwrap();
        assert_ne!(first.etag, second.etag);

        let err = s
            .set(SetRequest::new("k", r#"{"v": 3}"#).with_etag(first.etag), &call())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict, "{}", s.name());
        let got = s.get(GetRequest::new("k"), &call()).await.unwrap();
        assert_eq!(got.json::<serde_json::Value>().unwrap(), json!({"v": 2}));
        assert_eq!(got.etag, Some(second.etag));

        // No etag, last-write: always applies.
        s.set(SetRequest::new("k", r#"{"v": 4}"#), &call()).await.unwrap();
        let got = s.get(GetRequest::new("k"), &call()).await.unwrap();
        assert_eq!(got.json::<serde_json::Value>().unwrap(), json!({"v": 4}));
    }
}

#[tokio::test]
async fn test_etag_for_absent_key_conflicts() {
    for f in fixtures().await {
        let err = f
            .store
            .set(SetRequest::new("ghost", "{}").with_etag("1"), &call())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict, "{}", f.store.name());
    }
}

#[tokio::test]
async fn test_first_write_only_creates() {
    for f in fixtures().await {
        let s = &f.store;
        let req = || SetRequest::new("once", "[1]").with_concurrency(Concurrency::FirstWrite);
        s.set(req(), &call()).await.unwrap();
        let err = s.set(req(), &call()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict, "{}", s.name());
    }
}

#[tokio::test]
async fn test_delete_rules() {
    for f in fixtures().await {
        let s = &f.store;
        let err = s.delete(DeleteRequest::new("missing"), &call()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound, "{}", s.name());

        let set = s.set(SetRequest::new("k", "[1]"), &call()).await.unwrap();
        let err = s
            .delete(DeleteRequest::new("k").with_etag("not-it"), &call())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        s.delete(DeleteRequest::new("k").with_etag(set.etag), &call()).await.unwrap();
        let err = s.get(GetRequest::new("k"), &call()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

// ===========================================================================
// Bulk
// ===========================================================================

#[tokio::test]
async fn test_bulk_set_reports_each_index() {
    for f in fixtures().await {
        let s = &f.store;
        let requests: Vec<SetRequest> = (0..6)
            .map(|i| {
                if i == 3 {
                    SetRequest::new("", "{}")
                } else {
                    SetRequest::new(format!("item-{i}"), format!(r#"{{"n": {i}}}"#))
                }
            })
            .collect();

        let outcomes = s.bulk_set(requests, &call()).await.unwrap();
        assert_eq!(outcomes.len(), 6);
        for (position, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.index, position);
            assert_eq!(outcome.is_ok(), position != 3, "{} index {position}", s.name());
        }
        let err = outcomes[3].result.as_ref().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let got = s.get(GetRequest::new("item-5"), &call()).await.unwrap();
        assert_eq!(got.json::<serde_json::Value>().unwrap(), json!({"n": 5}));
    }
}

#[tokio::test]
async fn test_bulk_get_and_delete() {
    for f in fixtures().await {
        let s = &f.store;
        s.set(SetRequest::new("a", "[1]"), &call()).await.unwrap();
        s.set(SetRequest::new("c", "[3]"), &call()).await.unwrap();

        let gets = vec![GetRequest::new("a"), GetRequest::new("b"), GetRequest::new("c")];
        let outcomes = s.bulk_get(gets, &call()).await.unwrap();
        assert!(outcomes[0].is_ok());
        assert_eq!(outcomes[1].result.as_ref().unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(outcomes[2].result.as_ref().unwrap().data, b"[3]".to_vec());

        let deletes = vec![DeleteRequest::new("a"), DeleteRequest::new("b")];
        let outcomes = s.bulk_delete(deletes, &call()).await.unwrap();
        assert!(outcomes[0].is_ok());
        assert_eq!(outcomes[1].result.as_ref().unwrap_err().kind(), ErrorKind::NotFound);
    }
}

#[tokio::test]
async fn test_bulk_requires_capability() {
    let driver = InMemoryDriver::new("cache").with_capabilities(Capabilities::all().without(Feature::Bulk));
    let f = ready(Arc::new(driver), None).await;
    let err = f
        .store
        .bulk_get(vec![GetRequest::new("a")], &call())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
}

// ===========================================================================
// Transactions
// ===========================================================================

#[tokio::test]
async fn test_transaction_leaves_no_partial_state() {
    for f in fixtures().await {
        let s = &f.store;
        s.set(SetRequest::new("keep", r#"{"v": 1}"#), &call()).await.unwrap();

        let doomed = TransactionalRequest::new()
            .set(SetRequest::new("new", "[1]"))
            .delete(DeleteRequest::new("keep"))
            .set(SetRequest::new("other", "[2]").with_etag("stale"));
        let err = s.transact(doomed, &call()).await.unwrap_err();
        match err {
            StateError::TransactionAborted { index, source, .. } => {
                assert_eq!(index, 2, "{}", s.name());
                assert_eq!(source.kind(), ErrorKind::Conflict);
            }
            other => panic!("{}: unexpected error {other}", s.name()),
        }
        assert!(s.get(GetRequest::new("keep"), &call()).await.is_ok());
        assert_eq!(
            s.get(GetRequest::new("new"), &call()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );

        let good = TransactionalRequest::new()
            .set(SetRequest::new("new", "[1]"))
            .delete(DeleteRequest::new("keep"));
        s.transact(good, &call()).await.unwrap();
        assert!(s.get(GetRequest::new("new"), &call()).await.is_ok());
        assert!(s.get(GetRequest::new("keep"), &call()).await.is_err());
    }
}

#[tokio::test]
async fn test_invalid_transaction_operation_rejected_before_io() {
    let driver = Arc::new(MetricsDriver::new(InMemoryDriver::new("memory")));
    let f = ready(driver.clone(), None).await;
    let req = TransactionalRequest::new()
        .set(SetRequest::new("a", "[1]"))
        .set(SetRequest::new("b", "[2]").with_metadata(metadata::TTL_IN_SECONDS, "zero"));

    let err = f.store.transact(req, &call()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(driver.stats().await.transaction_count, 0);
}

// ===========================================================================
// Query
// ===========================================================================

#[tokio::test]
async fn test_query_filters_json_values() {
    for f in fixtures().await {
        let s = &f.store;
        for (key, color) in [("a", "red"), ("b", "blue"), ("c", "red")] {
            let req = SetRequest::json(key, &json!({"color": color, "size": {"label": "M"}})).unwrap();
            s.set(req, &call()).await.unwrap();
        }
        let filter: Filter = serde_json::from_value(json!({
            "AND": [{"EQ": {"color": "red"}}, {"IN": {"size.label": ["S", "M"]}}]
        }))
        .unwrap();

        let mut keys: Vec<String> = s
            .query(QueryRequest::new(filter), &call())
            .await
            .unwrap()
            .map(|item| item.unwrap().key)
            .collect()
            .await;
        keys.sort();
        assert_eq!(keys, vec!["a", "c"], "{}", s.name());
    }
}

#[tokio::test]
async fn test_query_unsupported_never_reaches_driver() {
    let inner = InMemoryDriver::new("cache").with_capabilities(Capabilities::all().without(Feature::Query));
    let driver = Arc::new(MetricsDriver::new(inner));
    let f = ready(driver.clone(), None).await;

    let err = f
        .store
        .query(QueryRequest::new(Filter::eq("color", "red")), &call())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
    assert_eq!(driver.stats().await.query_count, 0);
}

// ===========================================================================
// Lifecycle and cancellation
// ===========================================================================

#[tokio::test]
async fn test_closed_store_rejects_operations() {
    for f in fixtures().await {
        let s = &f.store;
        s.close().await.unwrap();
        let get = s.get(GetRequest::new("k"), &call()).await.unwrap_err();
        let set = s.set(SetRequest::new("k", "[]"), &call()).await.unwrap_err();
        let bulk = s.bulk_delete(vec![DeleteRequest::new("k")], &call()).await.unwrap_err();
        for err in [get, set, bulk] {
            assert_eq!(err.kind(), ErrorKind::Lifecycle, "{}", s.name());
        }
    }
}

#[tokio::test]
async fn test_cancelled_call_reports_cancelled() {
    for f in fixtures().await {
        let token = CancellationToken::new();
        token.cancel();
        let opts = CallOptions::new().with_cancel(token);
        let err = f.store.set(SetRequest::new("k", "[]"), &opts).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled, "{}", f.store.name());
    }
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expiry() {
    init_tracing();
    for f in ephemeral_fixtures().await {
        let s = &f.store;
        let req = SetRequest::new("session", r#"{"user": 7}"#).with_metadata(metadata::TTL_IN_SECONDS, "30");
        s.set(req, &call()).await.unwrap();
        let forever = SetRequest::new("config", "[1]").with_metadata(metadata::TTL_IN_SECONDS, "-1");
        s.set(forever, &call()).await.unwrap();

        let got = s.get(GetRequest::new("session"), &call()).await.unwrap();
        assert!(got.metadata.contains_key(metadata::TTL_EXPIRE_TIME), "{}", s.name());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            s.get(GetRequest::new("session"), &call()).await.unwrap_err().kind(),
            ErrorKind::NotFound,
            "{}",
            s.name()
        );
        assert!(s.get(GetRequest::new("config"), &call()).await.is_ok());
    }
}

#[tokio::test]
async fn test_unrepresentable_ttl_is_a_validation_error() {
    for f in fixtures().await {
        let s = &f.store;
        let req = SetRequest::new("k", "[1]").with_metadata(metadata::TTL_IN_SECONDS, "10000000000000");
        let err = s.set(req, &call()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{}", s.name());
        assert!(err.to_string().contains(s.name()), "{err}");
        assert_eq!(
            s.get(GetRequest::new("k"), &call()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_expired_entries_do_not_accumulate() {
    init_tracing();
    let driver = Arc::new(InMemoryDriver::new("memory"));
    let f = ready(Arc::clone(&driver) as Arc<dyn StateDriver>, None).await;
    for i in 0..50 {
        let req = SetRequest::new(format!("session-{i}"), "{}").with_metadata(metadata::TTL_IN_SECONDS, "5");
        f.store.set(req, &call()).await.unwrap();
    }
    assert_eq!(driver.stored_len().await, 50);

    tokio::time::advance(Duration::from_secs(6)).await;
    f.store.set(SetRequest::new("fresh", "{}"), &call()).await.unwrap();
    assert_eq!(driver.stored_len().await, 1);
}

#[tokio::test]
async fn test_ttl_rejected_without_capability() {
    let driver = InMemoryDriver::new("cache").with_capabilities(Capabilities::all().without(Feature::Ttl));
    let f = ready(Arc::new(driver), None).await;
    let req = SetRequest::new("k", "[]").with_metadata(metadata::TTL_IN_SECONDS, "10");
    let err = f.store.set(req, &call()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
}
