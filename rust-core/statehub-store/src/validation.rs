// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Request validation.
//!
//! Everything here runs before a driver is called, so a rejected request
//! never has a partial effect.

use std::collections::HashMap;
use std::time::Duration;

use crate::capability::{Capabilities, Feature};
use crate::encoding::ValueEncoder;
use crate::error::{Operation, StateError};
use crate::item::StateItem;
use crate::request::{metadata, Concurrency, DeleteRequest, GetRequest, QueryRequest, SetRequest};

pub fn validate_key(operation: Operation, key: &str) -> Result<(), StateError> {
    if key.is_empty() {
        return Err(StateError::validation(operation, key, "key must not be empty"));
    }
    Ok(())
}

/// Longest accepted `ttlInSeconds`, the range of a signed 32-bit count of
/// seconds used by document-store TTL fields (about 68 years).
pub const MAX_TTL_SECONDS: i64 = i32::MAX as i64;

/// Parse `ttlInSeconds` from request metadata.
///
/// Returns `None` when the key is absent or set to `-1` (never expire).
/// Any other value must be a positive integer no larger than
/// [`MAX_TTL_SECONDS`].
pub fn parse_ttl(
    operation: Operation,
    key: &str,
    metadata: &HashMap<String, String>,
) -> Result<Option<Duration>, StateError> {
    let Some(raw) = metadata.get(metadata::TTL_IN_SECONDS) else {
        return Ok(None);
    };
    match raw.trim().parse::<i64>() {
        Ok(-1) => Ok(None),
        Ok(secs) if secs > MAX_TTL_SECONDS => Err(StateError::validation(
            operation,
            key,
            format!("ttlInSeconds must not exceed {MAX_TTL_SECONDS}, got {secs}"),
        )),
        Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs.unsigned_abs()))),
        Ok(secs) => Err(StateError::validation(
            operation,
            key,
            format!("ttlInSeconds must be positive or -1, got {secs}"),
        )),
        Err(err) => Err(StateError::validation(
            operation,
            key,
            format!("invalid ttlInSeconds '{raw}': {err}"),
        )),
    }
}

/// Reject etag-based options on backends without etag concurrency.
pub fn check_concurrency_options(
    backend: &str,
    capabilities: Capabilities,
    operation: Operation,
    etag: Option<&str>,
    concurrency: Concurrency,
) -> Result<(), StateError> {
    if etag.is_some() || concurrency == Concurrency::FirstWrite {
        capabilities.require(backend, operation, Feature::EtagConcurrency)?;
    }
    Ok(())
}

pub fn prepare_get(backend: &str, operation: Operation, req: &GetRequest) -> Result<(), StateError> {
    validate_key(operation, &req.key).map_err(|err| err.on_backend(backend))
}

/// Validate and encode a set request into the item a driver persists.
pub fn prepare_set(
    backend: &str,
    capabilities: Capabilities,
    encoder: &ValueEncoder,
    operation: Operation,
    req: SetRequest,
) -> Result<StateItem, StateError> {
    build_item(backend, capabilities, encoder, operation, req).map_err(|err| err.on_backend(backend))
}

fn build_item(
    backend: &str,
    capabilities: Capabilities,
    encoder: &ValueEncoder,
    operation: Operation,
    req: SetRequest,
) -> Result<StateItem, StateError> {
    validate_key(operation, &req.key)?;
    let value = req
        .value
        .as_ref()
        .ok_or_else(|| StateError::validation(operation, &req.key, "value is required"))?;

    let ttl = parse_ttl(operation, &req.key, &req.metadata)?;
    if ttl.is_some() {
        capabilities.require(backend, operation, Feature::Ttl)?;
    }
    check_concurrency_options(
        backend,
        capabilities,
        operation,
        req.etag.as_deref(),
        req.options.concurrency,
    )?;

    let encoded = encoder.encode(&req.key, value, req.content_type())?;
    Ok(StateItem::new(req.key, encoded)?
        .with_etag(req.etag)
        .with_options(req.options)
        .with_ttl(ttl)
        .with_metadata(req.metadata))
}

pub fn prepare_delete(
    backend: &str,
    capabilities: Capabilities,
    operation: Operation,
    req: &DeleteRequest,
) -> Result<(), StateError> {
    validate_key(operation, &req.key).map_err(|err| err.on_backend(backend))?;
    check_concurrency_options(
        backend,
        capabilities,
        operation,
        req.etag.as_deref(),
        req.options.concurrency,
    )
}

pub fn prepare_query(
    backend: &str,
    capabilities: Capabilities,
    req: &QueryRequest,
) -> Result<(), StateError> {
    capabilities.require(backend, Operation::Query, Feature::Query)?;
    if let Some(filter) = &req.filter {
        filter.validate().map_err(|err| err.on_backend(backend))?;
    }
    if req.limit == Some(0) {
        return Err(StateError::validation(Operation::Query, "", "limit must be at least 1").on_backend(backend));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::EncodedValue;
    use crate::error::ErrorKind;
    use crate::query::Filter;

    fn ttl_md(value: &str) -> HashMap<String, String> {
        HashMap::from([(metadata::TTL_IN_SECONDS.to_string(), value.to_string())])
    }

    #[test]
    fn test_parse_ttl() {
        let op = Operation::Set;
        assert_eq!(parse_ttl(op, "k", &HashMap::new()).unwrap(), None);
        assert_eq!(parse_ttl(op, "k", &ttl_md("-1")).unwrap(), None);
        assert_eq!(
            parse_ttl(op, "k", &ttl_md("90")).unwrap(),
            Some(Duration::from_secs(90))
        );
        assert_eq!(parse_ttl(op, "k", &ttl_md("0")).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(parse_ttl(op, "k", &ttl_md("-5")).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(parse_ttl(op, "k", &ttl_md("soon")).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_parse_ttl_upper_bound() {
        let op = Operation::Set;
        let max = MAX_TTL_SECONDS.to_string();
        assert_eq!(
            parse_ttl(op, "k", &ttl_md(&max)).unwrap(),
            Some(Duration::from_secs(MAX_TTL_SECONDS as u64))
        );

        for too_long in ["2147483648", "10000000000000", "9223372036854775807"] {
            let err = parse_ttl(op, "k", &ttl_md(too_long)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
            assert!(err.to_string().contains("must not exceed"));
        }
    }

    #[test]
    fn test_errors_name_the_backend() {
        let err = prepare_set(
            "orders",
            Capabilities::all(),
            &ValueEncoder::default(),
            Operation::Set,
            SetRequest::new("", "x"),
        )
        .unwrap_err();
        assert!(matches!(err, StateError::Validation { ref backend, .. } if backend == "orders"));

        let err = prepare_get("orders", Operation::Get, &GetRequest::new("")).unwrap_err();
        assert!(err.to_string().contains("on orders"));
    }

    #[test]
    fn test_prepare_set_builds_item() {
        let req = SetRequest::new("k", "{\"a\":1}")
            .with_etag("7")
            .with_metadata(metadata::TTL_IN_SECONDS, "10")
            .with_metadata("unknownHint", "ignored");
        let item = prepare_set("mem", Capabilities::all(), &ValueEncoder::default(), Operation::Set, req)
            .unwrap();
        assert_eq!(item.key, "k");
        assert_eq!(item.etag.as_deref(), Some("7"));
        assert_eq!(item.ttl, Some(Duration::from_secs(10)));
        assert_eq!(item.value, EncodedValue::Json(serde_json::json!({"a": 1})));
    }

    #[test]
    fn test_prepare_set_requires_key_and_value() {
        let caps = Capabilities::all();
        let encoder = ValueEncoder::default();

        let err = prepare_set("mem", caps, &encoder, Operation::Set, SetRequest::new("", "x"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let missing = SetRequest {
            key: "k".into(),
            ..Default::default()
        };
        let err = prepare_set("mem", caps, &encoder, Operation::Set, missing).unwrap_err();
        assert!(err.to_string().contains("value is required"));
    }

    #[test]
    fn test_capability_gating() {
        let caps = Capabilities::none();
        let encoder = ValueEncoder::default();

        let with_ttl = SetRequest::new("k", "v").with_metadata(metadata::TTL_IN_SECONDS, "5");
        let err = prepare_set("kv", caps, &encoder, Operation::Set, with_ttl).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);

        // "never expires" is meaningful everywhere.
        let forever = SetRequest::new("k", "v").with_metadata(metadata::TTL_IN_SECONDS, "-1");
        assert!(prepare_set("kv", caps, &encoder, Operation::Set, forever).is_ok());

        let with_etag = SetRequest::new("k", "v").with_etag("1");
        let err = prepare_set("kv", caps, &encoder, Operation::Set, with_etag).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);

        let first_write = DeleteRequest::new("k").with_concurrency(Concurrency::FirstWrite);
        let err = prepare_delete("kv", caps, Operation::Delete, &first_write).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);

        assert!(prepare_delete("kv", caps, Operation::Delete, &DeleteRequest::new("k")).is_ok());
    }

    #[test]
    fn test_prepare_query() {
        let req = QueryRequest::new(Filter::eq("color", "red"));
        assert!(prepare_query("docs", Capabilities::all(), &req).is_ok());
        assert_eq!(
            prepare_query("kv", Capabilities::none(), &req).unwrap_err().kind(),
            ErrorKind::NotSupported
        );
        assert_eq!(
            prepare_query("docs", Capabilities::all(), &req.clone().with_limit(0))
                .unwrap_err()
                .kind(),
            ErrorKind::Validation
        );
        let bad = QueryRequest::new(Filter::Or(vec![]));
        assert!(prepare_query("docs", Capabilities::all(), &bad).is_err());
    }

    #[test]
    fn test_prepare_get() {
        assert!(prepare_get("mem", Operation::Get, &GetRequest::new("k")).is_ok());
        assert!(prepare_get("mem", Operation::BulkGet, &GetRequest::new("")).is_err());
    }
}
