// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Structured query filters.
//!
//! A filter is evaluated by a driver against its own representation of a
//! stored JSON value. The JSON form mirrors the usual state query shape:
//!
//! ```json
//! {"AND": [{"EQ": {"color": "red"}}, {"IN": {"size.label": ["S", "M"]}}]}
//! ```
//!
//! Field names are dotted paths into the stored value.

use std::collections::BTreeMap;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::driver::StoredState;
use crate::error::{Operation, StateError};

/// Lazily produced query results.
pub type QueryStream = BoxStream<'static, Result<StoredState, StateError>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Filter {
    /// Exactly one `field: value` pair.
    Eq(BTreeMap<String, Value>),
    /// Exactly one `field: [values]` pair.
    In(BTreeMap<String, Vec<Value>>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(field.into(), value.into());
        Filter::Eq(map)
    }

    pub fn one_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(field.into(), values);
        Filter::In(map)
    }

    /// Check structural rules: comparisons carry exactly one field, and
    /// combinators are non-empty.
    pub fn validate(&self) -> Result<(), StateError> {
        let invalid = |reason: &str| Err(StateError::validation(Operation::Query, "", reason));
        match self {
            Filter::Eq(map) if map.len() != 1 => invalid("EQ takes exactly one field"),
            Filter::In(map) if map.len() != 1 => invalid("IN takes exactly one field"),
            Filter::And(filters) | Filter::Or(filters) => {
                if filters.is_empty() {
                    return invalid("AND/OR need at least one operand");
                }
                filters.iter().try_for_each(Filter::validate)
            }
            _ => Ok(()),
        }
    }

    /// Evaluate against a stored JSON document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::Eq(map) => map
                .iter()
                .all(|(field, expected)| lookup(doc, field) == Some(expected)),
            Filter::In(map) => map.iter().all(|(field, candidates)| {
                lookup(doc, field).is_some_and(|actual| candidates.contains(actual))
            }),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }
}

/// Resolve a dotted path such as `person.org` inside `doc`.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
