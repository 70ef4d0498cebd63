// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bulk and transaction coordination.
//
// Bulk calls validate each item on its own, run the valid ones with bounded
// parallelism and report one outcome per input position. A failed item never
// stops the rest. Transactions are the opposite: every operation is checked
// before any I/O and the batch is handed to the driver as a unit.

use std::future::Future;

use futures::stream::{self, StreamExt};

use crate::capability::{Capabilities, Feature};
use crate::driver::TransactionItem;
use crate::encoding::ValueEncoder;
use crate::error::{Operation, StateError};
use crate::request::{TransactionOperation, TransactionalRequest};
use crate::validation;

/// The result for one position of a bulk request.
#[derive(Debug)]
pub struct BulkOutcome<T> {
    /// Position of the item in the caller's request.
    pub index: usize,
    pub key: String,
    pub result: Result<T, StateError>,
}

impl<T> BulkOutcome<T> {
    pub fn failed(index: usize, key: impl Into<String>, error: StateError) -> Self {
        Self {
            index,
            key: key.into(),
            result: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Transform a successful result, keeping position and key.
    pub fn map<U>(self, f: impl FnOnce(T) -> Result<U, StateError>) -> BulkOutcome<U> {
        BulkOutcome {
            index: self.index,
            key: self.key,
            result: self.result.and_then(f),
        }
    }
}

/// Indices of failed outcomes, in order.
pub fn failed_indices<T>(outcomes: &[BulkOutcome<T>]) -> Vec<usize> {
    outcomes
        .iter()
        .filter(|o| !o.is_ok())
        .map(|o| o.index)
        .collect()
}

/// Run `op` over `items` with at most `parallelism` in flight and wait for
/// all of them. Outcomes come back sorted by index.
pub async fn fan_out<I, T, K, F, Fut>(
    items: Vec<(usize, I)>,
    parallelism: usize,
    key_of: K,
    op: F,
) -> Vec<BulkOutcome<T>>
where
    K: Fn(&I) -> String,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, StateError>>,
{
    let mut outcomes: Vec<BulkOutcome<T>> = stream::iter(items)
        .map(|(index, item)| {
            let key = key_of(&item);
            let pending = op(item);
            async move {
                BulkOutcome {
                    index,
                    key,
                    result: pending.await,
                }
            }
        })
        .buffer_unordered(parallelism.max(1))
        .collect()
        .await;
    outcomes.sort_by_key(|o| o.index);
    outcomes
}

/// Combine outcomes rejected before dispatch with those returned by the
/// driver into one index-ordered list.
pub fn merge_outcomes<T>(
    mut rejected: Vec<BulkOutcome<T>>,
    dispatched: Vec<BulkOutcome<T>>,
) -> Vec<BulkOutcome<T>> {
    rejected.extend(dispatched);
    rejected.sort_by_key(|o| o.index);
    rejected
}

/// Validate and encode a whole transactional request.
///
/// Fails with `NotSupported` before looking at the operations when the
/// backend has no transactions, and with the first operation's error when
/// any of them is invalid. Nothing has touched the backend either way.
pub fn prepare_transaction(
    backend: &str,
    capabilities: Capabilities,
    encoder: &ValueEncoder,
    request: TransactionalRequest,
) -> Result<Vec<TransactionItem>, StateError> {
    capabilities.require(backend, Operation::Transaction, Feature::Transaction)?;

    request
        .operations
        .into_iter()
        .map(|op| match op {
            TransactionOperation::Set(req) => validation::prepare_set(
                backend,
                capabilities,
                encoder,
                Operation::Transaction,
                req,
            )
            .map(TransactionItem::Upsert),
            TransactionOperation::Delete(req) => {
                validation::prepare_delete(backend, capabilities, Operation::Transaction, &req)?;
                Ok(TransactionItem::Delete(req))
            }
        })
        .collect()
}
