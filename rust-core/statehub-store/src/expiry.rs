// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Expiring entry map for the in-process drivers.
//!
//! Entries may carry an expiry instant on the tokio clock. Next to the
//! entries sits an index from expiry instant to keys, so reclaiming expired
//! entries costs O(expired) rather than a scan of everything stored.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};

use tokio::time::Instant;

/// A value that may expire.
pub(crate) trait Expiring {
    fn expires_at(&self) -> Option<Instant>;

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at().map_or(true, |at| now < at)
    }
}

#[derive(Debug)]
pub(crate) struct ExpiringMap<K, V> {
    entries: BTreeMap<K, V>,
    /// expiry instant -> keys expiring then
    index: BTreeMap<Instant, BTreeSet<K>>,
}

impl<K, V> Default for ExpiringMap<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Expiring> ExpiringMap<K, V> {
    /// The entry for `key`, unless it has expired by `now`.
    pub fn get_live<Q>(&self, key: &Q, now: Instant) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.entries.get(key).filter(|v| v.is_live(now))
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.remove(&key);
        if let Some(at) = value.expires_at() {
            self.index.entry(at).or_default().insert(key.clone());
        }
        self.entries.insert(key, value);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key)?;
        if let Some(at) = removed.expires_at() {
            if let Some(keys) = self.index.get_mut(&at) {
                keys.remove(key);
                if keys.is_empty() {
                    self.index.remove(&at);
                }
            }
        }
        Some(removed)
    }

    /// Whether anything stored has expired by `now`.
    pub fn has_expired(&self, now: Instant) -> bool {
        self.index.keys().next().is_some_and(|at| *at <= now)
    }

    /// Drop every entry that has expired by `now`, returning how many.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        while let Some(due) = self.index.first_entry() {
            if *due.key() > now {
                break;
            }
            for key in due.remove() {
                if self.entries.remove(&key).is_some() {
                    purged += 1;
                }
            }
        }
        purged
    }

    /// Live entries in key order.
    pub fn iter_live(&self, now: Instant) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().filter(move |(_, v)| v.is_live(now))
    }

    /// Stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}
