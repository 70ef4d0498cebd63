// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Driver capability declarations.
//
// Each driver states which optional parts of the contract it implements. The
// store consults this before routing a request so that an unsupported call
// fails with `NotSupported` instead of being silently degraded.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Operation, StateError};

/// An optional part of the state-store contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    Bulk,
    Transaction,
    Query,
    Ttl,
    EtagConcurrency,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::Bulk,
        Feature::Transaction,
        Feature::Query,
        Feature::Ttl,
        Feature::EtagConcurrency,
    ];
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feature::Bulk => "bulk operations",
            Feature::Transaction => "transactions",
            Feature::Query => "query",
            Feature::Ttl => "ttl",
            Feature::EtagConcurrency => "etag concurrency",
        };
        f.write_str(name)
    }
}

/// The static capability set a driver exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub bulk: bool,
    pub transaction: bool,
    pub query: bool,
    pub ttl: bool,
    pub etag_concurrency: bool,
}

impl Capabilities {
    /// Every optional feature enabled.
    pub const fn all() -> Self {
        Self {
            bulk: true,
            transaction: true,
            query: true,
            ttl: true,
            etag_concurrency: true,
        }
    }

    /// Plain get/set/delete only.
    pub const fn none() -> Self {
        Self {
            bulk: false,
            transaction: false,
            query: false,
            ttl: false,
            etag_concurrency: false,
        }
    }

    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::Bulk => self.bulk,
            Feature::Transaction => self.transaction,
            Feature::Query => self.query,
            Feature::Ttl => self.ttl,
            Feature::EtagConcurrency => self.etag_concurrency,
        }
    }

    /// Return a copy with `feature` switched on or off.
    pub fn set(mut self, feature: Feature, enabled: bool) -> Self {
        match feature {
            Feature::Bulk => self.bulk = enabled,
            Feature::Transaction => self.transaction = enabled,
            Feature::Query => self.query = enabled,
            Feature::Ttl => self.ttl = enabled,
            Feature::EtagConcurrency => self.etag_concurrency = enabled,
        }
        self
    }

    pub fn with(self, feature: Feature) -> Self {
        self.set(feature, true)
    }

    pub fn without(self, feature: Feature) -> Self {
        self.set(feature, false)
    }

    /// The enabled features, in declaration order.
    pub fn features(&self) -> Vec<Feature> {
        Feature::ALL
            .iter()
            .copied()
            .filter(|f| self.supports(*f))
            .collect()
    }

    /// Fail with `NotSupported` unless `feature` is enabled.
    pub fn require(
        &self,
        backend: &str,
        operation: Operation,
        feature: Feature,
    ) -> Result<(), StateError> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(StateError::not_supported(backend, operation, feature))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_all_and_none() {
        assert_eq!(Capabilities::all().features().len(), 5);
        assert!(Capabilities::none().features().is_empty());
        assert_eq!(Capabilities::default(), Capabilities::none());
    }

    #[test]
    fn test_with_and_without() {
        let caps = Capabilities::none()
            .with(Feature::Bulk)
            .with(Feature::Ttl);
        assert!(caps.supports(Feature::Bulk));
        assert!(caps.supports(Feature::Ttl));
        assert!(!caps.supports(Feature::Query));

        let caps = Capabilities::all().without(Feature::Transaction);
        assert!(!caps.transaction);
        assert_eq!(
            caps.features(),
            vec![
                Feature::Bulk,
                Feature::Query,
                Feature::Ttl,
                Feature::EtagConcurrency
            ]
        );
    }

    #[test]
    fn test_require() {
        let caps = Capabilities::none().with(Feature::Query);
        assert!(caps.require("docs", Operation::Query, Feature::Query).is_ok());

        let err = caps
            .require("docs", Operation::Transaction, Feature::Transaction)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert!(err.to_string().contains("transactions"));
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_value(Capabilities::all()).unwrap();
        assert_eq!(json["etag_concurrency"], true);
        let feature: Feature = serde_json::from_str("\"etag-concurrency\"").unwrap();
        assert_eq!(feature, Feature::EtagConcurrency);
    }
}
