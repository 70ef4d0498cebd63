// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Named store registry.
//!
//! Maps component names to initialized [`StateStore`]s. Stores are created
//! lazily on first resolution from the component's driver kind, through a
//! factory table that callers can extend. Resolution is safe under
//! concurrency: racing callers always receive the same instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

use crate::config::{ComponentConfig, RegistryConfig};
use crate::document::DocumentDriver;
use crate::driver::StateDriver;
use crate::encoding::ValueEncoder;
use crate::error::{Operation, StateError};
use crate::memory::InMemoryDriver;
use crate::store::{LifecycleState, StateStore};

pub const IN_MEMORY: &str = "state.in-memory";
pub const DOCUMENT: &str = "state.document";
#[cfg(feature = "redb-backend")]
pub const REDB: &str = "state.redb";

/// Builds a driver from its component configuration.
pub type DriverFactory =
    Arc<dyn Fn(&ComponentConfig) -> Result<Arc<dyn StateDriver>, StateError> + Send + Sync>;

/// Every store that failed to close, with its error. The remaining stores
/// were still closed.
#[derive(Debug, Error)]
#[error("failed to close {} state store(s): {}", .failures.len(), describe(.failures))]
pub struct CloseError {
    pub failures: Vec<(String, StateError)>,
}

fn describe(failures: &[(String, StateError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A named store, filled once its driver has initialized.
type Slot = Arc<OnceCell<Arc<StateStore>>>;

#[derive(Default)]
struct Stores {
    open: HashMap<String, Slot>,
    closed: bool,
}

pub struct StateStoreRegistry {
    config: RegistryConfig,
    factories: HashMap<String, DriverFactory>,
    stores: RwLock<Stores>,
}

impl StateStoreRegistry {
    /// Validate `config` and register the built-in driver kinds.
    pub fn new(config: RegistryConfig) -> Result<Self, StateError> {
        config.validate()?;
        let mut registry = Self {
            config,
            factories: HashMap::new(),
            stores: RwLock::new(Stores::default()),
        };

        registry.register_factory(IN_MEMORY, |config| {
            Ok(Arc::new(InMemoryDriver::new(&config.name)) as Arc<dyn StateDriver>)
        });
        registry.register_factory(DOCUMENT, |config| {
            Ok(Arc::new(DocumentDriver::from_config(config)?) as Arc<dyn StateDriver>)
        });
        #[cfg(feature = "redb-backend")]
        registry.register_factory(REDB, |config| {
            Ok(Arc::new(crate::redb_backend::RedbDriver::from_config(config)?) as Arc<dyn StateDriver>)
        });

        Ok(registry)
    }

    /// Add or replace the factory for a driver kind.
    pub fn register_factory<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&ComponentConfig) -> Result<Arc<dyn StateDriver>, StateError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    /// Configured component names, in configuration order.
    pub fn names(&self) -> Vec<&str> {
        self.config.components.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return the ready store for `name`, creating and initializing it on
    /// first use.
    ///
    /// Each name initializes at most once at a time; callers racing on the
    /// same name wait for that one initialization. The registry lock is
    /// never held across a driver's `init`, so a slow backend does not stall
    /// resolution of other names.
    pub async fn resolve(&self, name: &str) -> Result<Arc<StateStore>, StateError> {
        let component = self
            .config
            .component(name)
            .ok_or_else(|| StateError::UnknownBackend(name.to_string()))?;
        let slot = self.slot(name).await?;

        let store = slot
            .get_or_try_init(|| async {
                let store = self.create(component)?;
                store.init().await?;
                info!(store = %component.name, kind = %component.kind, "state store registered");
                Ok::<_, StateError>(Arc::new(store))
            })
            .await?;

        // The registry may have closed while this store was initializing.
        if self.stores.read().await.closed {
            if let Err(err) = store.close().await {
                warn!(store = %name, error = %err, "failed to close state store");
            }
            return Err(closed_error(name));
        }
        Ok(Arc::clone(store))
    }

    async fn slot(&self, name: &str) -> Result<Slot, StateError> {
        {
            let stores = self.stores.read().await;
            if stores.closed {
                return Err(closed_error(name));
            }
            if let Some(slot) = stores.open.get(name) {
                return Ok(Arc::clone(slot));
            }
        }
        let mut stores = self.stores.write().await;
        if stores.closed {
            return Err(closed_error(name));
        }
        Ok(Arc::clone(stores.open.entry(name.to_string()).or_default()))
    }

    fn create(&self, component: &ComponentConfig) -> Result<StateStore, StateError> {
        let factory = self.factories.get(&component.kind).ok_or_else(|| {
            StateError::InvalidConfig(format!(
                "component '{}' has unknown type '{}'",
                component.name, component.kind
            ))
        })?;
        let driver = factory(component)?;
        Ok(StateStore::new(&component.name, driver)
            .with_options(self.config.options.clone())
            .with_encoder(ValueEncoder::new(component.content_type())))
    }

    /// Eagerly resolve every configured component.
    pub async fn init(&self) -> Result<(), StateError> {
        for component in &self.config.components {
            self.resolve(&component.name).await?;
        }
        Ok(())
    }

    /// Close every open store. Later resolutions fail with a lifecycle
    /// error. Closing is attempted for all stores even if some fail.
    pub async fn close(&self) -> Result<(), CloseError> {
        let open = {
            let mut stores = self.stores.write().await;
            stores.closed = true;
            std::mem::take(&mut stores.open)
        };

        let mut failures = Vec::new();
        for (name, slot) in open {
            // Stores still initializing are closed by their resolver.
            let Some(store) = slot.get() else { continue };
            if let Err(err) = store.close().await {
                warn!(store = %name, error = %err, "failed to close state store");
                failures.push((name, err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort_by(|a, b| a.0.cmp(&b.0));
            Err(CloseError { failures })
        }
    }
}

impl fmt::Debug for StateStoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("StateStoreRegistry")
            .field("config", &self.config)
            .field("kinds", &kinds)
            .finish()
    }
}

fn closed_error(name: &str) -> StateError {
    StateError::Lifecycle {
        backend: name.to_string(),
        operation: Operation::Init,
        state: LifecycleState::Closed,
    }
}
