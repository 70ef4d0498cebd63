// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Typed state wrapper.
//
// Provides a serde-based interface on top of a `StateStore`. Values go in as
// structured objects and come back deserialized; keys are prefixed with
// `{namespace}||` so several logical owners can share one store without key
// collisions.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StateError;
use crate::request::{CallOptions, DeleteRequest, GetRequest, SetRequest};
use crate::store::StateStore;

/// Separator between namespace and key.
pub const KEY_SEPARATOR: &str = "||";

/// A typed, namespaced view of a [`StateStore`].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use serde::{Deserialize, Serialize};
/// use statehub_store::memory::InMemoryDriver;
/// use statehub_store::store::StateStore;
/// use statehub_store::typed::TypedStateStore;
///
/// #[derive(Debug, Serialize, Deserialize, PartialEq)]
/// struct User { name: String, age: u32 }
///
/// # tokio_test::block_on(async {
/// let store = Arc::new(StateStore::new("users", Arc::new(InMemoryDriver::new("users"))));
/// store.init().await.unwrap();
/// let users = TypedStateStore::new(store, "app1");
///
/// let alice = User { name: "Alice".into(), age: 30 };
/// users.put("alice", &alice).await.unwrap();
/// let retrieved: User = users.get("alice").await.unwrap().unwrap();
/// assert_eq!(retrieved, alice);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct TypedStateStore {
    store: Arc<StateStore>,
    namespace: String,
    call: CallOptions,
}

impl TypedStateStore {
    pub fn new(store: Arc<StateStore>, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            call: CallOptions::default(),
        }
    }

    /// Apply `call` to every operation made through this view.
    pub fn with_call_options(mut self, call: CallOptions) -> Self {
        self.call = call;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The key as stored in the backend.
    pub fn full_key(&self, key: &str) -> String {
        format!("{}{}{}", self.namespace, KEY_SEPARATOR, key)
    }

    /// Serialize and store `value`, returning the new etag.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<String, StateError> {
        let req = SetRequest::json(self.full_key(key), value)?;
        Ok(self.store.set(req, &self.call).await?.etag)
    }

    /// Replace `value` only if the stored version still carries `etag`.
    pub async fn put_if_match<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        etag: &str,
    ) -> Result<String, StateError> {
        let req = SetRequest::json(self.full_key(key), value)?.with_etag(etag);
        Ok(self.store.set(req, &self.call).await?.etag)
    }

    /// Returns `Ok(None)` if the key does not exist.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        Ok(self.get_with_etag(key).await?.map(|(value, _)| value))
    }

    pub async fn get_with_etag<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(T, String)>, StateError> {
        match self.store.get(GetRequest::new(self.full_key(key)), &self.call).await {
            Ok(resp) => {
                let value = resp.json()?;
                Ok(Some((value, resp.etag.unwrap_or_default())))
            }
            Err(StateError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Returns `Ok(true)` if the key existed and was removed.
    pub async fn delete(&self, key: &str) -> Result<bool, StateError> {
        match self.store.delete(DeleteRequest::new(self.full_key(key)), &self.call).await {
            Ok(()) => Ok(true),
            Err(StateError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::InMemoryDriver;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Item {
        id: u64,
        label: String,
    }

    async fn shared_store() -> Arc<StateStore> {
        let store = Arc::new(StateStore::new("typed", Arc::new(InMemoryDriver::new("typed"))));
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let typed = TypedStateStore::new(shared_store().await, "app1");
        let item = Item { id: 1, label: "one".into() };

        typed.put("k", &item).await.unwrap();
        assert_eq!(typed.get::<Item>("k").await.unwrap(), Some(item));

        assert!(typed.delete("k").await.unwrap());
        assert!(!typed.delete("k").await.unwrap());
        assert_eq!(typed.get::<Item>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = shared_store().await;
        let a = TypedStateStore::new(store.clone(), "a");
        let b = TypedStateStore::new(store.clone(), "b");

        a.put("k", &1u32).await.unwrap();
        assert_eq!(b.get::<u32>("k").await.unwrap(), None);
        assert_eq!(a.full_key("k"), "a||k");

        // The raw store sees the prefixed key.
        let raw = store
            .get(GetRequest::new("a||k"), &CallOptions::new())
            .await
            .unwrap();
        assert_eq!(raw.data, b"1".to_vec());
    }

    #[tokio::test]
    async fn test_put_if_match() {
        let typed = TypedStateStore::new(shared_store().await, "app");
        let etag = typed.put("k", &Item { id: 1, label: "a".into() }).await.unwrap();

        let (_, current) = typed.get_with_etag::<Item>("k").await.unwrap().unwrap();
        assert_eq!(current, etag);

        typed
            .put_if_match("k", &Item { id: 1, label: "b".into() }, &etag)
            .await
            .unwrap();
        let err = typed
            .put_if_match("k", &Item { id: 1, label: "c".into() }, &etag)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_wrong_type_is_encoding_error() {
        let typed = TypedStateStore::new(shared_store().await, "app");
        typed.put("k", &"text").await.unwrap();
        let err = typed.get::<Item>("k").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Encoding);
    }
}
