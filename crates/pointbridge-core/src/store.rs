//! Shared state store abstraction.
//!
//! Priority state lives under a `(namespace, key)` pair, where the namespace is
//! the registration's `store` and the key its `path`.

use crate::error::StoreError;
use crate::priority::PriorityState;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Key-value storage for [`PriorityState`] records.
///
/// `set` returns only after the backend accepted the write; callers treat a
/// successful return as durable.
pub trait SharedStateStore: Send + Sync {
    /// Load the state stored under `namespace`/`key`.
    ///
    /// Records that cannot be decoded are reported as absent.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be queried.
    fn get(&self, namespace: &str, key: &str) -> Result<Option<PriorityState>, StoreError>;

    /// Store `state` under `namespace`/`key`, replacing any previous record.
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects the write.
    fn set(&self, namespace: &str, key: &str, state: &PriorityState) -> Result<(), StoreError>;
}

/// In-process store, used for tests and `memory` deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), PriorityState>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SharedStateStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<PriorityState>, StoreError> {
        Ok(self
            .entries
            .lock()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn set(&self, namespace: &str, key: &str, state: &PriorityState) -> Result<(), StoreError> {
        self.entries
            .lock()
            .insert((namespace.to_string(), key.to_string()), state.clone());
        Ok(())
    }
}
