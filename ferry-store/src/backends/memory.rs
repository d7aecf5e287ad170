use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{MessageStore, Result, StorageKey, StoreError};

/// In-memory store, for tests and local experiments.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub(crate) messages: Arc<RwLock<HashMap<StorageKey, Arc<[u8]>>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a message, replacing anything already under `key`.
    pub fn insert(&self, key: StorageKey, raw: impl Into<Arc<[u8]>>) {
        self.messages.write().insert(key, raw.into());
    }

    /// Remove a message, simulating expiry of the staged copy.
    pub fn expire(&self, key: &StorageKey) -> bool {
        self.messages.write().remove(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn fetch(&self, key: &StorageKey) -> Result<Vec<u8>> {
        self.messages
            .read()
            .get(key)
            .map(|raw| raw.to_vec())
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    fn describe(&self) -> String {
        format!("memory ({} messages)", self.len())
    }
}
