use std::fmt::Debug;

use async_trait::async_trait;

use crate::{Result, StorageKey};

/// Read-only access to raw staged messages.
///
/// Implementations must never mutate or delete what they read; retention is
/// owned by whatever staged the message.
#[async_trait]
pub trait MessageStore: Send + Sync + Debug {
    /// Fetch the unmodified RFC 5322 bytes stored under `key`.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::NotFound`] when the key is absent, a retryable
    /// error for connectivity or throttling, and a terminal error otherwise.
    async fn fetch(&self, key: &StorageKey) -> Result<Vec<u8>>;

    /// Short human-readable description, used in logs and `ferry check`.
    fn describe(&self) -> String;
}
