use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use ferry_common::{Classify, internal};

use crate::{MessageStore, Result, StorageKey, StoreError};

/// Wraps a store with a per-attempt timeout and a small number of immediate
/// retries on retryable failures.
///
/// There is no backoff between attempts; longer-horizon retries belong to
/// whatever redelivers the invocation.
#[derive(Debug, Clone)]
pub struct RetryingStore {
    inner: Arc<dyn MessageStore>,
    retries: u32,
    attempt_timeout: Duration,
}

impl RetryingStore {
    #[must_use]
    pub fn new(inner: Arc<dyn MessageStore>, retries: u32, attempt_timeout: Duration) -> Self {
        Self {
            inner,
            retries,
            attempt_timeout,
        }
    }

    async fn attempt(&self, key: &StorageKey) -> Result<Vec<u8>> {
        tokio::time::timeout(self.attempt_timeout, self.inner.fetch(key))
            .await
            .map_err(|_| StoreError::Timeout(self.attempt_timeout))?
    }
}

#[async_trait]
impl MessageStore for RetryingStore {
    async fn fetch(&self, key: &StorageKey) -> Result<Vec<u8>> {
        let mut attempt = 0;

        loop {
            match self.attempt(key).await {
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    internal!(
                        level = WARN,
                        key = %key,
                        attempt,
                        error = %err,
                        "Retrying store fetch"
                    );
                }
                result => return result,
            }
        }
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{InjectedFailure, TestStore};

    #[tokio::test]
    async fn single_retry_recovers_transient() {
        let store = TestStore::new();
        let key = store.stage("abc", b"raw".to_vec());
        store.fail_next(InjectedFailure::Transient);

        let retrying = RetryingStore::new(Arc::new(store.clone()), 1, Duration::from_secs(1));
        assert_eq!(retrying.fetch(&key).await.unwrap(), b"raw".to_vec());
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let store = TestStore::new();
        let key = store.stage("abc", b"raw".to_vec());
        store.fail_next(InjectedFailure::Transient);
        store.fail_next(InjectedFailure::Transient);

        let retrying = RetryingStore::new(Arc::new(store.clone()), 1, Duration::from_secs(1));
        assert!(retrying.fetch(&key).await.unwrap_err().is_retryable());
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let store = TestStore::new();
        let key = StorageKey::parse("missing").unwrap();

        let retrying = RetryingStore::new(Arc::new(store.clone()), 3, Duration::from_secs(1));
        assert!(retrying.fetch(&key).await.unwrap_err().is_not_found());
        assert_eq!(store.fetch_count(), 1);
    }
}
