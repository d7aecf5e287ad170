use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ferry_tracing::traced;

use crate::{MessageStore, Result, StorageKey, StoreError, key::validate_prefix};

/// Reads staged messages from `<root>/<prefix><key>` on a local filesystem
/// or a mounted bucket.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    prefix: String,
}

impl FileStore {
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidPrefix`] if `prefix` is absolute or
    /// escapes `root`.
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;

        Ok(Self {
            root: root.into(),
            prefix,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &StorageKey) -> PathBuf {
        self.root
            .join(self.prefix.trim_end_matches('/'))
            .join(key.as_str())
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip(self), fields(key = %key)), timing(precision = "us"))]
    async fn read(&self, key: &StorageKey) -> Result<Vec<u8>> {
        let path = self.path_for(key);

        tokio::fs::read(&path)
            .await
            .map_err(|err| StoreError::from_io(key, err))
    }
}

#[async_trait]
impl MessageStore for FileStore {
    async fn fetch(&self, key: &StorageKey) -> Result<Vec<u8>> {
        self.read(key).await
    }

    fn describe(&self) -> String {
        format!("file:{}", self.root.join(&self.prefix).display())
    }
}
