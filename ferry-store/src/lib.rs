pub mod backends;
pub mod config;
pub mod error;
pub mod key;
pub mod retry;
pub mod store;

pub use backends::{FileStore, HttpStore, InjectedFailure, MemoryStore, TestStore};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use key::StorageKey;
pub use retry::RetryingStore;
pub use store::MessageStore;
