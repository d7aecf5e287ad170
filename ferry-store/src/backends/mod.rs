mod file;
mod http;
mod memory;

pub use file::FileStore;
pub use http::{DEFAULT_MAX_OBJECT_SIZE, HttpStore};
pub use memory::MemoryStore;
pub use test::{InjectedFailure, TestStore};
