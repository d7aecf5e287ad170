pub mod address;
pub mod alias;
pub mod domain;
pub mod error;
pub mod logging;

pub use address::{AddressError, Mailbox, parse_reverse_path};
pub use alias::Alias;
pub use domain::Domain;
pub use error::{Classify, FailureClass};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting work and drain in-flight invocations
    Shutdown,
    /// Re-read the address map
    Reload,
}
