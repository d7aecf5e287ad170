pub mod config;
pub mod error;
pub mod pipeline;
pub mod reload;
pub mod serve;

pub use config::{FerryConfig, ServeConfig, Timeouts};
pub use error::{ConfigError, PipelineError};
pub use pipeline::{BounceSummary, Disposition, Failure, Pipeline, Report, Stage, Trigger};
pub use reload::{AddressMapConfig, AddressMapHandle, MapSource, ReloadPolicy};
pub use serve::{ServeSummary, serve};
