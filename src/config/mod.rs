//! Desired configuration
//!
//! The configuration file holds the desired cluster spec plus optional engine
//! settings. It is loaded and validated once, at the process boundary; the
//! engine only ever sees the typed [`ClusterConfig`].

mod loader;
pub mod settings;
mod types;
mod validation;

#[cfg(test)]
mod tests;

pub use loader::{load_config, parse_config, ConfigFile, ConfigFormat};
pub use settings::{EngineSettings, Timeouts};
pub use types::*;
pub use validation::{into_error, parse_network_cidr, SpecValidationError};
