//! # Mantle Utilities
//!
//! Shared utilities for the Mantle workspace: logging built on `tracing`, and
//! environment-driven engine configuration.

pub mod config;
pub mod logging;

pub use config::{ConfigError, EngineConfig};
pub use logging::{init_logging, init_logging_to_file, init_logging_with_level, LogFormat, LogLevel};
pub use tracing::{debug, error, info, trace, warn};
