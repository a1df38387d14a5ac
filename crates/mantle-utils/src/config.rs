//! # Engine Configuration
//!
//! Tunables for the introspection engine, read from the environment.
//!
//! | variable | default | meaning |
//! |----------|---------|---------|
//! | `MANTLE_POLL_INTERVAL_MS` | 10 | how long one wait on the target holds the process lock |
//! | `MANTLE_MAX_STEP_ITERATIONS` | 100000 | instruction steps a single line step may take |
//! | `MANTLE_MAX_CHUNKS_PER_UPDATE` | 64 | chunks one data table may advance through in one update |
//! | `MANTLE_MAX_DEFERRED_RECORDS` | 4096 | records held back for modules that are not loaded yet |
//! | `MANTLE_MAX_STRING_LENGTH` | 4096 | longest NUL-terminated string read from the target |
//! | `MANTLE_MAX_TABLE_ENTRIES` | 65536 | method entries or line rows accepted in one descriptor |
//! | `MANTLE_MAX_BACKTRACE_DEPTH` | 256 | frames walked by a backtrace |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Configuration error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError
{
    /// A variable was set but does not parse as the expected type.
    #[error("Invalid value for {variable}: {value:?} ({reason})")]
    InvalidValue
    {
        /// Environment variable name
        variable: &'static str,
        /// Raw value found in the environment
        value: String,
        /// Parser message
        reason: String,
    },

    /// A variable parsed but is outside the accepted range.
    #[error("{variable} must be at least {minimum}, got {value}")]
    OutOfRange
    {
        /// Environment variable name
        variable: &'static str,
        /// Parsed value
        value: u64,
        /// Smallest accepted value
        minimum: u64,
    },
}

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig
{
    /// Maximum time a single wait holds the target lock.
    pub poll_interval: Duration,
    /// Upper bound on instruction steps performed for one line step.
    pub max_step_iterations: u32,
    /// Upper bound on chunk links followed per table and update.
    pub max_chunks_per_update: u32,
    /// Upper bound on records deferred for unknown modules.
    pub max_deferred_records: usize,
    /// Upper bound on NUL-terminated string reads.
    pub max_string_length: usize,
    /// Upper bound on method entries and line rows in one descriptor.
    pub max_table_entries: usize,
    /// Upper bound on frames produced by a backtrace.
    pub max_backtrace_depth: usize,
}

impl Default for EngineConfig
{
    fn default() -> Self
    {
        Self {
            poll_interval: Duration::from_millis(10),
            max_step_iterations: 100_000,
            max_chunks_per_update: 64,
            max_deferred_records: 4096,
            max_string_length: 4096,
            max_table_entries: 65_536,
            max_backtrace_depth: 256,
        }
    }
}

impl EngineConfig
{
    /// Build a configuration from the process environment, starting from the
    /// defaults.
    ///
    /// ## Errors
    ///
    /// Returns [`ConfigError`] when a variable is present but malformed.
    pub fn from_env() -> Result<Self, ConfigError>
    {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// ## Errors
    ///
    /// Returns [`ConfigError`] when a value is present but malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "MANTLE_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(at_least("MANTLE_POLL_INTERVAL_MS", ms, 1)?);
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "MANTLE_MAX_STEP_ITERATIONS")? {
            config.max_step_iterations = at_least("MANTLE_MAX_STEP_ITERATIONS", u64::from(n), 1)? as u32;
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "MANTLE_MAX_CHUNKS_PER_UPDATE")? {
            config.max_chunks_per_update = at_least("MANTLE_MAX_CHUNKS_PER_UPDATE", u64::from(n), 1)? as u32;
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "MANTLE_MAX_DEFERRED_RECORDS")? {
            config.max_deferred_records = n;
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "MANTLE_MAX_STRING_LENGTH")? {
            config.max_string_length = at_least("MANTLE_MAX_STRING_LENGTH", n as u64, 1)? as usize;
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "MANTLE_MAX_TABLE_ENTRIES")? {
            config.max_table_entries = at_least("MANTLE_MAX_TABLE_ENTRIES", n as u64, 1)? as usize;
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "MANTLE_MAX_BACKTRACE_DEPTH")? {
            config.max_backtrace_depth = at_least("MANTLE_MAX_BACKTRACE_DEPTH", n as u64, 1)? as usize;
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, variable: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(variable) else {
        return Ok(None);
    };
    raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::InvalidValue {
        variable,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

fn at_least(variable: &'static str, value: u64, minimum: u64) -> Result<u64, ConfigError>
{
    if value < minimum {
        return Err(ConfigError::OutOfRange { variable, value, minimum });
    }
    Ok(value)
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String>
    {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_environment()
    {
        let config = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_overrides_are_applied()
    {
        let config = EngineConfig::from_lookup(lookup(&[
            ("MANTLE_POLL_INTERVAL_MS", "25"),
            ("MANTLE_MAX_CHUNKS_PER_UPDATE", " 3 "),
            ("MANTLE_MAX_TABLE_ENTRIES", "1024"),
        ]))
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert_eq!(config.max_chunks_per_update, 3);
        assert_eq!(config.max_table_entries, 1024);
        assert_eq!(config.max_step_iterations, 100_000);
    }

    #[test]
    fn test_malformed_value_is_reported()
    {
        let err = EngineConfig::from_lookup(lookup(&[("MANTLE_MAX_STEP_ITERATIONS", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { variable: "MANTLE_MAX_STEP_ITERATIONS", .. }));
    }

    #[test]
    fn test_zero_poll_interval_is_rejected()
    {
        let err = EngineConfig::from_lookup(lookup(&[("MANTLE_POLL_INTERVAL_MS", "0")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::OutOfRange {
                variable: "MANTLE_POLL_INTERVAL_MS",
                value: 0,
                minimum: 1
            }
        );
    }
}
