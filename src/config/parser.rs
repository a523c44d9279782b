//! Environment variable parsing
//!
//! Values are looked up through `EnvSource` so tests can feed a plain map
//! instead of mutating the process environment.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable holds a value that cannot be parsed
    #[error("Invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },
}

/// Where configuration values come from
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads from the process environment
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Parse a boolean flag; `true/false/1/0/yes/no`, case-insensitive
pub fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Parse any `FromStr` number
pub fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Typed lookups with defaults
pub(crate) struct Lookup<'a> {
    source: &'a dyn EnvSource,
}

impl<'a> Lookup<'a> {
    pub fn new(source: &'a dyn EnvSource) -> Self {
        Lookup { source }
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.source.get(key).filter(|v| !v.trim().is_empty())
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key) {
            Some(v) => parse_bool(key, &v),
            None => Ok(default),
        }
    }

    pub fn number_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.string(key) {
            Some(v) => parse_number(key, &v),
            None => Ok(default),
        }
    }

    pub fn millis_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.string(key) {
            Some(v) => Ok(Duration::from_millis(parse_number::<u64>(key, &v)?)),
            None => Ok(default),
        }
    }
}
