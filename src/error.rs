//! Error types for the snippet runtime
//!
//! Every subsystem reports through `RteError`. Query-layer failures keep the
//! message prefixes scripts have always seen (`nsQL error: ...`,
//! `nsQL cassandra transcompiler error: ...`) so they can be surfaced verbatim.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::config::ConfigError;

/// Main error type for runtime operations
#[derive(Debug)]
pub enum RteError {
    /// Configuration errors
    Config(String),

    /// Network/IO errors
    Io(String),

    /// Errors raised by the Lua VM or a capability module
    Lua(String),

    /// Resource-limit monitor could not start
    Resource(String),

    /// Snippet source could not be resolved
    CodeFetch(String),

    /// Malformed control message or collaborator failure
    Event(String),

    /// nsQL lexing, parsing, compilation or backend errors
    Nsql(NsqlError),

    /// Internal errors
    Internal(String),
}

/// Query-layer errors, one variant per message family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NsqlError {
    /// Lexer or parser rejected the query
    Syntax(String),

    /// Lua module level error (bad data source, options)
    Module(String),

    /// Cassandra compiler or driver error
    Cassandra(String),

    /// Spark compiler error
    Spark(String),

    /// Spark service could not be reached
    SparkComm(String),

    /// Spark service reported a failure
    SparkData(String),
}

/// Type alias for Results throughout the runtime
pub type Result<T> = std::result::Result<T, RteError>;

impl NsqlError {
    pub fn syntax(msg: impl Into<String>) -> Self {
        NsqlError::Syntax(msg.into())
    }

    pub fn module(msg: impl Into<String>) -> Self {
        NsqlError::Module(msg.into())
    }

    pub fn cassandra(msg: impl Into<String>) -> Self {
        NsqlError::Cassandra(msg.into())
    }

    pub fn spark(msg: impl Into<String>) -> Self {
        NsqlError::Spark(msg.into())
    }
}

impl fmt::Display for RteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RteError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RteError::Io(msg) => write!(f, "I/O error: {}", msg),
            RteError::Lua(msg) => write!(f, "{}", msg),
            RteError::Resource(msg) => write!(f, "{}", msg),
            RteError::CodeFetch(msg) => write!(f, "{}", msg),
            RteError::Event(msg) => write!(f, "{}", msg),
            RteError::Nsql(err) => write!(f, "{}", err),
            RteError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl fmt::Display for NsqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NsqlError::Syntax(msg) => write!(f, "nsQL syntax error: {}", msg),
            NsqlError::Module(msg) => write!(f, "nsQL error: {}", msg),
            NsqlError::Cassandra(msg) => write!(f, "nsQL cassandra transcompiler error: {}", msg),
            NsqlError::Spark(msg) => write!(f, "nsQL spark transcompiler error: {}", msg),
            NsqlError::SparkComm(msg) => {
                write!(f, "nsQL spark transcompiler communication error: {}", msg)
            }
            NsqlError::SparkData(msg) => {
                write!(f, "nsQL spark transcompiler data access error: {}", msg)
            }
        }
    }
}

impl StdError for RteError {}
impl StdError for NsqlError {}

// Conversion implementations
impl From<io::Error> for RteError {
    fn from(err: io::Error) -> Self {
        RteError::Io(err.to_string())
    }
}

impl From<NsqlError> for RteError {
    fn from(err: NsqlError) -> Self {
        RteError::Nsql(err)
    }
}

impl From<mlua::Error> for RteError {
    fn from(err: mlua::Error) -> Self {
        RteError::Lua(err.to_string())
    }
}

impl From<serde_json::Error> for RteError {
    fn from(err: serde_json::Error) -> Self {
        RteError::Event(err.to_string())
    }
}

impl From<reqwest::Error> for RteError {
    fn from(err: reqwest::Error) -> Self {
        RteError::Io(err.to_string())
    }
}

impl From<ConfigError> for RteError {
    fn from(err: ConfigError) -> Self {
        RteError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NsqlError::syntax("unexpected ASTERISK");
        assert_eq!(err.to_string(), "nsQL syntax error: unexpected ASTERISK");

        let err: RteError = NsqlError::cassandra("invalid FROM in SELECT").into();
        assert_eq!(
            err.to_string(),
            "nsQL cassandra transcompiler error: invalid FROM in SELECT"
        );

        let err = NsqlError::SparkData("table not found".to_string());
        assert_eq!(
            err.to_string(),
            "nsQL spark transcompiler data access error: table not found"
        );
    }
}
