//! nsQL: a small SQL dialect transcompiled to Cassandra CQL or Spark programs
//!
//! Text goes through the lexer and parser into an immutable `Statement`, which
//! exactly one backend consumes. The backend is chosen from the data source a
//! script hands to the `nsQL` Lua module.

pub mod ast;
pub mod cassandra;
pub mod cql_session;
pub mod lexer;
pub mod parser;
pub mod spark;
pub mod udfs;

use std::sync::Arc;

use serde::Deserialize;

use crate::error::NsqlError;
use crate::value::Value;

pub use cassandra::CassandraCompiler;
pub use cql_session::{CqlSession, QueryRows, ScyllaSessionFactory, SessionFactory};
pub use parser::parse;
pub use spark::SparkCompiler;

/// `backend` selecting the native column-store driver
pub const NATIVE: &str = "native";

/// `backend` selecting the remote Spark service
pub const SPARK: &str = "spark";

/// `protocol` of a Cassandra data source
pub const CASSANDRA: &str = "cassandra";

/// Where the data lives and how to reach it
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Source {
    #[serde(deserialize_with = "crate::value::lenient_string")]
    pub backend: String,

    #[serde(deserialize_with = "crate::value::lenient_string")]
    pub protocol: String,

    /// Comma separated host list
    #[serde(deserialize_with = "crate::value::lenient_string")]
    pub host: String,

    #[serde(deserialize_with = "crate::value::lenient_string")]
    pub port: String,

    #[serde(deserialize_with = "crate::value::lenient_string")]
    pub username: String,

    #[serde(deserialize_with = "crate::value::lenient_string")]
    pub password: String,

    /// CQL version, empty for the driver default
    #[serde(deserialize_with = "crate::value::lenient_string")]
    pub version: String,
}

/// Per-query knobs
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    /// Append `allow filtering` to Cassandra selects
    #[serde(alias = "allow_filtering", alias = "AllowFiltering")]
    pub allow_filtering: bool,

    /// Row cap applied when Spark loads a Cassandra table, 0 for none
    #[serde(alias = "cassandra_fetch_limit", alias = "CassandraFetchLimit")]
    pub cassandra_fetch_limit: u64,

    /// Return cells as typed values instead of wire strings
    #[serde(alias = "return_typed", alias = "ReturnTyped")]
    pub return_typed: bool,
}

impl Source {
    pub fn from_value(value: &Value) -> Result<Self, NsqlError> {
        serde_json::from_value(value.clone().into()).map_err(|e| NsqlError::module(e.to_string()))
    }
}

impl Options {
    /// Options from a script argument; nil means defaults
    pub fn from_value(value: &Value) -> Result<Self, NsqlError> {
        match value {
            Value::Null => Ok(Options::default()),
            Value::Map(_) => serde_json::from_value(value.clone().into())
                .map_err(|e| NsqlError::module(e.to_string())),
            _ => Err(NsqlError::module("unknown input type")),
        }
    }
}

/// Runs nsQL text against one backend
pub trait Compiler: Send {
    fn run(&mut self, query: &str, options: &Options) -> Result<Value, NsqlError>;
}

/// Process-wide settings the backends depend on
#[derive(Clone)]
pub struct Backends {
    /// `host:port` of the Spark execution service
    pub spark_host_port: Option<String>,

    /// Opens Cassandra sessions
    pub sessions: Arc<dyn SessionFactory>,
}

impl Backends {
    pub fn new(spark_host_port: Option<String>) -> Self {
        Backends {
            spark_host_port,
            sessions: Arc::new(ScyllaSessionFactory::default()),
        }
    }

    /// Size the runtime behind each Cassandra session
    pub fn with_driver_threads(self, threads: usize) -> Self {
        self.with_sessions(Arc::new(ScyllaSessionFactory::new(threads)))
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionFactory>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Pick the compiler serving `source`
    pub fn compiler_for(&self, source: &Source) -> Result<Box<dyn Compiler>, NsqlError> {
        match self.backend_kind(source)? {
            BackendKind::Cassandra => Ok(Box::new(self.cassandra(source))),
            BackendKind::Spark => Ok(Box::new(self.spark(source)?)),
        }
    }

    /// A Cassandra compiler, for callers holding a persistent connection
    pub fn cassandra_for(&self, source: &Source) -> Result<CassandraCompiler, NsqlError> {
        match self.backend_kind(source)? {
            BackendKind::Cassandra => Ok(self.cassandra(source)),
            BackendKind::Spark => Err(NsqlError::module("invalid backend or protocol")),
        }
    }

    fn cassandra(&self, source: &Source) -> CassandraCompiler {
        CassandraCompiler::new(source.clone(), Arc::clone(&self.sessions))
    }

    fn spark(&self, source: &Source) -> Result<SparkCompiler, NsqlError> {
        match self.spark_host_port.as_deref() {
            Some(host_port) if !host_port.is_empty() => {
                tracing::info!(host_port, "using spark backend");
                Ok(SparkCompiler::new(host_port, source.clone()))
            }
            _ => Err(NsqlError::module("unable to find spark host port")),
        }
    }

    fn backend_kind(&self, source: &Source) -> Result<BackendKind, NsqlError> {
        if source.protocol.is_empty() || source.host.is_empty() || source.port.is_empty() {
            return Err(NsqlError::module(
                "data source protocol, host and port must be defined",
            ));
        }
        match source.backend.as_str() {
            NATIVE => match source.protocol.as_str() {
                CASSANDRA => Ok(BackendKind::Cassandra),
                other => Err(NsqlError::module(format!(
                    "{} is not a supported data source protocol",
                    other
                ))),
            },
            SPARK => Ok(BackendKind::Spark),
            other => Err(NsqlError::module(format!(
                "{} is not a supported data processing backend",
                other
            ))),
        }
    }
}

enum BackendKind {
    Cassandra,
    Spark,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn source(backend: &str, protocol: &str) -> Source {
        Source {
            backend: backend.to_string(),
            protocol: protocol.to_string(),
            host: "127.0.0.1".to_string(),
            port: "9042".to_string(),
            ..Source::default()
        }
    }

    #[test]
    fn test_backend_selection_errors() {
        let backends = Backends::new(None);
        let cases = vec![
            (
                Source::default(),
                "nsQL error: data source protocol, host and port must be defined",
            ),
            (
                source("native", "mysql"),
                "nsQL error: mysql is not a supported data source protocol",
            ),
            (
                source("hadoop", "cassandra"),
                "nsQL error: hadoop is not a supported data processing backend",
            ),
            (
                source("spark", "cassandra"),
                "nsQL error: unable to find spark host port",
            ),
        ];
        for (src, expected) in cases {
            let err = backends.compiler_for(&src).err().unwrap();
            assert_eq!(err.to_string(), expected);
        }

        let spark = Backends::new(Some("spark:8080".to_string()));
        assert!(spark.compiler_for(&source("spark", "cassandra")).is_ok());
        assert_eq!(
            spark
                .cassandra_for(&source("spark", "cassandra"))
                .err()
                .unwrap()
                .to_string(),
            "nsQL error: invalid backend or protocol"
        );
    }

    #[test]
    fn test_source_and_options_from_values() {
        let mut table = BTreeMap::new();
        table.insert("backend".to_string(), Value::from("native"));
        table.insert("protocol".to_string(), Value::from("cassandra"));
        table.insert("host".to_string(), Value::from("10.0.0.1,10.0.0.2"));
        table.insert("port".to_string(), Value::Int(9042));
        let src = Source::from_value(&Value::Map(table)).unwrap();
        assert_eq!(src.port, "9042");
        assert_eq!(src.username, "");

        let mut opts = BTreeMap::new();
        opts.insert("allowFiltering".to_string(), Value::Bool(true));
        opts.insert("cassandra_fetch_limit".to_string(), Value::Int(10));
        let options = Options::from_value(&Value::Map(opts)).unwrap();
        assert!(options.allow_filtering);
        assert_eq!(options.cassandra_fetch_limit, 10);
        assert!(!options.return_typed);

        assert_eq!(Options::from_value(&Value::Null).unwrap(), Options::default());
        assert_eq!(
            Options::from_value(&Value::from("x")).unwrap_err().to_string(),
            "nsQL error: unknown input type"
        );
    }
}
