//! Configuration module for the snippet runtime
//!
//! The runtime is configured entirely from environment variables. The
//! resulting `RteConfig` is immutable and handed down explicitly to every
//! component that needs it.

mod parser;

pub use parser::{parse_bool, parse_number, ConfigError, EnvSource, ProcessEnv};

use parser::Lookup;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the runtime
#[derive(Debug, Clone)]
pub struct RteConfig {
    /// Identifier of this runtime instance, reported with every output
    pub rte_id: String,

    /// Number of worker threads executing invocations
    pub workers: usize,

    /// Capacity of the bounded dispatch queue
    pub worker_queue_capacity: usize,

    /// Enable cgroup based memory monitoring
    pub enable_rlimit: bool,

    /// Worker threads of the runtime driving each Cassandra session
    pub thread_count: usize,

    /// Byte budget for captured stdout
    pub print_limit: usize,

    /// Delay before a finished worker is dropped from the registry
    pub cleanup_delay: Duration,

    /// cgroup pseudo-files used by the memory monitor
    pub cgroup: CgroupConfig,

    /// `host:port` of the Spark execution service
    pub spark_host_port: Option<String>,

    /// `host:port` of the API receiving execution callbacks
    pub callback_host_port: Option<String>,

    /// Capability modules installed into every interpreter state
    pub modules: ModuleFlags,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// cgroup memory accounting files
#[derive(Debug, Clone)]
pub struct CgroupConfig {
    pub limit_file: PathBuf,
    pub usage_file: PathBuf,
}

/// Which capability modules are exposed to scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleFlags {
    pub http: bool,
    pub nsql: bool,
    pub ns_output: bool,
    pub ns_ftp: bool,
    pub ns_sftp: bool,
    pub ns_object: bool,
    pub ns_kv: bool,
    pub ns_stream: bool,
    pub ns_util: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines
    Text,

    /// One JSON object per line
    Json,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "plain" => Some(LogFormat::Text),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

impl Default for RteConfig {
    fn default() -> Self {
        RteConfig {
            rte_id: uuid::Uuid::new_v4().to_string(),
            workers: 1,
            worker_queue_capacity: 10,
            enable_rlimit: true,
            thread_count: 1,
            print_limit: 10000,
            cleanup_delay: Duration::from_secs(5),
            cgroup: CgroupConfig::default(),
            spark_host_port: None,
            callback_host_port: None,
            modules: ModuleFlags::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CgroupConfig {
    fn default() -> Self {
        CgroupConfig {
            limit_file: PathBuf::from("/sys/fs/cgroup/memory/memory.limit_in_bytes"),
            usage_file: PathBuf::from("/sys/fs/cgroup/memory/memory.usage_in_bytes"),
        }
    }
}

impl Default for ModuleFlags {
    fn default() -> Self {
        ModuleFlags {
            http: false,
            nsql: false,
            ns_output: true,
            ns_ftp: false,
            ns_sftp: false,
            ns_object: false,
            ns_kv: false,
            ns_stream: false,
            ns_util: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl RteConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&ProcessEnv)
    }

    /// Load configuration from an arbitrary source
    pub fn from_source(source: &dyn EnvSource) -> Result<Self, ConfigError> {
        let env = Lookup::new(source);
        let defaults = RteConfig::default();

        let rte_id = match env.string("MESOS_TASK_ID") {
            Some(task) => rte_id_from_task(&task),
            None => defaults.rte_id,
        };

        let format = match env.string("LOG_FORMAT") {
            Some(f) => LogFormat::from_str(&f).ok_or(ConfigError::InvalidValue {
                key: "LOG_FORMAT".to_string(),
                value: f,
            })?,
            None => LogFormat::Text,
        };

        let dm = ModuleFlags::default();
        let modules = ModuleFlags {
            http: env.bool_or("ENABLE_HTTP", dm.http)?,
            nsql: env.bool_or("ENABLE_NSQL", dm.nsql)?,
            ns_output: env.bool_or("ENABLE_NSOUTPUT", dm.ns_output)?,
            ns_ftp: env.bool_or("ENABLE_NSFTP", dm.ns_ftp)?,
            ns_sftp: env.bool_or("ENABLE_NSSFTP", dm.ns_sftp)?,
            ns_object: env.bool_or("ENABLE_NSOBJECT", dm.ns_object)?,
            ns_kv: env.bool_or("ENABLE_NSKV", dm.ns_kv)?,
            ns_stream: env.bool_or("ENABLE_NSSTREAM", dm.ns_stream)?,
            ns_util: env.bool_or("ENABLE_NSUTIL", dm.ns_util)?,
        };

        let workers = positive(env.number_or("WORKERS", defaults.workers)?, "WORKERS")?;
        let thread_count = positive(
            env.number_or("THREAD_COUNT", defaults.thread_count)?,
            "THREAD_COUNT",
        )?;

        Ok(RteConfig {
            rte_id,
            workers,
            worker_queue_capacity: env
                .number_or("WORKER_QUEUE_CAPACITY", defaults.worker_queue_capacity)?,
            enable_rlimit: env.bool_or("ENABLE_RLIMIT", defaults.enable_rlimit)?,
            thread_count,
            print_limit: env.number_or("PRINT_LIMIT", defaults.print_limit)?,
            cleanup_delay: env.millis_or("CLEANUP_DELAY_MS", defaults.cleanup_delay)?,
            cgroup: CgroupConfig {
                limit_file: env
                    .string("CGROUP_MEMORY_LIMIT_FILE")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.cgroup.limit_file),
                usage_file: env
                    .string("CGROUP_MEMORY_USAGE_FILE")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.cgroup.usage_file),
            },
            spark_host_port: env.string("DPE_SPARK_HOST_PORT"),
            callback_host_port: env.string("NORTHSTARAPI_HOST_PORT"),
            modules,
            logging: LoggingConfig {
                level: env.string_or("LOG_LEVEL", &defaults.logging.level),
                format,
            },
        })
    }
}

fn positive(value: usize, key: &str) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: "0".to_string(),
        });
    }
    Ok(value)
}

/// The task id looks like `<framework>.<uuid>`; the runtime id is the tail
fn rte_id_from_task(task: &str) -> String {
    match task.split_once('.') {
        Some((_, tail)) if !tail.is_empty() => tail.to_string(),
        _ => task.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = RteConfig::from_source(&env(&[])).unwrap();
        assert_eq!(config.workers, 1);
        assert_eq!(config.worker_queue_capacity, 10);
        assert_eq!(config.thread_count, 1);
        assert!(config.enable_rlimit);
        assert_eq!(config.print_limit, 10000);
        assert_eq!(config.cleanup_delay, Duration::from_secs(5));
        assert!(config.modules.ns_output);
        assert!(config.modules.ns_util);
        assert!(!config.modules.nsql);
        assert!(config.spark_host_port.is_none());
        assert!(!config.rte_id.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = RteConfig::from_source(&env(&[
            ("WORKERS", "3"),
            ("THREAD_COUNT", "4"),
            ("ENABLE_RLIMIT", "false"),
            ("ENABLE_NSQL", "true"),
            ("CLEANUP_DELAY_MS", "10"),
            ("DPE_SPARK_HOST_PORT", "spark:8080"),
            ("MESOS_TASK_ID", "rte-lua.1f2e3d"),
            ("LOG_FORMAT", "json"),
        ]))
        .unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.thread_count, 4);
        assert!(!config.enable_rlimit);
        assert!(config.modules.nsql);
        assert_eq!(config.cleanup_delay, Duration::from_millis(10));
        assert_eq!(config.spark_host_port.as_deref(), Some("spark:8080"));
        assert_eq!(config.rte_id, "1f2e3d");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values() {
        let cases = vec![
            ("WORKERS", "0", "Invalid value for 'WORKERS': 0"),
            ("THREAD_COUNT", "0", "Invalid value for 'THREAD_COUNT': 0"),
            ("THREAD_COUNT", "many", "Invalid value for 'THREAD_COUNT': many"),
            ("ENABLE_NSQL", "perhaps", "Invalid value for 'ENABLE_NSQL': perhaps"),
            ("LOG_FORMAT", "xml", "Invalid value for 'LOG_FORMAT': xml"),
        ];
        for (key, value, expected) in cases {
            let err = RteConfig::from_source(&env(&[(key, value)])).unwrap_err();
            assert_eq!(err.to_string(), expected, "{}={}", key, value);
        }
    }
}
