//! Snippet runtime library
//!
//! Executes untrusted Lua snippets in pooled, sandboxed interpreter states
//! with deadline, memory and stdout limits, and ships the nsQL query
//! transcompiler (Cassandra and Spark backends) as a capability module.

pub mod config;
pub mod error;
pub mod events;
pub mod interpreter;
pub mod logging;
pub mod modules;
pub mod nsql;
pub mod rlimit;
pub mod stats;
pub mod value;

// Re-export commonly used types
pub use config::RteConfig;
pub use error::{NsqlError, Result, RteError};
pub use events::EventHandler;
pub use interpreter::{Input, Interpreter, Output, Repl, StatePool, Status};
pub use value::Value;
