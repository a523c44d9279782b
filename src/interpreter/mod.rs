//! Sandboxed snippet execution
//!
//! `Repl` turns one `Input` into one `Output`: it takes an interpreter state
//! from the pool, optionally starts memory monitoring, runs the snippet's
//! top-level code, calls its entry function and classifies the outcome.
//!
//! Two out-of-band sources stop a running script: an external `terminate`
//! and the monitor's out-of-memory signal. Both trip the state's
//! `CancelToken`, which the VM polls from an instruction hook.

pub mod cancel;
pub mod pool;
pub mod repl;
pub mod state;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rlimit;
use crate::value::Value;

pub use cancel::CancelToken;
pub use pool::StatePool;
pub use repl::Repl;
pub use state::{InterpreterState, StateEnv};

/// Runtime name served by this crate
pub const LUA: &str = "lua";

/// Text raised when a deadline passes
pub const CONTEXT_DEADLINE_EXCEEDED: &str = "context deadline exceeded";

/// Text raised when the token is cancelled
pub const CONTEXT_CANCELED: &str = "context canceled";

pub const TIMED_OUT_DESCR: &str = "snippet execution deadline exceeded";
pub const OUT_OF_MEMORY_DESCR: &str = "snippet has run out of memory";

/// One snippet invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Input {
    pub account_id: String,

    /// Snippet id
    pub id: String,

    pub invocation_id: String,
    pub runtime: String,

    /// Global function called after the top-level code ran
    #[serde(rename = "mainfn")]
    pub main_fn: String,

    /// Resolved Lua source
    pub code: String,

    /// Milliseconds; 0 or less means no deadline
    pub timeout: i64,

    pub callback: String,

    /// Memory budget in bytes, 0 for none
    pub memory: u64,

    pub args: BTreeMap<String, Value>,
}

impl Input {
    pub fn deadline(&self) -> Option<Duration> {
        if self.timeout > 0 {
            Some(Duration::from_millis(self.timeout as u64))
        } else {
            None
        }
    }
}

/// Terminal status of an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    StateCreateFailed,
    StartMonitoringFailed,
    OutOfMemory,
    CodeGetFailed,
    ReplFailed,
    TimedOut,
    Finished,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::StateCreateFailed => "STATE_CREATE_FAILED",
            Status::StartMonitoringFailed => "START_MONITORING_FAILED",
            Status::OutOfMemory => "OUT_OF_MEMORY",
            Status::CodeGetFailed => "CODE_GET_FAILED",
            Status::ReplFailed => "REPL_FAILED",
            Status::TimedOut => "TIMED_OUT",
            Status::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one invocation produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    pub started_on: DateTime<Utc>,
    pub finished_on: Option<DateTime<Utc>>,
    pub elapsed_time: Duration,
    pub stdout: String,
    pub result: String,
    pub status: Status,
    pub error_descr: String,
}

impl Output {
    /// An output that never got to run the snippet
    pub fn failed(started_on: DateTime<Utc>, status: Status, error_descr: impl Into<String>) -> Self {
        Output {
            started_on,
            finished_on: None,
            elapsed_time: Duration::ZERO,
            stdout: String::new(),
            result: String::new(),
            status,
            error_descr: error_descr.into(),
        }
    }
}

/// Runs snippets; `terminate` interrupts the one in flight
pub trait Interpreter: Send + Sync {
    fn do_repl(&self, input: &Input) -> Output;

    fn terminate(&self);
}

/// Map an execution error to a terminal status and description
///
/// A pending resource-limit signal wins over the error text itself.
pub fn classify(error: &str, resource_signal: Option<&str>) -> (Status, String) {
    if let Some(signal) = resource_signal {
        if signal.contains(rlimit::OUT_OF_MEMORY) {
            return (Status::OutOfMemory, OUT_OF_MEMORY_DESCR.to_string());
        }
    }
    if error.contains(CONTEXT_DEADLINE_EXCEEDED) {
        return (Status::TimedOut, TIMED_OUT_DESCR.to_string());
    }
    if error.contains("not enough memory") {
        return (Status::OutOfMemory, OUT_OF_MEMORY_DESCR.to_string());
    }
    (Status::ReplFailed, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let cases = vec![
            ("boom", None, Status::ReplFailed, "boom"),
            (
                "runtime error: context deadline exceeded",
                None,
                Status::TimedOut,
                TIMED_OUT_DESCR,
            ),
            (
                "context canceled",
                Some("out of memory"),
                Status::OutOfMemory,
                OUT_OF_MEMORY_DESCR,
            ),
            (
                "context deadline exceeded",
                Some("something else"),
                Status::TimedOut,
                TIMED_OUT_DESCR,
            ),
            ("not enough memory", None, Status::OutOfMemory, OUT_OF_MEMORY_DESCR),
            ("context canceled", None, Status::ReplFailed, "context canceled"),
        ];
        for (error, signal, status, descr) in cases {
            assert_eq!(classify(error, signal), (status, descr.to_string()), "{}", error);
        }
    }

    #[test]
    fn test_input_wire_names() {
        let input: Input = serde_json::from_str(
            r#"{"accountId": "a", "id": "s", "invocationId": "i", "mainfn": "main",
                "code": "x", "timeout": 1000, "memory": 64, "args": {"n": 1}}"#,
        )
        .unwrap();
        assert_eq!(input.main_fn, "main");
        assert_eq!(input.deadline(), Some(Duration::from_millis(1000)));
        assert_eq!(input.args.get("n"), Some(&Value::Int(1)));
        assert_eq!(Input::default().deadline(), None);

        assert_eq!(
            serde_json::to_string(&Status::StartMonitoringFailed).unwrap(),
            "\"START_MONITORING_FAILED\""
        );
        assert_eq!(Status::Finished.to_string(), "FINISHED");
    }
}
