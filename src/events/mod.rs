//! Control-channel plumbing between the message queue and the REPL engine
//!
//! `EventHandler` consumes `ControlMessage`s carrying an `RteEvent` envelope.
//! A `SNIPPET_START` becomes a `SnippetRunWorker` queued on the `WorkerPool`;
//! a `SNIPPET_STOP` terminates the registered worker for that invocation.
//! Results flow back through the `SnippetManager` collaborators.

pub mod callback;
pub mod handler;
pub mod manager;
pub mod pool;
pub mod source;
pub mod worker;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::value::Value;

pub use callback::HttpCallbackClient;
pub use handler::{lua_factory, EventHandler, InterpreterFactory};
pub use manager::{
    CallbackClient, EventProducer, InvocationStore, MemoryAcker, MemoryCallbacks,
    MemoryInvocationStore, MemoryProducer, OffsetAcker, SnippetManager,
};
pub use pool::WorkerPool;
pub use worker::{CleanupPolicy, SnippetRunWorker, WorkerContext, WorkerRegistry};

pub const SNIPPET_START: &str = "SNIPPET_START";
pub const SNIPPET_STOP: &str = "SNIPPET_STOP";
pub const SNIPPET_OUTPUT: &str = "SNIPPET_OUTPUT";

/// Invocation status written before the snippet runs
pub const SNIPPET_RUNNING: &str = "SNIPPET_RUNNING";

/// Envelope for every event on the control and output topics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RteEvent {
    pub event: String,
    #[serde(default)]
    pub account_id: String,
    pub timestamp: DateTime<Utc>,

    /// JSON of the specific event, base64 on the wire
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl RteEvent {
    /// Wrap `payload` in a fresh envelope
    pub fn new<T: Serialize>(event: &str, account_id: &str, payload: &T) -> Result<Self> {
        Ok(RteEvent {
            event: event.to_string(),
            account_id: account_id.to_string(),
            timestamp: Utc::now(),
            data: serde_json::to_vec(payload)?,
        })
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnippetStartEvent {
    pub invocation_id: String,
    pub snippet_id: String,
    pub runtime: String,
    #[serde(rename = "mainfn")]
    pub main_fn: String,

    /// Where the source lives: `base64://`, `http://` or empty
    pub url: String,
    pub code: String,

    /// Milliseconds
    pub timeout: i64,
    pub callback: String,
    pub memory: u64,
    pub args: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnippetStopEvent {
    pub invocation_id: String,
}

/// Emitted once per finished invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetOutputEvent {
    pub invocation_id: String,
    pub snippet_id: String,
    pub rte_id: String,
    pub status: String,
    pub error_description: String,
    pub started_on: DateTime<Utc>,
    pub finished_on: Option<DateTime<Utc>>,
    #[serde(with = "duration_nanos")]
    pub elapsed_time: Duration,
    pub callback: String,
}

/// Body of the execution callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub account_id: String,
    pub status: String,
    pub error_description: String,
    pub invocation_id: String,
    pub callback: String,
    #[serde(rename = "snippetID")]
    pub snippet_id: String,
    pub rte_id: String,
    pub started_on: DateTime<Utc>,
    pub finished_on: Option<DateTime<Utc>>,
    #[serde(with = "duration_nanos")]
    pub elapsed_time: Duration,
}

impl ExecutionResponse {
    pub fn from_output_event(account_id: &str, event: &SnippetOutputEvent) -> Self {
        ExecutionResponse {
            account_id: account_id.to_string(),
            status: event.status.clone(),
            error_description: event.error_description.clone(),
            invocation_id: event.invocation_id.clone(),
            callback: event.callback.clone(),
            snippet_id: event.snippet_id.clone(),
            rte_id: event.rte_id.clone(),
            started_on: event.started_on,
            finished_on: event.finished_on,
            elapsed_time: event.elapsed_time,
        }
    }
}

/// Persisted state of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRecord {
    pub invocation_id: String,
    pub snippet_id: String,
    pub rte_id: String,
    pub started_on: DateTime<Utc>,
    pub finished_on: Option<DateTime<Utc>>,

    /// Seconds
    pub elapsed_time: f64,
    pub stdout: String,
    pub result: String,
    pub status: String,
    pub error_descr: String,
}

/// One message read from the control topic
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub offset: i64,
    pub partition: i32,
    pub payload: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Durations as integer nanoseconds
mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_format() {
        let raw = r#"{"event":"SNIPPET_STOP","accountId":"acc","timestamp":"2017-05-01T10:00:00Z","data":"eyJpbnZvY2F0aW9uSWQiOiJpbnYtMSJ9"}"#;
        let envelope: RteEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.event, SNIPPET_STOP);
        assert_eq!(envelope.data, br#"{"invocationId":"inv-1"}"#.to_vec());

        let stop: SnippetStopEvent = envelope.payload().unwrap();
        assert_eq!(stop.invocation_id, "inv-1");

        let encoded = serde_json::to_string(&envelope).unwrap();
        assert_eq!(encoded, raw);
    }

    #[test]
    fn test_start_event_fields() {
        let start: SnippetStartEvent = serde_json::from_str(
            r#"{"invocationId":"i","snippetId":"s","runtime":"lua","mainfn":"main",
                "url":"base64://","code":"cmV0dXJu","timeout":500,"memory":1024,
                "args":{"limit":10}}"#,
        )
        .unwrap();
        assert_eq!(start.main_fn, "main");
        assert_eq!(start.timeout, 500);
        assert_eq!(start.args.get("limit"), Some(&Value::Int(10)));
        assert_eq!(start.callback, "");
    }

    #[test]
    fn test_output_event_elapsed_nanos() {
        let event = SnippetOutputEvent {
            invocation_id: "i".to_string(),
            snippet_id: "s".to_string(),
            rte_id: "r".to_string(),
            status: "FINISHED".to_string(),
            error_description: String::new(),
            started_on: Utc::now(),
            finished_on: None,
            elapsed_time: Duration::from_millis(3),
            callback: String::new(),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["elapsedTime"], 3_000_000);

        let response = ExecutionResponse::from_output_event("acc", &event);
        let json: serde_json::Value = serde_json::to_value(&response).unwrap();
        assert_eq!(json["snippetID"], "s");
        assert_eq!(json["accountId"], "acc");
    }
}
