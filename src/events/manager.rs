//! Reporting invocation progress to the outside world
//!
//! The queue, the invocation data service and the callback API are external
//! collaborators reached through the traits below. The `Memory*` types keep
//! everything in process for the stdin front end and for tests.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use super::{
    ExecutionResponse, InvocationRecord, RteEvent, SnippetOutputEvent, SnippetStartEvent,
    SNIPPET_OUTPUT,
};
use crate::error::{Result, RteError};
use crate::interpreter::Output;
use crate::stats::MetricsSink;

/// Invocation data service
pub trait InvocationStore: Send + Sync {
    fn update_status(
        &self,
        account_id: &str,
        invocation_id: &str,
        partition: i32,
        status: &str,
    ) -> Result<()>;

    fn store_invocation(&self, account_id: &str, record: &InvocationRecord) -> Result<()>;
}

/// Output topic producer
pub trait EventProducer: Send + Sync {
    fn send_output(&self, event: &RteEvent) -> Result<()>;
}

/// Commits consumed control-topic offsets
pub trait OffsetAcker: Send + Sync {
    fn ack(&self, offset: i64) -> Result<()>;
}

/// Delivers execution callbacks
pub trait CallbackClient: Send + Sync {
    fn post_execution(&self, response: &ExecutionResponse) -> Result<()>;
}

/// Persists output, emits the output event and fires the callback
pub struct SnippetManager {
    rte_id: String,
    store: Arc<dyn InvocationStore>,
    producer: Arc<dyn EventProducer>,
    callbacks: Option<Arc<dyn CallbackClient>>,
    metrics: Arc<dyn MetricsSink>,
}

impl SnippetManager {
    pub fn new(
        rte_id: impl Into<String>,
        store: Arc<dyn InvocationStore>,
        producer: Arc<dyn EventProducer>,
        callbacks: Option<Arc<dyn CallbackClient>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        SnippetManager {
            rte_id: rte_id.into(),
            store,
            producer,
            callbacks,
            metrics,
        }
    }

    pub fn rte_id(&self) -> &str {
        &self.rte_id
    }

    pub fn update_invocation(
        &self,
        account_id: &str,
        invocation_id: &str,
        partition: i32,
        status: &str,
    ) -> Result<()> {
        debug!(invocation_id, partition, status, "updating invocation");
        self.counted(
            "manager.update_invocation",
            self.store
                .update_status(account_id, invocation_id, partition, status),
        )
    }

    /// Report a finished invocation
    pub fn snippet_output(
        &self,
        account_id: &str,
        start: &SnippetStartEvent,
        output: &Output,
    ) -> Result<()> {
        self.counted("manager.snippet_output", self.report(account_id, start, output))
    }

    fn report(&self, account_id: &str, start: &SnippetStartEvent, output: &Output) -> Result<()> {
        let record = InvocationRecord {
            invocation_id: start.invocation_id.clone(),
            snippet_id: start.snippet_id.clone(),
            rte_id: self.rte_id.clone(),
            started_on: output.started_on,
            finished_on: output.finished_on,
            elapsed_time: output.elapsed_time.as_secs_f64(),
            stdout: output.stdout.clone(),
            result: output.result.clone(),
            status: output.status.to_string(),
            error_descr: output.error_descr.clone(),
        };
        self.store.store_invocation(account_id, &record).map_err(|e| {
            error!(error = %e, "failed to store invocation output");
            e
        })?;

        let event = SnippetOutputEvent {
            invocation_id: start.invocation_id.clone(),
            snippet_id: start.snippet_id.clone(),
            rte_id: self.rte_id.clone(),
            status: output.status.to_string(),
            error_description: output.error_descr.clone(),
            started_on: output.started_on,
            finished_on: output.finished_on,
            elapsed_time: output.elapsed_time,
            callback: start.callback.clone(),
        };
        self.producer
            .send_output(&RteEvent::new(SNIPPET_OUTPUT, account_id, &event)?)?;

        if !start.callback.is_empty() {
            debug!(callback = %start.callback, "detected callback");
            let client = self.callbacks.as_ref().ok_or_else(|| {
                RteError::Config("callback API host is not configured".to_string())
            })?;
            let response = ExecutionResponse::from_output_event(account_id, &event);
            client.post_execution(&response).map_err(|e| {
                error!(error = %e, "failed to trigger callback");
                e
            })?;
        }
        Ok(())
    }

    fn counted(&self, name: &str, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => self.metrics.incr(name),
            Err(_) => self.metrics.incr(&format!("{}.error", name)),
        }
        result
    }
}

/// Invocation store kept in memory
#[derive(Debug, Default)]
pub struct MemoryInvocationStore {
    statuses: Mutex<Vec<(String, String)>>,
    records: DashMap<String, InvocationRecord>,
}

impl MemoryInvocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(invocation_id, status)` pairs in update order
    pub fn statuses(&self) -> Vec<(String, String)> {
        self.statuses.lock().clone()
    }

    pub fn record(&self, invocation_id: &str) -> Option<InvocationRecord> {
        self.records.get(invocation_id).map(|r| r.clone())
    }
}

impl InvocationStore for MemoryInvocationStore {
    fn update_status(
        &self,
        _account_id: &str,
        invocation_id: &str,
        _partition: i32,
        status: &str,
    ) -> Result<()> {
        self.statuses
            .lock()
            .push((invocation_id.to_string(), status.to_string()));
        Ok(())
    }

    fn store_invocation(&self, _account_id: &str, record: &InvocationRecord) -> Result<()> {
        self.records
            .insert(record.invocation_id.clone(), record.clone());
        Ok(())
    }
}

/// Collects output events; optionally echoes them as JSON lines
#[derive(Debug, Default)]
pub struct MemoryProducer {
    events: Mutex<Vec<RteEvent>>,
    echo: bool,
}

impl MemoryProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also print every event to stdout
    pub fn echoing() -> Self {
        MemoryProducer {
            events: Mutex::new(Vec::new()),
            echo: true,
        }
    }

    pub fn events(&self) -> Vec<RteEvent> {
        self.events.lock().clone()
    }
}

impl EventProducer for MemoryProducer {
    fn send_output(&self, event: &RteEvent) -> Result<()> {
        if self.echo {
            println!("{}", serde_json::to_string(event)?);
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAcker {
    offsets: Mutex<Vec<i64>>,
}

impl MemoryAcker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.offsets.lock().clone()
    }
}

impl OffsetAcker for MemoryAcker {
    fn ack(&self, offset: i64) -> Result<()> {
        self.offsets.lock().push(offset);
        Ok(())
    }
}

/// Records callbacks instead of delivering them
#[derive(Debug, Default)]
pub struct MemoryCallbacks {
    responses: Mutex<Vec<ExecutionResponse>>,
}

impl MemoryCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn responses(&self) -> Vec<ExecutionResponse> {
        self.responses.lock().clone()
    }
}

impl CallbackClient for MemoryCallbacks {
    fn post_execution(&self, response: &ExecutionResponse) -> Result<()> {
        self.responses.lock().push(response.clone());
        Ok(())
    }
}
