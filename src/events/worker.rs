//! One in-flight invocation

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, error, info};

use super::manager::{OffsetAcker, SnippetManager};
use super::source::fetch_code;
use super::{SnippetStartEvent, SNIPPET_RUNNING};
use crate::error::Result;
use crate::interpreter::{Input, Interpreter, Output, Status};

/// Running workers keyed by invocation id
pub type WorkerRegistry = DashMap<String, Arc<SnippetRunWorker>>;

/// What happens after a worker reported its output
#[derive(Clone)]
pub struct CleanupPolicy {
    /// Lets the queue commit the acknowledged offset
    pub delay: Duration,

    /// Invoked after an `OUT_OF_MEMORY` invocation was reported
    pub on_out_of_memory: Arc<dyn Fn() + Send + Sync>,
}

impl CleanupPolicy {
    /// Exits the process after an out-of-memory invocation
    pub fn new(delay: Duration) -> Self {
        CleanupPolicy {
            delay,
            on_out_of_memory: Arc::new(|| std::process::exit(1)),
        }
    }

    pub fn with_exit_hook(mut self, hook: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.on_out_of_memory = hook;
        self
    }
}

/// Collaborators shared by every worker of a handler
#[derive(Clone)]
pub struct WorkerContext {
    pub manager: Arc<SnippetManager>,
    pub acker: Arc<dyn OffsetAcker>,
    pub registry: Arc<WorkerRegistry>,
    pub cleanup: CleanupPolicy,

    /// Where downloaded sources are staged
    pub tmp_dir: PathBuf,
}

pub struct SnippetRunWorker {
    account_id: String,
    start: SnippetStartEvent,
    offset: i64,
    partition: i32,
    interpreter: Arc<dyn Interpreter>,
    context: WorkerContext,
}

impl SnippetRunWorker {
    pub fn new(
        account_id: &str,
        start: SnippetStartEvent,
        offset: i64,
        partition: i32,
        interpreter: Arc<dyn Interpreter>,
        context: WorkerContext,
    ) -> Self {
        SnippetRunWorker {
            account_id: account_id.to_string(),
            start,
            offset,
            partition,
            interpreter,
            context,
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.start.invocation_id
    }

    /// Execute the invocation, report it and acknowledge its offset
    ///
    /// The offset is acknowledged even when reporting failed so the queue
    /// never redelivers a start that already ran. Cleanup sees the status
    /// of the interpreter run whether or not it could be reported.
    pub fn run(&self) -> Result<Output> {
        let (status, outcome) = self.execute();
        if let Err(e) = &outcome {
            error!(invocation_id = %self.invocation_id(), error = %e, "snippet run failed");
        }

        debug!(offset = self.offset, "acknowledging start offset");
        let acked = self.context.acker.ack(self.offset);
        if let Err(e) = &acked {
            error!(offset = self.offset, error = %e, "failed to ack start offset");
        }

        self.cleanup(status);
        let output = outcome?;
        acked?;
        Ok(output)
    }

    /// Interrupt the running snippet
    pub fn stop(&self) {
        debug!(invocation_id = %self.invocation_id(), "stop signal received");
        self.interpreter.terminate();
    }

    /// Run and report; the status is `None` when the snippet never ran
    fn execute(&self) -> (Option<Status>, Result<Output>) {
        if let Err(e) = self.context.manager.update_invocation(
            &self.account_id,
            &self.start.invocation_id,
            self.partition,
            SNIPPET_RUNNING,
        ) {
            return (None, Err(e));
        }

        let output = match fetch_code(&self.start.url, &self.start.code, &self.context.tmp_dir) {
            Ok(code) => self.interpreter.do_repl(&self.input(code)),
            Err(e) => {
                error!(error = %e, "failed to get snippet");
                Output::failed(Utc::now(), Status::CodeGetFailed, e.to_string())
            }
        };

        let status = Some(output.status);
        if let Err(e) = self
            .context
            .manager
            .snippet_output(&self.account_id, &self.start, &output)
        {
            return (status, Err(e));
        }
        info!(
            invocation_id = %self.start.invocation_id,
            status = %output.status,
            "snippet execution finished"
        );
        (status, Ok(output))
    }

    fn input(&self, code: String) -> Input {
        Input {
            account_id: self.account_id.clone(),
            id: self.start.snippet_id.clone(),
            invocation_id: self.start.invocation_id.clone(),
            runtime: self.start.runtime.clone(),
            main_fn: self.start.main_fn.clone(),
            code,
            timeout: self.start.timeout,
            callback: self.start.callback.clone(),
            memory: self.start.memory,
            args: self.start.args.clone(),
        }
    }

    fn cleanup(&self, status: Option<Status>) {
        debug!(invocation_id = %self.invocation_id(), ?status, "cleaning up worker");
        if !self.context.cleanup.delay.is_zero() {
            thread::sleep(self.context.cleanup.delay);
        }
        self.context
            .registry
            .remove_if(self.invocation_id(), |_, worker| std::ptr::eq(worker.as_ref(), self));

        if status == Some(Status::OutOfMemory) {
            info!("terminating process after out of memory invocation");
            (self.context.cleanup.on_out_of_memory)();
        }
    }
}
