//! Control-message dispatch

use std::sync::Arc;

use tracing::{debug, error};

use super::pool::WorkerPool;
use super::worker::{SnippetRunWorker, WorkerContext, WorkerRegistry};
use super::{ControlMessage, RteEvent, SnippetStartEvent, SnippetStopEvent, SNIPPET_START, SNIPPET_STOP};
use crate::error::{Result, RteError};
use crate::interpreter::{Interpreter, Repl, StatePool, LUA};
use crate::rlimit::ResourceLimit;
use crate::stats::MetricsSink;

/// Builds the interpreter for a runtime name
pub type InterpreterFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Interpreter>> + Send + Sync>;

/// Factory serving the `lua` runtime from a shared state pool
///
/// Each call yields its own `Repl`, so stopping one invocation never
/// touches another.
pub fn lua_factory(
    pool: Arc<StatePool>,
    limiter: Option<Arc<dyn ResourceLimit>>,
    metrics: Arc<dyn MetricsSink>,
) -> InterpreterFactory {
    Arc::new(move |runtime: &str| match runtime {
        LUA => {
            let repl = Repl::new(Arc::clone(&pool), limiter.clone(), Arc::clone(&metrics));
            Ok(Arc::new(repl) as Arc<dyn Interpreter>)
        }
        other => Err(RteError::Event(format!("Unknown runtime received: {}", other))),
    })
}

pub struct EventHandler {
    runtime: String,
    factory: InterpreterFactory,
    pool: WorkerPool,
    context: WorkerContext,
    metrics: Arc<dyn MetricsSink>,
}

impl EventHandler {
    /// Fails when `factory` cannot serve the default `runtime`
    pub fn new(
        runtime: &str,
        factory: InterpreterFactory,
        pool: WorkerPool,
        context: WorkerContext,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        factory(runtime)?;
        Ok(EventHandler {
            runtime: runtime.to_string(),
            factory,
            pool,
            context,
            metrics,
        })
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.context.registry
    }

    /// Handle one control message
    ///
    /// A message that fails processing is still acknowledged; the error is
    /// returned after the ack.
    pub fn on_receive(&self, message: &ControlMessage) -> Result<()> {
        match self.process(message) {
            Ok(()) => {
                self.metrics.incr("handler.on_receive");
                debug!(offset = message.offset, "message processed");
                Ok(())
            }
            Err(e) => {
                self.metrics.incr("handler.on_receive.error");
                error!(offset = message.offset, error = %e, "processMessage failed");
                self.context.acker.ack(message.offset)?;
                Err(e)
            }
        }
    }

    fn process(&self, message: &ControlMessage) -> Result<()> {
        let envelope: RteEvent = serde_json::from_slice(&message.payload)?;
        debug!(event = %envelope.event, "received control event");

        match envelope.event.as_str() {
            SNIPPET_START => {
                let start: SnippetStartEvent = envelope.payload()?;
                self.start_worker(&envelope.account_id, start, message)
            }
            SNIPPET_STOP => {
                let stop: SnippetStopEvent = envelope.payload()?;
                self.stop_worker(&stop.invocation_id)?;
                debug!(offset = message.offset, "acknowledging stop offset");
                self.context.acker.ack(message.offset)
            }
            other => Err(RteError::Event(format!("Unknown event: {}", other))),
        }
    }

    fn start_worker(
        &self,
        account_id: &str,
        start: SnippetStartEvent,
        message: &ControlMessage,
    ) -> Result<()> {
        let runtime = if start.runtime.is_empty() {
            self.runtime.as_str()
        } else {
            start.runtime.as_str()
        };
        let interpreter = (self.factory)(runtime)?;

        let invocation_id = start.invocation_id.clone();
        let worker = Arc::new(SnippetRunWorker::new(
            account_id,
            start,
            message.offset,
            message.partition,
            interpreter,
            self.context.clone(),
        ));

        // Registered before dispatch so a stop can race the start
        self.context
            .registry
            .insert(invocation_id.clone(), Arc::clone(&worker));
        let job = Arc::clone(&worker);
        if let Err(e) = self.pool.submit(move || {
            // Failures are logged with context inside `run`
            if let Err(e) = job.run() {
                debug!(
                    invocation_id = %job.invocation_id(),
                    error = %e,
                    "worker ended with error"
                );
            }
        }) {
            self.context.registry.remove(&invocation_id);
            return Err(e);
        }
        Ok(())
    }

    /// Terminate the worker running `invocation_id`
    pub fn stop_worker(&self, invocation_id: &str) -> Result<()> {
        let worker = self
            .context
            .registry
            .get(invocation_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                RteError::Event(format!("Worker not found for invocation: {}", invocation_id))
            })?;
        worker.stop();
        Ok(())
    }

    /// Wait for queued invocations to finish
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::manager::{MemoryAcker, MemoryInvocationStore, MemoryProducer, SnippetManager};
    use crate::events::worker::CleanupPolicy;
    use crate::interpreter::{Input, Output, Status};
    use crate::stats::AtomicMetrics;
    use chrono::Utc;
    use std::time::Duration;

    struct Echo;

    impl Interpreter for Echo {
        fn do_repl(&self, input: &Input) -> Output {
            let mut output = Output::failed(Utc::now(), Status::Finished, "");
            output.result = input.code.clone();
            output
        }

        fn terminate(&self) {}
    }

    fn handler(acker: Arc<MemoryAcker>, metrics: Arc<AtomicMetrics>) -> EventHandler {
        let factory: InterpreterFactory = Arc::new(|runtime: &str| match runtime {
            "echo" => Ok(Arc::new(Echo) as Arc<dyn Interpreter>),
            other => Err(RteError::Event(format!("Unknown runtime received: {}", other))),
        });
        let context = WorkerContext {
            manager: Arc::new(SnippetManager::new(
                "rte",
                Arc::new(MemoryInvocationStore::new()),
                Arc::new(MemoryProducer::new()),
                None,
                metrics.clone(),
            )),
            acker,
            registry: Arc::new(WorkerRegistry::new()),
            cleanup: CleanupPolicy::new(Duration::ZERO),
            tmp_dir: std::env::temp_dir(),
        };
        EventHandler::new("echo", factory, WorkerPool::new(1, 4).unwrap(), context, metrics)
            .unwrap()
    }

    fn message<T: serde::Serialize>(offset: i64, event: &str, payload: &T) -> ControlMessage {
        let envelope = RteEvent::new(event, "acc", payload).unwrap();
        ControlMessage {
            offset,
            partition: 0,
            payload: serde_json::to_vec(&envelope).unwrap(),
        }
    }

    #[test]
    fn test_rejected_messages_are_acked() {
        let acker = Arc::new(MemoryAcker::new());
        let metrics = Arc::new(AtomicMetrics::new());
        let handler = handler(acker.clone(), metrics.clone());

        let stop = SnippetStopEvent {
            invocation_id: "missing".to_string(),
        };
        let start = SnippetStartEvent {
            invocation_id: "inv".to_string(),
            runtime: "python".to_string(),
            code: "x".to_string(),
            ..SnippetStartEvent::default()
        };
        let garbage = ControlMessage {
            offset: 4,
            partition: 0,
            payload: b"not json".to_vec(),
        };
        let cases = vec![
            (message(1, SNIPPET_STOP, &stop), "Worker not found for invocation: missing"),
            (message(2, "SNIPPET_PAUSE", &stop), "Unknown event: SNIPPET_PAUSE"),
            (message(3, SNIPPET_START, &start), "Unknown runtime received: python"),
            (garbage, "expected ident"),
        ];
        for (msg, expected) in cases {
            let err = handler.on_receive(&msg).unwrap_err();
            assert!(err.to_string().contains(expected), "{}", err);
        }
        assert_eq!(acker.offsets(), vec![1, 2, 3, 4]);
        assert_eq!(metrics.counter("handler.on_receive.error"), 4);
        assert!(handler.registry().is_empty());
    }

    #[test]
    fn test_start_runs_on_pool() {
        let acker = Arc::new(MemoryAcker::new());
        let metrics = Arc::new(AtomicMetrics::new());
        let mut handler = handler(acker.clone(), metrics.clone());

        let start = SnippetStartEvent {
            invocation_id: "inv-9".to_string(),
            code: "return 9".to_string(),
            ..SnippetStartEvent::default()
        };
        handler.on_receive(&message(10, SNIPPET_START, &start)).unwrap();
        handler.shutdown();

        assert_eq!(acker.offsets(), vec![10]);
        assert_eq!(metrics.counter("handler.on_receive"), 1);
        assert_eq!(metrics.counter("manager.snippet_output"), 1);
        assert!(handler.registry().is_empty());

        let err = EventHandler::new(
            "ruby",
            lua_factory(
                Arc::new(StatePool::new(
                    crate::interpreter::StateEnv {
                        modules: crate::config::ModuleFlags::default(),
                        print_limit: 10,
                        backends: crate::nsql::Backends::new(None),
                        metrics: metrics.clone(),
                    },
                    1,
                )),
                None,
                metrics.clone(),
            ),
            WorkerPool::new(1, 1).unwrap(),
            handler.context.clone(),
            metrics,
        )
        .err()
        .unwrap();
        assert_eq!(err.to_string(), "Unknown runtime received: ruby");
    }
}
