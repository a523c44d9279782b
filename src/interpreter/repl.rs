//! The REPL engine: one invocation in, one `Output` out

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::Utc;
use crossbeam_channel::{bounded, select};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::cancel::CancelToken;
use super::pool::StatePool;
use super::state::InterpreterState;
use super::{classify, Input, Interpreter, Output, Status};
use crate::rlimit::{ResourceLimit, ResourceRequest};
use crate::stats::MetricsSink;

/// Executes snippets on pooled interpreter states
pub struct Repl {
    pool: Arc<StatePool>,
    limiter: Option<Arc<dyn ResourceLimit>>,
    metrics: Arc<dyn MetricsSink>,
    active: Mutex<Option<CancelToken>>,
}

impl Repl {
    /// `limiter` is `None` when resource limiting is disabled
    pub fn new(
        pool: Arc<StatePool>,
        limiter: Option<Arc<dyn ResourceLimit>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Repl {
            pool,
            limiter,
            metrics,
            active: Mutex::new(None),
        }
    }

    fn finish(&self, input: &Input, output: Output) -> Output {
        self.metrics.incr(&format!("repl.{}", output.status));
        info!(
            invocation_id = %input.invocation_id,
            snippet_id = %input.id,
            status = %output.status,
            elapsed_ms = output.elapsed_time.as_millis() as u64,
            "snippet finished"
        );
        output
    }

    /// Pool the state again unless it was interrupted
    fn release(&self, mut state: InterpreterState, interrupted: bool) {
        if interrupted {
            state.close();
        } else {
            self.pool.put(state);
        }
    }
}

impl Interpreter for Repl {
    fn do_repl(&self, input: &Input) -> Output {
        let started_on = Utc::now();
        let clock = Instant::now();
        debug!(
            invocation_id = %input.invocation_id,
            main = %input.main_fn,
            timeout = input.timeout,
            memory = input.memory,
            "running snippet"
        );

        let state = match self.pool.get(input) {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "failed to create state");
                let output = Output::failed(started_on, Status::StateCreateFailed, e.to_string());
                return self.finish(input, output);
            }
        };
        let token = state.token();
        *self.active.lock() = Some(token.clone());

        let session = match &self.limiter {
            Some(limiter) => match limiter.start_monitoring(ResourceRequest {
                memory: input.memory,
            }) {
                Ok(session) => Some(session),
                Err(e) => {
                    error!(error = %e, "failed to start resource monitoring");
                    *self.active.lock() = None;
                    self.pool.put(state);
                    let output =
                        Output::failed(started_on, Status::StartMonitoringFailed, e.to_string());
                    return self.finish(input, output);
                }
            },
            None => None,
        };

        // Forward a resource signal into the token while the script runs
        let signal: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = bounded::<()>(1);
        let watcher = session.as_ref().map(|session| {
            let limit = session.signal().clone();
            let token = token.clone();
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                select! {
                    recv(limit) -> msg => {
                        if let Ok(msg) = msg {
                            debug!(signal = %msg, "resource limit reached");
                            *signal.lock() = Some(msg);
                            token.cancel();
                        }
                    }
                    recv(done_rx) -> _ => {}
                }
            })
        });

        let outcome = state
            .exec(&input.code)
            .and_then(|()| state.call_entry(&input.main_fn));
        let finished_on = Utc::now();

        drop(done_tx);
        if let Some(watcher) = watcher {
            let _ = watcher.join();
        }
        if let Some(session) = session {
            session.stop();
        }
        *self.active.lock() = None;

        let stdout = state.stdout();
        let output = match outcome {
            Ok(result) => Output {
                started_on,
                finished_on: Some(finished_on),
                elapsed_time: clock.elapsed(),
                stdout,
                result: state.direct_result().unwrap_or(result),
                status: Status::Finished,
                error_descr: String::new(),
            },
            Err(e) => {
                let described = describe(&e);
                debug!(error = %described, "snippet execution failed");
                let (status, error_descr) = classify(&described, signal.lock().as_deref());
                Output {
                    started_on,
                    finished_on: Some(finished_on),
                    elapsed_time: clock.elapsed(),
                    stdout,
                    result: String::new(),
                    status,
                    error_descr,
                }
            }
        };

        let interrupted = token.is_canceled() || output.status == Status::OutOfMemory;
        self.release(state, interrupted);
        self.finish(input, output)
    }

    fn terminate(&self) {
        debug!("terminating active snippet");
        if let Some(token) = self.active.lock().as_ref() {
            token.cancel();
        }
    }
}

/// The innermost message of a Lua error, without its traceback
pub fn describe(err: &mlua::Error) -> String {
    let text = match err {
        mlua::Error::CallbackError { cause, .. } => return describe(cause),
        mlua::Error::RuntimeError(msg) | mlua::Error::MemoryError(msg) => msg.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        other => other.to_string(),
    };
    match text.find("\nstack traceback:") {
        Some(end) => text[..end].to_string(),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleFlags;
    use crate::error::{Result, RteError};
    use crate::interpreter::state::StateEnv;
    use crate::nsql::Backends;
    use crate::rlimit::MonitorSession;
    use crate::stats::AtomicMetrics;
    use std::time::Duration;

    /// Signals out of memory a fixed time after monitoring starts
    struct SignalAfter(Duration);

    impl ResourceLimit for SignalAfter {
        fn start_monitoring(&self, _request: ResourceRequest) -> Result<MonitorSession> {
            let (tx, rx) = bounded(1);
            let delay = self.0;
            thread::spawn(move || {
                thread::sleep(delay);
                let _ = tx.send(crate::rlimit::OUT_OF_MEMORY.to_string());
            });
            Ok(MonitorSession::from_channel(rx))
        }
    }

    struct Refuse;

    impl ResourceLimit for Refuse {
        fn start_monitoring(&self, _request: ResourceRequest) -> Result<MonitorSession> {
            Err(RteError::Resource("requested memory exceeds available".to_string()))
        }
    }

    fn repl(limiter: Option<Arc<dyn ResourceLimit>>) -> (Repl, Arc<StatePool>, Arc<AtomicMetrics>) {
        let metrics = Arc::new(AtomicMetrics::new());
        let pool = Arc::new(StatePool::new(
            StateEnv {
                modules: ModuleFlags::default(),
                print_limit: 100,
                backends: Backends::new(None),
                metrics: metrics.clone(),
            },
            1,
        ));
        (Repl::new(Arc::clone(&pool), limiter, metrics.clone()), pool, metrics)
    }

    fn input(code: &str, timeout: i64) -> Input {
        Input {
            invocation_id: "inv-1".to_string(),
            main_fn: "main".to_string(),
            code: code.to_string(),
            timeout,
            ..Input::default()
        }
    }

    #[test]
    fn test_outcomes() {
        let (repl, pool, metrics) = repl(None);
        let cases = vec![
            ("function main() return '10' end", Status::Finished, "10", ""),
            ("function main() return 4 * 5 end", Status::Finished, "20", ""),
            ("x = = 1", Status::ReplFailed, "", "unexpected symbol"),
            ("function main() error('bad') end", Status::ReplFailed, "", "bad"),
            ("function other() end", Status::ReplFailed, "", "attempt to call a nil value"),
        ];
        for (code, status, result, descr) in cases {
            let output = repl.do_repl(&input(code, 1000));
            assert_eq!(output.status, status, "{}", code);
            assert_eq!(output.result, result, "{}", code);
            assert!(output.error_descr.contains(descr), "{} -> {}", code, output.error_descr);
        }
        assert_eq!(metrics.counter("repl.FINISHED"), 2);
        assert_eq!(metrics.counter("repl.REPL_FAILED"), 3);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_stdout_and_direct_result() {
        let (repl, _, _) = repl(None);
        let output = repl.do_repl(&input(
            "function main() nsOutput.print('a', 'b') nsOutput.htmlDirect('<i>x</i>') return 'ignored' end",
            0,
        ));
        assert_eq!(output.status, Status::Finished);
        assert_eq!(output.stdout, "ab");
        assert_eq!(output.result, "{\"type\":\"text/html\",\"content\":\"<i>x</i>\"}\n");

        let output = repl.do_repl(&input("function main() return 'clean' end", 0));
        assert_eq!(output.stdout, "");
        assert_eq!(output.result, "clean");
    }

    #[test]
    fn test_deadline() {
        let (repl, pool, _) = repl(None);
        let started = Instant::now();
        let output = repl.do_repl(&input("function main() while true do end end", 200));
        assert_eq!(output.status, Status::TimedOut);
        assert_eq!(output.error_descr, "snippet execution deadline exceeded");
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(pool.idle(), 1);
        let output = repl.do_repl(&input("function main() return 'again' end", 200));
        assert_eq!(output.status, Status::Finished);
        assert_eq!(output.result, "again");
    }

    #[test]
    fn test_out_of_memory_signal() {
        let limiter: Arc<dyn ResourceLimit> = Arc::new(SignalAfter(Duration::from_millis(50)));
        let (repl, _, _) = repl(Some(limiter));
        let output = repl.do_repl(&input("function main() while true do end end", 0));
        assert_eq!(output.status, Status::OutOfMemory);
        assert_eq!(output.error_descr, "snippet has run out of memory");
    }

    #[test]
    fn test_monitoring_failure() {
        let (repl, pool, _) = repl(Some(Arc::new(Refuse)));
        let output = repl.do_repl(&input("function main() return 1 end", 0));
        assert_eq!(output.status, Status::StartMonitoringFailed);
        assert_eq!(output.error_descr, "requested memory exceeds available");
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_terminate_interrupts_running_script() {
        let (repl, _, _) = repl(None);
        let repl = Arc::new(repl);
        let runner = Arc::clone(&repl);
        let handle =
            thread::spawn(move || runner.do_repl(&input("function main() while true do end end", 0)));
        thread::sleep(Duration::from_millis(100));
        repl.terminate();
        let output = handle.join().unwrap();
        assert_eq!(output.status, Status::ReplFailed);
        assert!(output.error_descr.contains("context canceled"));
    }
}
