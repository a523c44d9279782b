//! Free list of interpreter states
//!
//! Growth is bounded only by the number of concurrent invocations; a state
//! is handed to one caller at a time and only returns after `clean`.

use parking_lot::Mutex;
use tracing::debug;

use super::state::{InterpreterState, StateEnv};
use super::Input;
use crate::error::Result;

pub struct StatePool {
    env: StateEnv,
    free: Mutex<Vec<InterpreterState>>,
}

impl StatePool {
    pub fn new(env: StateEnv, capacity: usize) -> Self {
        StatePool {
            env,
            free: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn env(&self) -> &StateEnv {
        &self.env
    }

    /// Reuse a free state for `input`, or build a new one
    pub fn get(&self, input: &Input) -> Result<InterpreterState> {
        let reused = self.free.lock().pop();
        if let Some(mut state) = reused {
            match state.prepare(input) {
                Ok(()) => return Ok(state),
                Err(e) => {
                    debug!(error = %e, "discarding pooled state");
                    state.close();
                }
            }
        }
        InterpreterState::create(input, &self.env)
    }

    /// Return a state after the invocation that held it finished
    pub fn put(&self, mut state: InterpreterState) {
        if state.is_closed() {
            return;
        }
        state.clean();
        self.free.lock().push(state);
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Close every pooled state
    pub fn shutdown(&self) {
        let states: Vec<InterpreterState> = self.free.lock().drain(..).collect();
        for mut state in states {
            state.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleFlags;
    use crate::nsql::Backends;
    use crate::stats::NoopMetrics;
    use std::sync::Arc;

    fn pool() -> StatePool {
        StatePool::new(
            StateEnv {
                modules: ModuleFlags::default(),
                print_limit: 100,
                backends: Backends::new(None),
                metrics: Arc::new(NoopMetrics),
            },
            2,
        )
    }

    #[test]
    fn test_get_put_reuses_states() {
        let pool = pool();
        let state = pool.get(&Input::default()).unwrap();
        state.exec("marker = 1").unwrap();
        pool.put(state);
        assert_eq!(pool.idle(), 1);

        let state = pool.get(&Input::default()).unwrap();
        assert_eq!(pool.idle(), 0);
        let marker: mlua::Value = state.sandbox().get("marker").unwrap();
        assert!(marker.is_nil());

        let second = pool.get(&Input::default()).unwrap();
        pool.put(state);
        pool.put(second);
        assert_eq!(pool.idle(), 2);

        pool.shutdown();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_closed_states_are_not_pooled() {
        let pool = pool();
        let mut state = pool.get(&Input::default()).unwrap();
        state.close();
        pool.put(state);
        assert_eq!(pool.idle(), 0);
    }
}
