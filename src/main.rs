//! Snippet runtime entry point
//!
//! Reads newline-delimited control envelopes from stdin, runs them through
//! the event handler and prints output events to stdout. The optional first
//! argument names the default runtime.

use std::io::{self, BufRead};
use std::process;
use std::sync::Arc;

use tracing::{info, warn};

use snippet_rte::config::RteConfig;
use snippet_rte::error::Result;
use snippet_rte::events::{
    lua_factory, CallbackClient, CleanupPolicy, ControlMessage, EventHandler, HttpCallbackClient,
    MemoryAcker, MemoryInvocationStore, MemoryProducer, SnippetManager, WorkerContext, WorkerPool,
    WorkerRegistry,
};
use snippet_rte::interpreter::{StateEnv, StatePool, LUA};
use snippet_rte::logging;
use snippet_rte::rlimit::{CgroupLimit, ResourceLimit};
use snippet_rte::stats::{AtomicMetrics, MetricsSink};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = RteConfig::from_env()?;
    logging::init(&config.logging);
    info!(
        rte_id = %config.rte_id,
        version = env!("CARGO_PKG_VERSION"),
        workers = config.workers,
        rlimit = config.enable_rlimit,
        "starting snippet runtime"
    );

    let metrics: Arc<dyn MetricsSink> = Arc::new(AtomicMetrics::new());
    let states = Arc::new(StatePool::new(
        StateEnv::from_config(&config, Arc::clone(&metrics)),
        config.workers,
    ));
    let limiter: Option<Arc<dyn ResourceLimit>> = if config.enable_rlimit {
        Some(Arc::new(CgroupLimit::new(config.cgroup.clone(), Arc::clone(&metrics))))
    } else {
        None
    };

    let callbacks: Option<Arc<dyn CallbackClient>> = match &config.callback_host_port {
        Some(host_port) => Some(Arc::new(HttpCallbackClient::new(host_port)?)),
        None => None,
    };
    let manager = SnippetManager::new(
        config.rte_id.clone(),
        Arc::new(MemoryInvocationStore::new()),
        Arc::new(MemoryProducer::echoing()),
        callbacks,
        Arc::clone(&metrics),
    );
    let context = WorkerContext {
        manager: Arc::new(manager),
        acker: Arc::new(MemoryAcker::new()),
        registry: Arc::new(WorkerRegistry::new()),
        cleanup: CleanupPolicy::new(config.cleanup_delay),
        tmp_dir: std::env::temp_dir(),
    };

    let runtime = std::env::args().nth(1).unwrap_or_else(|| LUA.to_string());
    let mut handler = EventHandler::new(
        &runtime,
        lua_factory(Arc::clone(&states), limiter, Arc::clone(&metrics)),
        WorkerPool::new(config.workers, config.worker_queue_capacity)?,
        context,
        Arc::clone(&metrics),
    )?;

    let stdin = io::stdin();
    for (offset, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message = ControlMessage {
            offset: offset as i64,
            partition: 0,
            payload: line.into_bytes(),
        };
        if let Err(e) = handler.on_receive(&message) {
            warn!(offset, error = %e, "control message rejected");
        }
    }

    handler.shutdown();
    states.shutdown();
    info!("snippet runtime stopped");
    Ok(())
}
