//! Control messages driving real Lua invocations

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use snippet_rte::config::ModuleFlags;
use snippet_rte::error::{Result, RteError};
use snippet_rte::events::{
    lua_factory, CleanupPolicy, ControlMessage, EventHandler, InvocationRecord, InvocationStore,
    MemoryAcker, MemoryInvocationStore, MemoryProducer, RteEvent, SnippetManager,
    SnippetOutputEvent, SnippetStartEvent, SnippetStopEvent, WorkerContext, WorkerPool,
    WorkerRegistry, SNIPPET_OUTPUT, SNIPPET_RUNNING, SNIPPET_START, SNIPPET_STOP,
};
use snippet_rte::interpreter::{StateEnv, StatePool, LUA};
use snippet_rte::nsql::Backends;
use snippet_rte::stats::{AtomicMetrics, MetricsSink};

struct Harness {
    handler: EventHandler,
    store: Arc<MemoryInvocationStore>,
    producer: Arc<MemoryProducer>,
    acker: Arc<MemoryAcker>,
    exited: Arc<AtomicBool>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryInvocationStore::new());
    let producer = Arc::new(MemoryProducer::new());
    let acker = Arc::new(MemoryAcker::new());
    let exited = Arc::new(AtomicBool::new(false));
    let handler = handler_with(
        store.clone(),
        producer.clone(),
        acker.clone(),
        Arc::clone(&exited),
    );
    Harness {
        handler,
        store,
        producer,
        acker,
        exited,
    }
}

fn handler_with(
    store: Arc<dyn InvocationStore>,
    producer: Arc<MemoryProducer>,
    acker: Arc<MemoryAcker>,
    exited: Arc<AtomicBool>,
) -> EventHandler {
    let metrics: Arc<dyn MetricsSink> = Arc::new(AtomicMetrics::new());
    let states = Arc::new(StatePool::new(
        StateEnv {
            modules: ModuleFlags::default(),
            print_limit: 10000,
            backends: Backends::new(None),
            metrics: Arc::clone(&metrics),
        },
        2,
    ));

    let flag = Arc::clone(&exited);
    let context = WorkerContext {
        manager: Arc::new(SnippetManager::new(
            "rte-test",
            store,
            producer,
            None,
            Arc::clone(&metrics),
        )),
        acker,
        registry: Arc::new(WorkerRegistry::new()),
        cleanup: CleanupPolicy::new(Duration::ZERO)
            .with_exit_hook(Arc::new(move || flag.store(true, Ordering::SeqCst))),
        tmp_dir: std::env::temp_dir(),
    };
    EventHandler::new(
        LUA,
        lua_factory(states, None, Arc::clone(&metrics)),
        WorkerPool::new(2, 4).unwrap(),
        context,
        metrics,
    )
    .unwrap()
}

/// Records status updates but cannot persist results
struct UnwritableStore;

impl InvocationStore for UnwritableStore {
    fn update_status(&self, _: &str, _: &str, _: i32, _: &str) -> Result<()> {
        Ok(())
    }

    fn store_invocation(&self, _: &str, _: &InvocationRecord) -> Result<()> {
        Err(RteError::Event("invocation store unavailable".to_string()))
    }
}

fn message<T: serde::Serialize>(offset: i64, event: &str, payload: &T) -> ControlMessage {
    let envelope = RteEvent::new(event, "acc-1", payload).unwrap();
    ControlMessage {
        offset,
        partition: 3,
        payload: serde_json::to_vec(&envelope).unwrap(),
    }
}

fn start(invocation_id: &str, code: &str, timeout: i64) -> SnippetStartEvent {
    SnippetStartEvent {
        invocation_id: invocation_id.to_string(),
        snippet_id: "snip-1".to_string(),
        main_fn: "main".to_string(),
        code: code.to_string(),
        timeout,
        ..SnippetStartEvent::default()
    }
}

#[test]
fn start_event_runs_and_reports() {
    let mut h = harness();
    let code = "function main() nsOutput.print('hi') return 6 * 7 end";
    h.handler
        .on_receive(&message(5, SNIPPET_START, &start("inv-1", code, 1000)))
        .unwrap();
    h.handler.shutdown();

    let record = h.store.record("inv-1").unwrap();
    assert_eq!(record.status, "FINISHED");
    assert_eq!(record.result, "42");
    assert_eq!(record.stdout, "hi");
    assert_eq!(record.rte_id, "rte-test");
    assert_eq!(
        h.store.statuses(),
        vec![("inv-1".to_string(), SNIPPET_RUNNING.to_string())]
    );

    let events = h.producer.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, SNIPPET_OUTPUT);
    assert_eq!(events[0].account_id, "acc-1");
    let output: SnippetOutputEvent = events[0].payload().unwrap();
    assert_eq!(output.invocation_id, "inv-1");
    assert_eq!(output.status, "FINISHED");

    assert_eq!(h.acker.offsets(), vec![5]);
    assert!(h.handler.registry().is_empty());
    assert!(!h.exited.load(Ordering::SeqCst));
}

#[test]
fn stop_event_interrupts_running_snippet() {
    let mut h = harness();
    let code = "function main() while true do end end";
    h.handler
        .on_receive(&message(1, SNIPPET_START, &start("inv-loop", code, 60000)))
        .unwrap();

    // The interpreter only honours a stop once the script is running
    let deadline = Instant::now() + Duration::from_secs(10);
    while h.store.record("inv-loop").is_none() {
        assert!(Instant::now() < deadline, "snippet was never stopped");
        let _ = h.handler.stop_worker("inv-loop");
        thread::sleep(Duration::from_millis(50));
    }
    h.handler.shutdown();

    let record = h.store.record("inv-loop").unwrap();
    assert_eq!(record.status, "REPL_FAILED");
    assert_eq!(record.error_descr, "context canceled");
    assert!(record.elapsed_time < 10.0);
    assert_eq!(h.acker.offsets(), vec![1]);
}

#[test]
fn stop_for_unknown_invocation_is_rejected() {
    let h = harness();
    let stop = SnippetStopEvent {
        invocation_id: "ghost".to_string(),
    };
    let err = h
        .handler
        .on_receive(&message(9, SNIPPET_STOP, &stop))
        .unwrap_err();
    assert_eq!(err.to_string(), "Worker not found for invocation: ghost");
    assert_eq!(h.acker.offsets(), vec![9]);
    assert!(h.producer.events().is_empty());
}

#[test]
fn source_failures_are_reported_not_dropped() {
    let mut h = harness();
    let mut bad_url = start("inv-url", "", 1000);
    bad_url.url = "ftp://example/snippet.lua".to_string();
    let mut encoded = start("inv-b64", "", 1000);
    encoded.url = "base64://ZnVuY3Rpb24gbWFpbigpIHJldHVybiAnb2snIGVuZA==".to_string();

    h.handler
        .on_receive(&message(1, SNIPPET_START, &bad_url))
        .unwrap();
    h.handler
        .on_receive(&message(2, SNIPPET_START, &encoded))
        .unwrap();
    h.handler.shutdown();

    let failed = h.store.record("inv-url").unwrap();
    assert_eq!(failed.status, "CODE_GET_FAILED");
    assert_eq!(failed.error_descr, "Unknow schema detected: ftp");

    let decoded = h.store.record("inv-b64").unwrap();
    assert_eq!(decoded.status, "FINISHED");
    assert_eq!(decoded.result, "ok");

    let mut offsets = h.acker.offsets();
    offsets.sort();
    assert_eq!(offsets, vec![1, 2]);
}

#[test]
fn out_of_memory_exits_even_when_output_is_lost() {
    let hungry = "function main()\n\
                  local t = {}\n\
                  for i = 1, 10000000 do t[i] = string.rep('x', 64) .. i end\n\
                end";
    let cases = vec![(hungry, 1024 * 1024, true), ("function main() return 1 end", 0, false)];
    for (code, memory, exits) in cases {
        let producer = Arc::new(MemoryProducer::new());
        let acker = Arc::new(MemoryAcker::new());
        let exited = Arc::new(AtomicBool::new(false));
        let mut handler = handler_with(
            Arc::new(UnwritableStore),
            producer.clone(),
            acker.clone(),
            Arc::clone(&exited),
        );

        let mut event = start("inv-oom", code, 10000);
        event.memory = memory;
        handler
            .on_receive(&message(11, SNIPPET_START, &event))
            .unwrap();
        handler.shutdown();

        assert_eq!(exited.load(Ordering::SeqCst), exits, "{}", code);
        assert_eq!(acker.offsets(), vec![11]);
        assert!(producer.events().is_empty());
        assert!(handler.registry().is_empty());
    }
}
