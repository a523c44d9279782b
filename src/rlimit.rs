//! Memory limit monitoring
//!
//! Before a snippet runs, the monitor checks the cgroup accounting files to
//! decide how much memory the invocation may use, then samples the process
//! from a background thread every poll interval. Crossing the budget pushes a
//! single `"out of memory"` message onto the session's signal channel.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, warn};

use crate::config::CgroupConfig;
use crate::error::{Result, RteError};
use crate::stats::{MemorySample, MetricsSink};

/// Message sent when the budget is crossed
pub const OUT_OF_MEMORY: &str = "out of memory";

/// Share of the cgroup limit kept free when no explicit budget is requested
const BUFFER_PERCENT: u64 = 20;

/// Default sampling cadence
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resources requested by one invocation
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceRequest {
    /// Memory budget in bytes; 0 lets the monitor derive one
    pub memory: u64,
}

/// Something that can start a monitoring session
pub trait ResourceLimit: Send + Sync {
    fn start_monitoring(&self, request: ResourceRequest) -> Result<MonitorSession>;
}

/// Reports how much memory the process currently holds
pub trait MemoryProbe: Send + Sync {
    fn current_bytes(&self) -> std::io::Result<u64>;
}

/// Reads `VmRSS` from `/proc/self/status`
#[derive(Debug, Default)]
pub struct ProcStatusProbe;

impl MemoryProbe for ProcStatusProbe {
    fn current_bytes(&self) -> std::io::Result<u64> {
        let status = fs::read_to_string("/proc/self/status")?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                return Ok(kb * 1024);
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "VmRSS missing from /proc/self/status",
        ))
    }
}

/// cgroup backed implementation
pub struct CgroupLimit {
    cgroup: CgroupConfig,
    probe: Arc<dyn MemoryProbe>,
    metrics: Arc<dyn MetricsSink>,
    interval: Duration,
}

impl CgroupLimit {
    pub fn new(cgroup: CgroupConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        CgroupLimit {
            cgroup,
            probe: Arc::new(ProcStatusProbe),
            metrics,
            interval: POLL_INTERVAL,
        }
    }

    /// Replace the memory probe
    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replace the polling interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Budget available to an invocation given the cgroup counters
    fn budget(&self, request: ResourceRequest) -> Result<u64> {
        let limit = read_counter(&self.cgroup.limit_file)?;
        let usage = read_counter(&self.cgroup.usage_file)?;

        if request.memory > 0 {
            if request.memory.saturating_add(usage) > limit {
                return Err(RteError::Resource("not enough memory available".to_string()));
            }
            return Ok(request.memory);
        }

        let buffer = limit / 100 * BUFFER_PERCENT;
        let budget = limit.saturating_sub(buffer).saturating_sub(usage);
        if budget == 0 {
            return Err(RteError::Resource("not enough memory available".to_string()));
        }
        Ok(budget)
    }
}

impl ResourceLimit for CgroupLimit {
    fn start_monitoring(&self, request: ResourceRequest) -> Result<MonitorSession> {
        let budget = self.budget(request)?;
        let initial = self.probe.current_bytes()?;

        let (signal_tx, signal_rx) = bounded::<String>(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let probe = Arc::clone(&self.probe);
        let metrics = Arc::clone(&self.metrics);
        let interval = self.interval;

        debug!(budget, initial, "starting memory monitor");

        let thread = thread::Builder::new()
            .name("rlimit-monitor".to_string())
            .spawn(move || poll(probe, metrics, initial, budget, interval, signal_tx, stop_rx))?;

        Ok(MonitorSession {
            signal: signal_rx,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

fn poll(
    probe: Arc<dyn MemoryProbe>,
    metrics: Arc<dyn MetricsSink>,
    initial: u64,
    budget: u64,
    interval: Duration,
    signal: Sender<String>,
    stop: Receiver<()>,
) {
    let mut signalled = false;
    loop {
        select! {
            recv(stop) -> _ => break,
            default(interval) => {
                let current = match probe.current_bytes() {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "memory probe failed");
                        continue;
                    }
                };
                let allocated = if current >= initial { current - initial } else { current };
                metrics.record_memory(MemorySample { allocated, current, budget });

                if !signalled && allocated >= budget {
                    signalled = true;
                    warn!(allocated, budget, "memory budget exceeded");
                    let _ = signal.try_send(OUT_OF_MEMORY.to_string());
                }
            }
        }
    }
}

/// Handle on a running monitor; stopping it joins the sampling thread
pub struct MonitorSession {
    signal: Receiver<String>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorSession {
    /// Channel carrying the out-of-memory signal
    pub fn signal(&self) -> &Receiver<String> {
        &self.signal
    }

    /// A session that never signals, for disabled monitoring and tests
    pub fn idle() -> Self {
        let (_tx, rx) = bounded(1);
        MonitorSession {
            signal: rx,
            stop: None,
            thread: None,
        }
    }

    /// Build a session around an externally driven signal channel
    pub fn from_channel(signal: Receiver<String>) -> Self {
        MonitorSession {
            signal,
            stop: None,
            thread: None,
        }
    }

    /// Stop sampling and wait for the thread to acknowledge
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_counter(path: &Path) -> Result<u64> {
    let content = fs::read_to_string(path)
        .map_err(|e| RteError::Resource(format!("{}: {}", path.display(), e)))?;
    let first = content.lines().next().unwrap_or("").trim();
    first
        .parse::<u64>()
        .map_err(|e| RteError::Resource(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{AtomicMetrics, NoopMetrics};
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::NamedTempFile;

    struct FakeProbe(AtomicU64);

    impl MemoryProbe for FakeProbe {
        fn current_bytes(&self) -> std::io::Result<u64> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    fn counter_file(value: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", value).unwrap();
        file
    }

    fn limit(limit: &NamedTempFile, usage: &NamedTempFile) -> CgroupLimit {
        CgroupLimit::new(
            CgroupConfig {
                limit_file: limit.path().to_path_buf(),
                usage_file: usage.path().to_path_buf(),
            },
            Arc::new(NoopMetrics),
        )
    }

    #[test]
    fn test_budget_calculation() {
        let limit_file = counter_file("1000");
        let usage_file = counter_file("300");
        let rl = limit(&limit_file, &usage_file);

        // implicit: 1000 - 200 - 300
        assert_eq!(rl.budget(ResourceRequest { memory: 0 }).unwrap(), 500);
        assert_eq!(rl.budget(ResourceRequest { memory: 700 }).unwrap(), 700);

        let err = rl.budget(ResourceRequest { memory: 701 }).unwrap_err();
        assert_eq!(err.to_string(), "not enough memory available");
    }

    #[test]
    fn test_unreadable_counters() {
        let usage_file = counter_file("garbage");
        let limit_file = counter_file("1000");
        let rl = limit(&limit_file, &usage_file);
        assert!(rl.start_monitoring(ResourceRequest::default()).is_err());
    }

    #[test]
    fn test_signals_once_when_budget_crossed() {
        let limit_file = counter_file("100000");
        let usage_file = counter_file("0");
        let probe = Arc::new(FakeProbe(AtomicU64::new(1000)));
        let metrics = Arc::new(AtomicMetrics::new());
        let rl = CgroupLimit::new(
            CgroupConfig {
                limit_file: limit_file.path().to_path_buf(),
                usage_file: usage_file.path().to_path_buf(),
            },
            metrics.clone(),
        )
        .with_probe(probe.clone())
        .with_interval(Duration::from_millis(5));

        let session = rl.start_monitoring(ResourceRequest { memory: 500 }).unwrap();
        assert!(session.signal().recv_timeout(Duration::from_millis(50)).is_err());

        probe.0.store(1600, Ordering::SeqCst);
        let msg = session.signal().recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(msg, OUT_OF_MEMORY);
        assert!(session.signal().recv_timeout(Duration::from_millis(50)).is_err());

        session.stop();
        assert!(metrics.snapshot().samples > 0);
    }

    #[test]
    fn test_proc_status_probe() {
        assert!(ProcStatusProbe.current_bytes().unwrap() > 0);
    }
}
