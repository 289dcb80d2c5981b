use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::models::memory::MemoryReport;

pub trait MemoryProbe: Send {
    /// Current virtual memory size of this process, in bytes.
    fn virtual_size(&mut self) -> u64;
}

pub struct SysinfoProbe {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = %e, "Cannot resolve own pid, memory sampling disabled");
                None
            }
        };

        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn virtual_size(&mut self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };

        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
        self.system
            .process(pid)
            .map(|process| process.virtual_memory())
            .unwrap_or(0)
    }
}

struct Baseline {
    initial_vsz: u64,
    last_vsz: u64,
    last_at: Instant,
}

/// Watches the worker's own virtual memory for slow growth. Observational
/// only; nothing here throttles consumption.
pub struct MemorySampler {
    worker: String,
    exchange: String,
    interval: Duration,
    probe: Box<dyn MemoryProbe>,
    baseline: Option<Baseline>,
    processed: u64,
    total_processed: u64,
}

impl MemorySampler {
    pub fn new(
        worker: impl Into<String>,
        exchange: impl Into<String>,
        interval: Duration,
        probe: Box<dyn MemoryProbe>,
    ) -> Self {
        Self {
            worker: worker.into(),
            exchange: exchange.into(),
            interval,
            probe,
            baseline: None,
            processed: 0,
            total_processed: 0,
        }
    }

    pub fn record_processed(&mut self) {
        self.processed += 1;
    }

    /// Messages counted in the current sampling window.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Messages counted in all closed windows.
    pub fn total_processed(&self) -> u64 {
        self.total_processed
    }

    pub fn maybe_sample(&mut self) -> Option<MemoryReport> {
        let now = Instant::now();

        if self.baseline.is_none() {
            let vsz = self.probe.virtual_size();
            self.baseline = Some(Baseline {
                initial_vsz: vsz,
                last_vsz: vsz,
                last_at: now,
            });
            return None;
        }
        let baseline = self.baseline.as_mut()?;

        if now.duration_since(baseline.last_at) < self.interval {
            return None;
        }

        let vsz = self.probe.virtual_size();
        let delta_since_last = vsz as i64 - baseline.last_vsz as i64;
        let delta_since_start = vsz as i64 - baseline.initial_vsz as i64;

        self.total_processed += self.processed;
        let per_message = if self.total_processed == 0 {
            0.0
        } else {
            delta_since_start as f64 / self.total_processed as f64
        };

        let report = MemoryReport {
            worker: self.worker.clone(),
            exchange: self.exchange.clone(),
            delta_since_last,
            delta_since_start,
            window_processed: self.processed,
            total_processed: self.total_processed,
            per_message,
        };

        debug!(
            worker = %report.worker,
            exchange = %report.exchange,
            delta_kb = report.delta_since_last / 1000,
            delta_since_start_kb = report.delta_since_start / 1000,
            processed = report.window_processed,
            total_processed = report.total_processed,
            per_message_kb = report.per_message / 1000.0,
            "Memory sample"
        );

        baseline.last_vsz = vsz;
        baseline.last_at = now;
        self.processed = 0;

        Some(report)
    }
}
