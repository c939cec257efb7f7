//! Metrics capability and samples.
//!
//! `MetricsSource` is the host/OS boundary. `SysinfoMetrics` is the default
//! implementation for the current process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::types::{Error, Result};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Process CPU usage at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    /// User + system time accumulated since process start.
    #[serde(with = "humantime_serde")]
    pub total_time: Duration,
    /// Usage since the previous refresh, 100.0 == one full core.
    pub percent: f64,
}

/// Static facts about the machine, reported alongside the latest sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemFacts {
    pub total_memory_mb: f64,
    pub free_memory_mb: f64,
    pub cpu_count: usize,
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
}

/// Source of process and system metrics.
///
/// Reads may fail; the governor treats a failed read as "no update this
/// cycle" for that dimension.
pub trait MetricsSource: Send + Sync {
    /// Resident memory of the process in bytes.
    fn memory_bytes(&self) -> Result<u64>;

    fn cpu(&self) -> Result<CpuUsage>;

    /// Open handle enumeration, when the platform offers one.
    fn handle_count(&self) -> Option<Result<usize>> {
        None
    }

    fn system_facts(&self) -> SystemFacts;
}

/// Point-in-time measurement. Superseded by the next sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub memory_bytes: Option<u64>,
    pub cpu: Option<CpuUsage>,
    pub handles: Option<usize>,
    pub queues: BTreeMap<String, usize>,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSample {
    pub fn memory_mb(&self) -> Option<f64> {
        self.memory_bytes.map(|b| b as f64 / BYTES_PER_MB)
    }
}

/// `MetricsSource` for the current process, backed by `sysinfo`.
pub struct SysinfoMetrics {
    system: Mutex<System>,
    pid: Pid,
    created: Instant,
}

impl SysinfoMetrics {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| Error::probe(e.to_string()))?;
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        Ok(Self {
            system: Mutex::new(system),
            pid,
            created: Instant::now(),
        })
    }

    fn with_process<T>(&self, read: impl FnOnce(&sysinfo::Process) -> T) -> Result<T> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| Error::internal("sysinfo state poisoned"))?;
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        system
            .process(self.pid)
            .map(read)
            .ok_or_else(|| Error::probe(format!("process {} not visible", self.pid)))
    }
}

impl fmt::Debug for SysinfoMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysinfoMetrics")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl MetricsSource for SysinfoMetrics {
    fn memory_bytes(&self) -> Result<u64> {
        self.with_process(|p| p.memory())
    }

    fn cpu(&self) -> Result<CpuUsage> {
        self.with_process(|p| CpuUsage {
            total_time: Duration::from_millis(p.accumulated_cpu_time()),
            percent: f64::from(p.cpu_usage()),
        })
    }

    fn system_facts(&self) -> SystemFacts {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let fallback_uptime = self.created.elapsed();

        match self.system.lock() {
            Ok(mut system) => {
                system.refresh_memory();
                let uptime = system
                    .process(self.pid)
                    .map(|p| Duration::from_secs(p.run_time()))
                    .unwrap_or(fallback_uptime);
                SystemFacts {
                    total_memory_mb: system.total_memory() as f64 / BYTES_PER_MB,
                    free_memory_mb: system.available_memory() as f64 / BYTES_PER_MB,
                    cpu_count,
                    uptime,
                }
            }
            Err(_) => SystemFacts {
                total_memory_mb: 0.0,
                free_memory_mb: 0.0,
                cpu_count,
                uptime: fallback_uptime,
            },
        }
    }
}
