//! Resource governor.
//!
//! Samples process metrics and named queue sizes on fixed periods, compares
//! them against [`Limits`], and reacts to breaches:
//! - memory: reclamation hint + memory-warning callback (measured MB)
//! - cpu: cpu-warning callback (measured percent)
//! - handles: handle-warning callback (count)
//! - queues: warning log only; eviction belongs to the queue owner
//!
//! Breaches never trigger [`ResourceGovernor::emergency_cleanup`]; the host
//! decides when to shed load.

mod limits;
mod metrics;
mod probes;

pub use limits::{LimitKind, Limits};
pub use metrics::{CpuUsage, MetricsSource, ResourceSample, SysinfoMetrics, SystemFacts};
pub use probes::{FnProbe, ReclaimHint, Reclaimable, SizeProbe};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::recovery::{with_recovery, with_recovery_async};
use crate::types::{GovernorConfig, QueueName, Result};

/// Callback receiving a measured value (MB for memory, percent for cpu).
pub type MeasureCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Callback receiving a measured count.
pub type CountCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// A dimension that exceeded its ceiling in one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Breach {
    Memory { measured_mb: f64, limit_mb: f64 },
    Cpu { measured_percent: f64, limit_percent: f64 },
    Handles { count: usize, limit: usize },
    Queue { name: String, size: usize, limit: usize },
}

/// Result of one sampling tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub sample: ResourceSample,
    pub breaches: Vec<Breach>,
}

/// Read-only view returned by [`ResourceGovernor::metrics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorMetrics {
    pub latest: Option<ResourceSample>,
    pub queues: BTreeMap<String, usize>,
    pub limits: Limits,
    pub system: SystemFacts,
}

#[derive(Default)]
struct Callbacks {
    memory: Option<MeasureCallback>,
    cpu: Option<MeasureCallback>,
    handles: Option<CountCallback>,
}

struct Shared {
    source: Arc<dyn MetricsSource>,
    limits: RwLock<Limits>,
    latest: RwLock<Option<ResourceSample>>,
    queue_sizes: RwLock<BTreeMap<String, usize>>,
    probes: RwLock<BTreeMap<QueueName, Arc<dyn SizeProbe>>>,
    handle_probe: RwLock<Option<Arc<dyn SizeProbe>>>,
    callbacks: RwLock<Callbacks>,
    reclaim_hint: RwLock<Option<Arc<dyn ReclaimHint>>>,
    emergency_cache: RwLock<Option<Arc<dyn Reclaimable>>>,
    emergency_handles: RwLock<Option<Arc<dyn Reclaimable>>>,
}

/// Periodic sampler with threshold reactions.
///
/// `start` spawns one background task driving both the sampling ticker and
/// the queue probe ticker; `stop` cancels it and is final.
pub struct ResourceGovernor {
    shared: Arc<Shared>,
    config: GovernorConfig,
    cancel: CancellationToken,
}

impl fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("config", &self.config)
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig, source: Arc<dyn MetricsSource>) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                limits: RwLock::new(config.limits.clone()),
                latest: RwLock::new(None),
                queue_sizes: RwLock::new(BTreeMap::new()),
                probes: RwLock::new(BTreeMap::new()),
                handle_probe: RwLock::new(None),
                callbacks: RwLock::new(Callbacks::default()),
                reclaim_hint: RwLock::new(None),
                emergency_cache: RwLock::new(None),
                emergency_handles: RwLock::new(None),
            }),
            config,
            cancel: CancellationToken::new(),
        }
    }

    // =========================================================================
    // Background loop
    // =========================================================================

    /// Spawn the sampling and queue probe loops.
    pub fn start(&self) -> JoinHandle<()> {
        let governor = self.handle();
        let cancel = self.cancel.clone();
        let defaults = GovernorConfig::default();
        let sample_period = non_zero_period(
            "sample_interval",
            self.config.sample_interval,
            defaults.sample_interval,
        );
        let probe_period = non_zero_period(
            "queue_probe_interval",
            self.config.queue_probe_interval,
            defaults.queue_probe_interval,
        );

        tokio::spawn(async move {
            let mut sample_ticker = interval_at(Instant::now() + sample_period, sample_period);
            sample_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut probe_ticker = interval_at(Instant::now() + probe_period, probe_period);
            probe_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                "governor_started: sample_interval={:?}, queue_probe_interval={:?}",
                sample_period,
                probe_period
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("governor_stopped");
                        break;
                    }
                    _ = probe_ticker.tick() => {
                        governor.refresh_queue_sizes().await;
                    }
                    _ = sample_ticker.tick() => {
                        governor.check_resources().await;
                    }
                }
            }
        })
    }

    /// Cancel the background loop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A second governor view sharing this one's state and cancellation.
    fn handle(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Watch a named queue. The probe is re-evaluated every
    /// `queue_probe_interval`, independently of the sampling tick.
    pub async fn register_queue(&self, name: QueueName, probe: Arc<dyn SizeProbe>) {
        tracing::debug!("queue_registered: name={}", name);
        self.shared.probes.write().await.insert(name, probe);
    }

    pub async fn unregister_queue(&self, name: &QueueName) {
        self.shared.probes.write().await.remove(name);
        self.shared.queue_sizes.write().await.remove(name.as_str());
    }

    /// Use `probe` for the handle count instead of the metrics source.
    pub async fn set_handle_probe(&self, probe: Arc<dyn SizeProbe>) {
        *self.shared.handle_probe.write().await = Some(probe);
    }

    pub async fn set_reclaim_hint(&self, hint: Arc<dyn ReclaimHint>) {
        *self.shared.reclaim_hint.write().await = Some(hint);
    }

    /// Cache cleared by [`Self::emergency_cleanup`].
    pub async fn designate_cache(&self, target: Arc<dyn Reclaimable>) {
        *self.shared.emergency_cache.write().await = Some(target);
    }

    /// Handle collection swept by [`Self::emergency_cleanup`].
    pub async fn designate_handles(&self, target: Arc<dyn Reclaimable>) {
        *self.shared.emergency_handles.write().await = Some(target);
    }

    pub async fn on_memory_warning(&self, callback: MeasureCallback) {
        self.shared.callbacks.write().await.memory = Some(callback);
    }

    pub async fn on_cpu_warning(&self, callback: MeasureCallback) {
        self.shared.callbacks.write().await.cpu = Some(callback);
    }

    pub async fn on_handle_warning(&self, callback: CountCallback) {
        self.shared.callbacks.write().await.handles = Some(callback);
    }

    // =========================================================================
    // Limits
    // =========================================================================

    /// Set one limit by name. Unknown names are ignored and return `false`.
    pub async fn set_limit(&self, name: &str, value: f64) -> bool {
        match name.parse::<LimitKind>() {
            Ok(kind) => {
                self.shared.limits.write().await.set(kind, value);
                tracing::info!("resource_limit_set: {}={}", name, value);
                true
            }
            Err(e) => {
                tracing::debug!("resource_limit_ignored: {}", e);
                false
            }
        }
    }

    pub async fn limits(&self) -> Limits {
        self.shared.limits.read().await.clone()
    }

    // =========================================================================
    // Sampling
    // =========================================================================

    /// Re-evaluate every registered queue probe.
    ///
    /// A probe that fails or panics keeps its previous value.
    pub async fn refresh_queue_sizes(&self) {
        let probes: Vec<(QueueName, Arc<dyn SizeProbe>)> = self
            .shared
            .probes
            .read()
            .await
            .iter()
            .map(|(name, probe)| (name.clone(), Arc::clone(probe)))
            .collect();

        for (name, probe) in probes {
            match with_recovery_async(probe.size(), "queue_probe").await {
                Ok(size) => {
                    self.shared
                        .queue_sizes
                        .write()
                        .await
                        .insert(name.as_str().to_string(), size);
                }
                Err(e) => {
                    tracing::warn!("queue_probe_failed: name={}, error={}", name, e);
                }
            }
        }
    }

    /// Take one sample, store it as the latest, and react to breaches.
    pub async fn check_resources(&self) -> CheckReport {
        let source = Arc::clone(&self.shared.source);

        let memory_bytes = read_metric("process_memory", || source.memory_bytes());
        let cpu = read_metric("process_cpu", || source.cpu());
        let handles = self.read_handle_count().await;
        let queues = self.shared.queue_sizes.read().await.clone();

        let sample = ResourceSample {
            memory_bytes,
            cpu,
            handles,
            queues,
            taken_at: Utc::now(),
        };

        let limits = self.limits().await;
        let breaches = find_breaches(&sample, &limits);
        *self.shared.latest.write().await = Some(sample.clone());

        for breach in &breaches {
            self.react(breach).await;
        }

        CheckReport { sample, breaches }
    }

    async fn read_handle_count(&self) -> Option<usize> {
        let probe = self.shared.handle_probe.read().await.clone();
        let result = match probe {
            Some(probe) => with_recovery_async(probe.size(), "handle_probe").await,
            None => {
                let source = Arc::clone(&self.shared.source);
                match with_recovery(|| Ok(source.handle_count()), "handle_count") {
                    Ok(Some(result)) => result,
                    Ok(None) => return None,
                    Err(e) => Err(e),
                }
            }
        };
        match result {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!("handle_count_failed: error={}", e);
                None
            }
        }
    }

    async fn react(&self, breach: &Breach) {
        match breach {
            Breach::Memory {
                measured_mb,
                limit_mb,
            } => {
                tracing::warn!(
                    "high_memory_usage: {:.0}MB (limit: {:.0}MB)",
                    measured_mb,
                    limit_mb
                );
                self.trigger_reclaim_hint().await;
                let callback = self.shared.callbacks.read().await.memory.clone();
                if let Some(callback) = callback {
                    let value = *measured_mb;
                    run_callback("memory_warning", || callback(value));
                }
            }
            Breach::Cpu {
                measured_percent,
                limit_percent,
            } => {
                tracing::warn!(
                    "high_cpu_usage: {:.1}% (limit: {:.1}%)",
                    measured_percent,
                    limit_percent
                );
                let callback = self.shared.callbacks.read().await.cpu.clone();
                if let Some(callback) = callback {
                    let value = *measured_percent;
                    run_callback("cpu_warning", || callback(value));
                }
            }
            Breach::Handles { count, limit } => {
                tracing::warn!("high_handle_count: {} (limit: {})", count, limit);
                let callback = self.shared.callbacks.read().await.handles.clone();
                if let Some(callback) = callback {
                    let value = *count;
                    run_callback("handle_warning", || callback(value));
                }
            }
            Breach::Queue { name, size, limit } => {
                tracing::warn!(
                    "queue_too_large: name={}, size={}, limit={}",
                    name,
                    size,
                    limit
                );
            }
        }
    }

    /// Ask the host memory manager to reclaim. Absence is not an error.
    async fn trigger_reclaim_hint(&self) -> bool {
        let hint = self.shared.reclaim_hint.read().await.clone();
        let Some(hint) = hint else {
            return false;
        };
        match with_recovery(|| hint.reclaim_memory(), "reclaim_hint") {
            Ok(()) => {
                tracing::info!("memory_reclaim_triggered");
                true
            }
            Err(e) => {
                tracing::warn!("memory_reclaim_failed: error={}", e);
                false
            }
        }
    }

    // =========================================================================
    // Reporting and load shedding
    // =========================================================================

    /// Latest sample, queue sizes, limits and system facts. Never re-samples.
    pub async fn metrics(&self) -> GovernorMetrics {
        let source = Arc::clone(&self.shared.source);
        GovernorMetrics {
            latest: self.shared.latest.read().await.clone(),
            queues: self.shared.queue_sizes.read().await.clone(),
            limits: self.limits().await,
            system: source.system_facts(),
        }
    }

    /// Clear the designated cache, force the reclamation hint and sweep the
    /// designated handle collection. Best effort; always returns `true`.
    pub async fn emergency_cleanup(&self) -> bool {
        tracing::warn!("emergency_cleanup_initiated");

        let cache = self.shared.emergency_cache.read().await.clone();
        if let Some(cache) = cache {
            match with_recovery_async(cache.reclaim(), "emergency_cache").await {
                Ok(n) => tracing::info!("emergency_cache_cleared: entries={}", n),
                Err(e) => tracing::warn!("emergency_cache_failed: error={}", e),
            }
        }

        self.trigger_reclaim_hint().await;

        let handles = self.shared.emergency_handles.read().await.clone();
        if let Some(handles) = handles {
            match with_recovery_async(handles.reclaim(), "emergency_handles").await {
                Ok(n) => tracing::info!("emergency_handles_swept: evicted={}", n),
                Err(e) => tracing::warn!("emergency_handles_failed: error={}", e),
            }
        }

        true
    }
}

fn read_metric<T>(name: &str, read: impl FnOnce() -> Result<T>) -> Option<T> {
    match with_recovery(read, name) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("metric_read_failed: metric={}, error={}", name, e);
            None
        }
    }
}

fn non_zero_period(name: &str, configured: Duration, fallback: Duration) -> Duration {
    if configured.is_zero() {
        tracing::warn!("zero_{}: using {:?}", name, fallback);
        fallback
    } else {
        configured
    }
}

fn run_callback(name: &str, callback: impl FnOnce()) {
    let _ = with_recovery(
        || {
            callback();
            Ok(())
        },
        name,
    );
}

fn find_breaches(sample: &ResourceSample, limits: &Limits) -> Vec<Breach> {
    let mut breaches = Vec::new();

    if let Some(measured_mb) = sample.memory_mb() {
        if measured_mb > limits.max_memory_mb {
            breaches.push(Breach::Memory {
                measured_mb,
                limit_mb: limits.max_memory_mb,
            });
        }
    }

    if let Some(cpu) = sample.cpu {
        if cpu.percent > limits.max_cpu_percent {
            breaches.push(Breach::Cpu {
                measured_percent: cpu.percent,
                limit_percent: limits.max_cpu_percent,
            });
        }
    }

    if let Some(count) = sample.handles {
        if count > limits.max_handles {
            breaches.push(Breach::Handles {
                count,
                limit: limits.max_handles,
            });
        }
    }

    for (name, &size) in &sample.queues {
        if size > limits.max_queue_size {
            breaches.push(Breach::Queue {
                name: name.clone(),
                size,
                limit: limits.max_queue_size,
            });
        }
    }

    breaches
}
