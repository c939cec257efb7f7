//! Top-level wiring.
//!
//! `Runtime` owns one instance of every component, connects the governor to
//! the throttle layer and the handle registry, and registers the shutdown
//! sequence:
//!
//! ```text
//!   init()                         shutdown()
//!   ├─ reaper.start()              ├─ resource_governor: stop loops
//!   ├─ governor.start()            ├─ throttle_layer:    destroy
//!   ├─ probes + emergency targets  └─ handle_registry:   destroy + stop reaper
//!   └─ cleanup registrations
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backpressure::ThrottleLayer;
use crate::governor::{MetricsSource, ResourceGovernor};
use crate::registry::{HandleRegistry, RegistryReaper, SharedRegistry};
use crate::shutdown::{CleanupOutcome, ShutdownOrchestrator};
use crate::types::{Config, Error, QueueName, Result};

/// Queue name under which the throttle layer's pending messages are watched.
pub const THROTTLE_QUEUE: &str = "throttle_pending";

pub struct Runtime {
    config: Config,
    registry: SharedRegistry,
    reaper: Arc<RegistryReaper>,
    governor: Arc<ResourceGovernor>,
    throttle: ThrottleLayer,
    shutdown: ShutdownOrchestrator,
    loops: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("governor", &self.governor)
            .field("reaper", &self.reaper)
            .field("throttle", &self.throttle)
            .field("shutdown", &self.shutdown)
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(config: Config, metrics: Arc<dyn MetricsSource>) -> Self {
        let registry: SharedRegistry = HandleRegistry::new().into_shared();
        let reaper = RegistryReaper::new(Arc::clone(&registry), config.registry.clone());
        let governor = ResourceGovernor::new(config.governor.clone(), metrics);
        let throttle = ThrottleLayer::new(config.throttle.clone());
        let shutdown = ShutdownOrchestrator::new(config.shutdown.clone());

        Self {
            config,
            registry,
            reaper: Arc::new(reaper),
            governor: Arc::new(governor),
            throttle,
            shutdown,
            loops: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.governor
    }

    pub fn throttle(&self) -> &ThrottleLayer {
        &self.throttle
    }

    pub fn shutdown_orchestrator(&self) -> &ShutdownOrchestrator {
        &self.shutdown
    }

    /// Start background loops and connect the components. Idempotent.
    pub async fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let queue = QueueName::from_string(THROTTLE_QUEUE.to_string()).map_err(Error::validation)?;
        self.governor
            .register_queue(queue, Arc::new(self.throttle.clone()))
            .await;
        self.governor
            .set_handle_probe(Arc::clone(&self.registry) as _)
            .await;
        self.governor
            .designate_cache(Arc::new(self.throttle.clone()))
            .await;
        self.governor
            .designate_handles(Arc::clone(&self.registry) as _)
            .await;

        let governor = Arc::clone(&self.governor);
        self.shutdown
            .register_fn("resource_governor", move |_: CancellationToken| {
                let governor = Arc::clone(&governor);
                async move {
                    governor.stop();
                    Ok(())
                }
            })
            .await;

        let throttle = self.throttle.clone();
        self.shutdown
            .register_fn("throttle_layer", move |_: CancellationToken| {
                let throttle = throttle.clone();
                async move {
                    throttle.destroy().await;
                    Ok(())
                }
            })
            .await;

        let reaper = Arc::clone(&self.reaper);
        self.shutdown
            .register_fn("handle_registry", move |_: CancellationToken| {
                let reaper = Arc::clone(&reaper);
                async move {
                    reaper.destroy().await;
                    Ok(())
                }
            })
            .await;

        let mut loops = self.loops.lock().await;
        loops.push(self.reaper.start());
        loops.push(self.governor.start());

        tracing::info!(
            "runtime_initialized: sweep_interval={:?}, sample_interval={:?}",
            self.config.registry.sweep_interval,
            self.config.governor.sample_interval
        );
        Ok(())
    }

    /// Run the shutdown sequence and wait for the background loops to exit.
    ///
    /// The loops are stopped even when their cleanup tasks timed out. A loop
    /// still busy after `task_timeout` (for example blocked on a lock the
    /// host holds) is aborted.
    ///
    /// `None` when a shutdown is already running.
    pub async fn shutdown(&self) -> Option<Vec<CleanupOutcome>> {
        let outcomes = self.shutdown.execute_all().await?;

        self.reaper.stop();
        self.governor.stop();

        let deadline = Instant::now() + self.config.shutdown.task_timeout;
        let loops: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for mut handle in loops {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("background_loop_join_failed: error={}", e),
                Err(_) => {
                    tracing::warn!("background_loop_aborted: still busy at shutdown deadline");
                    handle.abort();
                }
            }
        }

        tracing::info!("runtime_shutdown_complete");
        Some(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::{CpuUsage, SystemFacts};
    use crate::shutdown::TaskStatus;
    use std::time::Duration;

    struct FixedMetrics;

    impl MetricsSource for FixedMetrics {
        fn memory_bytes(&self) -> Result<u64> {
            Ok(64 * 1024 * 1024)
        }

        fn cpu(&self) -> Result<CpuUsage> {
            Ok(CpuUsage {
                total_time: Duration::from_secs(1),
                percent: 1.0,
            })
        }

        fn system_facts(&self) -> SystemFacts {
            SystemFacts {
                total_memory_mb: 1024.0,
                free_memory_mb: 512.0,
                cpu_count: 2,
                uptime: Duration::from_secs(1),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_then_shutdown() {
        let runtime = Runtime::new(Config::default(), Arc::new(FixedMetrics));
        runtime.init().await.unwrap();
        runtime.init().await.unwrap();
        assert_eq!(runtime.shutdown_orchestrator().task_count().await, 3);

        let outcomes = runtime.shutdown().await.unwrap();
        let names: Vec<&str> = outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["resource_governor", "throttle_layer", "handle_registry"]
        );
        assert!(outcomes.iter().all(|o| o.status == TaskStatus::Success));
        assert!(runtime.governor().is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_bounded_while_host_holds_registry_lock() {
        let runtime = Runtime::new(Config::default(), Arc::new(FixedMetrics));
        runtime.init().await.unwrap();

        let registry = Arc::clone(runtime.registry());
        let holder = tokio::spawn(async move {
            let _guard = registry.lock().await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        // Past the first sweep and sample, so both loops are parked on the lock
        tokio::time::sleep(Duration::from_secs(31)).await;

        let outcomes = tokio::time::timeout(Duration::from_secs(120), runtime.shutdown())
            .await
            .expect("shutdown must finish while the lock is held")
            .unwrap();
        let summary: Vec<(&str, TaskStatus)> = outcomes
            .iter()
            .map(|o| (o.name.as_str(), o.status))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("resource_governor", TaskStatus::Success),
                ("throttle_layer", TaskStatus::Success),
                ("handle_registry", TaskStatus::TimedOut),
            ]
        );
        assert!(runtime.governor().is_stopped());
        assert!(runtime.loops.lock().await.is_empty());
        holder.abort();
    }
}
