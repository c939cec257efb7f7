//! Background reaping of destroyed handles.
//!
//! `RegistryReaper` sweeps a [`SharedRegistry`] on a fixed period so
//! handles destroyed behind the registry's back do not accumulate.

use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{Handle, SharedRegistry};
use crate::types::RegistryConfig;

/// Periodic sweep loop over a shared registry.
pub struct RegistryReaper<H: Handle + ?Sized + 'static = dyn Handle> {
    registry: SharedRegistry<H>,
    config: RegistryConfig,
    cancel: CancellationToken,
}

impl<H: Handle + ?Sized + 'static> fmt::Debug for RegistryReaper<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryReaper")
            .field("config", &self.config)
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<H: Handle + ?Sized + 'static> RegistryReaper<H> {
    pub fn new(registry: SharedRegistry<H>, config: RegistryConfig) -> Self {
        Self {
            registry,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &SharedRegistry<H> {
        &self.registry
    }

    /// Start the sweep loop in the background.
    /// The first sweep runs one full period after start.
    pub fn start(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let cancel = self.cancel.clone();
        let period = if self.config.sweep_interval.is_zero() {
            let fallback = RegistryConfig::default().sweep_interval;
            tracing::warn!("zero_sweep_interval: using {:?}", fallback);
            fallback
        } else {
            self.config.sweep_interval
        };

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.lock().await.sweep();
                        tracing::debug!("registry_sweep_tick: evicted={}", evicted);
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("registry_reaper_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the sweep loop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Remove every entry with cleanup, then stop the sweep loop.
    ///
    /// The registry lock is held across both steps so no sweep can observe
    /// a half-destroyed registry.
    pub async fn destroy(&self) -> usize {
        let mut registry = self.registry.lock().await;
        let removed = registry.destroy();
        self.cancel.cancel();
        tracing::info!("registry_destroyed: removed={}", removed);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::FakeHandle;
    use crate::registry::HandleRegistry;
    use crate::types::HandleId;
    use std::time::Duration;

    fn reaper() -> RegistryReaper<FakeHandle> {
        RegistryReaper::new(
            HandleRegistry::new().into_shared(),
            RegistryConfig {
                sweep_interval: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_sweeps_on_interval() {
        let reaper = reaper();
        let doomed = FakeHandle::live();
        let survivor = FakeHandle::live();
        {
            let mut registry = reaper.registry().lock().await;
            registry.add(HandleId::new(), doomed.clone()).unwrap();
            registry.add(HandleId::new(), survivor.clone()).unwrap();
        }
        doomed.destroy();

        let handle = reaper.start();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(reaper.registry().lock().await.len(), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(reaper.registry().lock().await.len(), 1);

        reaper.stop();
        reaper.stop();
        handle.await.unwrap();
        assert!(reaper.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_falls_back_to_default_period() {
        let reaper = RegistryReaper::<FakeHandle>::new(
            HandleRegistry::new().into_shared(),
            RegistryConfig {
                sweep_interval: Duration::ZERO,
            },
        );
        let doomed = FakeHandle::live();
        reaper
            .registry()
            .lock()
            .await
            .add(HandleId::new(), doomed.clone())
            .unwrap();
        doomed.destroy();

        let handle = reaper.start();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(reaper.registry().lock().await.is_empty());

        reaper.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_clears_registry_and_stops_loop() {
        let reaper = reaper();
        let handles: Vec<_> = (0..3).map(|_| FakeHandle::live()).collect();
        {
            let mut registry = reaper.registry().lock().await;
            for h in &handles {
                registry.add(HandleId::new(), h.clone()).unwrap();
            }
        }
        let loop_handle = reaper.start();

        assert_eq!(reaper.destroy().await, 3);
        assert!(reaper.registry().lock().await.is_empty());
        tokio::time::timeout(Duration::from_secs(1), loop_handle)
            .await
            .expect("sweep loop should exit")
            .unwrap();

        // Idempotent
        assert_eq!(reaper.destroy().await, 0);
    }
}
