//! Bounded-time shutdown.
//!
//! `ShutdownOrchestrator` runs registered cleanup actions in registration
//! order. Each action is raced against `task_timeout` and receives a
//! [`CancellationToken`] that is cancelled if it loses the race. One
//! failing or slow action never prevents the rest from running.

pub mod teardown;

pub use teardown::{cleanup_window, clear_timer, release_timers, TimerHandle, TimerKind, Window};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::recovery::{with_recovery, with_recovery_async};
use crate::types::{Error, Result, ShutdownConfig};

/// A registered cleanup action.
pub type CleanupAction =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// How one cleanup task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failed,
    TimedOut,
}

/// Per-task record returned by [`ShutdownOrchestrator::execute_all`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupOutcome {
    pub name: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

struct CleanupTask {
    name: String,
    action: CleanupAction,
}

pub struct ShutdownOrchestrator {
    tasks: RwLock<Vec<CleanupTask>>,
    config: ShutdownConfig,
    running: AtomicBool,
}

impl fmt::Debug for ShutdownOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownOrchestrator")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Clears the running flag however `execute_all` exits.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ShutdownOrchestrator {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            tasks: RwLock::new(Vec::new()),
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    /// Append a cleanup action. Tasks are never removed.
    pub async fn register(&self, name: impl Into<String>, action: CleanupAction) {
        let name = name.into();
        tracing::debug!("cleanup_registered: name={}", name);
        self.tasks.write().await.push(CleanupTask { name, action });
    }

    /// Register an async closure without boxing it by hand.
    pub async fn register_fn<F, Fut>(&self, name: impl Into<String>, action: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let action: CleanupAction =
            Arc::new(move |token: CancellationToken| -> BoxFuture<'static, Result<()>> {
                Box::pin(action(token))
            });
        self.register(name, action).await;
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run every registered task in order.
    ///
    /// Returns `None` without running anything if another run is in
    /// progress. Tasks registered during a run take effect on the next run.
    pub async fn execute_all(&self) -> Option<Vec<CleanupOutcome>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("cleanup_already_in_progress");
            return None;
        }
        let _guard = RunGuard(&self.running);

        let tasks: Vec<(String, CleanupAction)> = self
            .tasks
            .read()
            .await
            .iter()
            .map(|t| (t.name.clone(), Arc::clone(&t.action)))
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (name, action) in tasks {
            outcomes.push(self.run_task(name, action).await);
        }

        let failed = outcomes
            .iter()
            .filter(|o| o.status != TaskStatus::Success)
            .count();
        tracing::info!(
            "cleanup_completed: tasks={}, unsuccessful={}",
            outcomes.len(),
            failed
        );
        Some(outcomes)
    }

    async fn run_task(&self, name: String, action: CleanupAction) -> CleanupOutcome {
        tracing::info!("cleanup_executing: name={}", name);
        let token = CancellationToken::new();
        let started = Instant::now();

        // The action may panic before it hands back a future, or while it is polled
        let started_action = with_recovery(|| Ok(action(token.clone())), &name);
        let run = async {
            match started_action {
                Ok(future) => with_recovery_async(future, &name).await,
                Err(e) => Err(e),
            }
        };
        let (status, error) = match tokio::time::timeout(self.config.task_timeout, run).await {
            Ok(Ok(())) => (TaskStatus::Success, None),
            Ok(Err(e)) => {
                tracing::error!("cleanup_failed: name={}, error={}", name, e);
                (TaskStatus::Failed, Some(e.to_string()))
            }
            Err(_) => {
                token.cancel();
                tracing::warn!(
                    "cleanup_timed_out: name={}, timeout={:?}",
                    name,
                    self.config.task_timeout
                );
                let reason =
                    Error::timeout(format!("{} exceeded {:?}", name, self.config.task_timeout));
                (TaskStatus::TimedOut, Some(reason.to_string()))
            }
        };

        CleanupOutcome {
            name,
            status,
            error,
            elapsed: started.elapsed(),
        }
    }
}
