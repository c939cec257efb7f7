//! Static teardown helpers: timer release and graceful window close.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::recovery::with_recovery;
use crate::registry::{is_handle_destroyed, Handle};
use crate::types::Result;

/// What a [`TimerHandle`] was scheduled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Interval,
    Timeout,
}

/// A cancellable timer task attached to a handle or window.
#[derive(Debug)]
pub struct TimerHandle {
    kind: TimerKind,
    handle: AbortHandle,
    cleared: AtomicBool,
}

impl TimerHandle {
    pub fn new(kind: TimerKind, handle: AbortHandle) -> Self {
        Self {
            kind,
            handle,
            cleared: AtomicBool::new(false),
        }
    }

    pub fn interval(handle: AbortHandle) -> Self {
        Self::new(TimerKind::Interval, handle)
    }

    pub fn timeout(handle: AbortHandle) -> Self {
        Self::new(TimerKind::Timeout, handle)
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// True once cleared or once the task ran to completion.
    pub fn is_inactive(&self) -> bool {
        self.cleared.load(Ordering::SeqCst) || self.handle.is_finished()
    }
}

/// Cancel `timer` if present.
///
/// Returns whether a live timer was cancelled; clearing twice, clearing a
/// finished timeout, or passing `None` all return `false`.
pub fn clear_timer(timer: Option<&TimerHandle>) -> bool {
    let Some(timer) = timer else {
        return false;
    };
    if timer.cleared.swap(true, Ordering::SeqCst) {
        return false;
    }
    let live = !timer.handle.is_finished();
    timer.handle.abort();
    live
}

/// Clear every occupied slot and leave it empty. Returns how many live
/// timers were cancelled.
pub fn release_timers(slots: &mut [Option<TimerHandle>]) -> usize {
    let mut cancelled = 0;
    for slot in slots.iter_mut() {
        let Some(timer) = slot.take() else {
            continue;
        };
        let live = clear_timer(Some(&timer));
        match timer.kind {
            TimerKind::Interval => tracing::trace!("interval_cleared: live={}", live),
            TimerKind::Timeout => tracing::trace!("timeout_cleared: live={}", live),
        }
        if live {
            cancelled += 1;
        }
    }
    cancelled
}

/// A host window: a [`Handle`] that can also be closed and force-destroyed.
pub trait Window: Handle {
    /// Request a graceful close.
    fn close(&self) -> Result<()>;

    fn destroy(&self) -> Result<()>;
}

/// Tear down `window`: detach listeners, cancel timers, request a graceful
/// close, wait `grace`, then force-destroy if it is still alive.
///
/// Returns `false` only if one of the window's own operations failed.
pub async fn cleanup_window<W: Window + ?Sized>(window: &W, grace: Duration) -> bool {
    match teardown_window(window, grace).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("window_cleanup_failed: error={}", e);
            false
        }
    }
}

async fn teardown_window<W: Window + ?Sized>(window: &W, grace: Duration) -> Result<()> {
    with_recovery(|| window.remove_all_listeners(), "window_listeners")?;

    let timers = with_recovery(|| Ok(window.take_timers()), "window_timers")?;
    let mut timers: Vec<Option<TimerHandle>> = timers.into_iter().map(Some).collect();
    release_timers(&mut timers);

    if is_destroyed(window) {
        tracing::debug!("window_already_destroyed");
        return Ok(());
    }

    with_recovery(|| window.close(), "window_close")?;
    tokio::time::sleep(grace).await;

    if !is_destroyed(window) {
        tracing::debug!("window_force_destroyed: grace={:?}", grace);
        with_recovery(|| window.destroy(), "window_destroy")?;
    }
    Ok(())
}

fn is_destroyed<W: Window + ?Sized>(window: &W) -> bool {
    with_recovery(|| is_handle_destroyed(window), "window_destroyed_check").unwrap_or(true)
}
