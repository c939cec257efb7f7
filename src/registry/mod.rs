//! Handle registry.
//!
//! Owns the set of live handle slots keyed by [`HandleId`]. Whether a handle
//! is destroyed is always derived from the handle itself at call time and
//! never stored. When that cannot be determined the handle is treated as
//! destroyed.

mod reaper;

pub use reaper::RegistryReaper;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::governor::{Reclaimable, SizeProbe};
use crate::recovery::with_recovery;
use crate::shutdown::{clear_timer, TimerHandle};
use crate::types::{Error, HandleId, Result};

/// Host-owned resource registered with the registry.
///
/// Every method has a default so hosts implement only what the underlying
/// object exposes.
pub trait Handle: Send + Sync {
    /// Direct destroyed introspection, when the handle offers one.
    fn is_destroyed(&self) -> Option<Result<bool>> {
        None
    }

    /// Content channel consulted when the handle has no introspection.
    fn content(&self) -> Option<&dyn Content> {
        None
    }

    fn remove_all_listeners(&self) -> Result<()> {
        Ok(())
    }

    /// Hand over attached timers for cancellation. Later calls return
    /// only timers attached since.
    fn take_timers(&self) -> Vec<TimerHandle> {
        Vec::new()
    }
}

/// Content channel backing a handle.
pub trait Content: Send + Sync {
    fn is_destroyed(&self) -> Result<bool>;

    fn remove_all_listeners(&self) -> Result<()>;
}

/// Replacement destroyed check supplied at construction.
pub type DestroyedPredicate<H> = Arc<dyn Fn(&H) -> Result<bool> + Send + Sync>;

/// Registry shared between the host, the reaper and the governor.
pub type SharedRegistry<H = dyn Handle> = Arc<Mutex<HandleRegistry<H>>>;

/// Default destroyed check: handle introspection, then content channel.
///
/// With neither available the handle counts as destroyed.
pub fn is_handle_destroyed<H: Handle + ?Sized>(handle: &H) -> Result<bool> {
    if let Some(result) = handle.is_destroyed() {
        return result;
    }
    if let Some(content) = handle.content() {
        return content.is_destroyed();
    }
    Ok(true)
}

/// Map of live handles.
pub struct HandleRegistry<H: ?Sized = dyn Handle> {
    handles: HashMap<HandleId, Arc<H>>,
    predicate: Option<DestroyedPredicate<H>>,
}

impl<H: Handle + ?Sized> Default for HandleRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized> fmt::Debug for HandleRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("handles", &self.handles.len())
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl<H: Handle + ?Sized> HandleRegistry<H> {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            predicate: None,
        }
    }

    /// Registry using `predicate` instead of [`is_handle_destroyed`].
    pub fn with_predicate(predicate: DestroyedPredicate<H>) -> Self {
        Self {
            handles: HashMap::new(),
            predicate: Some(predicate),
        }
    }

    /// Wrap into the shared form used by [`RegistryReaper`].
    pub fn into_shared(self) -> SharedRegistry<H> {
        Arc::new(Mutex::new(self))
    }

    /// Register `handle` under `id`, replacing any prior entry.
    ///
    /// A handle that already reports itself destroyed is rejected. The
    /// replaced handle, if any, is returned without cleanup.
    pub fn add(&mut self, id: HandleId, handle: Arc<H>) -> Result<Option<Arc<H>>> {
        if self.check_destroyed(&handle) {
            return Err(Error::validation(format!(
                "handle {} is already destroyed",
                id
            )));
        }
        tracing::debug!("handle_added: id={}", id);
        Ok(self.handles.insert(id, handle))
    }

    /// Live handle for `id`. A destroyed handle is evicted on the way.
    pub fn get(&mut self, id: &HandleId) -> Option<Arc<H>> {
        let handle = self.handles.get(id)?;
        if !self.check_destroyed(handle) {
            return Some(Arc::clone(handle));
        }
        self.remove(id);
        None
    }

    /// Release the handle's timers and listeners and drop the entry.
    pub fn remove(&mut self, id: &HandleId) -> Option<Arc<H>> {
        let handle = self.handles.remove(id)?;
        release_handle(id, handle.as_ref());
        Some(handle)
    }

    /// Evict every destroyed handle. Returns the number evicted.
    pub fn sweep(&mut self) -> usize {
        let destroyed: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|(_, handle)| self.check_destroyed(handle))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &destroyed {
            self.remove(id);
        }

        if !destroyed.is_empty() {
            tracing::info!("registry_sweep_completed: evicted={}", destroyed.len());
        }
        destroyed.len()
    }

    /// Snapshot of every handle that is currently alive.
    pub fn active_handles(&self) -> Vec<(HandleId, Arc<H>)> {
        self.handles
            .iter()
            .filter(|(_, handle)| !self.check_destroyed(handle))
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect()
    }

    pub fn contains(&self, id: &HandleId) -> bool {
        self.handles.contains_key(id)
    }

    /// Number of entries, destroyed-but-unswept included.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Remove every entry with cleanup. Returns the number removed.
    pub fn destroy(&mut self) -> usize {
        let ids: Vec<HandleId> = self.handles.keys().cloned().collect();
        for id in &ids {
            self.remove(id);
        }
        ids.len()
    }

    fn check_destroyed(&self, handle: &H) -> bool {
        let result = match &self.predicate {
            Some(predicate) => with_recovery(|| predicate(handle), "destroyed_predicate"),
            None => with_recovery(|| is_handle_destroyed(handle), "destroyed_check"),
        };
        result.unwrap_or_else(|e| {
            tracing::debug!("destroyed_check_failed: treating as destroyed, error={}", e);
            true
        })
    }
}

/// Handle-local cleanup. Each step is attempted regardless of the others.
fn release_handle<H: Handle + ?Sized>(id: &HandleId, handle: &H) {
    let timers = with_recovery(|| Ok(handle.take_timers()), "take_timers").unwrap_or_default();
    let cancelled = timers.iter().filter(|t| clear_timer(Some(*t))).count();

    if let Err(e) = with_recovery(|| handle.remove_all_listeners(), "remove_all_listeners") {
        tracing::warn!("handle_listener_cleanup_failed: id={}, error={}", id, e);
    }

    if let Some(content) = handle.content() {
        let alive = matches!(
            with_recovery(|| content.is_destroyed(), "content_check"),
            Ok(false)
        );
        if alive {
            if let Err(e) = with_recovery(|| content.remove_all_listeners(), "content_listeners") {
                tracing::debug!("content_listener_cleanup_failed: id={}, error={}", id, e);
            }
        }
    }

    tracing::debug!("handle_removed: id={}, timers_cancelled={}", id, cancelled);
}

#[async_trait]
impl<H: Handle + ?Sized + 'static> SizeProbe for Mutex<HandleRegistry<H>> {
    async fn size(&self) -> Result<usize> {
        Ok(self.lock().await.len())
    }
}

#[async_trait]
impl<H: Handle + ?Sized + 'static> Reclaimable for Mutex<HandleRegistry<H>> {
    async fn reclaim(&self) -> Result<usize> {
        Ok(self.lock().await.sweep())
    }
}
