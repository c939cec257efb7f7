//! Capabilities the governor polls and sheds load through.

use async_trait::async_trait;
use std::fmt;

use crate::types::Result;

/// Zero-argument size query for a named queue (or the handle count).
#[async_trait]
pub trait SizeProbe: Send + Sync {
    async fn size(&self) -> Result<usize>;
}

/// Target of an emergency reclamation pass.
#[async_trait]
pub trait Reclaimable: Send + Sync {
    /// Shed whatever can be shed; returns how many entries were released.
    async fn reclaim(&self) -> Result<usize>;
}

/// Best-effort hint to the host's memory manager.
pub trait ReclaimHint: Send + Sync {
    fn reclaim_memory(&self) -> Result<()>;
}

/// Adapts a synchronous closure into a [`SizeProbe`].
pub struct FnProbe<F>(pub F);

impl<F> FnProbe<F>
where
    F: Fn() -> Result<usize> + Send + Sync,
{
    pub fn new(probe: F) -> Self {
        Self(probe)
    }
}

impl<F> fmt::Debug for FnProbe<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnProbe")
    }
}

#[async_trait]
impl<F> SizeProbe for FnProbe<F>
where
    F: Fn() -> Result<usize> + Send + Sync,
{
    async fn size(&self) -> Result<usize> {
        (self.0)()
    }
}
