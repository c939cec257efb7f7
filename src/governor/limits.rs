//! Resource ceilings.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Mutable ceilings consulted on every sample. Never derived automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub max_memory_mb: f64,
    pub max_cpu_percent: f64,
    pub max_handles: usize,
    pub max_queue_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_memory_mb: 2048.0,
            max_cpu_percent: 80.0,
            max_handles: 10_000,
            max_queue_size: 100_000,
        }
    }
}

/// Name of a single limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    MaxMemoryMb,
    MaxCpuPercent,
    MaxHandles,
    MaxQueueSize,
}

impl FromStr for LimitKind {
    type Err = String;

    /// Accepts snake_case and the camelCase spelling hosts tend to send.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_memory_mb" | "maxMemoryMB" => Ok(LimitKind::MaxMemoryMb),
            "max_cpu_percent" | "maxCpuPercent" => Ok(LimitKind::MaxCpuPercent),
            "max_handles" | "maxHandles" => Ok(LimitKind::MaxHandles),
            "max_queue_size" | "maxQueueSize" => Ok(LimitKind::MaxQueueSize),
            other => Err(format!("unknown limit: {}", other)),
        }
    }
}

impl Limits {
    /// Set one limit. Count limits are truncated toward zero.
    pub fn set(&mut self, kind: LimitKind, value: f64) {
        match kind {
            LimitKind::MaxMemoryMb => self.max_memory_mb = value,
            LimitKind::MaxCpuPercent => self.max_cpu_percent = value,
            LimitKind::MaxHandles => self.max_handles = value.max(0.0) as usize,
            LimitKind::MaxQueueSize => self.max_queue_size = value.max(0.0) as usize,
        }
    }
}
