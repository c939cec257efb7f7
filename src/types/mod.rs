//! Core types for the warden runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (HandleId, QueueName)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for every component

mod config;
mod errors;
mod ids;

pub use config::{
    Config, GovernorConfig, ObservabilityConfig, RegistryConfig, ShutdownConfig, ThrottleConfig,
};
pub use errors::{Error, Result};
pub use ids::{HandleId, QueueName};
