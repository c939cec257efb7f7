//! # Warden Core - In-Process Resource-Lifecycle Governor
//!
//! Keeps a long-running host alive under resource pressure:
//! - Handle registry with periodic reaping of destroyed handles
//! - Resource governor sampling memory, CPU, handle and queue sizes
//! - Bounded-time shutdown of registered cleanup actions
//! - Backpressure: overwrite-oldest ring buffer and per-channel throttling
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────── Runtime ────────────────────┐
//!   host handles →│ HandleRegistry ◄── RegistryReaper (sweep loop)  │
//!                 │       ▲ handle probe / emergency sweep          │
//!                 │ ResourceGovernor (sample loop + probe loop)     │
//!                 │       ▼ queue probe / emergency cache clear     │
//!   messages    → │ ThrottleLayer ──► Transport (host)              │
//!                 │ ShutdownOrchestrator (ordered, time-bounded)    │
//!                 └─────────────────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod backpressure;
pub mod governor;
pub mod registry;
pub mod runtime;
pub mod shutdown;
pub mod types;

// Internal utilities
pub mod observability;
pub mod recovery;

pub use types::{Config, Error, Result};
