//! Backpressure primitives protecting a downstream message consumer.

mod bounded_queue;
mod throttle;

pub use bounded_queue::BoundedQueue;
pub use throttle::{ThrottleLayer, Transport};
