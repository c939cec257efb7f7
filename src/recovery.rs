//! Panic containment for host-supplied callbacks.
//!
//! Destroyed-predicates, size probes, warning callbacks and cleanup actions
//! are all host code running inline on the runtime. A panic in any of them
//! must surface as an `Error::Internal`, never unwind through a sweep or
//! sampling loop.

use crate::types::{Error, Result};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Execute a function with panic recovery.
///
/// If the function panics, the panic is captured, logged, and converted
/// to an error.
///
/// # Example
/// ```
/// use warden_core::recovery::with_recovery;
///
/// let result = with_recovery(|| Ok(7), "size_probe");
/// assert_eq!(result.unwrap(), 7);
/// ```
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(panic_payload.as_ref());
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );

            Err(Error::internal(format!(
                "Panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

/// Await a future with panic recovery.
///
/// Panics raised while the future is being polled are captured, not just
/// panics raised while constructing it.
pub async fn with_recovery_async<Fut, T>(future: Fut, operation_name: &str) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(panic_payload.as_ref());
            tracing::error!(
                "async_panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );

            Err(Error::internal(format!(
                "Async panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}
