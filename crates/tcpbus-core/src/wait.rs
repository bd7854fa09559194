//! Bounded waits in front of blocking operations.
//!
//! `accept` and `connect` may block indefinitely. Callers that want a bound
//! wrap the operation in [`bounded`], which resolves to one of three
//! outcomes instead of a nested `Result`.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::time::timeout;

/// Outcome of a bounded wait.
#[derive(Debug)]
pub enum WaitOutcome<T> {
    /// The operation completed within the bound.
    Ready(T),
    /// The bound elapsed first. The operation was dropped.
    Timeout,
    /// The operation itself failed.
    Failure(io::Error),
}

impl<T> WaitOutcome<T> {
    /// Returns true if the operation completed.
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready(_))
    }
}

/// Waits for `operation` for at most `timeout_secs` seconds.
///
/// A timeout of zero means wait indefinitely: no timer is armed and the
/// outcome is either `Ready` or `Failure`.
pub async fn bounded<F, T>(timeout_secs: u32, operation: F) -> WaitOutcome<T>
where
    F: Future<Output = io::Result<T>>,
{
    if timeout_secs == 0 {
        return match operation.await {
            Ok(value) => WaitOutcome::Ready(value),
            Err(e) => WaitOutcome::Failure(e),
        };
    }

    match timeout(Duration::from_secs(u64::from(timeout_secs)), operation).await {
        Ok(Ok(value)) => WaitOutcome::Ready(value),
        Ok(Err(e)) => WaitOutcome::Failure(e),
        Err(_) => WaitOutcome::Timeout,
    }
}
