//! Panic recovery for tool handlers.
//!
//! In-process tools run inside the host. A panicking handler must fail its
//! own invocation with an `Internal` error instead of taking the worker task
//! (or the process) down with it.

use futures::FutureExt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::types::{Error, Result};

/// Run a closure, converting a panic into `Error::Internal`.
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(payload) => {
            let panic_msg = extract_panic_message(payload.as_ref());
            tracing::error!(operation = operation_name, panic = %panic_msg, "panic_recovered");
            Err(Error::internal(format!(
                "panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

/// Await a future, converting a panic raised while polling it into
/// `Error::Internal`.
pub async fn with_recovery_async<Fut, T>(future: Fut, operation_name: &str) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let panic_msg = extract_panic_message(payload.as_ref());
            tracing::error!(operation = operation_name, panic = %panic_msg, "async_panic_recovered");
            Err(Error::internal(format!(
                "panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

fn extract_panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_recovery_success() {
        assert_eq!(with_recovery(|| Ok(42), "op").unwrap(), 42);
    }

    #[test]
    fn test_with_recovery_preserves_error() {
        let result: Result<()> = with_recovery(|| Err(Error::validation("bad input")), "op");
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("bad input"));
    }

    #[test]
    fn test_with_recovery_panic_str() {
        let result: Result<()> = with_recovery(|| panic!("boom"), "echo");
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(err.to_string().contains("panic in echo: boom"));
    }

    #[test]
    fn test_with_recovery_panic_string() {
        let result: Result<()> = with_recovery(|| panic!("{}", "dynamic message"), "op");
        assert!(result.unwrap_err().to_string().contains("dynamic message"));
    }

    #[tokio::test]
    async fn test_with_recovery_async_success() {
        let result = with_recovery_async(async { Ok(7) }, "op").await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_recovery_async_catches_panic_after_await() {
        let result: Result<()> = with_recovery_async(
            async {
                tokio::task::yield_now().await;
                panic!("late panic");
            },
            "sleepy",
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(err.to_string().contains("late panic"));
    }
}
