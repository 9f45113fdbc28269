//! Error-logging wrapper for long-lived components.
//!
//! Background work (flush, cleanup) has no caller to hand errors to, so
//! failures are logged here with the component and operation names and then
//! returned unchanged.

use std::fmt::Display;
use std::future::Future;
use std::ops::Deref;
use std::time::Instant;

use crate::observability::metrics;

/// A component whose fallible operations are logged on failure.
#[derive(Debug)]
pub struct Logged<C> {
    component: &'static str,
    inner: C,
}

impl<C> Logged<C> {
    pub fn new(component: &'static str, inner: C) -> Self {
        Self { component, inner }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    /// Run `f` against the wrapped component, logging an error result.
    pub async fn call<'a, F, Fut, T, E>(&'a self, operation: &'static str, f: F) -> Result<T, E>
    where
        F: FnOnce(&'a C) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let start = Instant::now();
        let result = f(&self.inner).await;
        if let Err(e) = &result {
            metrics::record_component_error(self.component, operation);
            tracing::error!(
                component = self.component,
                operation,
                elapsed_ms = start.elapsed().as_millis() as u64,
                error = %e,
                "Operation failed"
            );
        }
        result
    }
}

impl<C> Deref for Logged<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    impl Counter {
        async fn half(&self, n: u32) -> Result<u32, String> {
            if n % 2 == 0 {
                Ok(n / 2)
            } else {
                Err(format!("{} is odd", n))
            }
        }
    }

    #[tokio::test]
    async fn test_passes_results_through() {
        let guarded = Logged::new("counter", Counter);
        assert_eq!(guarded.call("half", |c| c.half(8)).await, Ok(4));
        assert_eq!(
            guarded.call("half", |c| c.half(3)).await,
            Err("3 is odd".to_string())
        );
        // Deref gives direct access as well.
        assert_eq!(guarded.half(2).await, Ok(1));
        assert_eq!(guarded.component(), "counter");
    }
}
