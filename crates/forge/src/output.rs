//! Lazy values produced by external collaborators.
//!
//! Provisioning operations return values that are not available at call time
//! (a VM's address is only known once its guest agent reports interfaces).
//! [`Output`] represents such a value explicitly: later steps attach
//! continuations with [`Output::map`] or await the value with
//! [`Output::resolve`] instead of blocking a thread.

use std::fmt;
use std::future::Future;

use futures::future::{BoxFuture, FutureExt, Shared};

/// Error produced when a lazy value fails to resolve.
///
/// Cloneable so a single failed resolution can be observed by every holder
/// of the output.
#[derive(Debug, Clone, thiserror::Error)]
#[error("output failed to resolve: {0}")]
pub struct OutputError(pub String);

impl OutputError {
    /// Wrap any error as an output resolution failure.
    pub fn new(err: impl fmt::Display) -> Self {
        Self(err.to_string())
    }
}

/// A value that becomes available once an external operation completes.
///
/// Cloning is cheap; all clones resolve to the same value, and the
/// underlying operation runs at most once.
pub struct Output<T> {
    inner: Shared<BoxFuture<'static, Result<T, OutputError>>>,
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.peek() {
            Some(Ok(_)) => write!(f, "Output(resolved)"),
            Some(Err(e)) => write!(f, "Output(failed: {e})"),
            None => write!(f, "Output(pending)"),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Output<T> {
    /// Create an output backed by the given future.
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, OutputError>> + Send + 'static,
    {
        Self {
            inner: fut.boxed().shared(),
        }
    }

    /// Create an already-resolved output.
    pub fn ready(value: T) -> Self {
        Self::new(async move { Ok(value) })
    }

    /// Attach a continuation, producing a new output.
    pub fn map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let inner = self.inner.clone();
        Output::new(async move { inner.await.map(f) })
    }

    /// Await the resolved value.
    ///
    /// # Errors
    ///
    /// Returns the resolution failure of the underlying operation.
    pub async fn resolve(&self) -> Result<T, OutputError> {
        self.inner.clone().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_resolves_immediately() {
        let out = Output::ready(7);
        assert_eq!(out.resolve().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn map_attaches_continuation() {
        let out = Output::ready("10.0.0.4".to_string());
        let port = out.map(|ip| format!("{ip}:50000"));
        assert_eq!(port.resolve().await.unwrap(), "10.0.0.4:50000");
    }

    #[tokio::test]
    async fn clones_share_resolution() {
        let out = Output::new(async { Ok::<_, OutputError>(vec![1, 2, 3]) });
        let other = out.clone();
        assert_eq!(out.resolve().await.unwrap(), other.resolve().await.unwrap());
    }

    #[tokio::test]
    async fn failure_is_observable_by_all_clones() {
        let out: Output<String> = Output::new(async { Err(OutputError::new("agent timeout")) });
        let other = out.clone();
        assert!(out.resolve().await.is_err());
        assert!(other.resolve().await.is_err());
    }
}
