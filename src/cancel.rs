//! Cooperative cancellation threaded through every step and middleware call.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;

/// A cloneable, linkable cancellation signal.
///
/// Cancelling a signal cancels every child derived from it with
/// [`CancelSignal::child`]; cancelling a child leaves its parent untouched.
/// Cancellation is cooperative: it is only observed by code that checks
/// [`is_cancelled`](CancelSignal::is_cancelled) or awaits
/// [`cancelled`](CancelSignal::cancelled).
///
/// # Example
///
/// ```rust
/// use step_pipeline::CancelSignal;
///
/// let root = CancelSignal::new();
/// let child = root.child();
/// root.cancel();
/// assert!(child.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancelSignal {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tx: watch::Sender<bool>,
    parent: Option<CancelSignal>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// Create a new root signal that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner { tx, parent: None }),
        }
    }

    /// Derive a child signal that also fires when `self` fires.
    #[must_use]
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel this signal and all of its children.
    pub fn cancel(&self) {
        self.inner.tx.send_replace(true);
    }

    /// Returns true if this signal or any ancestor was cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.tx.borrow()
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(CancelSignal::is_cancelled)
    }

    /// Resolves once this signal or any ancestor is cancelled.
    pub fn cancelled(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut rx = self.inner.tx.subscribe();
            let own = async move {
                // The sender lives as long as `self`, so this only returns on cancel.
                let _ = rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
            };
            match &self.inner.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = own => {}
                        _ = parent.cancelled() => {}
                    }
                }
                None => own.await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let root = CancelSignal::new();
        let child = root.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_when_ancestor_fires() {
        let root = CancelSignal::new();
        let grandchild = root.child().child();

        let waiter = {
            let grandchild = grandchild.clone();
            tokio::spawn(async move { grandchild.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        root.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancellation should propagate")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_cancelled() {
        let signal = CancelSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already-cancelled signal should resolve");
    }
}
