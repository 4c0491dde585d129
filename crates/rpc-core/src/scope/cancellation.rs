//! Concrete scope type 2 (`spec.md` §3 "Scope types", §4.6): a cancellation
//! token mirrored across the wire. Built on `tokio::sync::Notify` rather
//! than pulling in `tokio-util`, matching the teacher's habit of hand
//! rolling small synchronization primitives instead of adding a dependency
//! for one type.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A cheaply-cloned handle to one cancellation signal. Cancelling any clone
/// cancels all of them.
#[derive(Clone, Debug)]
pub struct CancellationToken(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self(Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token. Idempotent; only the first call wakes waiters.
    pub fn cancel(&self) {
        if !self.0.cancelled.swap(true, Ordering::SeqCst) {
            self.0.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once this token is cancelled; resolves immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.0.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// A derived token that fires when either `self` or the returned child
    /// is cancelled, without letting the child cancel `self` — the shape a
    /// `Call`'s execution token takes when linked to a `Cancel` message
    /// *and* to the processor's own shutdown token (`spec.md` §3 "Call
    /// (context)... cancellation token linked to Cancel messages").
    pub fn child_token(&self) -> CancellationToken {
        let child = CancellationToken::new();
        let parent = self.clone();
        let linked = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            linked.cancel();
        });
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_existing_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should observe cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_fired() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("already-cancelled token resolves without waiting");
    }

    #[tokio::test]
    async fn child_token_fires_when_parent_does() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        assert!(!child.is_cancelled());
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child observes parent cancellation");
    }
}
