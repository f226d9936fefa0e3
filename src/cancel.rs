//! Cooperative cancellation primitives shared by the queue, scheduler, and
//! cache layers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cloneable, idempotent one-shot cancellation signal.
///
/// Every clone observes the same underlying flag. `cancel()` may be called
/// any number of times (including concurrently) and only the first call has
/// an effect; `cancelled()` resolves immediately for any clone created after
/// cancellation, and for clones racing a concurrent `cancel()` call.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a token that is not yet cancelled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Marks the token cancelled and wakes every pending `cancelled()` call.
    /// Safe to call more than once.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns `true` once [`Self::cancel`] has been called on any clone of
    /// this token.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled. Resolves immediately if it
    /// already is.
    ///
    /// Registers interest with [`Notify`] before re-checking the flag, so a
    /// `cancel()` racing this call is never missed.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

struct GroupCancelInner {
    current: CancelToken,
    poisoned: bool,
}

/// Group cancellation for an [`crate::scheduler::HttpScheduler`]'s
/// `cancel_all()`/`reset_limit()` pair.
///
/// Chosen policy: `cancel_all()` cancels every token subscribed so far *and*
/// poisons the group, so operations scheduled after the call but before the
/// next `reset()` are born already cancelled — a "hot broadcast" that stays
/// hot until explicitly reset. Only `reset()` installs a fresh, live token.
pub struct GroupCancel {
    inner: Mutex<GroupCancelInner>,
}

impl std::fmt::Debug for GroupCancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("group cancel mutex poisoned");
        f.debug_struct("GroupCancel").field("poisoned", &inner.poisoned).finish()
    }
}

impl GroupCancel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GroupCancelInner {
                current: CancelToken::new(),
                poisoned: false,
            }),
        }
    }

    /// Returns the token a newly scheduled operation should watch. If the
    /// group is currently poisoned, returns an already-cancelled token.
    pub fn subscribe(&self) -> CancelToken {
        let inner = self.inner.lock().expect("group cancel mutex poisoned");
        if inner.poisoned {
            let token = CancelToken::new();
            token.cancel();
            token
        } else {
            inner.current.clone()
        }
    }

    /// Cancels every currently subscribed operation and poisons the group
    /// against future subscriptions until [`Self::reset`] is called.
    pub fn cancel_all(&self) {
        let inner = self.inner.lock().expect("group cancel mutex poisoned");
        inner.current.cancel();
        drop(inner);
        let mut inner = self.inner.lock().expect("group cancel mutex poisoned");
        inner.poisoned = true;
    }

    /// Installs a fresh, live token and clears the poison flag. Subsequent
    /// subscribers are no longer born cancelled.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("group cancel mutex poisoned");
        inner.current = CancelToken::new();
        inner.poisoned = false;
    }
}

impl Default for GroupCancel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_pending_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::task::yield_now().await;
        token.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_after_the_fact() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn group_cancel_poisons_until_reset() {
        let group = GroupCancel::new();
        let a = group.subscribe();
        group.cancel_all();
        assert!(a.is_cancelled());

        let b = group.subscribe();
        assert!(b.is_cancelled());

        group.reset();
        let c = group.subscribe();
        assert!(!c.is_cancelled());
    }
}
