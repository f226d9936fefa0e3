//! In-flight request deduplication table.
//!
//! Grounded in the `hitbox` crate's `BroadcastConcurrencyManager`
//! (`examples/other_examples/…hitbox-src-concurrency.rs.rs`): a concurrent
//! map keyed by request identity, get-or-insert-shared-future semantics via
//! `DashMap::entry`, and removal of the entry once the shared future settles.
//!
//! Keyed on the fingerprint alone, not `(fingerprint, priority)`: this
//! crate's chosen conforming policy for concurrent cross-priority duplicates
//! (spec's "speculative cancellation via dedup" allowance) is to share the
//! existing in-flight handle rather than cancel-and-replace, so a later
//! caller at a different priority for the same fingerprint must collide
//! with, not bypass, an already in-flight entry.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::cancel::CancelToken;
use crate::error::{HttpSchedError, Result};
use crate::scheduler::ScheduleOutcome;

pub(crate) type Key = String;

type SharedResult = Shared<BoxFuture<'static, Result<ScheduleOutcome>>>;

/// The single outstanding execution for a key: a driven, shared result plus
/// the bookkeeping needed to cancel it once every real caller has lost
/// interest.
#[derive(Clone)]
struct InFlight {
    result: SharedResult,
    refs: Arc<AtomicUsize>,
    cancel: CancelToken,
}

/// Decrements the entry's external reference count on drop; cancels the
/// entry once that count reaches zero.
///
/// This is what makes cancellation real: the background task that drives an
/// entry to completion (below) never itself counts as a reference, so it
/// cannot keep an entry alive against cancellation — only real
/// [`DedupFuture`] handles do, and "dropping the last handle signals cancel
/// to the task" falls straight out of `fetch_sub` hitting `1`.
struct RefGuard {
    refs: Arc<AtomicUsize>,
    cancel: CancelToken,
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.cancel.cancel();
        }
    }
}

/// A handle to the single outstanding execution for a key. Multiple handles
/// for the same key all observe the same terminal outcome; dropping every
/// handle before the outcome is observed cancels the underlying work.
pub struct DedupFuture {
    inner: SharedResult,
    guard: RefGuard,
}

impl Future for DedupFuture {
    type Output = Result<ScheduleOutcome>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll(cx)
    }
}

/// The inflight table: fingerprint → shared result handle.
#[derive(Clone)]
pub struct Dedup {
    table: Arc<DashMap<Key, InFlight>>,
}

impl fmt::Debug for Dedup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dedup").field("in_flight", &self.table.len()).finish()
    }
}

impl Dedup {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self { table: Arc::new(DashMap::new()) }
    }

    /// Returns a handle to the execution for `key`, constructing it from
    /// `produce` if none is currently in flight. Install is atomic with
    /// respect to concurrent calls on the same key: `DashMap::entry` holds
    /// the shard lock across the occupied/vacant check, so two racing
    /// callers for the same key can never both construct a fresh execution.
    ///
    /// The execution is driven to completion by a background task
    /// regardless of whether the returned handle is polled, so the result is
    /// available promptly to every concurrent caller — but that task is not
    /// itself a caller: it watches a per-entry [`CancelToken`] that only
    /// fires once every handle returned by this method for `key` has been
    /// dropped, so cancelling the sole (or last) observer still cancels the
    /// underlying work instead of letting it run to completion unobserved.
    pub fn get_or_insert_with(&self, key: Key, produce: impl FnOnce() -> BoxFuture<'static, Result<ScheduleOutcome>>) -> DedupFuture {
        use dashmap::mapref::entry::Entry;

        let in_flight = match self.table.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(vacant) => {
                let cancel = CancelToken::new();
                let driver_cancel = cancel.clone();
                let inner = produce();
                let driven: BoxFuture<'static, Result<ScheduleOutcome>> = Box::pin(async move {
                    tokio::select! {
                        result = inner => result,
                        _ = driver_cancel.cancelled() => Err(HttpSchedError::Cancelled),
                    }
                });
                let result = driven.shared();

                let in_flight = InFlight { result: result.clone(), refs: Arc::new(AtomicUsize::new(0)), cancel };
                vacant.insert(in_flight.clone());

                let table = self.table.clone();
                let cleanup_key = key;
                tokio::spawn(async move {
                    result.await;
                    table.remove(&cleanup_key);
                });

                in_flight
            }
        };

        in_flight.refs.fetch_add(1, Ordering::SeqCst);
        DedupFuture {
            inner: in_flight.result,
            guard: RefGuard { refs: in_flight.refs, cancel: in_flight.cancel },
        }
    }

    /// Number of executions currently in flight. Exposed for tests.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for Dedup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpHeaders;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    fn outcome() -> Result<ScheduleOutcome> {
        Ok(ScheduleOutcome {
            status: 200,
            response_headers: HttpHeaders::new(),
            content_headers: HttpHeaders::new(),
            body: Bytes::from_static(b"x"),
            body_fetched: true,
        })
    }

    #[tokio::test]
    async fn concurrent_callers_for_the_same_key_share_one_execution() {
        let dedup = Dedup::new();
        let sends = Arc::new(AtomicU32::new(0));
        let key: Key = "fp".to_string();

        let make = |sends: Arc<AtomicU32>| -> BoxFuture<'static, Result<ScheduleOutcome>> {
            Box::pin(async move {
                sends.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                outcome()
            })
        };

        let a = dedup.get_or_insert_with(key.clone(), || make(sends.clone()));
        let b = dedup.get_or_insert_with(key.clone(), || make(sends.clone()));
        assert_eq!(a.await.unwrap().status, 200);
        assert_eq!(b.await.unwrap().status, 200);
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entry_is_removed_after_completion() {
        let dedup = Dedup::new();
        let key: Key = "fp".to_string();
        let handle = dedup.get_or_insert_with(key.clone(), || Box::pin(async move { outcome() }));
        handle.await.unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn dropping_the_sole_observer_cancels_the_underlying_execution() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dedup = Dedup::new();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let key: Key = "fp".to_string();

        let handle = dedup.get_or_insert_with(key.clone(), move || {
            Box::pin(async move {
                let _flag = flag;
                std::future::pending::<Result<ScheduleOutcome>>().await
            })
        });

        tokio::task::yield_now().await;
        drop(handle);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(dropped.load(Ordering::SeqCst), "underlying execution was not cancelled when the sole observer dropped");
        assert!(dedup.is_empty());
    }
}
