//! Priority Operation Queue (component A): bounded concurrent execution of
//! asynchronous operations ordered by priority, with per-operation
//! cancellation and no preemption of running work (see `DESIGN.md`).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::sync::{oneshot, Notify};

use crate::cancel::CancelToken;
use crate::error::{HttpSchedError, Result};
use crate::priority::Priority;

type ProduceFn<T> = Box<dyn FnOnce(CancelToken) -> BoxFuture<'static, Result<T>> + Send>;

struct PendingOp<T> {
    priority: Priority,
    seq: u64,
    cancel: CancelToken,
    produce: ProduceFn<T>,
    result_tx: oneshot::Sender<Result<T>>,
    settled: Arc<Notify>,
}

impl<T> PartialEq for PendingOp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for PendingOp<T> {}

impl<T> PartialOrd for PendingOp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PendingOp<T> {
    /// `BinaryHeap` is a max-heap; larger priority pops first. For equal
    /// priorities the *smaller* `seq` (earlier enqueue) must pop first, so
    /// the sequence comparison is reversed.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner<T> {
    heap: Mutex<BinaryHeap<PendingOp<T>>>,
    notify: Notify,
    running: AtomicUsize,
    max_concurrent: usize,
    paused: AtomicBool,
    shutting_down: AtomicBool,
    seq: AtomicU64,
}

/// Bounded, priority-ordered, FIFO-tie-broken async operation queue.
///
/// `T` is the output type produced by every `produce` closure submitted via
/// [`PriorityQueue::enqueue`]; a single queue only ever runs operations of
/// one output type, matching how `HttpScheduler` uses one queue for all of
/// its `(headers, bytes)` results.
pub struct PriorityQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for PriorityQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> std::fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("running", &self.inner.running.load(AtomicOrdering::SeqCst))
            .finish()
    }
}

impl<T: Send + 'static> PriorityQueue<T> {
    /// Creates a queue that admits at most `max_concurrent` operations at a
    /// time and spawns its background admission loop.
    pub fn new(max_concurrent: usize) -> Self {
        let inner = Arc::new(QueueInner {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            running: AtomicUsize::new(0),
            max_concurrent,
            paused: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });
        tokio::spawn(admission_loop(inner.clone()));
        Self { inner }
    }

    /// Registers `produce` at `priority` and returns a handle that
    /// completes with its outcome, or with `Cancelled` if `cancel` fires
    /// before or during execution. Dropping every clone of the returned
    /// handle without having observed a result also cancels `cancel`, so the
    /// queue can reclaim the slot.
    pub fn enqueue<F, Fut>(&self, priority: Priority, cancel: CancelToken, produce: F) -> QueueHandle<T>
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        if self.inner.shutting_down.load(AtomicOrdering::SeqCst) {
            let _ = result_tx.send(Err(HttpSchedError::Cancelled));
            return QueueHandle { rx: result_rx, cancel, taken: false };
        }

        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::SeqCst);
        let settled = Arc::new(Notify::new());
        let op = PendingOp {
            priority,
            seq,
            cancel: cancel.clone(),
            produce: Box::new(move |c| Box::pin(produce(c))),
            result_tx,
            settled: settled.clone(),
        };
        self.inner.heap.lock().expect("queue heap mutex poisoned").push(op);
        self.inner.notify.notify_waiters();

        // Bounds the op's presence in the Pending set to its cancel signal:
        // if cancelled before admission, pull it straight out of the heap
        // rather than waiting for the admission loop to eventually visit it.
        let watch_cancel = cancel.clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watch_cancel.cancelled() => {
                    let mut heap = inner.heap.lock().expect("queue heap mutex poisoned");
                    if let Some(idx) = heap.iter().position(|o| o.seq == seq) {
                        let mut items: Vec<_> = std::mem::take(&mut *heap).into_vec();
                        let op = items.swap_remove(idx);
                        *heap = BinaryHeap::from(items);
                        drop(heap);
                        let _ = op.result_tx.send(Err(HttpSchedError::Cancelled));
                    }
                }
                _ = settled.notified() => {}
            }
        });

        QueueHandle { rx: result_rx, cancel, taken: false }
    }

    /// Stops admitting new operations; operations already `Running` continue.
    pub fn pause(&self) {
        self.inner.paused.store(true, AtomicOrdering::SeqCst);
    }

    /// Resumes admission after [`Self::pause`].
    pub fn resume(&self) {
        self.inner.paused.store(false, AtomicOrdering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Stops accepting new operations. If `drain` is `false`, every
    /// currently `Pending` operation is cancelled immediately instead of
    /// waiting to be admitted.
    pub fn shutdown(&self, drain: bool) {
        self.inner.shutting_down.store(true, AtomicOrdering::SeqCst);
        if !drain {
            let mut heap = self.inner.heap.lock().expect("queue heap mutex poisoned");
            for op in std::mem::take(&mut *heap).into_vec() {
                op.cancel.cancel();
                let _ = op.result_tx.send(Err(HttpSchedError::Cancelled));
            }
        }
        self.inner.notify.notify_waiters();
    }

    /// Number of operations currently `Running`. Exposed for tests.
    pub fn running_count(&self) -> usize {
        self.inner.running.load(AtomicOrdering::SeqCst)
    }
}

async fn admission_loop<T: Send + 'static>(inner: Arc<QueueInner<T>>) {
    loop {
        if inner.shutting_down.load(AtomicOrdering::SeqCst) && inner.heap.lock().expect("queue heap mutex poisoned").is_empty() {
            return;
        }

        let op = {
            let mut heap = inner.heap.lock().expect("queue heap mutex poisoned");
            if inner.paused.load(AtomicOrdering::SeqCst) {
                None
            } else if inner.running.load(AtomicOrdering::SeqCst) < inner.max_concurrent {
                heap.pop()
            } else {
                None
            }
        };

        let Some(op) = op else {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            notified.await;
            continue;
        };

        op.settled.notify_waiters();
        if op.cancel.is_cancelled() {
            let _ = op.result_tx.send(Err(HttpSchedError::Cancelled));
            continue;
        }

        inner.running.fetch_add(1, AtomicOrdering::SeqCst);
        let inner_for_task = inner.clone();
        tokio::spawn(async move {
            let outcome = (op.produce)(op.cancel).await;
            let _ = op.result_tx.send(outcome);
            inner_for_task.running.fetch_sub(1, AtomicOrdering::SeqCst);
            inner_for_task.notify.notify_waiters();
        });
    }
}

/// The result handle returned by [`PriorityQueue::enqueue`].
///
/// Dropping the handle before it resolves cancels the underlying operation:
/// dropping all observers propagates cancellation.
pub struct QueueHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
    cancel: CancelToken,
    taken: bool,
}

impl<T> std::fmt::Debug for QueueHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle").field("taken", &self.taken).finish()
    }
}

impl<T> Future for QueueHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                self.taken = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                self.taken = true;
                Poll::Ready(Err(HttpSchedError::Cancelled))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for QueueHandle<T> {
    fn drop(&mut self) {
        if !self.taken {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Barrier;

    fn produce_value(v: u32) -> impl FnOnce(CancelToken) -> BoxFuture<'static, Result<u32>> {
        move |_cancel: CancelToken| Box::pin(async move { Ok(v) })
    }

    #[tokio::test]
    async fn admits_in_priority_then_fifo_order() {
        let queue: PriorityQueue<u32> = PriorityQueue::new(1);
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        let barrier = Arc::new(Barrier::new(2));
        let b = barrier.clone();
        // Occupy the single slot so the next three enqueues all start Pending.
        let hold = queue.enqueue(Priority(0), CancelToken::new(), move |_c| {
            Box::pin(async move {
                b.wait().await;
                Ok(0u32)
            })
        });

        let o1 = order.clone();
        let low = queue.enqueue(Priority(1), CancelToken::new(), move |c| {
            let o = o1;
            Box::pin(async move {
                let v = produce_value(1)(c).await;
                o.lock().unwrap().push(1);
                v
            })
        });
        let o2 = order.clone();
        let high = queue.enqueue(Priority(10), CancelToken::new(), move |c| {
            let o = o2;
            Box::pin(async move {
                let v = produce_value(2)(c).await;
                o.lock().unwrap().push(2);
                v
            })
        });

        tokio::task::yield_now().await;
        barrier.wait().await;
        assert_eq!(hold.await.unwrap(), 0);
        assert_eq!(high.await.unwrap(), 2);
        assert_eq!(low.await.unwrap(), 1);
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[tokio::test]
    async fn bounded_concurrency_is_respected() {
        let queue: PriorityQueue<u32> = PriorityQueue::new(4);
        let running = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for i in 0..8 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(queue.enqueue(Priority(i), CancelToken::new(), move |_c| {
                Box::pin(async move {
                    let now = running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                    tokio::task::yield_now().await;
                    running.fetch_sub(1, AtomicOrdering::SeqCst);
                    Ok(i as u32)
                })
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_seen.load(AtomicOrdering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn pending_cancel_completes_without_running() {
        let queue: PriorityQueue<u32> = PriorityQueue::new(1);
        let barrier = Arc::new(Barrier::new(2));
        let b = barrier.clone();
        let _hold = queue.enqueue(Priority(0), CancelToken::new(), move |_c| {
            Box::pin(async move {
                b.wait().await;
                Ok(0u32)
            })
        });

        let cancel = CancelToken::new();
        let pending = queue.enqueue(Priority(0), cancel.clone(), |_c| Box::pin(async { Ok(99u32) }));
        tokio::task::yield_now().await;
        cancel.cancel();
        let result = pending.await;
        assert!(matches!(result, Err(HttpSchedError::Cancelled)));
        barrier.wait().await;
    }
}
