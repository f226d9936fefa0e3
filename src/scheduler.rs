//! HTTP Scheduler (component B): turns `(request, priority)` into
//! `(status, headers, body)` under admission, retry, byte budget, and group
//! cancellation.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::StreamExt;
use log::debug;

use crate::cancel::{CancelToken, GroupCancel};
use crate::error::{HttpSchedError, Result};
use crate::priority::Priority;
use crate::queue::PriorityQueue;
use crate::transport::{Transport, TransportRequest};
use crate::HttpHeaders;

/// Caller-supplied gate invoked once response headers (and status) arrive;
/// returning `false` skips the body read entirely.
/// Defaults to always reading the body. `httpsched::cache` also uses this
/// to fold in its own "is the cached copy still valid" decision, so the
/// predicate sees status as well as headers.
pub type ShouldFetchBody = Arc<dyn Fn(u16, &HttpHeaders) -> bool + Send + Sync>;

/// The terminal, successful result of a [`HttpScheduler::schedule`] call.
///
/// Any HTTP status — including 4xx/5xx — is surfaced here as `Ok`; those
/// are not errors at this layer.
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    /// The response status code.
    pub status: u16,
    /// Response headers, as received.
    pub response_headers: HttpHeaders,
    /// Content-related headers (e.g. `Content-Type`, `Content-Length`), as
    /// received.
    pub content_headers: HttpHeaders,
    /// The response body, or empty if `should_fetch_body` rejected it.
    pub body: Bytes,
    /// Whether the body was actually drained from the transport, as opposed
    /// to being left empty because `should_fetch_body` returned `false`.
    /// Lets `httpsched::cache` tell "legitimately zero-length body" apart
    /// from "body intentionally not read".
    pub body_fetched: bool,
}

/// A future returned by [`HttpScheduler::schedule`]. Dropping it before it
/// resolves cancels the underlying queued operation.
pub type ScheduleFuture = Pin<Box<dyn Future<Output = Result<ScheduleOutcome>> + Send>>;

/// Immutable configuration for a [`HttpScheduler`].
#[derive(Debug, Clone)]
pub struct HttpSchedulerOptions {
    /// Maximum number of concurrently `Running` transport sends.
    pub max_concurrent: usize,
    /// Added to every caller-supplied [`Priority`] before enqueuing.
    pub priority_base: i32,
    /// Number of retries on transport-level errors. `0` disables retry.
    pub retry_count: u32,
}

impl Default for HttpSchedulerOptions {
    fn default() -> Self {
        Self { max_concurrent: 4, priority_base: 0, retry_count: 3 }
    }
}

struct BudgetState {
    bytes_read: u64,
    max_bytes: Option<u64>,
}

/// Component B: wraps a [`PriorityQueue`] with retry, a process-wide byte
/// budget, and group cancellation.
pub struct HttpScheduler<T> {
    transport: Arc<T>,
    queue: PriorityQueue<ScheduleOutcome>,
    options: HttpSchedulerOptions,
    budget: Arc<Mutex<BudgetState>>,
    group_cancel: Arc<GroupCancel>,
}

impl<T> std::fmt::Debug for HttpScheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpScheduler").field("options", &self.options).field("queue", &self.queue).finish()
    }
}

impl<T: Transport> HttpScheduler<T> {
    /// Creates a scheduler over `transport` with `options`, and a queue
    /// admitting at most `options.max_concurrent` operations.
    pub fn new(transport: T, options: HttpSchedulerOptions) -> Self {
        let queue = PriorityQueue::new(options.max_concurrent);
        Self {
            transport: Arc::new(transport),
            queue,
            options,
            budget: Arc::new(Mutex::new(BudgetState { bytes_read: 0, max_bytes: None })),
            group_cancel: Arc::new(GroupCancel::new()),
        }
    }

    /// Zeroes `bytes_read` and sets the byte ceiling, atomically with
    /// respect to concurrent `schedule` calls.
    pub fn reset_limit(&self, max_bytes: Option<u64>) {
        let mut budget = self.budget.lock().expect("budget mutex poisoned");
        budget.bytes_read = 0;
        budget.max_bytes = max_bytes;
    }

    /// Broadcasts cancellation to every current subscriber and poisons the
    /// group against new ones until [`Self::reset_limit`]'s companion
    /// `reset()` call — see [`GroupCancel`] for the exact poisoning policy.
    pub fn cancel_all(&self) {
        self.group_cancel.cancel_all();
    }

    /// Un-poisons the group after a prior [`Self::cancel_all`], so newly
    /// scheduled operations are no longer born cancelled.
    pub fn reset_group_cancel(&self) {
        self.group_cancel.reset();
    }

    /// Current count of `Running` transport sends. Exposed for tests.
    pub fn running_count(&self) -> usize {
        self.queue.running_count()
    }

    /// Turns `request` into `(status, headers, body)` under admission,
    /// retry, and the byte budget.
    pub fn schedule(
        &self,
        request: TransportRequest,
        priority: Priority,
        should_fetch_body: Option<ShouldFetchBody>,
    ) -> ScheduleFuture {
        {
            let budget = self.budget.lock().expect("budget mutex poisoned");
            if let Some(max_bytes) = budget.max_bytes {
                if budget.bytes_read >= max_bytes {
                    debug!("httpsched: budget exhausted, rejecting schedule without transport contact");
                    return Box::pin(async { Err(HttpSchedError::BudgetExhausted) });
                }
            }
        }

        let transport = self.transport.clone();
        let budget = self.budget.clone();
        let retry_count = self.options.retry_count;
        let queue_priority = Priority(self.options.priority_base) + priority;
        let queue = self.queue.clone();
        // `request_cancel` is this call's own signal: dropping the returned
        // future before it resolves cancels only this operation. The group
        // token is a separate subscription so one caller discarding its
        // handle never cancels unrelated in-flight calls.
        let request_cancel = CancelToken::new();
        let group_token = self.group_cancel.subscribe();

        Box::pin(async move {
            let handle = queue.enqueue(queue_priority, request_cancel.clone(), move |op_cancel| {
                run_with_retry(transport, request, should_fetch_body, budget, retry_count, op_cancel)
            });
            tokio::pin!(handle);

            tokio::select! {
                result = &mut handle => result,
                _ = group_token.cancelled() => {
                    request_cancel.cancel();
                    Err(HttpSchedError::Cancelled)
                }
            }
        })
    }
}

fn run_with_retry<T: Transport>(
    transport: Arc<T>,
    request: TransportRequest,
    should_fetch_body: Option<ShouldFetchBody>,
    budget: Arc<Mutex<BudgetState>>,
    retry_count: u32,
    cancel: CancelToken,
) -> BoxFuture<'static, Result<ScheduleOutcome>> {
    Box::pin(async move {
        let mut attempt = 0;
        loop {
            let outcome = run_once(&transport, &request, should_fetch_body.as_ref(), &budget, cancel.clone()).await;
            match outcome {
                Err(HttpSchedError::Transport(e)) if attempt < retry_count => {
                    attempt += 1;
                    debug!("httpsched: transport error on attempt {attempt}, retrying ({e})");
                    continue;
                }
                other => return other,
            }
        }
    })
}

async fn run_once<T: Transport>(
    transport: &T,
    request: &TransportRequest,
    should_fetch_body: Option<&ShouldFetchBody>,
    budget: &Arc<Mutex<BudgetState>>,
    cancel: CancelToken,
) -> Result<ScheduleOutcome> {
    let response = transport.send(request, cancel.clone()).await?;
    let status = response.status;
    let response_headers = response.response_headers;
    let content_headers = response.content_headers;

    let fetch_body = should_fetch_body.map(|f| f(status, &response_headers)).unwrap_or(true);
    if !fetch_body {
        drop(response.body);
        return Ok(ScheduleOutcome { status, response_headers, content_headers, body: Bytes::new(), body_fetched: false });
    }

    let mut body = response.body;
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        if cancel.is_cancelled() {
            return Err(HttpSchedError::Cancelled);
        }
        let chunk = chunk?;
        buf.extend_from_slice(&chunk);
    }
    {
        let mut budget = budget.lock().expect("budget mutex poisoned");
        budget.bytes_read = budget.bytes_read.saturating_add(buf.len() as u64);
    }

    Ok(ScheduleOutcome { status, response_headers, content_headers, body: buf.freeze(), body_fetched: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use http::Method;

    fn get_request(uri: &str) -> TransportRequest {
        TransportRequest { method: Method::GET, uri: uri.parse().unwrap(), headers: HttpHeaders::new() }
    }

    #[tokio::test]
    async fn simple_success_returns_status_and_body() {
        let transport = MockTransport::new();
        transport.stub(Method::GET, "http://example/", 200, HttpHeaders::new(), Bytes::from_static(b"foo"));
        let scheduler = HttpScheduler::new(transport, HttpSchedulerOptions::default());
        let outcome = scheduler.schedule(get_request("http://example/"), Priority::USER_INITIATED, None).await.unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body.len(), 3);
    }

    #[tokio::test]
    async fn budget_exhausted_rejects_without_transport_contact() {
        let transport = MockTransport::new();
        transport.stub(Method::GET, "http://example/", 200, HttpHeaders::new(), Bytes::from_static(b"foo"));
        let scheduler = HttpScheduler::new(transport, HttpSchedulerOptions::default());
        scheduler.reset_limit(Some(0));
        let result = scheduler.schedule(get_request("http://example/"), Priority::USER_INITIATED, None).await;
        assert!(matches!(result, Err(HttpSchedError::BudgetExhausted)));
        assert_eq!(scheduler.running_count(), 0);
    }

    #[tokio::test]
    async fn predicate_rejected_body_is_empty_and_bytes_read_unchanged() {
        let transport = MockTransport::new();
        transport.stub(Method::GET, "http://example/", 200, HttpHeaders::new(), Bytes::from_static(b"foo"));
        let scheduler = HttpScheduler::new(transport, HttpSchedulerOptions::default());
        let reject: ShouldFetchBody = Arc::new(|_status, _headers| false);
        let outcome = scheduler
            .schedule(get_request("http://example/"), Priority::USER_INITIATED, Some(reject))
            .await
            .unwrap();
        assert_eq!(outcome.body.len(), 0);
        scheduler.reset_limit(Some(1));
        let result = scheduler.schedule(get_request("http://example/"), Priority::USER_INITIATED, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn group_cancel_completes_current_and_future_calls_until_reset() {
        let transport = MockTransport::new();
        transport.stub_blocking(Method::GET, "http://example/slow");
        let scheduler = Arc::new(HttpScheduler::new(transport, HttpSchedulerOptions { max_concurrent: 4, ..Default::default() }));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler.schedule(get_request("http://example/slow"), Priority::USER_INITIATED, None).await
            }));
        }
        tokio::task::yield_now().await;
        scheduler.cancel_all();
        for h in handles {
            assert!(matches!(h.await.unwrap(), Err(HttpSchedError::Cancelled)));
        }

        let result = scheduler.schedule(get_request("http://example/slow"), Priority::USER_INITIATED, None).await;
        assert!(matches!(result, Err(HttpSchedError::Cancelled)));

        scheduler.reset_group_cancel();
    }
}
