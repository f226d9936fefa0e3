//! A hand-rolled [`Transport`] test double.
//!
//! `httpsched` ships no real network client — the transport is an injected
//! trait — so the test double for it is a scripted implementation of the
//! trait itself, not a wrapped HTTP server (`mockito` et al. have nothing
//! to attach to here). Feature-gated behind `test-util` so downstream
//! crates can reuse it in their own tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream;
use futures::StreamExt;
use http::Method;

use crate::cancel::CancelToken;
use crate::error::{HttpSchedError, Result};
use crate::transport::{Transport, TransportRequest, TransportResponse};
use crate::HttpHeaders;

#[derive(Clone)]
enum Step {
    Response { status: u16, headers: HttpHeaders, body: Bytes },
    TransportError,
    Blocking,
}

struct Script {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
}

/// A scripted [`Transport`]: each `(method, uri)` pair is stubbed with one
/// or more [`Step`]s, consumed in order and then repeated from the last one.
#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    scripts: DashMap<(Method, String), Arc<Script>>,
}

impl MockTransport {
    /// Creates a transport with no stubs configured.
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, method: Method, uri: &str) -> Arc<Script> {
        self.scripts
            .entry((method, uri.to_string()))
            .or_insert_with(|| Arc::new(Script { steps: Mutex::new(VecDeque::new()), calls: AtomicU32::new(0) }))
            .clone()
    }

    /// Stubs a single fixed response for every call to `(method, uri)`.
    pub fn stub(&self, method: Method, uri: &str, status: u16, headers: HttpHeaders, body: Bytes) {
        self.script(method, uri).steps.lock().expect("mock transport mutex poisoned").push_back(Step::Response { status, headers, body });
    }

    /// Stubs a sequence of responses for successive calls to `(method,
    /// uri)`; the last response repeats once the sequence is exhausted.
    pub fn stub_sequence(&self, method: Method, uri: &str, responses: Vec<(u16, HttpHeaders, Bytes)>) {
        let script = self.script(method, uri);
        let mut steps = script.steps.lock().expect("mock transport mutex poisoned");
        for (status, headers, body) in responses {
            steps.push_back(Step::Response { status, headers, body });
        }
    }

    /// Stubs `(method, uri)` to fail with a transport-level error (eligible
    /// for `HttpScheduler`'s retry).
    pub fn stub_transport_error(&self, method: Method, uri: &str) {
        self.script(method, uri).steps.lock().expect("mock transport mutex poisoned").push_back(Step::TransportError);
    }

    /// Stubs `(method, uri)` to hang until the call is cancelled, then
    /// resolve with `Cancelled` — simulating cooperative cancellation
    /// forwarding into the transport.
    pub fn stub_blocking(&self, method: Method, uri: &str) {
        self.script(method, uri).steps.lock().expect("mock transport mutex poisoned").push_back(Step::Blocking);
    }

    /// Number of `send` calls observed for `(method, uri)`.
    pub fn calls(&self, method: Method, uri: &str) -> u32 {
        self.scripts.get(&(method, uri.to_string())).map(|s| s.calls.load(Ordering::SeqCst)).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &TransportRequest, cancel: CancelToken) -> Result<TransportResponse> {
        let key = (request.method.clone(), request.uri.to_string());
        let script = self.scripts.get(&key).map(|s| s.clone());
        let Some(script) = script else {
            return Err(HttpSchedError::Transport("no stub configured for this request".to_string().into()));
        };
        script.calls.fetch_add(1, Ordering::SeqCst);

        let step = {
            let mut steps = script.steps.lock().expect("mock transport mutex poisoned");
            if steps.len() > 1 {
                steps.pop_front().expect("non-empty")
            } else {
                steps.front().cloned().expect("mock transport stub queue is empty")
            }
        };

        match step {
            Step::Response { status, headers, body } => Ok(TransportResponse {
                status,
                response_headers: headers,
                content_headers: HttpHeaders::new(),
                body: stream::once(async move { Ok(body) }).boxed(),
            }),
            Step::TransportError => Err(HttpSchedError::Transport("mock transport error".to_string().into())),
            Step::Blocking => {
                cancel.cancelled().await;
                Err(HttpSchedError::Cancelled)
            }
        }
    }
}
