//! The injected HTTP transport contract.
//!
//! `httpsched` ships no real-network client; callers provide a `Transport`
//! impl (e.g. wrapping `reqwest`/`hyper`) and tests use
//! [`crate::testing::MockTransport`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use http::{Method, Uri};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::HttpHeaders;

/// A chunked, cancellable body stream. Each item is one chunk of bytes as it
/// arrives; transport-level errors mid-stream fail the whole `schedule`
/// call.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// A request ready to be sent by a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HttpHeaders,
}

/// What a transport returns once headers have arrived. The body is not
/// drained yet — that only happens if `should_fetch_body` says so.
pub struct TransportResponse {
    pub status: u16,
    pub response_headers: HttpHeaders,
    pub content_headers: HttpHeaders,
    pub body: BodyStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("response_headers", &self.response_headers)
            .field("content_headers", &self.content_headers)
            .finish()
    }
}

/// The injected collaborator a caller supplies: `send(request, abort) →
/// (headers, body_stream)`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends `request`, honoring `cancel` for the duration of the call
    /// (including while the returned body stream is still being drained).
    async fn send(
        &self,
        request: &TransportRequest,
        cancel: CancelToken,
    ) -> Result<TransportResponse>;
}
