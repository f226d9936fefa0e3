#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! A priority-scheduled HTTP request engine with an in-flight deduplication
//! table and an ETag/Last-Modified validating response cache.
//!
//! Three pieces, each usable on its own:
//!
//! - [`queue::PriorityQueue`] — bounded concurrent execution of async
//!   operations ordered by caller priority.
//! - [`scheduler::HttpScheduler`] — layers retry, a process-wide byte
//!   budget, group cancellation, and a two-stage fetch (headers, then a
//!   conditionally-skipped body read) on top of a queue.
//! - [`cache::CachingHttpScheduler`] — layers in-flight request
//!   deduplication and a validating HTTP response cache on top of a
//!   scheduler.
//!
//! This crate does not ship a real network client or a persistent database;
//! both are narrow injected traits ([`transport::Transport`] and
//! [`cache::store::BlobStore`]) so applications can plug in whatever they
//! already use for each.
//!
//! ## Basic usage
//!
//! ```no_run
//! use httpsched::{CachingHttpScheduler, Priority};
//! # async fn run(transport: impl httpsched::Transport, request: httpsched::TransportRequest) -> httpsched::Result<()> {
//! let scheduler = CachingHttpScheduler::new(transport, Default::default(), Default::default());
//! let outcome = scheduler
//!     .schedule(request, Priority::USER_INITIATED, None)
//!     .await?;
//! # let _ = (outcome.status, outcome.response_headers, outcome.body);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub mod cache;
pub mod cancel;
pub mod error;
pub mod priority;
pub mod queue;
pub mod rate_limiting;
pub mod scheduler;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use cache::{CacheOptions, CachingHttpScheduler};
pub use cancel::{CancelToken, GroupCancel};
pub use error::{HttpSchedError, Result};
pub use priority::Priority;
pub use queue::{PriorityQueue, QueueHandle};
pub use scheduler::{HttpScheduler, HttpSchedulerOptions};
pub use transport::{BodyStream, Transport, TransportRequest, TransportResponse};

/// HTTP headers as a case-insensitive multimap, matching how both
/// `response_headers` and `content_headers` are modeled throughout this
/// crate.
///
/// Keys are normalized to lowercase on every mutation, per RFC 7230 (a
/// header field name is case-insensitive).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HttpHeaders(HashMap<String, Vec<String>>);

impl HttpHeaders {
    /// Creates an empty header multimap.
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Replaces any existing values for `key` with a single `value`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into().to_ascii_lowercase(), vec![value.into()]);
    }

    /// Appends `value`, preserving any existing values for `key`.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into().to_ascii_lowercase()).or_default().push(value.into());
    }

    /// Returns the first value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).and_then(|v| v.first()).map(String::as_str)
    }

    /// Returns every value for `key`.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.0.get(&key.to_ascii_lowercase()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Removes `key` and all of its values.
    pub fn remove(&mut self, key: &str) {
        self.0.remove(&key.to_ascii_lowercase());
    }

    /// Returns whether `key` has any values.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_lowercase())
    }

    /// Iterates over every `(key, value)` pair, one entry per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }
}

impl From<&http::HeaderMap> for HttpHeaders {
    fn from(headers: &http::HeaderMap) -> Self {
        let mut out = HttpHeaders::new();
        for name in headers.keys() {
            for value in headers.get_all(name) {
                if let Ok(value) = value.to_str() {
                    out.append(name.as_str(), value);
                }
            }
        }
        out
    }
}
