//! Error types surfaced by the queue, scheduler, and cache layers.

use miette::Diagnostic;
use thiserror::Error;

/// A `Result` typedef to use with [`HttpSchedError`].
pub type Result<T> = std::result::Result<T, HttpSchedError>;

/// Errors surfaced to callers of [`crate::queue::PriorityQueue`],
/// [`crate::scheduler::HttpScheduler`], and
/// [`crate::cache::CachingHttpScheduler`].
///
/// Per the error handling design, a non-retried HTTP status (including
/// 4xx/5xx) is never one of these variants — it is surfaced on the `Ok`
/// path as [`crate::scheduler::ScheduleOutcome::status`], for the caller to
/// interpret. Only [`HttpSchedError::Transport`] is ever retried.
#[derive(Error, Diagnostic, Debug)]
pub enum HttpSchedError {
    /// The byte ceiling set by `reset_limit` has been reached; the transport
    /// was never contacted.
    #[error("byte budget exhausted")]
    #[diagnostic(code(httpsched::budget_exhausted))]
    BudgetExhausted,

    /// An IO/connection-level failure from the transport, after retries (if
    /// any) were exhausted. This is the only kind `HttpScheduler` retries.
    #[error("transport error: {0}")]
    #[diagnostic(code(httpsched::transport))]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Caller cancellation, group cancellation, or predicate-induced early
    /// termination.
    #[error("operation cancelled")]
    #[diagnostic(code(httpsched::cancelled))]
    Cancelled,

    /// The injected entry store failed. Reads degrade to a cache miss; writes
    /// are logged and otherwise ignored (the response is still returned).
    #[error("store unavailable: {0}")]
    #[diagnostic(code(httpsched::store_unavailable))]
    StoreUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Error constructing or parsing an `http` type.
    #[error(transparent)]
    #[diagnostic(code(httpsched::http))]
    Http(#[from] http::Error),

    /// Error parsing a request/response URL.
    #[error(transparent)]
    #[diagnostic(code(httpsched::invalid_url))]
    InvalidUrl(#[from] url::ParseError),

    /// Error converting a header value to a string.
    #[error(transparent)]
    #[diagnostic(code(httpsched::header_to_str))]
    HeaderToStr(#[from] http::header::ToStrError),

    /// Error parsing a header value.
    #[error(transparent)]
    #[diagnostic(code(httpsched::invalid_header_value))]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Error (de)serializing a cache entry.
    #[error(transparent)]
    #[diagnostic(code(httpsched::postcard))]
    Postcard(#[from] postcard::Error),

    /// Error from the `cacache`-backed store.
    #[cfg(feature = "store-cacache")]
    #[error(transparent)]
    #[diagnostic(code(httpsched::cacache))]
    CaCache(#[from] cacache::Error),

    /// A malformed or unparsable header was encountered where a well-formed
    /// one was required (e.g. while building the request fingerprint).
    #[error("malformed header")]
    #[diagnostic(code(httpsched::bad_header))]
    BadHeader,
}

impl Clone for HttpSchedError {
    /// Cloning a transport/store error loses the original cause and keeps
    /// only its rendered message; used so a single terminal error can be
    /// handed to every waiter on a dedup-table entry (see
    /// [`crate::cache::dedup`]).
    fn clone(&self) -> Self {
        match self {
            Self::BudgetExhausted => Self::BudgetExhausted,
            Self::Transport(e) => Self::Transport(e.to_string().into()),
            Self::Cancelled => Self::Cancelled,
            Self::StoreUnavailable(e) => {
                Self::StoreUnavailable(e.to_string().into())
            }
            Self::Http(e) => Self::Transport(e.to_string().into()),
            Self::InvalidUrl(e) => Self::Transport(e.to_string().into()),
            Self::HeaderToStr(e) => Self::Transport(e.to_string().into()),
            Self::InvalidHeaderValue(e) => {
                Self::Transport(e.to_string().into())
            }
            Self::Postcard(e) => Self::StoreUnavailable(e.to_string().into()),
            #[cfg(feature = "store-cacache")]
            Self::CaCache(e) => Self::StoreUnavailable(e.to_string().into()),
            Self::BadHeader => Self::BadHeader,
        }
    }
}
