//! Cache entries, freshness, and validation.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::HttpHeaders;

fn cache_control_directives(headers: &HttpHeaders) -> Vec<String> {
    headers
        .get("cache-control")
        .map(|v| v.split(',').map(|d| d.trim().to_ascii_lowercase()).collect())
        .unwrap_or_default()
}

fn cache_control_has(headers: &HttpHeaders, directive: &str) -> bool {
    cache_control_directives(headers).iter().any(|d| d == directive)
}

fn cache_control_max_age(headers: &HttpHeaders) -> Option<u64> {
    cache_control_directives(headers).iter().find_map(|d| d.strip_prefix("max-age=")?.parse().ok())
}

/// A persisted response record, keyed by request fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The stored `ETag`, if the response carried one.
    pub etag: Option<String>,
    /// The stored `Last-Modified`, as the raw HTTP-date string, if present.
    pub last_modified: Option<String>,
    /// The response status at insert time.
    pub status: u16,
    /// Response headers, as received.
    pub response_headers: HttpHeaders,
    /// Content-related headers, as received.
    pub content_headers: HttpHeaders,
    /// The response body.
    pub body: Vec<u8>,
    /// `true` iff no freshness horizon was computable at insert, so every
    /// lookup must conditionally revalidate.
    pub must_revalidate: bool,
    /// Absolute freshness deadline, if one was computable.
    pub expiry: Option<SystemTime>,
    /// When this entry was stored.
    pub inserted_at: SystemTime,
}

/// The freshness horizon for a response: `now + max-age` if `Cache-Control`
/// carries one, else the parsed `Expires` date, else
/// `(None, must_revalidate = true)`.
pub(crate) fn freshness_horizon(headers: &HttpHeaders, now: SystemTime) -> (Option<SystemTime>, bool) {
    if let Some(max_age) = cache_control_max_age(headers) {
        (Some(now + Duration::from_secs(max_age)), false)
    } else if let Some(expires) = headers.get("expires").and_then(|v| httpdate::parse_http_date(v).ok()) {
        (Some(expires), false)
    } else {
        (None, true)
    }
}

impl CacheEntry {
    /// Builds an entry from a freshly fetched response, computing the
    /// freshness horizon: `now + max-age`, else `Expires`, else
    /// `must_revalidate = true` with no expiry.
    pub fn from_response(
        status: u16,
        response_headers: HttpHeaders,
        content_headers: HttpHeaders,
        body: Vec<u8>,
        now: SystemTime,
    ) -> Self {
        let (expiry, must_revalidate) = freshness_horizon(&response_headers, now);

        Self {
            etag: response_headers.get("etag").map(str::to_string),
            last_modified: response_headers.get("last-modified").map(str::to_string),
            status,
            body,
            must_revalidate,
            expiry,
            inserted_at: now,
            response_headers,
            content_headers,
        }
    }

    /// Whether a response with this status/headers may be cached at all.
    pub fn cacheable(status: u16, headers: &HttpHeaders) -> bool {
        if !(200..400).contains(&status) {
            return false;
        }
        !cache_control_has(headers, "no-store")
    }

    /// Whether this entry must be conditionally revalidated before serving,
    /// accounting both for the flag set at insert time and for the
    /// freshness horizon having since elapsed.
    pub fn needs_revalidation(&self, now: SystemTime) -> bool {
        self.must_revalidate || matches!(self.expiry, Some(expiry) if now >= expiry)
    }

    /// True when the response's `ETag` (if any) matches this entry's, and
    /// the response's `Last-Modified` (if any) is no newer than this
    /// entry's — vacuously true when the corresponding header is absent on
    /// the response. A `304` status is treated as an unconditional match.
    pub fn use_cached_data(&self, status: u16, headers: &HttpHeaders) -> bool {
        if status == 304 {
            return true;
        }

        let etag_matches = match headers.get("etag") {
            Some(response_etag) => self.etag.as_deref() == Some(response_etag),
            None => true,
        };
        if !etag_matches {
            return false;
        }

        match headers.get("last-modified") {
            Some(response_lm) => match (self.last_modified.as_deref().and_then(|s| httpdate::parse_http_date(s).ok()), httpdate::parse_http_date(response_lm).ok()) {
                (Some(stored), Some(response)) => response <= stored,
                _ => true,
            },
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(pairs: &[(&str, &str)]) -> HttpHeaders {
        let mut h = HttpHeaders::new();
        for (k, v) in pairs {
            h.insert(*k, *v);
        }
        h
    }

    #[test]
    fn max_age_sets_absolute_expiry_and_clears_must_revalidate() {
        let now = SystemTime::UNIX_EPOCH;
        let headers = headers_with(&[("cache-control", "max-age=60")]);
        let entry = CacheEntry::from_response(200, headers, HttpHeaders::new(), b"hello".to_vec(), now);
        assert!(!entry.must_revalidate);
        assert_eq!(entry.expiry, Some(now + Duration::from_secs(60)));
        assert!(!entry.needs_revalidation(now + Duration::from_secs(30)));
        assert!(entry.needs_revalidation(now + Duration::from_secs(61)));
    }

    #[test]
    fn no_freshness_header_forces_must_revalidate() {
        let now = SystemTime::now();
        let entry = CacheEntry::from_response(200, headers_with(&[("etag", "\"abc\"")]), HttpHeaders::new(), b"hi".to_vec(), now);
        assert!(entry.must_revalidate);
        assert!(entry.expiry.is_none());
        assert!(entry.needs_revalidation(now));
    }

    #[test]
    fn use_cached_data_matches_on_equal_etag() {
        let now = SystemTime::now();
        let entry = CacheEntry::from_response(200, headers_with(&[("etag", "\"abc\"")]), HttpHeaders::new(), b"hi".to_vec(), now);
        assert!(entry.use_cached_data(200, &headers_with(&[("etag", "\"abc\"")])));
        assert!(!entry.use_cached_data(200, &headers_with(&[("etag", "\"xyz\"")])));
    }

    #[test]
    fn status_304_is_always_a_match() {
        let now = SystemTime::now();
        let entry = CacheEntry::from_response(200, HttpHeaders::new(), HttpHeaders::new(), b"hi".to_vec(), now);
        assert!(entry.use_cached_data(304, &HttpHeaders::new()));
    }

    #[test]
    fn no_store_is_not_cacheable() {
        assert!(!CacheEntry::cacheable(200, &headers_with(&[("cache-control", "no-store")])));
        assert!(CacheEntry::cacheable(200, &HttpHeaders::new()));
        assert!(!CacheEntry::cacheable(404, &HttpHeaders::new()));
        assert!(!CacheEntry::cacheable(500, &HttpHeaders::new()));
    }
}
