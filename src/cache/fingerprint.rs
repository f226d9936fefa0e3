//! Request fingerprinting.

use http::Method;
use sha1::{Digest, Sha1};

use crate::HttpHeaders;

const PREFIX: &str = "HttpSchedulerCache_";

fn canonical_list(value: &str) -> String {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).collect::<Vec<_>>().join("|")
}

/// Derives the stable fingerprint for a request: SHA-1 over the absolute
/// URI, method, canonicalized `Accept`/`Accept-Encoding`, `Referer` (or the
/// `http://example` sentinel when absent), `User-Agent`, and `Authorization`
/// — in that fixed order — hex-encoded upper-case and prefixed with
/// `"HttpSchedulerCache_"`. Connection-varying headers (`Date`, `Host`,
/// cookies) never contribute, so the fingerprint is stable across process
/// restarts for semantically equivalent requests.
pub fn fingerprint(method: &Method, uri: &str, headers: &HttpHeaders) -> String {
    let mut hasher = Sha1::new();
    hasher.update(uri.as_bytes());
    hasher.update(b"\0");
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical_list(headers.get("accept").unwrap_or_default()).as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical_list(headers.get("accept-encoding").unwrap_or_default()).as_bytes());
    hasher.update(b"\0");
    hasher.update(headers.get("referer").unwrap_or("http://example").as_bytes());
    hasher.update(b"\0");
    hasher.update(headers.get("user-agent").unwrap_or_default().as_bytes());
    hasher.update(b"\0");
    hasher.update(headers.get("authorization").unwrap_or_default().as_bytes());

    format!("{PREFIX}{}", hex::encode_upper(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_pure_and_deterministic() {
        let mut headers = HttpHeaders::new();
        headers.insert("accept", "text/html, application/xml");
        let a = fingerprint(&Method::GET, "http://example/", &headers);
        let b = fingerprint(&Method::GET, "http://example/", &headers);
        assert_eq!(a, b);
        assert!(a.starts_with(PREFIX));
    }

    #[test]
    fn ignores_connection_varying_headers() {
        let mut h1 = HttpHeaders::new();
        h1.insert("host", "a.example");
        h1.insert("date", "Mon, 01 Jan 2024 00:00:00 GMT");
        let mut h2 = HttpHeaders::new();
        h2.insert("host", "b.example");
        h2.insert("date", "Tue, 02 Jan 2024 00:00:00 GMT");
        assert_eq!(
            fingerprint(&Method::GET, "http://example/", &h1),
            fingerprint(&Method::GET, "http://example/", &h2)
        );
    }

    #[test]
    fn differs_by_method() {
        let headers = HttpHeaders::new();
        assert_ne!(
            fingerprint(&Method::GET, "http://example/", &headers),
            fingerprint(&Method::POST, "http://example/", &headers)
        );
    }
}
