//! Conditional-GET helpers for JSON responses that change rarely.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};

/// Weak, process-stable quoted ETag of a response body.
pub fn compute_etag(body: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("\"{:x}\"", hasher.finish())
}

pub fn cache_control(max_age: u64, swr: u64) -> HeaderValue {
    HeaderValue::from_str(&format!("max-age={}, stale-while-revalidate={}", max_age, swr))
        .expect("cache-control header value should be valid")
}

/// True when `If-None-Match` lists `*` or `etag`.
pub fn if_none_match_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(|raw| raw.split(',').map(str::trim).any(|tag| tag == "*" || tag == etag))
        .unwrap_or(false)
}

/// 200 with `body` and an ETag, or an empty 304 when the client already
/// holds the same representation.
pub fn json_with_etag(body: Vec<u8>, request_headers: &HeaderMap, caching: HeaderValue) -> Response {
    let etag = compute_etag(&body);

    let (status, body) = if if_none_match_matches(request_headers, &etag) {
        (StatusCode::NOT_MODIFIED, Body::empty())
    } else {
        (StatusCode::OK, Body::from(body))
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CACHE_CONTROL, caching)
        .header(header::ETAG, etag.as_str());
    if status == StatusCode::OK {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }

    builder.body(body).expect("etag response should be valid")
}
