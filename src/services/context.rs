//! Immutable request context and sub-request derivation.
//!
//! Every sub-request the pipeline issues (access checks, link follows,
//! listings, copies) is derived from the incoming request with [`
//! RequestContext::derive`], a pure function. Nothing mutates shared request
//! state, so headers can never leak between a request and its sub-requests
//! except through the explicit allow-through below.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use bytes::Bytes;

/// Header carrying the caller's identity; propagated to every sub-request.
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// The `COPY` verb used for server-side content duplication.
pub fn copy_method() -> Method {
    Method::from_bytes(b"COPY").expect("static method token")
}

/// One request as seen by the pipeline. Cloning is cheap enough at this
/// scale; bodies are reference-counted `Bytes`.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RequestContext {
    pub fn new(
        method: Method,
        path: impl Into<String>,
        query: Option<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            query,
            headers,
            body,
        }
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.header(AUTH_TOKEN_HEADER)
    }

    /// Derive a sub-request context for `method` against `path`.
    ///
    /// The caller's headers are carried over minus transport framing
    /// (Content-Length, Transfer-Encoding), the engine's own `X-Trigger-*`
    /// surface, and Destination, none of which may escape into sub-requests.
    /// The body starts empty; use [`RequestContext::with_body`] to attach
    /// one.
    pub fn derive(&self, method: Method, path: impl Into<String>) -> Self {
        let mut headers = self.headers.clone();
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove("destination");

        let engine_headers: Vec<HeaderName> = headers
            .keys()
            .filter(|name| name.as_str().starts_with("x-trigger-"))
            .cloned()
            .collect();
        for name in engine_headers {
            headers.remove(&name);
        }

        Self {
            method,
            path: path.into(),
            query: None,
            headers,
            body: Bytes::new(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert("x-auth-token", HeaderValue::from_static("tk"));
        headers.insert("x-trigger-assign-on-read", HeaderValue::from_static("noop"));
        headers.insert("x-trigger-link-to", HeaderValue::from_static("c/o"));
        headers.insert("destination", HeaderValue::from_static("c/moved"));
        headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        RequestContext::new(
            Method::PUT,
            "/v1/a/c/o",
            None,
            headers,
            Bytes::from_static(b"body"),
        )
    }

    #[test]
    fn derive_strips_engine_and_framing_headers() {
        let sub = base().derive(Method::HEAD, "/v1/a/c/other");
        assert_eq!(sub.method, Method::HEAD);
        assert_eq!(sub.path, "/v1/a/c/other");
        assert_eq!(sub.auth_token(), Some("tk"));
        assert!(sub.header("x-trigger-assign-on-read").is_none());
        assert!(sub.header("x-trigger-link-to").is_none());
        assert!(sub.header("destination").is_none());
        assert!(sub.headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(sub.body.is_empty());
    }

    #[test]
    fn derive_does_not_touch_the_original() {
        let ctx = base();
        let _sub = ctx.derive(Method::GET, "/v1/a/c/x");
        assert!(ctx.header("x-trigger-link-to").is_some());
        assert_eq!(ctx.body, Bytes::from_static(b"body"));
    }
}
