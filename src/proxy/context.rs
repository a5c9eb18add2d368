use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::Response;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use uuid::Uuid;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request state that flows through the layer pipeline.
///
/// The outbound request parts are mutable — layers rewrite headers in place
/// and the body stays buffered so the Sessions layer can re-dispatch the
/// same request on retry. Cross-layer values live in named, typed slots
/// rather than a string-keyed bag.
pub struct RequestContext {
    pub request_id: Uuid,
    /// Stable pseudonym for the downstream client; filled by the base layer.
    pub client_id: String,
    pub peer_addr: SocketAddr,

    pub method: Method,
    /// Absolute target URI.
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,

    /// The response travelling back through the pipeline; set by the
    /// executor or synthesized by a layer.
    pub response: Option<Response<BoxBody>>,

    pub start: Instant,
    pub upstream_elapsed: Option<Duration>,

    /// Pending session-creation handoff. Taken by the Sessions layer's
    /// `on_response`; dropping the sender without sending signals failure.
    pub session_handoff: Option<oneshot::Sender<String>>,
    /// Held while the request is inside the rate limiter; released on drop.
    pub rate_limit_permit: Option<OwnedSemaphorePermit>,
}

impl RequestContext {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client_id: String::new(),
            peer_addr,
            method,
            uri,
            headers,
            body,
            response: None,
            start: Instant::now(),
            upstream_elapsed: None,
            session_handoff: None,
            rate_limit_permit: None,
        }
    }

    /// Request host: the Host header, or the URI authority.
    pub fn host(&self) -> String {
        self.headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.to_string())
            .unwrap_or_else(|| {
                self.uri
                    .authority()
                    .map(|a| a.host().to_string())
                    .unwrap_or_default()
            })
    }

    pub fn user_agent(&self) -> &str {
        self.headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn response_status(&self) -> Option<StatusCode> {
        self.response.as_ref().map(|r| r.status())
    }

    /// Value of a response header, if the response is present and the value
    /// is valid UTF-8.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response
            .as_ref()
            .and_then(|r| r.headers().get(name))
            .and_then(|v| v.to_str().ok())
    }

    /// Whether the upstream flagged this response as a soft failure. Header
    /// lookup is case-insensitive; only a non-empty value counts.
    pub fn is_upstream_error(&self) -> bool {
        self.response_header(super::X_CRAWLERA_ERROR)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// Replace the response with a synthetic plain-text one.
    pub fn respond(&mut self, status: StatusCode, body: &str) {
        self.response = Some(
            Response::builder()
                .status(status)
                .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(full_body(body.to_string()))
                .expect("static response"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_context(uri: &str) -> RequestContext {
        RequestContext::new(
            Method::GET,
            uri.parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:40000".parse().unwrap(),
        )
    }

    #[test]
    fn test_host_prefers_header() {
        let mut ctx = test_context("https://example.com/path");
        assert_eq!(ctx.host(), "example.com");

        ctx.headers
            .insert(http::header::HOST, "other.com".parse().unwrap());
        assert_eq!(ctx.host(), "other.com");
    }

    #[test]
    fn test_upstream_error_detection() {
        let mut ctx = test_context("https://example.com/");
        assert!(!ctx.is_upstream_error());

        ctx.response = Some(
            Response::builder()
                .header("X-Crawlera-Error", "bad_session_id")
                .body(empty_body())
                .unwrap(),
        );
        assert!(ctx.is_upstream_error());

        ctx.response = Some(
            Response::builder()
                .header("x-crawlera-error", "banned")
                .body(empty_body())
                .unwrap(),
        );
        assert!(ctx.is_upstream_error());

        ctx.response = Some(
            Response::builder()
                .header("x-crawlera-error", "")
                .body(empty_body())
                .unwrap(),
        );
        assert!(!ctx.is_upstream_error());
    }

    #[test]
    fn test_respond_synthesizes() {
        let mut ctx = test_context("http://example.com/");
        ctx.respond(StatusCode::FORBIDDEN, "no");
        assert_eq!(ctx.response_status(), Some(StatusCode::FORBIDDEN));
    }
}
