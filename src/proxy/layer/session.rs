use crate::error::ProxyError;
use crate::proxy::context::RequestContext;
use crate::proxy::executor::Executor;
use crate::proxy::session_manager::{SessionGrant, SessionManager};
use crate::proxy::X_CRAWLERA_SESSION;
use crate::stats::Stats;
use dashmap::DashMap;
use http::HeaderValue;
use std::sync::Arc;
use tracing::{info, warn};

const CREATE_SESSION: &str = "create";

/// Per-client session management: hands every request a live session token,
/// creates sessions on demand through single-use handoff channels, and
/// retries a request once when the upstream reports its session broken.
pub struct SessionsLayer {
    clients: DashMap<String, SessionManager>,
    api_key: String,
    crawlera_addr: String,
    executor: Executor,
    stats: Arc<Stats>,
}

impl SessionsLayer {
    pub fn new(
        api_key: String,
        crawlera_addr: String,
        executor: Executor,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            clients: DashMap::new(),
            api_key,
            crawlera_addr,
            executor,
            stats,
        }
    }

    /// Coordinator handle for one client; insertion is atomic with the task
    /// spawn, so concurrent first requests share one coordinator.
    fn manager_for(&self, client_id: &str) -> SessionManager {
        self.clients
            .entry(client_id.to_string())
            .or_insert_with(|| {
                SessionManager::spawn(self.api_key.clone(), self.crawlera_addr.clone())
            })
            .clone()
    }

    pub async fn on_request(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        let manager = self.manager_for(&ctx.client_id);

        match manager.acquire(false).await {
            Some(SessionGrant::Token(token)) => set_session_header(ctx, &token),
            Some(SessionGrant::Create(handoff)) => {
                set_session_header(ctx, CREATE_SESSION);
                ctx.session_handoff = Some(handoff);
            }
            None => {}
        }

        Ok(())
    }

    pub async fn on_response(
        &self,
        ctx: &mut RequestContext,
        err: Option<ProxyError>,
    ) -> Option<ProxyError> {
        // Taking the handoff here guarantees it is resolved on every path:
        // a drop without a send tells the coordinator the creation failed.
        let handoff = ctx.session_handoff.take();

        if err.is_some() {
            return err;
        }

        if !ctx.is_upstream_error() {
            if let Some(handoff) = handoff {
                self.publish_created_session(ctx, handoff);
            }
            return None;
        }

        drop(handoff);
        self.retry_with_replacement(ctx).await
    }

    /// A `"create"` dispatch succeeded: pass the token the upstream returned
    /// to the coordinator.
    fn publish_created_session(&self, ctx: &RequestContext, handoff: tokio::sync::oneshot::Sender<String>) {
        match ctx.response_header(X_CRAWLERA_SESSION) {
            Some(token) if !token.is_empty() => {
                let token = token.to_string();
                let _ = handoff.send(token.clone());
                self.stats.new_session_created();
                metrics::counter!("headless_proxy_sessions_created_total").increment(1);
                info!(
                    request_id = %ctx.request_id,
                    session_id = %token,
                    "initialized new session"
                );
            }
            _ => {
                warn!(
                    request_id = %ctx.request_id,
                    "upstream did not return a session id for a create request"
                );
            }
        }
    }

    /// The upstream flagged the response as a soft failure: report the
    /// session broken, obtain a replacement and re-dispatch once.
    async fn retry_with_replacement(&self, ctx: &mut RequestContext) -> Option<ProxyError> {
        let manager = self.manager_for(&ctx.client_id);

        let used_token = ctx
            .headers
            .get(X_CRAWLERA_SESSION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && *v != CREATE_SESSION)
            .map(|v| v.to_string());
        if let Some(token) = used_token {
            manager.report_broken(token);
        }

        match manager.acquire(true).await {
            Some(SessionGrant::Token(token)) => {
                set_session_header(ctx, &token);
                match self.executor.execute(ctx).await {
                    Ok(()) if !ctx.is_upstream_error() => {
                        info!(
                            request_id = %ctx.request_id,
                            session_id = %token,
                            "request succeeded with new session after retry"
                        );
                        None
                    }
                    Ok(()) => {
                        manager.report_broken(token.clone());
                        info!(
                            request_id = %ctx.request_id,
                            session_id = %token,
                            "request failed even with new session after retry"
                        );
                        None
                    }
                    Err(e) => Some(e),
                }
            }
            Some(SessionGrant::Create(handoff)) => {
                set_session_header(ctx, CREATE_SESSION);
                match self.executor.execute(ctx).await {
                    Ok(()) if !ctx.is_upstream_error() => {
                        match ctx.response_header(X_CRAWLERA_SESSION) {
                            Some(token) if !token.is_empty() => {
                                let token = token.to_string();
                                let _ = handoff.send(token.clone());
                                self.stats.new_session_created();
                                metrics::counter!("headless_proxy_sessions_created_total")
                                    .increment(1);
                                info!(
                                    request_id = %ctx.request_id,
                                    session_id = %token,
                                    "got fresh session after retry"
                                );
                            }
                            _ => drop(handoff),
                        }
                        None
                    }
                    Ok(()) => {
                        drop(handoff);
                        warn!(
                            request_id = %ctx.request_id,
                            "could not obtain new session even after retry"
                        );
                        None
                    }
                    Err(e) => {
                        drop(handoff);
                        Some(e)
                    }
                }
            }
            None => None,
        }
    }
}

fn set_session_header(ctx: &mut RequestContext, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            ctx.headers.insert(X_CRAWLERA_SESSION, value);
        }
        Err(_) => warn!(session_id = %value, "session id is not a valid header value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::empty_body;
    use bytes::Bytes;
    use http::{HeaderMap, Method, Response};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn context() -> RequestContext {
        RequestContext::new(
            Method::GET,
            "http://example.com/".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:40000".parse().unwrap(),
        )
    }

    fn response_with(name: &str, value: &str) -> Response<crate::proxy::context::BoxBody> {
        Response::builder()
            .header(name, value)
            .body(empty_body())
            .unwrap()
    }

    /// Upstream stand-in: answers every request with 200, returning a fresh
    /// session id whenever the request asked to create one.
    async fn mock_upstream(session_id: &'static str) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }

                    let request = String::from_utf8_lossy(&request).to_ascii_lowercase();
                    let response = if request.contains("x-crawlera-session: create") {
                        format!(
                            "HTTP/1.1 200 OK\r\nX-Crawlera-Session: {}\r\ncontent-length: 2\r\n\r\nok",
                            session_id
                        )
                    } else {
                        "HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok".to_string()
                    };
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        addr
    }

    async fn layer_with_upstream(session_id: &'static str) -> SessionsLayer {
        let addr = mock_upstream(session_id).await;
        let stats = Arc::new(Stats::new());
        SessionsLayer::new(
            "apikey".to_string(),
            addr.to_string(),
            Executor::upstream(addr.to_string(), stats.clone()),
            stats,
        )
    }

    #[tokio::test]
    async fn test_happy_path_creates_then_reuses() {
        let layer = layer_with_upstream("s1").await;

        // First request: no session yet, so the layer asks for one.
        let mut ctx = context();
        layer.on_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.headers.get(X_CRAWLERA_SESSION).unwrap(), "create");
        assert!(ctx.session_handoff.is_some());

        // The upstream answers with a fresh session id.
        ctx.response = Some(response_with("X-Crawlera-Session", "s1"));
        assert!(layer.on_response(&mut ctx, None).await.is_none());
        assert!(ctx.session_handoff.is_none());

        // Second request reuses it.
        let mut second = context();
        layer.on_request(&mut second).await.unwrap();
        assert_eq!(second.headers.get(X_CRAWLERA_SESSION).unwrap(), "s1");
    }

    #[tokio::test]
    async fn test_break_and_recover() {
        let layer = layer_with_upstream("s2").await;

        // Seed the coordinator with a live session.
        let mut seed = context();
        layer.on_request(&mut seed).await.unwrap();
        seed.response = Some(response_with("X-Crawlera-Session", "s1"));
        layer.on_response(&mut seed, None).await;

        // Next request uses s1 and hits an upstream soft error; the layer
        // must obtain a replacement and re-dispatch with "create".
        let mut broken = context();
        layer.on_request(&mut broken).await.unwrap();
        assert_eq!(broken.headers.get(X_CRAWLERA_SESSION).unwrap(), "s1");

        broken.response = Some(response_with("X-Crawlera-Error", "bad_session_id"));
        assert!(layer.on_response(&mut broken, None).await.is_none());

        // The retry went out as a create and got a clean response back.
        assert_eq!(broken.headers.get(X_CRAWLERA_SESSION).unwrap(), "create");
        assert!(!broken.is_upstream_error());

        // Subsequent requests use the replacement session.
        let mut after = context();
        layer.on_request(&mut after).await.unwrap();
        assert_eq!(after.headers.get(X_CRAWLERA_SESSION).unwrap(), "s2");
    }

    #[tokio::test]
    async fn test_transport_error_closes_handoff() {
        let layer = layer_with_upstream("s1").await;

        let mut ctx = context();
        layer.on_request(&mut ctx).await.unwrap();
        assert!(ctx.session_handoff.is_some());

        // Transport failure: the handoff must be dropped without a send so
        // the coordinator returns to idle.
        let err = layer
            .on_response(
                &mut ctx,
                Some(ProxyError::UpstreamConnect("refused".to_string())),
            )
            .await;
        assert!(err.is_some());
        assert!(ctx.session_handoff.is_none());

        // The next request becomes the new creator instead of hanging.
        let mut next = context();
        layer.on_request(&mut next).await.unwrap();
        assert_eq!(next.headers.get(X_CRAWLERA_SESSION).unwrap(), "create");
    }
}
