use crate::error::ProxyError;
use crate::proxy::context::RequestContext;
use crate::stats::Stats;
use bytes::Bytes;
use http::header::HeaderName;
use http::Request;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::Response;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Forwarding primitive at the end of the layer pipeline. Abstract over the
/// dialer: the main upstream proxy, the optional direct-access proxy, or a
/// plain direct connection.
#[derive(Clone)]
pub enum Executor {
    Proxy(ProxyExecutor),
    Direct(DirectExecutor),
}

impl Executor {
    /// The main upstream executor; records upstream latency and request
    /// counts into `stats`.
    pub fn upstream(addr: String, stats: Arc<Stats>) -> Self {
        Executor::Proxy(ProxyExecutor {
            addr: Arc::from(addr.as_str()),
            stats: Some(stats),
        })
    }

    /// A secondary forward proxy (direct-access traffic).
    pub fn alternate_proxy(addr: String) -> Self {
        Executor::Proxy(ProxyExecutor {
            addr: Arc::from(addr.as_str()),
            stats: None,
        })
    }

    /// Fetch the target origin directly, without any proxy.
    pub fn direct(verify_tls: bool) -> Self {
        Executor::Direct(DirectExecutor {
            client: build_direct_client(verify_tls),
        })
    }

    /// Dispatch the context's outbound request and attach the response.
    pub async fn execute(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        match self {
            Executor::Proxy(exec) => exec.execute(ctx).await,
            Executor::Direct(exec) => exec.execute(ctx).await,
        }
    }
}

/// Replays the request in absolute form over a fresh connection to an HTTP
/// proxy.
#[derive(Clone)]
pub struct ProxyExecutor {
    addr: Arc<str>,
    stats: Option<Arc<Stats>>,
}

impl ProxyExecutor {
    async fn execute(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        let request = build_request(ctx);

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&*self.addr))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)?
            .map_err(|e| ProxyError::UpstreamConnect(e.to_string()))?;

        let (mut sender, conn) = http1::Builder::new()
            .title_case_headers(true)
            .handshake::<_, Full<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::UpstreamTransport(e.to_string()))?;

        // The connection task owns the socket for as long as the response
        // body is being streamed.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "upstream connection closed with error");
            }
        });

        let start = Instant::now();
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::UpstreamTransport(e.to_string()))?;
        let elapsed = start.elapsed();

        if let Some(ref stats) = self.stats {
            stats.new_upstream_request();
            stats.new_upstream_time(elapsed);
            metrics::counter!("headless_proxy_upstream_requests_total").increment(1);
            metrics::histogram!("headless_proxy_upstream_duration_seconds")
                .record(elapsed.as_secs_f64());
        }

        ctx.upstream_elapsed = Some(elapsed);
        ctx.response = Some(box_response(response));
        Ok(())
    }
}

/// Fetches the target origin through a pooled HTTPS-capable client.
#[derive(Clone)]
pub struct DirectExecutor {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl DirectExecutor {
    async fn execute(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        let mut request = build_request(ctx);
        strip_proxy_headers(request.headers_mut());

        let start = Instant::now();
        let response = self.client.request(request).await.map_err(|e| {
            if e.is_connect() {
                ProxyError::UpstreamConnect(e.to_string())
            } else {
                ProxyError::UpstreamTransport(e.to_string())
            }
        })?;

        ctx.upstream_elapsed = Some(start.elapsed());
        ctx.response = Some(box_response(response));
        Ok(())
    }
}

fn build_request(ctx: &RequestContext) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(ctx.method.clone()).uri(ctx.uri.clone());
    for (name, value) in &ctx.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(ctx.body.clone()))
        .expect("request parts were already valid")
}

fn box_response(response: Response<Incoming>) -> Response<super::context::BoxBody> {
    response.map(|body| body.boxed())
}

/// The upstream control headers and our proxy credential must not leak to
/// origins contacted directly.
fn strip_proxy_headers(headers: &mut http::HeaderMap) {
    headers.remove(http::header::PROXY_AUTHORIZATION);
    let control: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("x-crawlera-"))
        .cloned()
        .collect();
    for name in control {
        headers.remove(name);
    }
}

fn build_direct_client(verify_tls: bool) -> Client<HttpsConnector<HttpConnector>, Full<Bytes>> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_connect_timeout(Some(CONNECT_TIMEOUT));
    http.enforce_http(false);

    let https = if verify_tls {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(http)
    } else {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();

        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http)
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(60))
        .build(https)
}

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Used when `dont_verify_crawlera_cert` is set.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
