mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::ProxyState;

use crate::proxy::{self, context::empty_body, context::BoxBody};
use anyhow::{Context, Result};
use http::{Method, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Run the proxy listener with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to `DRAIN_TIMEOUT` for in-flight connections to finish.
pub async fn run_proxy_server(state: ProxyState, shutdown: Arc<Notify>) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    let addr = state.config.bind();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind proxy listener on {}", addr))?;
    info!(addr = %addr, "proxy listening");

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("stop accepting new connections, draining");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };

        metrics::counter!("headless_proxy_connections_total").increment(1);
        metrics::gauge!("headless_proxy_connections_active").increment(1.0);
        state.stats.client_connected(true);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service_state = state.clone();
            let service = service_fn(move |req: Request<Incoming>| {
                let state = service_state.clone();
                async move { serve_request(req, state, peer_addr).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, service)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    debug!(peer = %peer_addr, error = %e, "connection error");
                }
            }

            metrics::gauge!("headless_proxy_connections_active").decrement(1.0);
            state.stats.client_connected(false);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    drain(&active_conns, DRAIN_TIMEOUT).await;
    Ok(())
}

async fn drain(active_conns: &AtomicI64, timeout: std::time::Duration) {
    let active = active_conns.load(Ordering::Relaxed);
    if active == 0 {
        return;
    }

    info!(active = active, "waiting for active connections to drain");
    let all_closed = async {
        while active_conns.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    };
    match tokio::time::timeout(timeout, all_closed).await {
        Ok(()) => info!("all connections drained"),
        Err(_) => info!(
            remaining = active_conns.load(Ordering::Relaxed),
            "drain timeout, dropping remaining connections"
        ),
    }
}

/// Entry point for every downstream request: CONNECT starts a TLS
/// interception tunnel, anything else goes straight into the pipeline.
async fn serve_request(
    req: Request<Incoming>,
    state: ProxyState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    if req.method() == Method::CONNECT {
        return handle_connect(req, state, peer_addr);
    }
    proxy::handle_request(req, state, peer_addr, None).await
}

/// Accept the CONNECT, then intercept the TLS handshake on the upgraded
/// stream with a leaf certificate minted for the requested host. Decrypted
/// requests re-enter the regular pipeline.
fn handle_connect(
    req: Request<Incoming>,
    state: ProxyState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.to_string(),
        None => {
            debug!(uri = %req.uri(), "CONNECT without authority");
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(empty_body())
                .expect("static response"));
        }
    };

    let upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                if let Err(e) = serve_tls_tunnel(upgraded, authority.clone(), state, peer_addr).await
                {
                    debug!(authority = %authority, error = %e, "TLS tunnel closed with error");
                }
            }
            Err(e) => debug!(authority = %authority, error = %e, "CONNECT upgrade failed"),
        }
    });

    Ok(Response::new(empty_body()))
}

async fn serve_tls_tunnel(
    upgraded: hyper::upgrade::Upgraded,
    authority: String,
    state: ProxyState,
    peer_addr: SocketAddr,
) -> Result<()> {
    let host = authority.split(':').next().unwrap_or(&authority);
    let tls_config = state.tls.server_config(host)?;
    let acceptor = TlsAcceptor::from(tls_config);
    let tls_stream = acceptor.accept(TokioIo::new(upgraded)).await?;

    let service_state = state.clone();
    let service_authority = authority.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let state = service_state.clone();
        let authority = service_authority.clone();
        async move { proxy::handle_request(req, state, peer_addr, Some(authority)).await }
    });

    auto::Builder::new(TokioExecutor::new())
        .http1()
        .keep_alive(true)
        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    Ok(())
}

/// Run the proxy API endpoint: stats, Prometheus metrics, liveness.
pub async fn run_api_server(state: ProxyState) -> Result<()> {
    let addr = state.config.api_bind();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind proxy API listener on {}", addr))?;
    info!(addr = %addr, "proxy API listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, service)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    debug!(error = %e, "proxy API connection error");
                }
            }
        });
    }
}
