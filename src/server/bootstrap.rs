use crate::config::{Cli, Config};
use crate::server::{self, ProxyState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Proxy lifecycle: config → state → API server → proxy server → shutdown.
pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli)?;
    init_tracing(config.debug);

    debug!(
        bind = %config.bind(),
        proxy_api = %config.api_bind(),
        crawlera = %config.crawlera_addr(),
        no_auto_sessions = config.no_auto_sessions,
        concurrent_connections = config.concurrent_connections,
        adblock_lists = ?config.adblock_lists,
        xheaders = ?config.xheaders,
        dont_verify_crawlera_cert = config.dont_verify_crawlera_cert,
        "configuration"
    );

    let state = ProxyState::new(config)?;
    let shutdown = Arc::new(Notify::new());

    // Fatal failures inside the spawned servers — a bind on an occupied
    // port, most likely — come back through this channel; startup failures
    // must exit 1, not idle until a signal arrives.
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<anyhow::Error>(2);

    start_api_server(&state, fatal_tx.clone());

    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        let fatal_tx = fatal_tx.clone();
        async move {
            if let Err(e) = server::run_proxy_server(state, shutdown).await {
                let _ = fatal_tx.send(e).await;
            }
        }
    });
    drop(fatal_tx);

    tokio::select! {
        _ = wait_for_shutdown(&shutdown) => {}
        fatal = fatal_rx.recv() => {
            shutdown.notify_waiters();
            let e = fatal
                .unwrap_or_else(|| anyhow::anyhow!("server tasks ended unexpectedly"));
            error!(error = %e, "startup failure");
            return Err(e);
        }
    }

    if let Err(e) = proxy_handle.await {
        error!(error = %e, "proxy task panicked");
    }

    info!("shutdown complete");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };

    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer guard must outlive the process.
    std::mem::forget(guard);
}

fn start_api_server(state: &ProxyState, fatal_tx: mpsc::Sender<anyhow::Error>) {
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_api_server(state).await {
            let _ = fatal_tx.send(e.context("proxy API server failed")).await;
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
