//! Streams headless browser tabs to thin-client displays.
//!
//! Configuration comes from the environment (see `ServerConfig::from_env`).
//! Clients connect with `ws://host:WS_PORT/?id=<device>&w=..&h=..`.

use std::process;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay_webview_host::broadcast::Broadcaster;
use relay_webview_host::browser::BrowserRuntime;
use relay_webview_host::cdp::CdpRuntime;
use relay_webview_host::config::ServerConfig;
use relay_webview_host::device::FrameCodecs;
use relay_webview_host::manager::{DeviceManager, ManagerOptions};
use relay_webview_host::server::{serve, ServerState};
use relay_webview_host::stats::write_snapshots;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    info!(
        bind = %config.ws_bind,
        port = config.ws_port,
        debug_port = config.debug_port,
        idle_ttl_secs = config.idle_ttl.as_secs(),
        "starting"
    );

    // ── Browser bootstrap ───────────────────────────────────────────
    let cdp = match CdpRuntime::connect(config.cdp_ws_url.as_deref(), config.debug_port).await {
        Ok(cdp) => cdp,
        Err(e) => {
            error!(error = %e, "browser runtime unavailable");
            process::exit(1);
        }
    };
    match cdp.version().await {
        Ok(product) => info!(browser = %product, "browser ready"),
        Err(e) => warn!(error = %e, "could not read browser version"),
    }
    let runtime: Arc<dyn BrowserRuntime> = Arc::new(cdp);

    let manager = Arc::new(DeviceManager::new(
        runtime,
        Arc::new(Broadcaster::default()),
        FrameCodecs::default(),
        ManagerOptions::from(&config),
    ));

    // ── Idle sweep ──────────────────────────────────────────────────
    let sweeper = manager.spawn_idle_sweeper(config.idle_ttl, config.idle_sweep_interval);

    // ── Periodic metrics snapshots ──────────────────────────────────
    let stats_writer = config.stats_dir.clone().map(|dir| {
        let manager = Arc::clone(&manager);
        let period = config.stats_interval;
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            loop {
                interval.tick().await;
                let snapshots = manager.snapshots();
                if !snapshots.is_empty() {
                    write_snapshots(&dir, &snapshots);
                }
            }
        })
    });

    // ── Listener ────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.ws_bind, config.ws_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    info!(addr = %addr, "listening for displays");

    let state = Arc::new(ServerState::new(
        Arc::clone(&manager),
        config.device_defaults.clone(),
    ));

    tokio::select! {
        _ = serve(listener, state) => {}
        _ = shutdown_signal() => info!("shutdown requested"),
    }

    sweeper.abort();
    if let Some(writer) = stats_writer {
        writer.abort();
    }
    manager.shutdown_all().await;
    info!("all devices released");
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
