//! mcpgate daemon.
//!
//! Configuration comes from the environment (and `.env`): `HOST`, `PORT`,
//! `GATEWAY_BASE_URL`, `DATA_DIR`, `RUST_LOG`. Exit code 0 on clean
//! shutdown, 1 on startup failure. SIGINT/SIGTERM trigger graceful
//! shutdown: reconnect timers cancelled, sessions disconnected in
//! parallel, store flushed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mcpgate_core::{EventBus, RequestLog};
use mcpgate_gateway::{Gateway, GatewayServer, HttpConfig, OAuthManager, SessionOptions};
use mcpgate_store::FileStore;

fn main() {
    // .env is optional; real environment wins
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            std::process::exit(1);
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => {
            info!("shutdown complete");
        }
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3100".to_string())
        .parse()
        .context("PORT is not a valid port number")?;
    let base_url = std::env::var("GATEWAY_BASE_URL")
        .unwrap_or_else(|_| format!("http://{host}:{port}"));
    let data_dir = std::env::var("DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mcpgate")
    });
    let store_path = data_dir.join("gateway.json");

    info!(
        host = %host,
        port,
        base_url = %base_url,
        store = %store_path.display(),
        "starting mcpgate"
    );

    let store = FileStore::open(&store_path)
        .await
        .context("opening the gateway store")?;

    let events = EventBus::new();
    let oauth = Arc::new(OAuthManager::new(
        store.clone(),
        events.sender(),
        base_url.clone(),
    ));
    let gateway = Gateway::new(
        store.clone(),
        events.sender(),
        oauth,
        SessionOptions::default(),
    );
    let request_log = Arc::new(RequestLog::new(mcpgate_core::request_log::DEFAULT_CAPACITY)
        .with_events(events.sender()));

    let config = HttpConfig {
        host,
        port,
        enable_cors: true,
        base_url,
    };

    let server = GatewayServer::new(config, gateway.clone(), request_log, events);

    server
        .run(async {
            wait_for_signal().await;
            info!("shutdown signal received; draining");
        })
        .await?;

    // listener is closed; now tear down sessions and flush the store
    gateway.shutdown().await;
    if let Err(e) = store.close().await {
        error!(error = %e, "final store flush failed");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler; falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
