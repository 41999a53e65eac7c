// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! codexgate: HTTP façade over per-user `codex app-server` subprocesses.

pub mod chat;
pub mod config;
pub mod error;
pub mod history;
pub mod probe;
pub mod rpc;
pub mod session;
pub mod state;
pub mod test_support;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::GateConfig;
use crate::session::{manager::spawn_reaper, CodexLauncher, SessionManager};
use crate::state::AppState;
use crate::transport::build_router;
use crate::transport::identity::IdentityEnforcer;

/// Run the gateway until shutdown.
pub async fn run(config: GateConfig) -> anyhow::Result<()> {
    // reqwest is built against rustls with no default provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let codex = probe::detect(&config).await;
    match (&codex.binary, &codex.version) {
        (Some(bin), version) => {
            info!(binary = %bin.display(), version = version.as_deref().unwrap_or("unknown"), "codex binary resolved")
        }
        (None, _) => warn!("codex binary not found; chat requests will fail until it is installed"),
    }

    let launcher = Arc::new(CodexLauncher::new(codex.binary.clone(), &config));
    let manager = SessionManager::new(config.clone(), launcher);
    spawn_reaper(Arc::clone(&manager));

    let identity = IdentityEnforcer::from_config(&config)?;
    let state = Arc::new(AppState { config: config.clone(), manager: Arc::clone(&manager), identity, codex });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("codexgate listening on {addr}");

    let shutdown = manager.shutdown_token();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let router = build_router(state);
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    // Drain leases and close every child before exiting.
    manager.shutdown().await;
    Ok(())
}
