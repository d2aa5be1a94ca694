use std::sync::Arc;

use anyhow::{Context, Result};
use axum::serve;
use gsm_session::{
    ConnectionManager, FileCredentialStore, OutboundDispatcher, PairingView, SharedCredentialStore,
    SharedSessionProvider,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    config::{GatewayConfig, ProviderKind},
    dev_provider::DevSessionProvider,
    http::{GatewayState, router},
    render::{CodeRenderer, QrRenderer},
};

/// Builds the session stack for `config` and serves HTTP until a shutdown signal.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let store: SharedCredentialStore = Arc::new(FileCredentialStore::new(&config.session_dir));
    let provider: SharedSessionProvider = match config.provider {
        ProviderKind::Dev => Arc::new(DevSessionProvider::new(store, config.dev_pairing_delay)),
    };

    let manager = ConnectionManager::new(provider, config.manager_options());
    let dispatcher = OutboundDispatcher::new(manager.clone())
        .with_preview_chars(config.preview_chars)
        .with_send_timeout(config.send_timeout);
    let renderer: Arc<dyn CodeRenderer> = Arc::new(QrRenderer::default());

    let announcer = tokio::spawn(announce_pairing_codes(manager.clone(), renderer.clone()));
    manager.start().await;

    let app = router(GatewayState::new(dispatcher, renderer));
    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("bind {}", config.addr))?;
    info!(
        addr = %config.addr,
        session_dir = %config.session_dir.display(),
        "pairing-gateway listening"
    );

    let grace = config.shutdown_grace;
    let stopping = manager.clone();
    serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!(grace_ms = grace.as_millis() as u64, "shutdown requested");
            let report = stopping.shutdown(grace).await;
            info!(
                in_flight = report.in_flight,
                abandoned = report.abandoned,
                "session released"
            );
        })
        .await
        .context("http server failed")?;

    announcer.abort();
    Ok(())
}

/// Prints every new pairing code to the log as a scannable block.
async fn announce_pairing_codes(manager: ConnectionManager, renderer: Arc<dyn CodeRenderer>) {
    let mut rx = manager.subscribe();
    let mut last: Option<String> = None;
    while rx.changed().await.is_ok() {
        let available = rx.borrow_and_update().pairing_code_available;
        if !available {
            last = None;
            continue;
        }
        let PairingView::Pending(code) = manager.pairing().await else {
            continue;
        };
        if last.as_deref() == Some(code.data.as_str()) {
            continue;
        }
        match renderer.terminal(&code.data) {
            Ok(art) => info!("scan this code to pair the gateway (also at GET /pairing)\n{art}"),
            Err(err) => warn!(error = %err, "could not render pairing code for the terminal"),
        }
        last = Some(code.data);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
