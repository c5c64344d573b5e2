mod api;
mod config;
mod mdns;
mod probe;
mod push;
mod reaper;
mod reconcile;
mod registration;
mod resolve;
mod store;
mod store_manager;
mod wol;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::probe::NetProber;
use crate::push::PushHandler;
use crate::reconcile::Reconciler;
use crate::resolve::SystemResolver;
use crate::store::Registry;
use crate::store_manager::StoreHandle;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("circos_registryd=info"))
        )
        .init();

    tracing::info!("Starting circos-registryd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/circos/registryd.toml".to_string());

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    let wol_broadcast: SocketAddr = config.wol.broadcast
        .parse()
        .with_context(|| format!("Invalid wol.broadcast address {}", config.wol.broadcast))?;

    let registry = Registry::open(&config.registry.snapshot_path)?;
    let initial_hash = store::hash::compute_hash(registry.all_entries());
    tracing::info!(
        "Registry at {:?} holds {} entries (hash {})",
        config.registry.snapshot_path,
        registry.all_entries().len(),
        initial_hash
    );

    let (hash_tx, hash_rx) = watch::channel(initial_hash);
    let store = StoreHandle::spawn(registry, hash_tx);

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        Arc::new(NetProber::new(config.probe.timeout())?),
        Arc::new(SystemResolver),
        &config.registry,
        &config.probe,
    ));
    let push = Arc::new(PushHandler::new(
        store.clone(),
        reconciler.clone(),
        config.probe.default_port,
        config.registry.shutdown_refresh_delay(),
    ));

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.discovery.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    let cancel = CancellationToken::new();

    let (discovery_tx, discovery_rx) = mpsc::channel(256);
    let browser_cancel = cancel.clone();
    let browser_daemon = mdns_daemon.clone();
    let service_types = config.discovery.service_types.clone();
    let browser_handle = tokio::spawn(async move {
        if let Err(e) = mdns::browser::run_browser(browser_daemon, service_types, discovery_tx, browser_cancel).await {
            tracing::error!("mDNS browser error: {:#}", e);
        }
    });

    let mgr_cancel = cancel.clone();
    let mgr_store = store.clone();
    let mgr_reconciler = reconciler.clone();
    let poll_interval = config.registry.poll_interval();
    let mgr_handle = tokio::spawn(async move {
        if let Err(e) = store_manager::run(mgr_store, mgr_reconciler, discovery_rx, poll_interval, mgr_cancel).await {
            tracing::error!("Store manager error: {:#}", e);
        }
    });

    let app_state = api::routes::AppState {
        store: store.clone(),
        reconciler,
        push,
        hash_rx,
        default_port: config.probe.default_port,
        wol_broadcast,
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(browser_handle, mgr_handle, server_handle);

    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
