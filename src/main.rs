use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use reservd::auth::CredentialStore;
use reservd::config::{Config, StoreKind};
use reservd::engine::Engine;
use reservd::notify::NotifyHub;
use reservd::server::{self, ServerContext};
use reservd::store::{InMemoryStore, IntervalStore, WalStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    reservd::observability::init_logging();

    let config = Config::from_env()?;
    reservd::observability::init_metrics(config.metrics_port)?;

    let tls_acceptor = config.tls.as_ref().map(reservd::tls::load_tls_acceptor).transpose()?;

    let store: Arc<dyn IntervalStore> = match config.store {
        StoreKind::Wal => {
            std::fs::create_dir_all(&config.data_dir)?;
            Arc::new(WalStore::open(&config.wal_path())?)
        }
        StoreKind::Memory => Arc::new(InMemoryStore::new()),
    };
    let engine = Arc::new(Engine::new(store, Arc::new(NotifyHub::new()), config.engine.clone()));
    let credentials = Arc::new(CredentialStore::new(config.users.clone()));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("reservd listening on {addr}");
    info!("  store: {:?} ({})", config.store, config.data_dir.display());
    info!("  users: {}", credentials.len());
    info!("  max_connections: {}", config.max_connections);
    info!("  scope_timeout: {:?}", config.engine.scope_timeout);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let ctx = ServerContext::new(engine, credentials, tls_acceptor, config.max_connections);
    server::serve(listener, ctx, shutdown_signal()?).await;

    info!("reservd stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    })
}
