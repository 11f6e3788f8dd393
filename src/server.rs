use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::auth::CredentialStore;
use crate::engine::Engine;
use crate::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use crate::wire::{self, ReservdFactory};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection task needs.
#[derive(Clone)]
pub struct ServerContext {
    pub factory: Arc<ReservdFactory>,
    pub tls: Option<TlsAcceptor>,
    pub max_connections: usize,
}

impl ServerContext {
    pub fn new(engine: Arc<Engine>, credentials: Arc<CredentialStore>, tls: Option<TlsAcceptor>, max_connections: usize) -> Self {
        Self {
            factory: Arc::new(ReservdFactory::new(engine, credentials)),
            tls,
            max_connections,
        }
    }
}

/// Accept connections until `shutdown` resolves, then wait (bounded) for
/// in-flight connections to finish.
pub async fn serve(listener: TcpListener, ctx: ServerContext, shutdown: impl Future<Output = ()>) {
    let semaphore = Arc::new(Semaphore::new(ctx.max_connections));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
                let factory = ctx.factory.clone();
                let tls = ctx.tls.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, factory, tls).await {
                        error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    drain(&semaphore, ctx.max_connections).await;
}

async fn drain(semaphore: &Semaphore, max_connections: usize) {
    info!("draining connections...");
    let deadline = tokio::time::sleep(DRAIN_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            return;
        }
        tokio::select! {
            _ = &mut deadline => {
                let remaining = max_connections - semaphore.available_permits();
                warn!("drain timeout, {remaining} connections still open");
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}
