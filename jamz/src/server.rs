//! Server lifecycle management
//!
//! Runs the HTTP server and watches two things: OS shutdown signals and the
//! media worker fatal channel. A signal drains connections and exits cleanly.
//! A worker death waits out the grace period and exits with an error so the
//! process supervisor restarts us.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use jamz_api::http::{create_router, AppState};
use jamz_api::SignalingGateway;
use jamz_core::Config;
use jamz_sfu::{await_fatal, FatalReceiver, FatalSignal, MediaWorkerPool};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

enum StopReason {
    Signal,
    ServerStopped,
    WorkerDied(FatalSignal),
}

pub struct JamzServer {
    config: Config,
    pool: Arc<MediaWorkerPool>,
    gateway: Arc<SignalingGateway>,
    fatal_rx: FatalReceiver,
}

impl JamzServer {
    pub const fn new(
        config: Config,
        pool: Arc<MediaWorkerPool>,
        gateway: Arc<SignalingGateway>,
        fatal_rx: FatalReceiver,
    ) -> Self {
        Self {
            config,
            pool,
            gateway,
            fatal_rx,
        }
    }

    /// Start the HTTP server and block until shutdown
    pub async fn start(mut self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let http_handle = self.start_http_server(shutdown_rx).await?;
        info!("All servers started successfully");

        let grace = self.config.media.worker_death_grace();
        let fatal_rx = &mut self.fatal_rx;
        let worker_death = async move {
            match await_fatal(fatal_rx, grace).await {
                Some(signal) => signal,
                // Every monitor has finished without reporting a death
                None => std::future::pending().await,
            }
        };

        let reason = tokio::select! {
            _ = http_handle => StopReason::ServerStopped,
            () = shutdown_signal() => StopReason::Signal,
            signal = worker_death => StopReason::WorkerDied(signal),
        };

        let _ = shutdown_tx.send(true);

        match reason {
            StopReason::Signal => {
                info!("Shutdown signal received, starting graceful shutdown...");
                self.drain_connections().await;
                self.pool.close();
                info!("Jamz server stopped");
                Ok(())
            }
            StopReason::ServerStopped => {
                error!("HTTP server stopped unexpectedly");
                self.pool.close();
                Err(anyhow::anyhow!("HTTP server stopped unexpectedly"))
            }
            StopReason::WorkerDied(signal) => {
                error!("Exiting after fatal media worker failure: {}", signal);
                self.pool.close();
                Err(anyhow::anyhow!("{signal}"))
            }
        }
    }

    /// Give open sockets a moment to close on their own
    async fn drain_connections(&self) {
        let hub = self.gateway.hub();
        let active = hub.connection_count();
        if active == 0 {
            return;
        }
        info!(
            "Waiting up to {}s for {} active connection(s) to drain...",
            DRAIN_TIMEOUT.as_secs(),
            active
        );
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            let remaining = hub.connection_count();
            if remaining == 0 {
                info!("All connections drained");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Drain timeout reached with {} connection(s) still active, proceeding with shutdown",
                    remaining
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Start HTTP server with graceful shutdown support
    async fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let state = AppState::new(
            self.gateway.clone(),
            self.config.signaling.max_message_size,
        );
        let router = create_router(state);

        let http_addr: std::net::SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;
        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;

        info!("HTTP server listening on {}", http_addr);

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
