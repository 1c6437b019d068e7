//! Server lifecycle management
//!
//! Starts the HTTP/WebSocket server and tears everything down in order
//! on shutdown: stop accepting requests, kill any live transcoding
//! workers, then close the database pool.

use std::path::PathBuf;
use std::sync::Arc;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use guildcast_core::{
    service::{StreamService, TokenService},
    Config,
};
use guildcast_live::{SessionRegistry, StreamHub, StreamRelay};

/// Container for shared services
#[derive(Clone)]
pub struct Services {
    pub stream_service: Arc<StreamService>,
    pub token_service: Arc<TokenService>,
    pub hub: Arc<StreamHub>,
    pub relay: Arc<StreamRelay>,
    pub registry: Arc<SessionRegistry>,
}

pub struct GuildcastServer {
    config: Config,
    pool: PgPool,
    services: Services,
}

impl GuildcastServer {
    pub fn new(config: Config, pool: PgPool, services: Services) -> Self {
        Self {
            config,
            pool,
            services,
        }
    }

    /// Start the server and wait for a shutdown signal
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let http_handle = self.start_http_server(shutdown_rx)?;

        info!("Guildcast server started");

        tokio::select! {
            _ = http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        let _ = shutdown_tx.send(true);
        self.shutdown().await;

        Ok(())
    }

    /// Gracefully shut down all components
    async fn shutdown(&self) {
        info!("Shutting down Guildcast server...");

        // 1. Kill every live transcoding worker. Viewers get their
        //    stream-ended events while the hub is still up.
        let live = self.services.registry.len();
        if live > 0 {
            info!("Tearing down {} live session(s)...", live);
        }
        self.services.relay.shutdown().await;

        // 2. Close the database connection pool
        info!("Closing database connection pool...");
        self.pool.close().await;
        info!("Database pool closed");

        info!("Guildcast server shut down complete");
    }

    fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let live_root = PathBuf::from(&self.config.live.root_dir);

        let state = guildcast_api::AppState {
            stream_service: self.services.stream_service.clone(),
            token_service: self.services.token_service.clone(),
            hub: self.services.hub.clone(),
            relay: self.services.relay.clone(),
            registry: self.services.registry.clone(),
            playback_base: self.config.playback_base_url(),
        };

        let router = guildcast_api::create_router(state, live_root);

        let handle = tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&http_address).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to bind HTTP address {}: {}", http_address, e);
                    return;
                }
            };

            info!("HTTP server listening on {}", http_address);

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
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
