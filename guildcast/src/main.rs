mod server;

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use guildcast_core::{
    bootstrap::{init_database, load_config},
    logging,
    service::{StreamService, TokenService},
};
use guildcast_live::{FfmpegSpawner, SessionRegistry, StreamHub, StreamRelay, WorkerSpawner};

use server::{GuildcastServer, Services};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration and fail fast on misconfigurations
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Guildcast server starting...");
    info!("HTTP address: {}", config.http_address());
    info!("Live segment root: {}", config.live.root_dir);

    // 3. Initialize database
    let pool = init_database(&config).await?;

    // 4. Run migrations
    info!("Running database migrations...");
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            anyhow::anyhow!("Migration failed: {e}")
        })?;
    info!("Migrations completed");

    // 5. Wire up services
    let registry = Arc::new(SessionRegistry::new());
    let hub = Arc::new(StreamHub::new());
    let spawner: Arc<dyn WorkerSpawner> = Arc::new(FfmpegSpawner::new(config.live.clone()));
    let relay = Arc::new(StreamRelay::new(
        Arc::clone(&registry),
        Arc::clone(&hub),
        spawner,
        config.live.clone(),
    ));

    let services = Services {
        stream_service: Arc::new(StreamService::new(pool.clone())),
        token_service: Arc::new(TokenService::new(&config.auth.token_secret)),
        hub,
        relay,
        registry,
    };

    // 6. Run until a shutdown signal arrives
    let server = GuildcastServer::new(config, pool, services);
    server.run().await
}
