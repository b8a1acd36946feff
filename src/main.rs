use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use activity_stream_service::api::{create_router, AppState};
use activity_stream_service::config::Config;
use activity_stream_service::db::Database;
use activity_stream_service::membership::RedisMembershipStore;
use activity_stream_service::signature::SignatureVerifier;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "activity_stream_service=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    info!("Configuration loaded successfully");

    let schema = std::fs::read_to_string(&config.database.schema_path)
        .with_context(|| format!("reading schema from {}", config.database.schema_path))?;
    let db = Arc::new(Database::connect(&config.database.url, &schema).await?);
    let membership = Arc::new(RedisMembershipStore::connect(&config.redis.url).await?);

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        SignatureVerifier::new(config.webhook.secrets.clone(), config.webhook.max_age_secs),
        membership,
        db.clone(),
        db,
        &config.webhook.network,
        config.heartbeat(),
        shutdown.clone(),
    );
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!("Activity stream service listening on {}", config.bind_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM and cancels every open stream so the
/// server can drain.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, closing activity streams");
    shutdown.cancel();
}
