use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use liveclass_core::directory::{HttpUserLookup, NoopUserLookup, UserLookup};
use liveclass_core::AppState;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod routes;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("liveclass=info,tower_http=debug")),
        )
        .init();

    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;

    let lookup: Arc<dyn UserLookup> = match &config.lookup.url {
        Some(url) => {
            tracing::info!(url = %url, "avatar lookup enabled");
            Arc::new(HttpUserLookup::new(url.clone(), config.lookup_timeout())?)
        }
        None => {
            tracing::info!("no lookup url configured, participants will have no avatars");
            Arc::new(NoopUserLookup)
        }
    };

    let state = AppState::new(config.core_config(), lookup);
    let sweeper = liveclass_core::spawn_room_sweeper(state.clone());
    let app = routes::build_router(state, &config)?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        bind_address = %config.server.bind_address,
        origins = ?config.server.allowed_origins,
        "liveclass server listening"
    );

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutting down (ctrl-c)...");
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    sweeper.abort();
    Ok(())
}
