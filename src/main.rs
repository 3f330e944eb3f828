//! Persona Relay - conversational session manager for persona chat
//!
//! Receives chat messages over HTTP, runs them through the per-user turn
//! pipeline, meters premium artifacts against a gem ledger and tracks
//! long-running video jobs and voice calls until they settle.

mod api;
mod config;
mod db;
mod fulfillment;
mod intent;
mod ledger;
mod offers;
mod payments;
mod persona;
mod postprocess;
mod prompt;
mod providers;
mod runtime;
mod session_cache;
mod state_machine;
mod turn;

use api::{create_router, AppState};
use config::Config;
use db::Database;
use persona::Catalog;
use providers::{Backends, GatewayTransport};
use runtime::{RelayRuntime, Services};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "persona_relay=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration errors abort before anything is bound
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    let catalog = match &config.persona_catalog {
        Some(path) => {
            let catalog = Catalog::load(path)?;
            tracing::info!(
                path = %path,
                personas = catalog.personas.len(),
                "Persona catalog loaded"
            );
            catalog
        }
        None => {
            tracing::warn!("RELAY_PERSONA_CATALOG not set, using the built-in catalog");
            Catalog::builtin()
        }
    };

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %config.db_path, "Opening database");
    let db = Arc::new(Database::open(&config.db_path)?);

    let backends = Backends::from_config(&config.backends)?;
    let transport = Arc::new(GatewayTransport::new(
        &config.gateway_url,
        config.gateway_token.clone(),
    )?);

    let services = Services {
        sessions: db.clone(),
        accounts: db.clone(),
        payments: db,
        text: backends.text,
        image: backends.image,
        video: backends.video,
        speech: backends.speech,
        transport,
    };
    let runtime = Arc::new(RelayRuntime::new(
        services,
        catalog,
        config.turn.clone(),
        config.fulfillment.clone(),
        config.retention.clone(),
    ));

    if runtime.check_text_backend().await {
        tracing::info!(url = %config.backends.text_backend_url, "Text backend available");
    } else {
        tracing::warn!(
            url = %config.backends.text_backend_url,
            "Text backend unavailable, replies will use the fallback line"
        );
    }

    let shutdown = CancellationToken::new();
    let sweeper = runtime.spawn_sweeper(shutdown.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = create_router(AppState::new(runtime.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "Persona relay listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    runtime.shutdown();
    let _ = sweeper.await;
    Ok(())
}
