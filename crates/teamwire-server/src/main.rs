use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use teamwire_core::auth::{create_token, JwtVerifier};
use teamwire_core::observability::gateway_counters;
use teamwire_core::{Collaborators, RealtimeService};
use teamwire_media::{HttpMediaEngine, LoopbackEngine, MediaEngine};
use teamwire_ws::GatewayState;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

use config::{ConfigSource, MediaEngineKind};

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("teamwire=info,tower_http=info"));
    if logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let (mut config, source) = config::Config::load(&args.config)?;
    init_tracing(&config.logging);
    if source == ConfigSource::Generated {
        tracing::info!("Generated default config at '{}'", args.config);
    }

    if let Some(user_id) = args.print_token {
        let token = create_token(user_id, &config.auth.jwt_secret, config.auth.jwt_expiry_seconds)
            .context("issuing token")?;
        println!("{token}");
        return Ok(());
    }

    // CLI --bind overrides config file
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    let directory = Arc::new(config.directory.build_index());
    tracing::info!(rooms = directory.room_count(), "Seeded in-memory directory");

    let media: Arc<dyn MediaEngine> = match config.media.engine {
        MediaEngineKind::Loopback => {
            tracing::warn!("Using loopback media engine; no media will flow");
            Arc::new(LoopbackEngine::new())
        }
        MediaEngineKind::Http => {
            let engine = HttpMediaEngine::new(config.media.http_engine_config())
                .context("building media engine client")?;
            tracing::info!(url = %config.media.http_url, "Using HTTP media engine");
            Arc::new(engine)
        }
    };

    let service = RealtimeService::new(
        config.realtime.to_realtime_config(),
        Collaborators {
            auth: Arc::new(JwtVerifier::new(config.auth.jwt_secret.clone())),
            authorization: directory.clone(),
            read_states: directory,
            media,
        },
    );

    let gateway = GatewayState::new(service.clone(), config.gateway.to_gateway_config());
    let maintenance = gateway.spawn_maintenance();

    let app = Router::new()
        .route("/health", get(health))
        .merge(teamwire_ws::gateway_router())
        .with_state(gateway)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("binding {}", config.server.bind_address))?;
    tracing::info!(
        "Teamwire listening on {} (gateway at /gateway)",
        config.server.bind_address
    );

    let drain = service.clone();
    let shutdown_signal = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down (ctrl-c)...");
            }
            _ = drain.shutdown.notified() => {
                tracing::info!("Shutting down (requested)...");
            }
        }
        drain.shutdown().await;
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    maintenance.abort();
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn health(State(gateway): State<GatewayState>) -> Json<Value> {
    let service = &gateway.service;
    Json(json!({
        "status": if service.is_accepting() { "ok" } else { "draining" },
        "stats": service.stats(),
        "gateway": {
            "active": gateway.active_connections(),
            "counters": gateway_counters(),
        },
    }))
}
