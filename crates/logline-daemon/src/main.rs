//! logline-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, connects to the
//! store, builds the shared state, wires middleware, and starts the HTTP
//! server. All route handlers live in `routes.rs`; all shared state types
//! live in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use logline_config::Settings;
use logline_daemon::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let settings = Settings::load_from_env()?;
    let pool = logline_registry::connect(&settings.store_connection).await?;

    let allowed_origins = settings.allowed_origins.clone();
    let store_connection = settings.store_connection.clone();
    let shared = Arc::new(state::AppState::new(pool, settings));

    state::spawn_ping(shared.bus.clone(), Duration::from_secs(30));
    state::spawn_timeline_listener(shared.bus.clone(), store_connection);

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_layer(&allowed_origins));

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("logline-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("LOGLINE_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS: allow only the origins configured via `LOGLINE_ALLOWED_ORIGINS`
/// (§6.4). Empty configuration means no cross-origin caller is trusted.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
