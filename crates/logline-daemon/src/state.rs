//! Shared runtime state for logline-daemon.
//!
//! All types here are `Clone`-able (via `Arc`/`PgPool`/`broadcast::Sender`).
//! Handlers receive `State<Arc<AppState>>` from Axum; this module owns
//! nothing async itself beyond spawning the background bus feeders.

use std::time::Duration;

use logline_config::Settings;
use logline_manifest::ManifestCache;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::warn;

/// Messages broadcast over the internal event bus and surfaced as SSE
/// events on `GET /timeline/stream` (§6.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    /// Raw `NOTIFY timeline_updates` payload, forwarded verbatim.
    Record { payload: String },
    /// Keeps idle SSE connections alive; emitted every 30s per §6.2.
    Ping { ts_millis: i64 },
}

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub manifest_cache: ManifestCache,
    pub settings: Settings,
    pub build: BuildInfo,
    /// Broadcast bus for the `/timeline/stream` SSE endpoint.
    pub bus: broadcast::Sender<BusMsg>,
}

impl AppState {
    pub fn new(pool: PgPool, settings: Settings) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        let manifest_cache = ManifestCache::new(Duration::from_millis(settings.manifest_cache_ttl_ms));

        Self {
            pool,
            manifest_cache,
            settings,
            build: BuildInfo {
                service: "logline-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            bus,
        }
    }
}

/// Emit a `Ping` on the bus every `interval` (§6.2's 30s SSE ping).
pub fn spawn_ping(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Ping { ts_millis: ts });
        }
    });
}

/// Subscribe to `timeline_updates` and forward every notification onto the
/// bus. Reconnects with a short backoff if the listener connection drops —
/// a dead `PgListener` must never take the SSE endpoint down with it.
pub fn spawn_timeline_listener(bus: broadcast::Sender<BusMsg>, store_connection: String) {
    tokio::spawn(async move {
        loop {
            match logline_registry::listen_timeline(&store_connection).await {
                Ok(mut listener) => loop {
                    match listener.recv().await {
                        Ok(notification) => {
                            let _ = bus.send(BusMsg::Record {
                                payload: notification.payload().to_string(),
                            });
                        }
                        Err(err) => {
                            warn!(%err, "daemon: timeline listener connection lost, reconnecting");
                            break;
                        }
                    }
                },
                Err(err) => {
                    warn!(%err, "daemon: failed to subscribe to timeline_updates, retrying");
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    });
}
