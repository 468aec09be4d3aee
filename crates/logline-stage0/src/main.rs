//! `logline-stage0` entry point.
//!
//! Thin by design: load configuration, connect to the store, run one
//! boot request built from the process environment, print the outcome.
//! `logline-daemon`'s `POST /boot` handler and `logline-cli`'s `boot`
//! subcommand call [`logline_stage0::boot`] directly instead of
//! shelling out to this binary; this binary exists for environments
//! that invoke Stage-0 as a standalone process per request (the
//! "edge adapter" case §6.2 leaves open).

use std::time::Duration;

use logline_manifest::ManifestCache;
use logline_stage0::{boot, RawBootRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let settings = logline_config::Settings::load_from_env()?;
    let pool = logline_registry::connect(&settings.store_connection).await?;

    let boot_function_id = settings
        .boot_function_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("CONFIG_MISSING: LOGLINE_BOOT_FUNCTION_ID is not set"))?;
    let user_id = settings
        .app_user_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("CONFIG_MISSING: LOGLINE_APP_USER_ID is not set"))?;

    let manifest_cache = ManifestCache::new(Duration::from_millis(settings.manifest_cache_ttl_ms));
    let request = RawBootRequest {
        boot_function_id,
        user_id,
        tenant_id: settings.app_tenant_id.clone(),
        trace_id: None,
    };

    let outcome = boot(
        &pool,
        &manifest_cache,
        settings.signing_key_hex.as_deref(),
        settings.environment,
        request,
    )
    .await;

    match outcome {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(err) => {
            tracing::error!(%err, status = err.status_code(), "stage0: boot failed");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
