//! Operator CLI (§6.5): database lifecycle, manifest inspection/governance,
//! manual boot, and a tailing view of the timeline. Thin by design — every
//! subcommand calls straight into a library crate; no business logic lives
//! here.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use logline_config::Settings;
use logline_crypto::{seal, signing_key_from_hex, strip_proof_fields};
use logline_manifest::{Manifest, Throttle};
use logline_registry::{QueryFilters, Session};
use logline_schemas::{EntityType, NewSpan, Visibility};
use logline_stage0::RawBootRequest;

#[derive(Parser)]
#[command(name = "logline")]
#[command(about = "LogLineOS operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database lifecycle commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },
    /// Manifest inspection and governance
    Manifest {
        #[command(subcommand)]
        cmd: ManifestCmd,
    },
    /// Boot a function record through Stage-0
    Boot {
        #[arg(long)]
        function: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Tail the timeline
    Records {
        #[command(subcommand)]
        cmd: RecordsCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum ManifestCmd {
    Show,
    SetThrottle {
        /// New per-tenant daily execution limit
        n: i64,
    },
}

#[derive(Subcommand)]
enum RecordsCmd {
    Tail {
        #[arg(long = "entity-type")]
        entity_type: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();
    let settings = Settings::load_from_env()?;

    match cli.cmd {
        Commands::Db { cmd } => run_db(&settings, cmd).await,
        Commands::Manifest { cmd } => run_manifest(&settings, cmd).await,
        Commands::Boot { function, user, tenant } => run_boot(&settings, function, user, tenant).await,
        Commands::Records { cmd } => run_records(&settings, cmd).await,
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn operator_session(settings: &Settings) -> Result<Session> {
    let user_id = settings
        .app_user_id
        .clone()
        .context("CONFIG_MISSING: LOGLINE_APP_USER_ID is not set")?;
    Ok(Session::new(user_id, settings.app_tenant_id.clone()))
}

async fn run_db(settings: &Settings, cmd: DbCmd) -> Result<()> {
    let pool = logline_registry::connect(&settings.store_connection).await?;
    match cmd {
        DbCmd::Status => {
            let status = logline_registry::status(&pool).await?;
            println!("db_ok={} has_records_table={}", status.ok, status.has_records_table);
        }
        DbCmd::Migrate => {
            logline_registry::migrate(&pool).await?;
            println!("migrations_applied=true");
        }
    }
    Ok(())
}

async fn run_manifest(settings: &Settings, cmd: ManifestCmd) -> Result<()> {
    let pool = logline_registry::connect(&settings.store_connection).await?;
    let session = operator_session(settings)?;

    match cmd {
        ManifestCmd::Show => {
            let manifest = logline_manifest::load_current(&pool, &session).await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        ManifestCmd::SetThrottle { n } => {
            let current = logline_manifest::load_current(&pool, &session)
                .await
                .unwrap_or_default();
            let updated = Manifest {
                throttle: Throttle {
                    per_tenant_daily_exec_limit: n,
                },
                ..current
            };
            let inserted = insert_manifest(settings, &pool, &session, &updated).await?;
            println!("manifest_id={} per_tenant_daily_exec_limit={}", inserted, n);
        }
    }
    Ok(())
}

/// Signs the updated manifest when a signing key is configured (governance
/// provenance, §4.2); writes unsigned otherwise, same as any other caller
/// without a key.
async fn insert_manifest(
    settings: &Settings,
    pool: &sqlx::PgPool,
    session: &Session,
    manifest: &Manifest,
) -> Result<Uuid> {
    let mut new_span = NewSpan::new(EntityType::Manifest, "operator:cli", session.user_id.clone())
        .did("update_manifest")
        .this("manifest")
        .metadata(serde_json::to_value(manifest)?);
    if let Some(tenant_id) = session.tenant_id.clone() {
        new_span = new_span.tenant(tenant_id).visibility(Visibility::Tenant);
    } else {
        new_span = new_span.visibility(Visibility::Public);
    }

    if let Some(signing_key_hex) = settings.signing_key_hex.as_deref() {
        let id = Uuid::now_v7();
        let at = Utc::now();
        new_span = new_span.id(id).at(at);
        let preview = new_span.preview_span(id, 0, at);
        let body = strip_proof_fields(serde_json::to_value(&preview)?);
        let signing_key = signing_key_from_hex(signing_key_hex)?;
        let envelope = seal(&signing_key, &body);
        new_span = new_span.sealed(envelope.curr_hash, envelope.signature, envelope.public_key);
    }

    let inserted = logline_registry::insert_record(pool, session, new_span).await?;
    Ok(inserted.id)
}

async fn run_boot(settings: &Settings, function: String, user: String, tenant: Option<String>) -> Result<()> {
    let pool = logline_registry::connect(&settings.store_connection).await?;
    let manifest_cache =
        logline_manifest::ManifestCache::new(std::time::Duration::from_millis(settings.manifest_cache_ttl_ms));

    let request = RawBootRequest {
        boot_function_id: function,
        user_id: user,
        tenant_id: tenant,
        trace_id: None,
    };

    let outcome = logline_stage0::boot(
        &pool,
        &manifest_cache,
        settings.signing_key_hex.as_deref(),
        settings.environment,
        request,
    )
    .await
    .map_err(|e| anyhow::anyhow!(e))?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn run_records(settings: &Settings, cmd: RecordsCmd) -> Result<()> {
    let pool = logline_registry::connect(&settings.store_connection).await?;
    let session = operator_session(settings)?;

    match cmd {
        RecordsCmd::Tail { entity_type, limit } => {
            let entity_type = EntityType::parse(&entity_type)
                .with_context(|| format!("unknown entity_type '{entity_type}'"))?;
            let filters = QueryFilters {
                entity_type: Some(entity_type),
                limit: limit.clamp(1, 100),
                ..Default::default()
            };
            let records = logline_registry::query_timeline(&pool, &session, &filters).await?;
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
    }
    Ok(())
}
