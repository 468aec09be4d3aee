//! The current-manifest view: allowed boot ids, per-tenant throttle,
//! the policy slow threshold, and the override public key (§4.11).
//!
//! A manifest is not special storage — it is the newest `entity_type =
//! 'manifest'` row visible to the caller, parsed out of its `metadata`
//! payload. Governance updates are just more manifest rows; rollback is
//! a new row carrying the older values forward.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use logline_config::ttl::TtlCache;
use logline_registry::{fetch_current_manifest, RegistryError, Session};
use logline_schemas::Span;
use sqlx::PgPool;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no manifest record is visible to this session")]
    NotFound,
    #[error("manifest record {id} failed to parse: {detail}")]
    Malformed { id: Uuid, detail: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("manifest unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

/// `kernels: { run_code, observer, request_worker, policy_agent,
/// provider_exec, stage0_loader }` — the function-record ids Stage-0
/// and the kernels resolve themselves against.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KernelIds {
    pub run_code: Option<Uuid>,
    pub observer: Option<Uuid>,
    pub request_worker: Option<Uuid>,
    pub policy_agent: Option<Uuid>,
    pub provider_exec: Option<Uuid>,
    pub stage0_loader: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Throttle {
    pub per_tenant_daily_exec_limit: i64,
}

impl Default for Throttle {
    fn default() -> Self {
        Self {
            per_tenant_daily_exec_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub slow_ms: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { slow_ms: 5000 }
    }
}

/// The parsed contents of the newest visible `manifest` record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Manifest {
    #[serde(default)]
    pub kernels: KernelIds,
    #[serde(default)]
    pub allowed_boot_ids: Vec<Uuid>,
    #[serde(default)]
    pub throttle: Throttle,
    #[serde(default)]
    pub policy: PolicyConfig,
    pub override_pubkey_hex: Option<String>,
}

impl Manifest {
    /// Stage-0's `allowed_boot_ids[]` whitelist check.
    pub fn allows_boot(&self, boot_id: &Uuid) -> bool {
        self.allowed_boot_ids.contains(boot_id)
    }

    /// The per-tenant daily execution ceiling `run_code_kernel` enforces
    /// before emitting an `execution` record.
    pub fn quota_for_tenant(&self) -> i64 {
        self.throttle.per_tenant_daily_exec_limit
    }

    /// Whether `public_key_hex` matches the admin key authorized to flag
    /// `force`-marked over-quota executions.
    pub fn is_override_key(&self, public_key_hex: &str) -> bool {
        self.override_pubkey_hex
            .as_deref()
            .is_some_and(|k| k.eq_ignore_ascii_case(public_key_hex))
    }

    fn from_span(span: &Span) -> Result<Self, ManifestError> {
        serde_json::from_value(span.metadata.clone()).map_err(|e| ManifestError::Malformed {
            id: span.id,
            detail: e.to_string(),
        })
    }
}

/// Fetch the newest visible manifest record directly from the store,
/// bypassing any cache. Callers needing the standard stale-fallback
/// discipline should go through [`ManifestCache`] instead.
pub async fn load_current(pool: &PgPool, session: &Session) -> Result<Manifest, ManifestError> {
    let span = fetch_current_manifest(pool, session)
        .await?
        .ok_or(ManifestError::NotFound)?;
    Manifest::from_span(&span)
}

/// The 5-minute-TTL, fail-closed manifest cache §4.4 step 2 and §5.4
/// require: "Cache reads never block on cache refresh; a refresh
/// failure falls back to the last-known-good value until TTL×2, then
/// fails closed."
pub struct ManifestCache {
    inner: TtlCache<Manifest>,
}

impl ManifestCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: TtlCache::new(ttl),
        }
    }

    pub async fn current(&self, pool: &PgPool, session: &Session) -> Result<Manifest, ManifestError> {
        self.inner
            .get_or_refresh(|| async {
                load_current(pool, session)
                    .await
                    .map_err(|e| anyhow::anyhow!(e))
            })
            .await
            .map_err(ManifestError::from)
    }
}
