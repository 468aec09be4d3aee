//! Stage-0 (§4.4): the only trusted out-of-ledger code. Everything a
//! `boot_function_id` refers to is data; this crate's job is to
//! validate the boot request, check it against the manifest whitelist,
//! verify the target function's signature if it carries one, record a
//! `boot_event`, and run the function's `code` in the sandbox.
//!
//! Grounded on `mqk-daemon::main` for the thin-binary shape (tracing
//! init, delegate to a library) and `mqk-promotion::artifact_gate` for
//! the validate -> required-field-check -> hash/signature-verify ->
//! typed-error pipeline (`LockError` there, `BootError` here).

use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use logline_config::Environment;
use logline_crypto::{strip_proof_fields, verify_envelope};
use logline_ctx::{Ctx, CtxError, Env};
use logline_manifest::{Manifest, ManifestCache, ManifestError};
use logline_registry::{fetch_latest, insert_record, RegistryError};
use logline_sandbox::SandboxHost;
use logline_schemas::{EntityType, NewSpan, Span, Visibility};
use sqlx::PgPool;

#[derive(Debug, Error)]
pub enum BootError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("boot_function_id {0} is not in the manifest's allowed_boot_ids")]
    Forbidden(Uuid),
    #[error("function {0} not found")]
    FunctionNotFound(Uuid),
    #[error("no manifest is configured for this deployment")]
    Misconfigured,
    #[error("manifest unavailable: {0}")]
    ManifestUnavailable(String),
    #[error("function {0} carries a signature that does not verify")]
    SignatureInvalid(Uuid),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Ctx(#[from] CtxError),
}

impl BootError {
    /// §7's taxonomy, as the HTTP status `logline-daemon`'s `/boot`
    /// handler and `logline-stage0`'s own CLI exit path both map to.
    pub fn status_code(&self) -> u16 {
        match self {
            BootError::Validation(_) => 400,
            BootError::Forbidden(_) | BootError::SignatureInvalid(_) => 403,
            BootError::FunctionNotFound(_) => 404,
            BootError::Misconfigured | BootError::ManifestUnavailable(_) => 503,
            BootError::Registry(_) | BootError::Ctx(_) => 500,
        }
    }
}

/// The raw, untrusted `POST /boot` body (§4.4 Inputs).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RawBootRequest {
    pub boot_function_id: String,
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub trace_id: Option<String>,
}

struct BootRequest {
    boot_function_id: Uuid,
    user_id: String,
    tenant_id: Option<String>,
    trace_id: Option<Uuid>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BootOutcome {
    pub boot_event_id: Uuid,
    pub function_id: Uuid,
    pub status: &'static str,
    pub output: Value,
    pub duration_ms: i64,
}

fn is_valid_user_id(s: &str) -> bool {
    (1..=100).contains(&s.len()) && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-'))
}

fn is_valid_tenant_id(s: &str) -> bool {
    (1..=50).contains(&s.len()) && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn validate(raw: RawBootRequest) -> Result<BootRequest, BootError> {
    let boot_function_id = Uuid::parse_str(&raw.boot_function_id)
        .map_err(|_| BootError::Validation("boot_function_id must be a syntactically valid UUID".into()))?;
    if !is_valid_user_id(&raw.user_id) {
        return Err(BootError::Validation("user_id must match [a-z0-9:_-]{1,100}".into()));
    }
    if let Some(tenant_id) = &raw.tenant_id {
        if !is_valid_tenant_id(tenant_id) {
            return Err(BootError::Validation("tenant_id must match [a-z0-9-]{1,50}".into()));
        }
    }
    let trace_id = raw
        .trace_id
        .map(|s| Uuid::parse_str(&s).map_err(|_| BootError::Validation("trace_id must be a valid UUID".into())))
        .transpose()?;

    Ok(BootRequest {
        boot_function_id,
        user_id: raw.user_id,
        tenant_id: raw.tenant_id,
        trace_id,
    })
}

/// True when `err` is `ManifestCache`'s collapsed form of "no manifest
/// row exists at all" rather than a transient fetch failure. The cache
/// folds every refresh failure through `anyhow` for its stale-serve
/// discipline (`logline-config::ttl::TtlCache`), so this distinction —
/// needed only for step 3's production/non-production branch — is
/// recovered from the error text rather than the error type.
fn manifest_missing_entirely(err: &ManifestError) -> bool {
    err.to_string().contains("no manifest record is visible to this session")
}

/// Entry point for one boot request. See §4.4 for the algorithm this
/// implements step by step.
pub async fn boot(
    pool: &PgPool,
    manifest_cache: &ManifestCache,
    signing_key_hex: Option<&str>,
    environment: Environment,
    raw: RawBootRequest,
) -> Result<BootOutcome, BootError> {
    let request = validate(raw)?;

    let env = Env {
        user_id: request.user_id.clone(),
        tenant_id: request.tenant_id.clone(),
        signing_key_hex: signing_key_hex.map(str::to_string),
    };
    let ctx = Ctx::new(pool.clone(), env);

    let (manifest, unconfigured_fallback) = match manifest_cache.current(pool, ctx.session()).await {
        Ok(manifest) => (manifest, false),
        Err(err) if manifest_missing_entirely(&err) => {
            if environment.is_production() {
                return Err(BootError::Misconfigured);
            }
            warn!(%err, "stage0: no manifest configured; proceeding without a whitelist (non-production)");
            (Manifest::default(), true)
        }
        Err(err) => return Err(BootError::ManifestUnavailable(err.to_string())),
    };

    // An empty `allowed_boot_ids` on a real, fetched manifest still
    // denies every boot (§4.4 step 3) — only the no-manifest-at-all
    // fallback above skips the whitelist check entirely.
    if !unconfigured_fallback && !manifest.allows_boot(&request.boot_function_id) {
        return Err(BootError::Forbidden(request.boot_function_id));
    }

    let function = fetch_latest(ctx.pool(), ctx.session(), request.boot_function_id)
        .await?
        .ok_or(BootError::FunctionNotFound(request.boot_function_id))?;
    if function.entity_type != EntityType::Function {
        return Err(BootError::FunctionNotFound(request.boot_function_id));
    }

    verify_function_signature(&function)?;

    let boot_event = build_boot_event(&request, &function);
    let boot_event = insert_record(ctx.pool(), ctx.session(), boot_event).await?;

    let host = SandboxHost::new(Duration::from_millis(manifest.policy.slow_ms.max(0) as u64));
    let code = function.code.clone().unwrap_or_default();
    let started = Instant::now();
    let result = host.execute(code, function.input.clone()).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    let (status, output) = match result {
        Ok(value) => ("complete", value),
        Err(err) => {
            warn!(%err, function_id = %function.id, "stage0: boot function raised a sandbox error");
            ("error", serde_json::json!({ "message": err.to_string() }))
        }
    };

    Ok(BootOutcome {
        boot_event_id: boot_event.id,
        function_id: function.id,
        status,
        output,
        duration_ms,
    })
}

/// §4.2 signature check, step 5: only enforced when the function record
/// actually carries `signature`/`public_key` — an unsigned function is
/// not an error here, Stage-0 simply runs it unverified.
fn verify_function_signature(function: &Span) -> Result<(), BootError> {
    let (Some(signature), Some(public_key), Some(claimed_hash)) =
        (&function.signature, &function.public_key, &function.curr_hash)
    else {
        return Ok(());
    };

    let body = strip_proof_fields(serde_json::to_value(function).expect("Span serialization cannot fail"));
    match verify_envelope(&body, claimed_hash, signature, public_key) {
        Ok(()) => Ok(()),
        Err(_) => Err(BootError::SignatureInvalid(function.id)),
    }
}

/// Step 6: an `input` payload of ids only, never secrets.
fn build_boot_event(request: &BootRequest, function: &Span) -> NewSpan {
    let mut boot_event = NewSpan::new(EntityType::BootEvent, "edge:stage0", request.user_id.clone())
        .did("booted")
        .this("stage0")
        .status("complete")
        .related_to([function.id])
        .input(serde_json::json!({
            "boot_function_id": function.id,
            "user_id": request.user_id,
            "tenant_id": request.tenant_id,
        }));
    if let Some(tenant_id) = request.tenant_id.clone() {
        boot_event = boot_event.tenant(tenant_id).visibility(Visibility::Tenant);
    }
    if let Some(trace_id) = request.trace_id {
        boot_event = boot_event.trace_id(trace_id);
    }
    boot_event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_boot_function_id() {
        let raw = RawBootRequest {
            boot_function_id: "not-a-uuid".into(),
            user_id: "alice".into(),
            tenant_id: None,
            trace_id: None,
        };
        assert!(matches!(validate(raw), Err(BootError::Validation(_))));
    }

    #[test]
    fn rejects_user_id_with_disallowed_characters() {
        let raw = RawBootRequest {
            boot_function_id: Uuid::now_v7().to_string(),
            user_id: "alice smith".into(),
            tenant_id: None,
            trace_id: None,
        };
        assert!(matches!(validate(raw), Err(BootError::Validation(_))));
    }

    #[test]
    fn rejects_tenant_id_outside_its_charset() {
        let raw = RawBootRequest {
            boot_function_id: Uuid::now_v7().to_string(),
            user_id: "alice".into(),
            tenant_id: Some("Acme_Corp".into()),
            trace_id: None,
        };
        assert!(matches!(validate(raw), Err(BootError::Validation(_))));
    }

    #[test]
    fn accepts_a_well_formed_request() {
        let raw = RawBootRequest {
            boot_function_id: Uuid::now_v7().to_string(),
            user_id: "svc:stage0-test_01".into(),
            tenant_id: Some("acme-prod".into()),
            trace_id: Some(Uuid::now_v7().to_string()),
        };
        let parsed = validate(raw).unwrap();
        assert_eq!(parsed.user_id, "svc:stage0-test_01");
        assert_eq!(parsed.tenant_id.as_deref(), Some("acme-prod"));
    }

    #[test]
    fn status_codes_follow_the_section_7_taxonomy() {
        assert_eq!(BootError::Validation("x".into()).status_code(), 400);
        assert_eq!(BootError::Forbidden(Uuid::now_v7()).status_code(), 403);
        assert_eq!(BootError::SignatureInvalid(Uuid::now_v7()).status_code(), 403);
        assert_eq!(BootError::FunctionNotFound(Uuid::now_v7()).status_code(), 404);
        assert_eq!(BootError::Misconfigured.status_code(), 503);
    }

    #[test]
    fn unsigned_function_passes_the_signature_check_unverified() {
        let function = Span {
            id: Uuid::now_v7(),
            seq: 0,
            entity_type: EntityType::Function,
            who: "u".into(),
            did: String::new(),
            this: String::new(),
            at: chrono::Utc::now(),
            parent_id: None,
            related_to: Default::default(),
            owner_id: "u".into(),
            tenant_id: None,
            visibility: Visibility::Private,
            status: None,
            is_deleted: false,
            name: None,
            description: None,
            code: Some("1".into()),
            language: None,
            runtime: None,
            input: Value::Null,
            output: Value::Null,
            error: Value::Null,
            duration_ms: None,
            trace_id: None,
            prev_hash: None,
            curr_hash: None,
            signature: None,
            public_key: None,
            metadata: Value::Null,
        };
        assert!(verify_function_signature(&function).is_ok());
    }
}
