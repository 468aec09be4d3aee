//! `run_code_kernel` (§4.5): executes one `function` record's `code` in
//! the sandbox and emits exactly one signed `execution` record, plus
//! optionally a `policy_violation` (quota) or a `status_patch` (slow).
//!
//! Grounded on `BrokerGateway::enforce_gates`'s ordered, first-failure-
//! wins gate sequencing — generalized here from three trading gates
//! (integrity/risk/reconcile) to this kernel's three: tenant quota,
//! per-record lock, sandbox deadline.

use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use logline_crypto::{seal, signing_key_from_hex, strip_proof_fields};
use logline_ctx::Ctx;
use logline_manifest::Manifest;
use logline_registry::{count_executions_today, fetch_latest, insert_record, with_advisory_lock, RegistryError};
use logline_sandbox::SandboxHost;
use logline_schemas::{EntityType, NewSpan, Span, Visibility};

#[derive(Debug, Error)]
pub enum RunCodeError {
    #[error("record {0} is not a function record")]
    InvalidTarget(Uuid),
    #[error("record {0} belongs to a different tenant than this session")]
    TenantMismatch(Uuid),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What happened to one invocation. Most callers only care whether this
/// is `Executed`; the rest let a request-worker or CLI caller decide
/// whether to log, retry, or surface the contention as a no-op.
#[derive(Debug)]
pub enum RunCodeOutcome {
    /// Lost the tenant throttle lock race; caller should re-drive later.
    ThrottleContended,
    /// Tenant is at or over quota and the target isn't override-signed.
    QuotaExceeded { violation_id: Uuid },
    /// Another worker already holds this record's advisory lock.
    RecordContended,
    /// The sandbox ran; `execution_id` is the signed record's id.
    Executed { execution_id: Uuid, status: &'static str },
}

/// Entry point a request-worker (or the CLI, for manual re-drive) calls
/// for one `function` record id. See §4.5 for the full algorithm this
/// implements step by step.
pub async fn run_code_kernel(ctx: &Ctx, manifest: &Manifest, span_id: Uuid) -> Result<RunCodeOutcome, RunCodeError> {
    let target = fetch_latest(ctx.pool(), ctx.session(), span_id)
        .await?
        .ok_or(RunCodeError::InvalidTarget(span_id))?;

    if target.entity_type != EntityType::Function {
        return Err(RunCodeError::InvalidTarget(span_id));
    }
    if target.tenant_id != ctx.session().tenant_id {
        return Err(RunCodeError::TenantMismatch(span_id));
    }

    if let Some(tenant_id) = target.tenant_id.clone() {
        let throttle_key = format!("throttle:{tenant_id}");
        let count_tenant = tenant_id.clone();
        let count = with_advisory_lock(ctx.pool(), &throttle_key, move |_conn| {
            let tenant_id = count_tenant.clone();
            async move { count_executions_today(ctx.pool(), &tenant_id).await }
        })
        .await?;

        let Some(count) = count else {
            warn!(%span_id, "run_code: lost the tenant throttle lock race");
            return Ok(RunCodeOutcome::ThrottleContended);
        };

        let forced = target
            .metadata
            .get("force")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
            && target
                .public_key
                .as_deref()
                .is_some_and(|pk| manifest.is_override_key(pk));

        if count >= manifest.quota_for_tenant() && !forced {
            let violation = NewSpan::new(
                EntityType::PolicyViolation,
                format!("kernel:run_code@{span_id}"),
                ctx.session().user_id.clone(),
            )
            .did("quota_exceeded")
            .this(target.this.clone())
            .parent(target.id)
            .related_to([target.id])
            .tenant(tenant_id)
            .visibility(Visibility::Tenant)
            .metadata(serde_json::json!({
                "limit": manifest.quota_for_tenant(),
                "count": count,
            }));
            let inserted = insert_record(ctx.pool(), ctx.session(), violation).await?;
            warn!(%span_id, violation_id = %inserted.id, "run_code: tenant over daily execution quota");
            return Ok(RunCodeOutcome::QuotaExceeded { violation_id: inserted.id });
        }
    }

    let record_key = format!("record:{span_id}");
    let outcome = with_advisory_lock(ctx.pool(), &record_key, |_conn| async { execute_and_sign(ctx, manifest, &target).await }).await?;

    match outcome {
        None => {
            info!(%span_id, "run_code: another worker holds this record's lock");
            Ok(RunCodeOutcome::RecordContended)
        }
        Some(outcome) => Ok(outcome),
    }
}

/// Steps 4-8 of §4.5, run under the per-record advisory lock: execute
/// the sandbox, emit the optional slow-path `status_patch`, then sign
/// and insert the `execution` record.
async fn execute_and_sign(ctx: &Ctx, manifest: &Manifest, target: &Span) -> Result<RunCodeOutcome, RegistryError> {
    let slow_ms = manifest.policy.slow_ms;
    let host = SandboxHost::new(Duration::from_millis(slow_ms.max(0) as u64));
    let trace_id = target.trace_id.unwrap_or_else(Uuid::now_v7);
    let code = target.code.clone().unwrap_or_default();

    let started = Instant::now();
    let result = host.execute(code, target.input.clone()).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    let (status, output, error): (&'static str, serde_json::Value, serde_json::Value) = match result {
        Ok(value) => ("complete", value, serde_json::Value::Null),
        Err(logline_sandbox::SandboxError::Timeout) => (
            "error",
            serde_json::Value::Null,
            serde_json::json!({ "message": "timeout" }),
        ),
        Err(err) => (
            "error",
            serde_json::Value::Null,
            serde_json::json!({ "message": err.to_string() }),
        ),
    };

    if status == "complete" && duration_ms > slow_ms {
        let mut patch = NewSpan::new(
            EntityType::StatusPatch,
            format!("kernel:run_code@{}", target.id),
            ctx.session().user_id.clone(),
        )
        .did("mark_slow")
        .this(target.this.clone())
        .parent(target.id)
        .related_to([target.id])
        .status("slow")
        .trace_id(trace_id)
        .metadata(serde_json::json!({ "status": "slow", "duration_ms": duration_ms }));
        if let Some(tenant_id) = &target.tenant_id {
            patch = patch.tenant(tenant_id.clone()).visibility(Visibility::Tenant);
        }
        insert_record(ctx.pool(), ctx.session(), patch).await?;
        info!(target_id = %target.id, duration_ms, "run_code: emitted slow status_patch");
    }

    let execution_id = Uuid::now_v7();
    let at = Utc::now();
    let mut new_span = NewSpan::new(
        EntityType::Execution,
        format!("kernel:run_code@{}", target.id),
        ctx.session().user_id.clone(),
    )
    .did("execute")
    .this(target.this.clone())
    .parent(target.id)
    .related_to([target.id])
    .status(status)
    .input(target.input.clone())
    .output(output)
    .error(error)
    .duration_ms(duration_ms)
    .trace_id(trace_id)
    .id(execution_id)
    .at(at);
    if let Some(tenant_id) = &target.tenant_id {
        new_span = new_span.tenant(tenant_id.clone()).visibility(Visibility::Tenant);
    }

    let preview = new_span.preview_span(execution_id, 0, at);
    let body = strip_proof_fields(serde_json::to_value(&preview).expect("Span serialization cannot fail"));
    let signing_key_hex = ctx
        .env()
        .signing_key_hex
        .as_deref()
        .ok_or_else(|| RegistryError::InvariantViolation("no signing key configured for this session".into()))?;
    let signing_key = signing_key_from_hex(signing_key_hex)?;
    let envelope = seal(&signing_key, &body);
    let new_span = new_span.sealed(envelope.curr_hash, envelope.signature, envelope.public_key);

    let inserted = insert_record(ctx.pool(), ctx.session(), new_span).await?;
    info!(execution_id = %inserted.id, status, duration_ms, "run_code: execution recorded");

    Ok(RunCodeOutcome::Executed {
        execution_id: inserted.id,
        status,
    })
}
