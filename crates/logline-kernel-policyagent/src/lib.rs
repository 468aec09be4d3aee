//! `policy_agent_kernel` (§4.8): per-policy cursor pump. Each active
//! `policy` record walks records newer than its own cursor through a
//! sandboxed rule, turning whatever action list the rule returns into
//! signed `request`/arbitrary records, then advances its cursor.
//!
//! Grounded on the old reconcile engine's `SnapshotWatermark`
//! (`watermark.rs`) — non-decreasing, fail-closed cursor, generalized
//! here from one snapshot timestamp to a per-policy `at` watermark
//! stored as its own `policy_cursor` row — and on its `gate.rs`'s
//! evaluate-then-gate structure, generalized from a fixed
//! reconciliation check to arbitrary record-resident policy code.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use logline_crypto::{seal, signing_key_from_hex, strip_proof_fields};
use logline_ctx::Ctx;
use logline_registry::{
    fetch_latest_policy_cursor, fetch_records_since, insert_record, query_timeline, with_advisory_lock, QueryFilters,
    RegistryError,
};
use logline_sandbox::SandboxHost;
use logline_schemas::{EntityType, NewSpan, Span, Visibility};

const POLICY_BATCH: i64 = 8;
const RECORD_BATCH: i64 = 500;
const EVAL_DEADLINE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum PolicyAgentError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Outcome for one active `policy` row the pass considered.
#[derive(Debug)]
pub enum PolicyRunOutcome {
    /// Another worker already holds this policy's advisory lock.
    Contended,
    /// The policy ran; cursor advanced past `processed` candidates.
    Ran { policy_id: Uuid, processed: usize, actions_emitted: usize, errors_emitted: usize },
    /// No candidates newer than the cursor; nothing to do this pass.
    Idle { policy_id: Uuid },
}

/// One pass over every active policy (§4.8 step 1-2). Policies are
/// processed in whatever order the visible timeline returns them, each
/// under its own advisory lock so concurrent passes never double-
/// advance one cursor.
pub async fn policy_agent_kernel(ctx: &Ctx) -> Result<Vec<PolicyRunOutcome>, PolicyAgentError> {
    let filters = QueryFilters {
        entity_type: Some(EntityType::Policy),
        status: Some("active".into()),
        limit: POLICY_BATCH.max(1) * 32,
        ..Default::default()
    };
    let policies = query_timeline(ctx.pool(), ctx.session(), &filters).await?;

    let mut outcomes = Vec::with_capacity(policies.len());
    for policy in policies {
        let lock_key = format!("policy:{}", policy.id);
        let result = with_advisory_lock(ctx.pool(), &lock_key, |_conn| async { run_one_policy(ctx, &policy).await }).await?;

        match result {
            None => {
                info!(policy_id = %policy.id, "policy_agent: skipping, policy lock held elsewhere");
                outcomes.push(PolicyRunOutcome::Contended);
            }
            Some(outcome) => outcomes.push(outcome),
        }
    }

    Ok(outcomes)
}

/// Steps 2a-2e of §4.8 for a single policy, run under its advisory lock.
async fn run_one_policy(ctx: &Ctx, policy: &Span) -> Result<PolicyRunOutcome, RegistryError> {
    let since = fetch_latest_policy_cursor(ctx.pool(), ctx.session(), policy.id)
        .await?
        .and_then(|cursor| cursor.metadata.get("last_at").and_then(|v| v.as_str()).map(str::to_owned))
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).expect("epoch is a valid timestamp"));

    let batch = fetch_records_since(ctx.pool(), ctx.session(), policy.tenant_id.as_deref(), since, RECORD_BATCH).await?;

    if batch.is_empty() {
        return Ok(PolicyRunOutcome::Idle { policy_id: policy.id });
    }

    let code = policy.code.clone().unwrap_or_default();
    let host = SandboxHost::new(EVAL_DEADLINE);

    let mut actions_emitted = 0usize;
    let mut errors_emitted = 0usize;
    let mut last_at = since;

    for candidate in &batch {
        let input = serde_json::to_value(candidate).expect("Span serialization cannot fail");
        match host.execute(code.clone(), input).await {
            Ok(Value::Array(actions)) => {
                for action in actions {
                    if apply_action(ctx, policy, candidate, &action).await? {
                        actions_emitted += 1;
                    } else {
                        errors_emitted += 1;
                        emit_policy_error(ctx, policy, candidate, "policy returned an unrecognized action shape").await?;
                    }
                }
            }
            Ok(_) => {
                warn!(policy_id = %policy.id, record_id = %candidate.id, "policy_agent: policy did not return a list of actions");
                errors_emitted += 1;
                emit_policy_error(ctx, policy, candidate, "policy did not return a list of actions").await?;
            }
            Err(err) => {
                warn!(policy_id = %policy.id, record_id = %candidate.id, %err, "policy_agent: policy evaluation failed");
                errors_emitted += 1;
                emit_policy_error(ctx, policy, candidate, &err.to_string()).await?;
            }
        }
        last_at = candidate.at;
    }

    let mut cursor = NewSpan::new(EntityType::PolicyCursor, format!("kernel:policy_agent@{}", policy.id), ctx.session().user_id.clone())
        .did("advance_cursor")
        .this(policy.this.clone())
        .related_to([policy.id])
        .metadata(serde_json::json!({ "last_at": last_at.to_rfc3339() }));
    if let Some(tenant_id) = &policy.tenant_id {
        cursor = cursor.tenant(tenant_id.clone()).visibility(Visibility::Tenant);
    }
    insert_record(ctx.pool(), ctx.session(), cursor).await?;

    Ok(PolicyRunOutcome::Ran { policy_id: policy.id, processed: batch.len(), actions_emitted, errors_emitted })
}

#[derive(Debug, Deserialize)]
struct RunCodeAction {
    run: String,
    span_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct EmitSpanAction {
    emit_span: EmitSpanBody,
}

#[derive(Debug, Deserialize)]
struct EmitSpanBody {
    entity_type: String,
    #[serde(default)]
    who: Option<String>,
    #[serde(default)]
    did: Option<String>,
    #[serde(default)]
    this: Option<String>,
    #[serde(default)]
    parent_id: Option<Uuid>,
    #[serde(default)]
    related_to: Vec<Uuid>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    runtime: Option<String>,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Value,
    #[serde(default)]
    metadata: Value,
}

/// Turn one returned action into a signed record. Returns `Ok(false)`
/// (not an error) for an action shape that matches neither recognized
/// kind, so the caller can record it as a `policy_error` without
/// aborting the rest of the batch.
async fn apply_action(ctx: &Ctx, policy: &Span, source: &Span, action: &Value) -> Result<bool, RegistryError> {
    if let Ok(run_code) = serde_json::from_value::<RunCodeAction>(action.clone()) {
        if run_code.run == "run_code" {
            let mut request = NewSpan::new(EntityType::Request, format!("kernel:policy_agent@{}", policy.id), ctx.session().user_id.clone())
                .did("schedule")
                .this("run_code")
                .parent(run_code.span_id)
                .related_to([policy.id, run_code.span_id])
                .status("scheduled");
            if let Some(tenant_id) = &policy.tenant_id {
                request = request.tenant(tenant_id.clone()).visibility(Visibility::Tenant);
            }
            sign_and_insert(ctx, request).await?;
            return Ok(true);
        }
    }

    if let Ok(emit) = serde_json::from_value::<EmitSpanAction>(action.clone()) {
        let Some(entity_type) = EntityType::parse(&emit.emit_span.entity_type) else {
            return Ok(false);
        };
        let default_who = format!("kernel:policy_agent@{}", policy.id);
        let mut new_span = NewSpan::new(entity_type, emit.emit_span.who.unwrap_or(default_who), ctx.session().user_id.clone())
            .did(emit.emit_span.did.unwrap_or_default())
            .this(emit.emit_span.this.unwrap_or_default())
            .related_to(emit.emit_span.related_to.into_iter().chain([policy.id, source.id]))
            .input(emit.emit_span.input)
            .output(emit.emit_span.output)
            .error(emit.emit_span.error)
            .metadata(emit.emit_span.metadata);
        if let Some(parent_id) = emit.emit_span.parent_id {
            new_span = new_span.parent(parent_id);
        }
        if let Some(status) = emit.emit_span.status {
            new_span = new_span.status(status);
        }
        new_span.code = emit.emit_span.code;
        new_span.language = emit.emit_span.language;
        new_span.runtime = emit.emit_span.runtime;
        new_span.name = emit.emit_span.name;
        new_span.description = emit.emit_span.description;
        if let Some(tenant_id) = &policy.tenant_id {
            new_span = new_span.tenant(tenant_id.clone()).visibility(Visibility::Tenant);
        }
        sign_and_insert(ctx, new_span).await?;
        return Ok(true);
    }

    Ok(false)
}

async fn emit_policy_error(ctx: &Ctx, policy: &Span, source: &Span, message: &str) -> Result<(), RegistryError> {
    let mut error = NewSpan::new(EntityType::PolicyError, format!("kernel:policy_agent@{}", policy.id), ctx.session().user_id.clone())
        .did("policy_error")
        .this(policy.this.clone())
        .related_to([policy.id, source.id])
        .error(serde_json::json!({ "message": message }));
    if let Some(tenant_id) = &policy.tenant_id {
        error = error.tenant(tenant_id.clone()).visibility(Visibility::Tenant);
    }
    insert_record(ctx.pool(), ctx.session(), error).await?;
    Ok(())
}

/// Fix `id`/`seq`/`at`, hash, and sign before insert — the same
/// signing-timing pattern `logline-kernel-runcode` uses for `execution`
/// records (the signature covers `at`, so it must be known ahead of the
/// insert that assigns it).
async fn sign_and_insert(ctx: &Ctx, new_span: NewSpan) -> Result<Span, RegistryError> {
    let id = new_span.id.unwrap_or_else(Uuid::now_v7);
    let at = Utc::now();
    let new_span = new_span.id(id).at(at);

    let preview = new_span.preview_span(id, 0, at);
    let body = strip_proof_fields(serde_json::to_value(&preview).expect("Span serialization cannot fail"));
    let signing_key_hex = ctx
        .env()
        .signing_key_hex
        .as_deref()
        .ok_or_else(|| RegistryError::InvariantViolation("no signing key configured for this session".into()))?;
    let signing_key = signing_key_from_hex(signing_key_hex)?;
    let envelope = seal(&signing_key, &body);
    let new_span = new_span.sealed(envelope.curr_hash, envelope.signature, envelope.public_key);

    insert_record(ctx.pool(), ctx.session(), new_span).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_code_action_parses_from_its_json_shape() {
        let value = serde_json::json!({"run": "run_code", "span_id": "0190b1b0-0000-7000-8000-000000000000"});
        let action: RunCodeAction = serde_json::from_value(value).unwrap();
        assert_eq!(action.run, "run_code");
    }

    #[test]
    fn emit_span_action_parses_nested_body() {
        let value = serde_json::json!({"emit_span": {"entity_type": "policy_violation", "metadata": {"k": 1}}});
        let action: EmitSpanAction = serde_json::from_value(value).unwrap();
        assert_eq!(action.emit_span.entity_type, "policy_violation");
    }
}
