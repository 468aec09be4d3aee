//! `observer_bot_kernel` (§4.6): a periodic, cron-driven kernel that
//! turns `function` records in `status='scheduled'` into `request`
//! records for `request_worker_kernel` to pick up.
//!
//! Grounded on `mqk-backtest::BacktestEngine::run`'s bar-by-bar replay
//! loop — one batch, iterate oldest-first, act or skip per item,
//! continue regardless — generalized from a deterministic replay over
//! historical bars to a live oldest-first scan over scheduled rows.

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use logline_ctx::Ctx;
use logline_manifest::Manifest;
use logline_registry::{count_executions_today, fetch_oldest_batch, insert_record, with_advisory_lock, RegistryError};
use logline_schemas::{EntityType, NewSpan, Visibility};

const BATCH_SIZE: i64 = 16;

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Outcome for one `function` row the scan considered.
#[derive(Debug)]
pub enum ObserverItemOutcome {
    /// Another worker already holds the row's advisory lock.
    Contended,
    /// Tenant is at or over quota; a `policy_violation` was recorded.
    QuotaExceeded { violation_id: Uuid },
    /// A `request` row was inserted.
    Scheduled { request_id: Uuid },
    /// The insert raced with another observer and lost; the partial
    /// unique index (§4.1) makes this idempotent across concurrent runs.
    AlreadyScheduled,
}

/// One pass of the periodic scan: oldest-first batch of ≤16 scheduled
/// `function` rows, one outcome per row considered.
pub async fn observer_bot_kernel(ctx: &Ctx, manifest: &Manifest) -> Result<Vec<ObserverItemOutcome>, ObserverError> {
    let batch = fetch_oldest_batch(ctx.pool(), ctx.session(), EntityType::Function, "scheduled", BATCH_SIZE).await?;

    let mut outcomes = Vec::with_capacity(batch.len());
    for function in batch {
        let lock_key = format!("record:{}", function.id);
        let result = with_advisory_lock(ctx.pool(), &lock_key, |_conn| async {
            let Some(tenant_id) = function.tenant_id.clone() else {
                return schedule_request(ctx, &function).await;
            };

            let count = count_executions_today(ctx.pool(), &tenant_id).await?;
            if count >= manifest.quota_for_tenant() {
                let violation = NewSpan::new(
                    EntityType::PolicyViolation,
                    "kernel:observer".to_string(),
                    ctx.session().user_id.clone(),
                )
                .did("quota_exceeded")
                .this(function.this.clone())
                .parent(function.id)
                .related_to([function.id])
                .tenant(tenant_id)
                .visibility(Visibility::Tenant)
                .metadata(serde_json::json!({ "limit": manifest.quota_for_tenant(), "count": count }));
                let inserted = insert_record(ctx.pool(), ctx.session(), violation).await?;
                return Ok(ObserverItemOutcome::QuotaExceeded { violation_id: inserted.id });
            }

            schedule_request(ctx, &function).await
        })
        .await?;

        match result {
            None => {
                info!(function_id = %function.id, "observer: skipping, record lock held elsewhere");
                outcomes.push(ObserverItemOutcome::Contended);
            }
            Some(outcome) => outcomes.push(outcome),
        }
    }

    Ok(outcomes)
}

async fn schedule_request(ctx: &Ctx, function: &logline_schemas::Span) -> Result<ObserverItemOutcome, RegistryError> {
    let mut request = NewSpan::new(EntityType::Request, "kernel:observer".to_string(), ctx.session().user_id.clone())
        .did("schedule")
        .this("run_code")
        .parent(function.id)
        .related_to([function.id])
        .status("scheduled")
        .trace_id(Uuid::now_v7());
    if let Some(tenant_id) = &function.tenant_id {
        request = request.tenant(tenant_id.clone()).visibility(Visibility::Tenant);
    }

    match insert_record(ctx.pool(), ctx.session(), request).await {
        Ok(inserted) => {
            info!(function_id = %function.id, request_id = %inserted.id, "observer: scheduled run_code request");
            Ok(ObserverItemOutcome::Scheduled { request_id: inserted.id })
        }
        Err(RegistryError::Conflict(_)) => {
            warn!(function_id = %function.id, "observer: request already scheduled by a concurrent run");
            Ok(ObserverItemOutcome::AlreadyScheduled)
        }
        Err(other) => Err(other),
    }
}
