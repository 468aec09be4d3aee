//! `request_worker_kernel` (§4.7): pulls scheduled `request` records
//! and dispatches `run_code_kernel` on their `parent_id`.
//!
//! Grounded on `logline-kernel-runcode`'s old-teacher `order_router.rs`
//! boundary (route a decision to a concrete handler under lock, one
//! choke-point, no strategy/risk logic of its own) — generalized from
//! routing an execution intent to a broker adapter to routing a
//! scheduled request to the native `run_code_kernel` dispatch.

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use logline_ctx::Ctx;
use logline_kernel_runcode::{run_code_kernel, RunCodeOutcome};
use logline_manifest::Manifest;
use logline_registry::{fetch_latest, fetch_oldest_batch, RegistryError};
use logline_schemas::EntityType;

const BATCH_SIZE: i64 = 8;

#[derive(Debug, Error)]
pub enum RequestWorkerError {
    #[error("manifest has no run_code kernel configured")]
    RunCodeKernelUnconfigured,
    #[error("run_code kernel function {0} is not present in the ledger")]
    RunCodeKernelMissing(Uuid),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug)]
pub enum RequestWorkerItemOutcome {
    /// `run_code_kernel` ran (or declined, e.g. lost its own per-record
    /// lock race — see `RunCodeOutcome::RecordContended`) for this
    /// request's parent.
    Dispatched(RunCodeOutcome),
    /// `run_code_kernel` itself failed; the request is left `scheduled`
    /// for a future pass rather than silently dropped.
    Failed { request_id: Uuid, error: String },
}

/// One pass: verify the ledger still carries a `run_code` kernel
/// function (step 1, fail fast), then drain ≤8 oldest-first scheduled
/// requests. Dispatch goes straight to `run_code_kernel`, which takes
/// the `record:{parent_id}` advisory lock itself — this loop must not
/// also take it, since Postgres session-level advisory locks are
/// per-connection and `with_advisory_lock` opens a fresh connection per
/// call, so an outer lock here would never see the inner one as held
/// by the same logical worker and the batch would self-contend.
pub async fn request_worker_kernel(ctx: &Ctx, manifest: &Manifest) -> Result<Vec<RequestWorkerItemOutcome>, RequestWorkerError> {
    let run_code_id = manifest
        .kernels
        .run_code
        .ok_or(RequestWorkerError::RunCodeKernelUnconfigured)?;
    fetch_latest(ctx.pool(), ctx.session(), run_code_id)
        .await?
        .ok_or(RequestWorkerError::RunCodeKernelMissing(run_code_id))?;

    let batch = fetch_oldest_batch(ctx.pool(), ctx.session(), EntityType::Request, "scheduled", BATCH_SIZE).await?;

    let mut outcomes = Vec::with_capacity(batch.len());
    for request in batch {
        let target_id = request.parent_id.unwrap_or(request.id);
        match run_code_kernel(ctx, manifest, target_id).await {
            Ok(outcome) => outcomes.push(RequestWorkerItemOutcome::Dispatched(outcome)),
            Err(err) => {
                warn!(request_id = %request.id, %err, "request_worker: run_code_kernel dispatch failed");
                outcomes.push(RequestWorkerItemOutcome::Failed {
                    request_id: request.id,
                    error: err.to_string(),
                });
            }
        }
    }

    Ok(outcomes)
}
