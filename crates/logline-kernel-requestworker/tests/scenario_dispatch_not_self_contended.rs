//! Regression coverage for the request-worker/run_code double-lock: a
//! scheduled request's parent must actually execute, not come back
//! contended against the worker's own dispatch (SPEC_FULL.md §4.7).

use logline_ctx::{Ctx, Env};
use logline_kernel_requestworker::{request_worker_kernel, RequestWorkerItemOutcome};
use logline_kernel_runcode::RunCodeOutcome;
use logline_manifest::{KernelIds, Manifest};
use logline_registry::Session;
use logline_schemas::{EntityType, NewSpan, Visibility};
use logline_testkit::{db_pool, function_fixture, insert_signed, TEST_SIGNING_KEY_HEX};

#[tokio::test]
async fn a_scheduled_request_is_dispatched_and_executes_in_one_pass() {
    let Ok(pool) = db_pool().await else { return };
    let tenant_id = "t-worker";
    let user_id = "u-worker";
    let session = Session::new(user_id, Some(tenant_id.to_string()));

    let function = function_fixture(user_id, "1 + 1").tenant(tenant_id).visibility(Visibility::Tenant);
    let function = insert_signed(&pool, &session, function).await.unwrap();

    // `request_worker_kernel` fails fast unless its own kernel function
    // id resolves in the ledger; any existing record id satisfies it.
    let run_code_kernel_fn = function_fixture(user_id, "1").tenant(tenant_id).visibility(Visibility::Tenant);
    let run_code_kernel_fn = insert_signed(&pool, &session, run_code_kernel_fn).await.unwrap();

    let request = NewSpan::new(EntityType::Request, "kernel:observer".to_string(), user_id.to_string())
        .did("schedule")
        .this("run_code")
        .parent(function.id)
        .related_to([function.id])
        .status("scheduled")
        .tenant(tenant_id)
        .visibility(Visibility::Tenant);
    logline_registry::insert_record(&pool, &session, request).await.unwrap();

    let manifest = Manifest {
        kernels: KernelIds {
            run_code: Some(run_code_kernel_fn.id),
            ..Default::default()
        },
        ..Default::default()
    };

    let ctx = Ctx::new(
        pool,
        Env {
            user_id: user_id.to_string(),
            tenant_id: Some(tenant_id.to_string()),
            signing_key_hex: Some(TEST_SIGNING_KEY_HEX.to_string()),
        },
    );

    let outcomes = request_worker_kernel(&ctx, &manifest).await.unwrap();
    let matching: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, RequestWorkerItemOutcome::Dispatched(RunCodeOutcome::Executed { .. })))
        .collect();
    assert_eq!(
        matching.len(),
        1,
        "expected exactly one executed dispatch, got {outcomes:?}"
    );
}
