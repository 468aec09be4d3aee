//! Store-backed scenarios for the quota gate and the slow-execution
//! status patch (SPEC_FULL.md §8 P6/P7, S1/S2/S4).

use logline_ctx::{Ctx, Env};
use logline_kernel_runcode::{run_code_kernel, RunCodeOutcome};
use logline_manifest::Manifest;
use logline_registry::Session;
use logline_testkit::{db_pool, function_fixture, insert_signed, TEST_SIGNING_KEY_HEX};

fn ctx(pool: sqlx::PgPool, user_id: &str, tenant_id: &str) -> Ctx {
    Ctx::new(
        pool,
        Env {
            user_id: user_id.to_string(),
            tenant_id: Some(tenant_id.to_string()),
            signing_key_hex: Some(TEST_SIGNING_KEY_HEX.to_string()),
        },
    )
}

#[tokio::test]
async fn happy_path_execution_produces_one_complete_execution_row() {
    let Ok(pool) = db_pool().await else { return };
    let session = Session::new("u1", Some("t-happy".to_string()));
    let function = function_fixture("u1", "input.qty + 1");
    let function = function.tenant("t-happy");
    let inserted = insert_signed(&pool, &session, function).await.unwrap();

    let ctx = ctx(pool, "u1", "t-happy");
    let manifest = Manifest::default();
    let outcome = run_code_kernel(&ctx, &manifest, inserted.id).await.unwrap();

    match outcome {
        RunCodeOutcome::Executed { status, .. } => assert_eq!(status, "complete"),
        other => panic!("expected Executed, got {other:?}"),
    }
}

#[tokio::test]
async fn quota_exceeded_blocks_execution_without_override() {
    let Ok(pool) = db_pool().await else { return };
    let tenant_id = "t-quota";
    let session = Session::new("u1", Some(tenant_id.to_string()));
    let function = function_fixture("u1", "1").tenant(tenant_id);
    let inserted = insert_signed(&pool, &session, function).await.unwrap();

    let ctx = ctx(pool.clone(), "u1", tenant_id);
    let mut manifest = Manifest::default();
    manifest.throttle.per_tenant_daily_exec_limit = 0;

    let outcome = run_code_kernel(&ctx, &manifest, inserted.id).await.unwrap();
    match outcome {
        RunCodeOutcome::QuotaExceeded { .. } => {}
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn zero_slow_ms_marks_every_completed_execution_slow() {
    let Ok(pool) = db_pool().await else { return };
    let tenant_id = "t-slow";
    let session = Session::new("u1", Some(tenant_id.to_string()));
    let function = function_fixture("u1", "1 + 1").tenant(tenant_id);
    let inserted = insert_signed(&pool, &session, function).await.unwrap();

    let ctx = ctx(pool.clone(), "u1", tenant_id);
    let mut manifest = Manifest::default();
    manifest.policy.slow_ms = 0;

    let outcome = run_code_kernel(&ctx, &manifest, inserted.id).await.unwrap();
    assert!(matches!(outcome, RunCodeOutcome::Executed { status: "complete", .. }));

    let records = logline_registry::query_timeline(
        &pool,
        &session,
        &logline_registry::QueryFilters {
            entity_type: Some(logline_schemas::EntityType::StatusPatch),
            status: None,
            owner_id: None,
            visibility: None,
            limit: 10,
            offset: 0,
        },
    )
    .await
    .unwrap();
    assert!(records.iter().any(|r| r.parent_id == Some(inserted.id)));
}
