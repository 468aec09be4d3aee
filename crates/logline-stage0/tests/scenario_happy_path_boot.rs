//! End-to-end happy-path boot and execute (SPEC_FULL.md §8 S1): a
//! whitelisted function boots, runs once, and the sandboxed output is
//! recorded on the resulting `execution` row.

use std::time::Duration;

use logline_config::Environment;
use logline_manifest::{Manifest, ManifestCache};
use logline_registry::{QueryFilters, Session};
use logline_schemas::EntityType;
use logline_stage0::{boot, RawBootRequest};
use logline_testkit::{db_pool, function_fixture, insert_signed, manifest_fixture, TEST_SIGNING_KEY_HEX};

#[tokio::test]
async fn boots_a_whitelisted_function_and_records_one_execution() {
    let Ok(pool) = db_pool().await else { return };
    let tenant_id = "t-s1";
    let user_id = "u1";
    let session = Session::new(user_id, Some(tenant_id.to_string()));

    let function = function_fixture(user_id, r#"{"hello": "world"}"#)
        .status("active")
        .tenant(tenant_id)
        .visibility(logline_schemas::Visibility::Tenant);
    let function = insert_signed(&pool, &session, function).await.unwrap();

    let manifest = Manifest {
        allowed_boot_ids: vec![function.id],
        ..Default::default()
    };
    let manifest_span = manifest_fixture(user_id, &manifest);
    insert_signed(&pool, &session, manifest_span).await.unwrap();

    let manifest_cache = ManifestCache::new(Duration::from_secs(300));
    let request = RawBootRequest {
        boot_function_id: function.id.to_string(),
        user_id: user_id.to_string(),
        tenant_id: Some(tenant_id.to_string()),
        trace_id: None,
    };

    let outcome = boot(
        &pool,
        &manifest_cache,
        Some(TEST_SIGNING_KEY_HEX),
        Environment::NonProduction,
        request,
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, "complete");
    assert!(outcome.duration_ms < 5000);
    assert_eq!(outcome.output, serde_json::json!({"hello": "world"}));

    let boot_events = logline_registry::query_timeline(
        &pool,
        &session,
        &QueryFilters {
            entity_type: Some(EntityType::BootEvent),
            status: None,
            owner_id: None,
            visibility: None,
            limit: 10,
            offset: 0,
        },
    )
    .await
    .unwrap();
    assert_eq!(boot_events.iter().filter(|b| b.parent_id == Some(function.id)).count(), 1);

    let executions = logline_registry::query_timeline(
        &pool,
        &session,
        &QueryFilters {
            entity_type: Some(EntityType::Execution),
            status: None,
            owner_id: None,
            visibility: None,
            limit: 10,
            offset: 0,
        },
    )
    .await
    .unwrap();
    let matching: Vec<_> = executions.iter().filter(|e| e.parent_id == Some(function.id)).collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].status.as_deref(), Some("complete"));
}

#[tokio::test]
async fn a_real_manifest_with_an_empty_allowlist_still_forbids_every_boot() {
    let Ok(pool) = db_pool().await else { return };
    let tenant_id = "t-s1-empty-allowlist";
    let user_id = "u-empty-allowlist";
    let session = Session::new(user_id, Some(tenant_id.to_string()));

    let function = function_fixture(user_id, "1").status("active").tenant(tenant_id).visibility(logline_schemas::Visibility::Tenant);
    let function = insert_signed(&pool, &session, function).await.unwrap();

    // `allowed_boot_ids` deliberately empty — this is a fetched,
    // well-formed manifest, not the no-manifest-configured fallback, so
    // it must still deny every boot rather than skip the check.
    let manifest = Manifest::default();
    let manifest_span = manifest_fixture(user_id, &manifest);
    insert_signed(&pool, &session, manifest_span).await.unwrap();

    let manifest_cache = ManifestCache::new(Duration::from_secs(300));
    let request = RawBootRequest {
        boot_function_id: function.id.to_string(),
        user_id: user_id.to_string(),
        tenant_id: Some(tenant_id.to_string()),
        trace_id: None,
    };

    let outcome = boot(
        &pool,
        &manifest_cache,
        Some(TEST_SIGNING_KEY_HEX),
        Environment::NonProduction,
        request,
    )
    .await;

    assert!(matches!(outcome, Err(logline_stage0::BootError::Forbidden(id)) if id == function.id));
}
