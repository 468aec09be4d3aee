//! A policy-agent pass with no new candidates advances no cursor twice
//! (SPEC_FULL.md §8 S6, R3).

use logline_ctx::{Ctx, Env};
use logline_kernel_policyagent::{policy_agent_kernel, PolicyRunOutcome};
use logline_registry::{QueryFilters, Session};
use logline_schemas::{EntityType, NewSpan, Visibility};
use logline_testkit::{db_pool, insert_signed, TEST_SIGNING_KEY_HEX};

#[tokio::test]
async fn second_pass_with_no_new_records_is_idle() {
    let Ok(pool) = db_pool().await else { return };
    let tenant_id = "t-policy";
    let session = Session::new("u1", Some(tenant_id.to_string()));

    let mut policy = NewSpan::new(EntityType::Policy, "testkit:fixture", "u1")
        .this("noop_policy")
        .status("active")
        .tenant(tenant_id)
        .visibility(Visibility::Tenant);
    policy.code = Some("[]".to_string());
    let policy = insert_signed(&pool, &session, policy).await.unwrap();

    // seed a candidate record so the first pass has something to walk.
    let seed = NewSpan::new(EntityType::Request, "testkit:fixture", "u1")
        .this("seed")
        .tenant(tenant_id)
        .visibility(Visibility::Tenant);
    insert_signed(&pool, &session, seed).await.unwrap();

    let ctx = Ctx::new(
        pool.clone(),
        Env {
            user_id: "u1".to_string(),
            tenant_id: Some(tenant_id.to_string()),
            signing_key_hex: Some(TEST_SIGNING_KEY_HEX.to_string()),
        },
    );

    let first = policy_agent_kernel(&ctx).await.unwrap();
    assert!(first
        .iter()
        .any(|o| matches!(o, PolicyRunOutcome::Ran { policy_id, .. } if *policy_id == policy.id)));

    let second = policy_agent_kernel(&ctx).await.unwrap();
    assert!(second
        .iter()
        .any(|o| matches!(o, PolicyRunOutcome::Idle { policy_id } if *policy_id == policy.id)));

    let cursors = logline_registry::query_timeline(
        &pool,
        &session,
        &QueryFilters {
            entity_type: Some(EntityType::PolicyCursor),
            status: None,
            owner_id: None,
            visibility: None,
            limit: 10,
            offset: 0,
        },
    )
    .await
    .unwrap();
    let matching = cursors.iter().filter(|c| c.related_to.contains(&policy.id)).count();
    assert_eq!(matching, 1, "idle pass must not append a second cursor row");
}
