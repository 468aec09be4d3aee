//! Store-level invariants that only make sense against a real table:
//! duplicate `(id, seq)` rejection and owner/session mismatch rejection
//! (SPEC_FULL.md §8 P2, B4). Run with `--features testkit`.
#![cfg(feature = "testkit")]

use std::collections::BTreeSet;

use logline_registry::{insert_record, testkit_db_pool, RegistryError, Session};
use logline_schemas::{EntityType, NewSpan};
use uuid::Uuid;

#[tokio::test]
async fn concurrent_revisions_of_the_same_id_never_collide_on_seq() {
    let Ok(pool) = testkit_db_pool().await else { return };
    let session = Session::new("u1", None);
    let id = Uuid::now_v7();

    let inserts = (0..5).map(|_| {
        let pool = pool.clone();
        let session = session.clone();
        async move {
            let new_span = NewSpan::new(EntityType::Function, "testkit", "u1").this("f").id(id);
            insert_record(&pool, &session, new_span).await
        }
    });
    let results = futures_util::future::join_all(inserts).await;
    let seqs: BTreeSet<i64> = results.into_iter().map(|r| r.unwrap().seq).collect();
    assert_eq!(seqs, BTreeSet::from([0, 1, 2, 3, 4]), "every concurrent revision must land on a distinct seq");
}

#[tokio::test]
async fn owner_id_mismatch_with_session_actor_is_rejected() {
    let Ok(pool) = testkit_db_pool().await else { return };
    let session = Session::new("u1", None);

    let mismatched = NewSpan::new(EntityType::Function, "testkit", "someone-else").this("f");
    let err = insert_record(&pool, &session, mismatched).await.unwrap_err();
    assert!(
        matches!(err, RegistryError::VisibilityMismatch { .. }),
        "expected VisibilityMismatch, got {err:?}"
    );
}
