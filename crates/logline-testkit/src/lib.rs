//! Shared scenario-test harness: a real Postgres pool via
//! `logline_registry::testkit_db_pool` (migrated fresh per call) plus
//! fixture builders for the record shapes scenario tests build on —
//! functions, policies, providers, and manifests. No mocks; every
//! crate's `tests/scenario_*.rs` composes these against the real store.

use chrono::Utc;
use logline_crypto::{seal, signing_key_from_hex, strip_proof_fields};
use logline_manifest::Manifest;
use logline_registry::{RegistryError, Session};
use logline_schemas::{EntityType, NewSpan, Span, Visibility};
use sqlx::PgPool;
use uuid::Uuid;

/// A fixed, non-secret Ed25519 signing key for scenario tests. Never use
/// outside tests — it is public in every sense of the word.
pub const TEST_SIGNING_KEY_HEX: &str = "0101010101010101010101010101010101010101010101010101010101010101";

/// Fresh migrated pool against `LOGLINE_DATABASE_URL`, per-test isolation
/// left to the caller (distinct tenant/owner ids, or a truncated schema
/// the caller's own setup manages).
pub async fn db_pool() -> Result<PgPool, RegistryError> {
    logline_registry::testkit_db_pool().await
}

pub fn session(user_id: &str, tenant_id: Option<&str>) -> Session {
    Session::new(user_id.to_string(), tenant_id.map(str::to_string))
}

/// A minimal unsigned `function` record ready to boot.
pub fn function_fixture(owner_id: &str, code: &str) -> NewSpan {
    let mut new_span = NewSpan::new(EntityType::Function, "testkit:fixture", owner_id)
        .this("fixture_function")
        .status("active")
        .visibility(Visibility::Private);
    new_span.code = Some(code.to_string());
    new_span
}

/// A `manifest` record carrying `manifest`'s fields through `metadata`,
/// matching how `logline-manifest` reads the current manifest back.
pub fn manifest_fixture(owner_id: &str, manifest: &Manifest) -> NewSpan {
    NewSpan::new(EntityType::Manifest, "testkit:fixture", owner_id)
        .this("manifest")
        .visibility(Visibility::Public)
        .metadata(serde_json::to_value(manifest).expect("Manifest serialization cannot fail"))
}

/// Sign `new_span` with [`TEST_SIGNING_KEY_HEX`] and insert it, mirroring
/// the sign-then-insert idiom every kernel crate follows
/// (`NewSpan::preview_span` -> `seal` -> `insert_record`).
pub async fn insert_signed(pool: &PgPool, session: &Session, new_span: NewSpan) -> Result<Span, RegistryError> {
    let id = new_span.id.unwrap_or_else(Uuid::now_v7);
    let at = new_span.at.unwrap_or_else(Utc::now);
    let new_span = new_span.id(id).at(at);

    let preview = new_span.preview_span(id, 0, at);
    let body = strip_proof_fields(serde_json::to_value(&preview).expect("Span serialization cannot fail"));
    let signing_key = signing_key_from_hex(TEST_SIGNING_KEY_HEX)?;
    let envelope = seal(&signing_key, &body);
    let new_span = new_span.sealed(envelope.curr_hash, envelope.signature, envelope.public_key);

    logline_registry::insert_record(pool, session, new_span).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_fixture_is_private_and_active() {
        let fixture = function_fixture("u1", "1 + 1");
        assert_eq!(fixture.owner_id, "u1");
        assert_eq!(fixture.status.as_deref(), Some("active"));
        assert_eq!(fixture.code.as_deref(), Some("1 + 1"));
    }

    #[test]
    fn manifest_fixture_round_trips_through_metadata() {
        let manifest = Manifest {
            allowed_boot_ids: vec![Uuid::now_v7()],
            ..Default::default()
        };
        let fixture = manifest_fixture("u1", &manifest);
        let parsed: Manifest = serde_json::from_value(fixture.metadata).unwrap();
        assert_eq!(parsed.allowed_boot_ids, manifest.allowed_boot_ids);
    }
}
