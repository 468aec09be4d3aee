//! The append-only ledger: one table, `records`, holding every span. This
//! crate is the only thing in the workspace that speaks SQL to it.
//!
//! Mutation is enforced as impossible two ways: this crate exposes no
//! update/delete function at all, and the schema itself (`migrations/0001_init.sql`)
//! rejects UPDATE/DELETE at the trigger level. `RegistryError::AppendOnlyViolation`
//! exists to surface that trigger firing if it ever does — a bug, not an
//! expected path.

use std::future::Future;

use chrono::{DateTime, Utc};
use logline_schemas::{EntityType, Span, Visibility};
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

pub const ENV_DB_URL: &str = "LOGLINE_DATABASE_URL";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("append-only violation: {0}")]
    AppendOnlyViolation(String),

    #[error("owner_id {given} does not match session actor {expected} (I6)")]
    VisibilityMismatch { given: String, expected: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("duplicate (id, seq) or unique-index conflict: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("content hash mismatch: claimed {claimed}, recomputed {recomputed}")]
    HashMismatch { claimed: String, recomputed: String },

    #[error("signature does not verify: {0}")]
    SignatureInvalid(String),

    #[error(transparent)]
    Crypto(#[from] logline_crypto::CryptoError),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// `(user_id, tenant_id)` installed on every insert/read this session
/// performs. Binds I5 (read visibility) and I6 (write ownership).
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub tenant_id: Option<String>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, tenant_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id,
        }
    }
}

pub async fn connect_from_env() -> Result<PgPool, RegistryError> {
    let url = std::env::var(ENV_DB_URL)
        .map_err(|_| RegistryError::InvariantViolation(format!("missing env var {ENV_DB_URL}")))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool, RegistryError> {
    let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
    Ok(pool)
}

#[cfg(feature = "testkit")]
pub async fn testkit_db_pool() -> Result<PgPool, RegistryError> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<(), RegistryError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| RegistryError::InvariantViolation(format!("migrate failed: {e}")))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RegistryStatus {
    pub ok: bool,
    pub has_records_table: bool,
}

/// `GET /health` backing query: connectivity plus schema presence.
pub async fn status(pool: &PgPool) -> Result<RegistryStatus, RegistryError> {
    let (one,): (i32,) = sqlx::query_as("select 1").fetch_one(pool).await?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from information_schema.tables
            where table_schema = 'public' and table_name = 'records'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(RegistryStatus {
        ok: one == 1,
        has_records_table: exists,
    })
}

fn row_to_span(row: sqlx::postgres::PgRow) -> Result<Span, RegistryError> {
    let entity_type_str: String = row.try_get("entity_type")?;
    let entity_type = EntityType::parse(&entity_type_str).ok_or_else(|| {
        RegistryError::InvariantViolation(format!("unknown entity_type in row: {entity_type_str}"))
    })?;
    let visibility_str: String = row.try_get("visibility")?;
    let visibility = Visibility::parse(&visibility_str)
        .ok_or_else(|| RegistryError::InvariantViolation(format!("unknown visibility: {visibility_str}")))?;
    let related_to_vec: Vec<Uuid> = row.try_get("related_to")?;

    Ok(Span {
        id: row.try_get("id")?,
        seq: row.try_get("seq")?,
        entity_type,
        who: row.try_get("who")?,
        did: row.try_get("did")?,
        this: row.try_get("this")?,
        at: row.try_get("at")?,
        parent_id: row.try_get("parent_id")?,
        related_to: related_to_vec.into_iter().collect(),
        owner_id: row.try_get("owner_id")?,
        tenant_id: row.try_get("tenant_id")?,
        visibility,
        status: row.try_get("status")?,
        is_deleted: row.try_get("is_deleted")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        code: row.try_get("code")?,
        language: row.try_get("language")?,
        runtime: row.try_get("runtime")?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        duration_ms: row.try_get("duration_ms")?,
        trace_id: row.try_get("trace_id")?,
        prev_hash: row.try_get("prev_hash")?,
        curr_hash: row.try_get("curr_hash")?,
        signature: row.try_get("signature")?,
        public_key: row.try_get("public_key")?,
        metadata: row.try_get("metadata")?,
    })
}

fn verify_i3(span: &Span) -> Result<(), RegistryError> {
    let (Some(curr_hash), Some(signature), Some(public_key)) =
        (&span.curr_hash, &span.signature, &span.public_key)
    else {
        return Ok(());
    };
    let body = logline_crypto::strip_proof_fields(
        serde_json::to_value(span).expect("Span serialization cannot fail"),
    );
    logline_crypto::verify_envelope(&body, curr_hash, signature, public_key).map_err(|e| match e {
        logline_crypto::CryptoError::HashMismatch { claimed, recomputed } => {
            RegistryError::HashMismatch { claimed, recomputed }
        }
        other => RegistryError::SignatureInvalid(other.to_string()),
    })
}

/// I5: would `session` be allowed to see this row?
fn visible_to(span: &Span, session: &Session) -> bool {
    if span.owner_id == session.user_id {
        return true;
    }
    match span.visibility {
        Visibility::Public => true,
        Visibility::Tenant => span.tenant_id.is_some() && span.tenant_id == session.tenant_id,
        Visibility::Private => false,
    }
}

/// Insert one record under `session`'s identity (I6). Assigns `id` (new
/// v7 UUID unless the caller pins one for a revision) and the next `seq`
/// for that `id`. `at` defaults to `now()` unless the caller fixed it
/// (required before signing — see `NewSpan::preview_span`). Verifies I3
/// if the caller pre-signed the payload.
pub async fn insert_record(
    pool: &PgPool,
    session: &Session,
    new_span: logline_schemas::NewSpan,
) -> Result<Span, RegistryError> {
    if new_span.owner_id != session.user_id {
        return Err(RegistryError::VisibilityMismatch {
            given: new_span.owner_id,
            expected: session.user_id.clone(),
        });
    }
    if let Some(tenant) = &new_span.tenant_id {
        if Some(tenant) != session.tenant_id.as_ref() {
            return Err(RegistryError::InvariantViolation(format!(
                "tenant_id {tenant} does not match session tenant (I6)"
            )));
        }
    }

    let id = new_span.id.unwrap_or_else(Uuid::now_v7);
    let lock_key = format!("record:{id}");

    let mut conn = pool.acquire().await?;
    let locked: bool = sqlx::query_scalar("select pg_try_advisory_lock(hashtext($1))")
        .bind(&lock_key)
        .fetch_one(&mut *conn)
        .await?;
    if !locked {
        return Err(RegistryError::Conflict(format!(
            "could not acquire per-record lock for {id}"
        )));
    }

    let result = insert_record_locked(&mut conn, session, id, new_span).await;

    let _ = sqlx::query("select pg_advisory_unlock(hashtext($1))")
        .bind(&lock_key)
        .execute(&mut *conn)
        .await;

    result
}

async fn insert_record_locked(
    conn: &mut PgConnection,
    session: &Session,
    id: Uuid,
    new_span: logline_schemas::NewSpan,
) -> Result<Span, RegistryError> {
    let next_seq: i64 = sqlx::query_scalar("select coalesce(max(seq) + 1, 0) from records where id = $1")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;

    let related_to: Vec<Uuid> = new_span.related_to.into_iter().collect();

    let row = sqlx::query(
        r#"
        insert into records (
            id, seq, entity_type, who, did, this, at,
            parent_id, related_to, owner_id, tenant_id, visibility,
            status, name, description, code, language, runtime,
            input, output, error, duration_ms, trace_id,
            prev_hash, curr_hash, signature, public_key, metadata
        ) values (
            $1, $2, $3, $4, $5, $6, coalesce($7, now()),
            $8, $9, $10, $11, $12,
            $13, $14, $15, $16, $17, $18,
            $19, $20, $21, $22, $23,
            $24, $25, $26, $27, $28
        )
        returning *
        "#,
    )
    .bind(id)
    .bind(next_seq)
    .bind(new_span.entity_type.as_str())
    .bind(&new_span.who)
    .bind(&new_span.did)
    .bind(&new_span.this)
    .bind(new_span.at)
    .bind(new_span.parent_id)
    .bind(&related_to)
    .bind(&session.user_id)
    .bind(&session.tenant_id)
    .bind(new_span.visibility.as_str())
    .bind(&new_span.status)
    .bind(&new_span.name)
    .bind(&new_span.description)
    .bind(&new_span.code)
    .bind(&new_span.language)
    .bind(&new_span.runtime)
    .bind(&new_span.input)
    .bind(&new_span.output)
    .bind(&new_span.error)
    .bind(new_span.duration_ms)
    .bind(new_span.trace_id)
    .bind(&new_span.prev_hash)
    .bind(&new_span.curr_hash)
    .bind(&new_span.signature)
    .bind(&new_span.public_key)
    .bind(&new_span.metadata)
    .fetch_one(&mut *conn)
    .await
    .map_err(map_insert_error)?;

    let span = row_to_span(row)?;
    verify_i3(&span)?;
    Ok(span)
}

fn map_insert_error(e: sqlx::Error) -> RegistryError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.code().as_deref() == Some("23505") {
            return RegistryError::Conflict(db_err.message().to_string());
        }
        if db_err.code().as_deref() == Some("0A000") {
            return RegistryError::AppendOnlyViolation(db_err.message().to_string());
        }
    }
    RegistryError::Db(e)
}

/// Filters behind `GET /records` (§6.2). `limit` is capped at 100 by the
/// caller (Stage-0/daemon validation, B1); this function trusts it.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub entity_type: Option<EntityType>,
    pub status: Option<String>,
    pub owner_id: Option<String>,
    pub visibility: Option<Visibility>,
    pub limit: i64,
    pub offset: i64,
}

/// Query the visible timeline (I5 applied in Rust, not pushed into SQL —
/// the "session context var" route described in §6.1 is left to the store
/// operator; this crate enforces I5 at the boundary it owns).
pub async fn query_timeline(
    pool: &PgPool,
    session: &Session,
    filters: &QueryFilters,
) -> Result<Vec<Span>, RegistryError> {
    let rows = sqlx::query(
        r#"
        select * from visible_timeline
        where ($1::text is null or entity_type = $1)
          and ($2::text is null or status = $2)
          and ($3::text is null or owner_id = $3)
          and ($4::text is null or visibility = $4)
        order by at desc
        limit $5 offset $6
        "#,
    )
    .bind(filters.entity_type.map(|e| e.as_str()))
    .bind(&filters.status)
    .bind(&filters.owner_id)
    .bind(filters.visibility.map(|v| v.as_str()))
    .bind(filters.limit)
    .bind(filters.offset)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let span = row_to_span(row)?;
        if visible_to(&span, session) {
            out.push(span);
        }
    }
    Ok(out)
}

/// Current revision (greatest `seq`) of a logical `id`, if visible.
pub async fn fetch_latest(
    pool: &PgPool,
    session: &Session,
    id: Uuid,
) -> Result<Option<Span>, RegistryError> {
    let row = sqlx::query(
        r#"
        select * from visible_timeline
        where id = $1
        order by seq desc
        limit 1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    let span = row_to_span(row)?;
    if !visible_to(&span, session) {
        return Ok(None);
    }
    Ok(Some(span))
}

/// Every revision of a logical `id`, oldest seq first.
pub async fn fetch_all_revisions(
    pool: &PgPool,
    session: &Session,
    id: Uuid,
) -> Result<Vec<Span>, RegistryError> {
    let rows = sqlx::query("select * from visible_timeline where id = $1 order by seq asc")
        .bind(id)
        .fetch_all(pool)
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let span = row_to_span(row)?;
        if visible_to(&span, session) {
            out.push(span);
        }
    }
    Ok(out)
}

/// Most recent `entity_type='manifest'` row visible to `session` — the
/// "current manifest" view (§3 Derived views).
pub async fn fetch_current_manifest(
    pool: &PgPool,
    session: &Session,
) -> Result<Option<Span>, RegistryError> {
    let filters = QueryFilters {
        entity_type: Some(EntityType::Manifest),
        limit: 1,
        ..Default::default()
    };
    let mut rows = query_timeline(pool, session, &filters).await?;
    Ok(rows.pop())
}

/// Oldest-first batch of visible rows matching `entity_type`/`status`,
/// used by the observer/request-worker/policy-agent kernels.
pub async fn fetch_oldest_batch(
    pool: &PgPool,
    session: &Session,
    entity_type: EntityType,
    status: &str,
    batch_size: i64,
) -> Result<Vec<Span>, RegistryError> {
    let rows = sqlx::query(
        r#"
        select * from visible_timeline
        where entity_type = $1 and status = $2
        order by at asc
        limit $3
        "#,
    )
    .bind(entity_type.as_str())
    .bind(status)
    .bind(batch_size)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let span = row_to_span(row)?;
        if visible_to(&span, session) {
            out.push(span);
        }
    }
    Ok(out)
}

/// Count `entity_type='execution'` rows for `tenant_id` since UTC midnight
/// — the tenant quota guard's read (§4.5 step 2).
pub async fn count_executions_today(pool: &PgPool, tenant_id: &str) -> Result<i64, RegistryError> {
    let midnight = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc();

    let count: i64 = sqlx::query_scalar(
        r#"
        select count(*) from records
        where entity_type = 'execution'
          and tenant_id = $1
          and at >= $2
        "#,
    )
    .bind(tenant_id)
    .bind(midnight)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Latest `policy_cursor` row for policy `policy_id` — `max(at)` among rows
/// whose `related_to` includes it (§4.8 step 2a).
pub async fn fetch_latest_policy_cursor(
    pool: &PgPool,
    session: &Session,
    policy_id: Uuid,
) -> Result<Option<Span>, RegistryError> {
    let row = sqlx::query(
        r#"
        select * from visible_timeline
        where entity_type = 'policy_cursor'
          and $1 = any(related_to)
        order by at desc
        limit 1
        "#,
    )
    .bind(policy_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    let span = row_to_span(row)?;
    if !visible_to(&span, session) {
        return Ok(None);
    }
    Ok(Some(span))
}

/// Records with `at > cursor` in `tenant_id`, oldest first, capped at
/// `limit` (§4.8 step 2b).
pub async fn fetch_records_since(
    pool: &PgPool,
    session: &Session,
    tenant_id: Option<&str>,
    since: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Span>, RegistryError> {
    let rows = sqlx::query(
        r#"
        select * from visible_timeline
        where at > $1
          and ($2::text is null or tenant_id = $2)
        order by at asc
        limit $3
        "#,
    )
    .bind(since)
    .bind(tenant_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let span = row_to_span(row)?;
        if visible_to(&span, session) {
            out.push(span);
        }
    }
    Ok(out)
}

/// Server-side fan-out of inserts (§4.1 `notify`). The trigger already
/// calls `pg_notify` on every insert; this is for callers that want to
/// push an out-of-band signal (e.g. a manual re-broadcast).
pub async fn notify(pool: &PgPool, channel: &str, payload: &str) -> Result<(), RegistryError> {
    sqlx::query("select pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(pool)
        .await?;
    Ok(())
}

/// Subscribe to `timeline_updates` for SSE fan-out (§6.1).
pub async fn listen_timeline(url: &str) -> Result<PgListener, RegistryError> {
    let mut listener = PgListener::connect(url).await?;
    listener.listen("timeline_updates").await?;
    Ok(listener)
}

/// Cooperative advisory lock scoped to a single dedicated connection, held
/// for the duration of `f`. Released on every exit path including `f`
/// returning an error (§5.3) — the "scoped acquisition with guaranteed
/// release" rule made concrete. Returns `Ok(None)` if the lock is already
/// held elsewhere, matching the cooperative "skip, don't wait" behavior
/// the kernels require (run_code's per-record lock, the tenant throttle
/// lock, …).
pub async fn with_advisory_lock<T, F, Fut>(
    pool: &PgPool,
    key: &str,
    f: F,
) -> Result<Option<T>, RegistryError>
where
    F: FnOnce(&mut PgConnection) -> Fut,
    Fut: Future<Output = Result<T, RegistryError>>,
{
    let mut conn = pool.acquire().await?;
    let locked: bool = sqlx::query_scalar("select pg_try_advisory_lock(hashtext($1))")
        .bind(key)
        .fetch_one(&mut *conn)
        .await?;
    if !locked {
        return Ok(None);
    }

    let result = f(&mut conn).await;

    let _ = sqlx::query("select pg_advisory_unlock(hashtext($1))")
        .bind(key)
        .execute(&mut *conn)
        .await;

    result.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use logline_schemas::NewSpan;

    fn build_span(visibility: Visibility, owner_id: &str, tenant_id: Option<&str>) -> Span {
        Span {
            id: Uuid::now_v7(),
            seq: 0,
            entity_type: EntityType::Function,
            who: "test".into(),
            did: "".into(),
            this: "".into(),
            at: Utc::now(),
            parent_id: None,
            related_to: Default::default(),
            owner_id: owner_id.into(),
            tenant_id: tenant_id.map(|s| s.to_string()),
            visibility,
            status: None,
            is_deleted: false,
            name: None,
            description: None,
            code: None,
            language: None,
            runtime: None,
            input: Value::Null,
            output: Value::Null,
            error: Value::Null,
            duration_ms: None,
            trace_id: None,
            prev_hash: None,
            curr_hash: None,
            signature: None,
            public_key: None,
            metadata: Value::Null,
        }
    }

    #[test]
    fn visible_to_respects_visibility_rules() {
        let owner = Session::new("u1", Some("t1".into()));
        let outsider = Session::new("u2", Some("t2".into()));
        let same_tenant = Session::new("u3", Some("t1".into()));

        let mut span = build_span(Visibility::Private, "u1", Some("t1"));
        assert!(visible_to(&span, &owner));
        assert!(!visible_to(&span, &outsider));
        assert!(!visible_to(&span, &same_tenant));

        span.visibility = Visibility::Tenant;
        assert!(visible_to(&span, &same_tenant));
        assert!(!visible_to(&span, &outsider));

        span.visibility = Visibility::Public;
        assert!(visible_to(&span, &outsider));
    }

    #[test]
    fn new_span_builder_produces_owner_matching_payload() {
        let span = NewSpan::new(EntityType::Request, "kernel:observer", "u1")
            .this("run_code")
            .status("scheduled");
        assert_eq!(span.owner_id, "u1");
        assert_eq!(span.status.as_deref(), Some("scheduled"));
    }
}
