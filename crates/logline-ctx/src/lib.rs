//! The §4.3 context (ctx) provider: the capability bundle handed to
//! every kernel invocation, scoped to the session identity that booted
//! it, and nothing else.
//!
//! Generalizes `EngineIsolation`/`EngineStore`'s per-engine capability
//! scoping (broker keys, exposure caps, keyed by `EngineId`) to a
//! per-`(user_id, tenant_id)` session: `Ctx` cannot be constructed from
//! untrusted input any more than `EngineIsolation::from_config_json`
//! could build a capability set from a config missing `engine_id`.

use chrono::{DateTime, SubsecRound, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use thiserror::Error;
use uuid::Uuid;

use logline_crypto::{sign_hash_hex, signing_key_from_hex, verify_hash_hex, CryptoError};
use logline_registry::{insert_record, RegistryError, Session};
use logline_schemas::{NewSpan, Span};

#[derive(Debug, Error)]
pub enum CtxError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Read-only `{ user_id, tenant_id, signing_key? }` populated from the
/// boot request. No capability in this crate reaches outside these
/// three fields plus the pool `Ctx` was built with.
#[derive(Debug, Clone)]
pub struct Env {
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub signing_key_hex: Option<String>,
}

/// The capability bundle. Construct one per kernel invocation; never
/// share a `Ctx` across session identities.
pub struct Ctx {
    pool: PgPool,
    session: Session,
    env: Env,
}

impl Ctx {
    pub fn new(pool: PgPool, env: Env) -> Self {
        let session = Session::new(env.user_id.clone(), env.tenant_id.clone());
        Self { pool, session, env }
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Raw pool access for kernels that need a `logline-registry` query
    /// the `sql`/`insert_record` capabilities don't cover (advisory
    /// locks, the fixed query shapes behind `fetch_latest` and friends).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `sql` — a parameter-binding query builder. `text` carries
    /// positional placeholders (`$1`, `$2`, …); values are attached via
    /// `.bind()`, never interpolated into `text` itself.
    pub fn sql<'a>(&'a self, text: &'a str) -> SqlBuilder<'a> {
        SqlBuilder {
            pool: &self.pool,
            query: sqlx::query(text),
        }
    }

    /// `withDb(fn)` — scoped acquisition of a pooled connection with
    /// guaranteed release on every exit path, `f` included.
    pub async fn with_db<T, F, Fut>(&self, f: F) -> Result<T, CtxError>
    where
        F: FnOnce(sqlx::pool::PoolConnection<Postgres>) -> Fut,
        Fut: std::future::Future<Output = Result<T, CtxError>>,
    {
        let conn = self.pool.acquire().await?;
        f(conn).await
    }

    /// `insertRecord(record)` — atomic single-row insert under the
    /// current session identity (I5/I6 enforced by `logline-registry`).
    pub async fn insert_record(&self, record: NewSpan) -> Result<Span, CtxError> {
        insert_record(&self.pool, &self.session, record)
            .await
            .map_err(CtxError::from)
    }

    /// `now()` — UTC timestamp truncated to millisecond precision.
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(3)
    }

    pub fn crypto(&self) -> Crypto<'_> {
        Crypto { env: &self.env }
    }
}

/// `{ hash, sign, verify, randomUUID, hex(bytes), bytes(hex) }`.
pub struct Crypto<'a> {
    env: &'a Env,
}

impl<'a> Crypto<'a> {
    pub fn hash(&self, value: &serde_json::Value) -> String {
        logline_crypto::content_hash(value)
    }

    /// Sign `curr_hash_hex` with the session's configured signing key.
    /// Returns `(signature_hex, public_key_hex)`.
    pub fn sign(&self, curr_hash_hex: &str) -> Result<(String, String), CtxError> {
        let key_hex = self
            .env
            .signing_key_hex
            .as_deref()
            .ok_or_else(|| CryptoError::InvalidSigningKey("no signing key in ctx env".into()))?;
        let signing_key = signing_key_from_hex(key_hex)?;
        Ok(sign_hash_hex(&signing_key, curr_hash_hex))
    }

    pub fn verify(&self, signature_hex: &str, curr_hash_hex: &str, public_key_hex: &str) -> bool {
        verify_hash_hex(public_key_hex, curr_hash_hex, signature_hex).is_ok()
    }

    pub fn random_uuid(&self) -> Uuid {
        Uuid::now_v7()
    }

    pub fn hex(&self, bytes: &[u8]) -> String {
        hex::encode(bytes)
    }

    pub fn bytes(&self, hex_str: &str) -> Result<Vec<u8>, CtxError> {
        Ok(hex::decode(hex_str)?)
    }
}

/// A `sql` statement under construction. Built from a fixed query text;
/// values attach only through `bind`, so raw string interpolation never
/// reaches the driver.
pub struct SqlBuilder<'a> {
    pool: &'a PgPool,
    query: Query<'a, Postgres, PgArguments>,
}

impl<'a> SqlBuilder<'a> {
    pub fn bind<T>(mut self, value: T) -> Self
    where
        T: 'a + Send + sqlx::Encode<'a, Postgres> + sqlx::Type<Postgres>,
    {
        self.query = self.query.bind(value);
        self
    }

    pub async fn fetch_all(self) -> Result<Vec<PgRow>, CtxError> {
        Ok(self.query.fetch_all(self.pool).await?)
    }

    pub async fn fetch_optional(self) -> Result<Option<PgRow>, CtxError> {
        Ok(self.query.fetch_optional(self.pool).await?)
    }

    pub async fn execute(self) -> Result<u64, CtxError> {
        Ok(self.query.execute(self.pool).await?.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_sign_fails_closed_without_a_configured_key() {
        let env = Env {
            user_id: "u1".into(),
            tenant_id: None,
            signing_key_hex: None,
        };
        let crypto = Crypto { env: &env };
        let err = crypto.sign("deadbeef").unwrap_err();
        assert!(matches!(err, CtxError::Crypto(_)));
    }

    #[test]
    fn crypto_hex_roundtrips() {
        let env = Env {
            user_id: "u1".into(),
            tenant_id: None,
            signing_key_hex: None,
        };
        let crypto = Crypto { env: &env };
        let encoded = crypto.hex(b"hello");
        assert_eq!(crypto.bytes(&encoded).unwrap(), b"hello");
    }
}
