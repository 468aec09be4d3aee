//! A read-mostly cache with a refresh TTL and a stale-fallback grace
//! period, per §4.4's caching discipline and §9's "global mutable state"
//! design note: DB credentials (15 min) and the current manifest (5 min)
//! are both instances of this shape — refresh on miss, serve
//! last-known-good on refresh failure, fail closed only past TTL×2.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

struct Cached<T> {
    value: T,
    fetched_at: Instant,
}

/// A single cached value of type `T`, refreshed by a caller-supplied async
/// function. Not generic over the refresh mechanism — callers pass a
/// closure because the refresh source (DB query, HTTP fetch) varies per
/// use site.
pub struct TtlCache<T> {
    ttl: Duration,
    inner: RwLock<Option<Cached<T>>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(None),
        }
    }

    /// Return the cached value if still fresh; otherwise call `refresh`.
    ///
    /// - Refresh succeeds: cache the new value, return it.
    /// - Refresh fails and a cached value exists younger than `ttl * 2`:
    ///   return the stale value (caller should log a warning).
    /// - Refresh fails and there is no usable cached value: propagate the
    ///   refresh error (fail closed).
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if let Some(fresh) = self.fresh_value() {
            return Ok(fresh);
        }

        match refresh().await {
            Ok(value) => {
                let mut guard = self.inner.write().expect("ttl cache lock poisoned");
                *guard = Some(Cached {
                    value: value.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(value)
            }
            Err(refresh_err) => {
                let guard = self.inner.read().expect("ttl cache lock poisoned");
                match guard.as_ref() {
                    Some(cached) if cached.fetched_at.elapsed() < self.ttl * 2 => {
                        Ok(cached.value.clone())
                    }
                    _ => Err(anyhow!(
                        "CACHE_STALE_BEYOND_TTL2: refresh failed and no usable cached value: {refresh_err}"
                    )),
                }
            }
        }
    }

    fn fresh_value(&self) -> Option<T> {
        let guard = self.inner.read().expect("ttl cache lock poisoned");
        let cached = guard.as_ref()?;
        if cached.fetched_at.elapsed() < self.ttl {
            Some(cached.value.clone())
        } else {
            None
        }
    }
}
