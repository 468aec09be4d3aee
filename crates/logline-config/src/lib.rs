use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

pub mod ttl;

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON. Same algorithm as `logline-crypto::canonicalize` — kept as
/// a separate, independent implementation here because config hashing and
/// span hashing are different concerns with different lifetimes (a config
/// hash identifies a deployed config bundle; a span hash identifies one
/// ledger row), even though the canonicalization rule is identical.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// `environment` toggle (§6.4): production tightens manifest checks and
/// redacts error detail (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    NonProduction,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// The §6.4 configuration surface, read from environment at process start.
#[derive(Debug, Clone)]
pub struct Settings {
    pub store_connection: String,
    pub boot_function_id: Option<String>,
    pub app_user_id: Option<String>,
    pub app_tenant_id: Option<String>,
    pub signing_key_hex: Option<String>,
    pub environment: Environment,
    pub allowed_origins: Vec<String>,
    pub manifest_cache_ttl_ms: u64,
    pub credentials_cache_ttl_ms: u64,
}

const ENV_STORE_CONNECTION: &str = "LOGLINE_STORE_CONNECTION";
const ENV_BOOT_FUNCTION_ID: &str = "LOGLINE_BOOT_FUNCTION_ID";
const ENV_APP_USER_ID: &str = "LOGLINE_APP_USER_ID";
const ENV_APP_TENANT_ID: &str = "LOGLINE_APP_TENANT_ID";
const ENV_SIGNING_KEY_HEX: &str = "LOGLINE_SIGNING_KEY_HEX";
const ENV_ENVIRONMENT: &str = "LOGLINE_ENVIRONMENT";
const ENV_ALLOWED_ORIGINS: &str = "LOGLINE_ALLOWED_ORIGINS";
const ENV_MANIFEST_CACHE_TTL_MS: &str = "LOGLINE_MANIFEST_CACHE_TTL_MS";
const ENV_CREDENTIALS_CACHE_TTL_MS: &str = "LOGLINE_CREDENTIALS_CACHE_TTL_MS";

/// Resolve a named environment variable, the name-only-in-errors
/// convention: callers report which variable is missing, never a value.
fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

impl Settings {
    /// Load the §6.4 surface from the process environment.
    ///
    /// # Errors
    /// Reports the env var NAME of the first missing required variable
    /// (`store_connection`); the value is never mentioned.
    pub fn load_from_env() -> Result<Self> {
        let store_connection = resolve_env(ENV_STORE_CONNECTION).with_context(|| {
            format!("CONFIG_MISSING: required env var '{ENV_STORE_CONNECTION}' is not set or empty")
        })?;

        let environment = match resolve_env(ENV_ENVIRONMENT).as_deref() {
            Some(s) if s.eq_ignore_ascii_case("production") => Environment::Production,
            _ => Environment::NonProduction,
        };

        let allowed_origins = resolve_env(ENV_ALLOWED_ORIGINS)
            .map(|s| s.split(',').map(|o| o.trim().to_string()).collect())
            .unwrap_or_default();

        let manifest_cache_ttl_ms = resolve_env(ENV_MANIFEST_CACHE_TTL_MS)
            .and_then(|s| s.parse().ok())
            .unwrap_or(300_000);

        let credentials_cache_ttl_ms = resolve_env(ENV_CREDENTIALS_CACHE_TTL_MS)
            .and_then(|s| s.parse().ok())
            .unwrap_or(900_000);

        Ok(Settings {
            store_connection,
            boot_function_id: resolve_env(ENV_BOOT_FUNCTION_ID),
            app_user_id: resolve_env(ENV_APP_USER_ID),
            app_tenant_id: resolve_env(ENV_APP_TENANT_ID),
            signing_key_hex: resolve_env(ENV_SIGNING_KEY_HEX),
            environment,
            allowed_origins,
            manifest_cache_ttl_ms,
            credentials_cache_ttl_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_json_sorts_keys_recursively() {
        let a = serde_json::json!({"b": 1, "a": {"z": 1, "y": 2}});
        let b = serde_json::json!({"a": {"y": 2, "z": 1}, "b": 1});
        assert_eq!(canonicalize_json(&a), canonicalize_json(&b));
    }

    #[test]
    fn deep_merge_overrides_scalars_and_merges_objects() {
        let mut dst = serde_json::json!({"a": 1, "nested": {"x": 1, "y": 1}});
        let src = serde_json::json!({"a": 2, "nested": {"y": 2, "z": 3}});
        deep_merge(&mut dst, src);
        assert_eq!(dst, serde_json::json!({"a": 2, "nested": {"x": 1, "y": 2, "z": 3}}));
    }

    #[test]
    fn load_layered_yaml_merges_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yaml");
        let override_file = dir.path().join("override.yaml");
        fs::write(&base, "throttle:\n  per_tenant_daily_exec_limit: 100\n").unwrap();
        fs::write(&override_file, "throttle:\n  per_tenant_daily_exec_limit: 50\n").unwrap();

        let loaded = load_layered_yaml(&[base.to_str().unwrap(), override_file.to_str().unwrap()]).unwrap();
        assert_eq!(
            loaded.config_json.pointer("/throttle/per_tenant_daily_exec_limit"),
            Some(&serde_json::json!(50))
        );
    }
}
