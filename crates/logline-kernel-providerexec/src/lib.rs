//! `provider_exec_kernel` (§4.9): one outbound HTTPS call to a
//! configured `provider` record's endpoint, captured into exactly one
//! signed `provider_execution` record. No retries at this layer.
//!
//! Grounded on `TwelveDataHistoricalProvider::fetch_bars` — a
//! reqwest-backed client built from provider config, one request per
//! call, application errors distinguished from transport/decode
//! errors — generalized here from one fixed OHLCV vendor to the two
//! provider shapes a ledger `provider` record can configure (an
//! OpenAI-compatible chat endpoint, or a local Ollama-style endpoint).

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use logline_crypto::{seal, signing_key_from_hex, strip_proof_fields};
use logline_ctx::Ctx;
use logline_registry::{fetch_latest, insert_record, RegistryError};
use logline_schemas::{EntityType, NewSpan, Span};

#[derive(Debug, Error)]
pub enum ProviderExecError {
    #[error("record {0} is not a provider record")]
    InvalidProvider(Uuid),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Why the call to the provider's endpoint didn't produce a response.
/// Captured into the emitted record's `error` field rather than
/// aborting the kernel — a failed call is still a completed kernel
/// pass (§4.9 step 3: emit a record with `output=null` and `error` set).
#[derive(Debug, Error)]
enum ProviderCallError {
    #[error("provider base_url '{0}' matches neither a known shape")]
    UnsupportedProvider(String),
    #[error("provider record has no base_url configured")]
    MissingBaseUrl,
    #[error("auth_env '{0}' is not set in this process's environment")]
    MissingAuth(String),
    #[error("request to provider failed: {0}")]
    Request(String),
    #[error("provider response could not be decoded as json: {0}")]
    Decode(String),
    #[error("provider returned http status {0}")]
    HttpStatus(u16),
}

#[derive(Debug)]
pub struct ProviderExecOutcome {
    pub execution_id: Uuid,
    pub ok: bool,
}

/// Entry point for one `(PROVIDER_ID, PROVIDER_PAYLOAD)` invocation. See
/// §4.9 for the full algorithm this implements step by step.
pub async fn provider_exec_kernel(ctx: &Ctx, provider_id: Uuid, payload: Value) -> Result<ProviderExecOutcome, ProviderExecError> {
    let provider = fetch_latest(ctx.pool(), ctx.session(), provider_id)
        .await?
        .ok_or(ProviderExecError::InvalidProvider(provider_id))?;
    if provider.entity_type != EntityType::Provider {
        return Err(ProviderExecError::InvalidProvider(provider_id));
    }

    let client = reqwest::Client::new();
    let result = call_provider(&client, &provider.metadata, &payload).await;

    let (output, error) = match result {
        Ok(value) => (value, Value::Null),
        Err(err) => {
            warn!(%provider_id, %err, "provider_exec: call failed");
            (Value::Null, serde_json::json!({ "message": err.to_string() }))
        }
    };
    let ok = error.is_null();

    let inserted = sign_and_insert(ctx, &provider, payload, output, error).await?;
    info!(%provider_id, execution_id = %inserted.id, ok, "provider_exec: execution recorded");
    Ok(ProviderExecOutcome { execution_id: inserted.id, ok })
}

async fn call_provider(client: &reqwest::Client, metadata: &Value, payload: &Value) -> Result<Value, ProviderCallError> {
    let base_url = metadata
        .get("base_url")
        .and_then(|v| v.as_str())
        .ok_or(ProviderCallError::MissingBaseUrl)?;
    let auth_env = metadata.get("auth_env").and_then(|v| v.as_str());

    let request = if base_url.contains("openai.com") {
        let env_name = auth_env.ok_or_else(|| ProviderCallError::MissingAuth("auth_env".into()))?;
        let token = std::env::var(env_name).map_err(|_| ProviderCallError::MissingAuth(env_name.to_string()))?;
        client
            .post(format!("{}/chat/completions", base_url.trim_end_matches('/')))
            .bearer_auth(token)
    } else if base_url.contains("localhost:11434") {
        client.post(format!("{}/api/chat", base_url.trim_end_matches('/')))
    } else {
        return Err(ProviderCallError::UnsupportedProvider(base_url.to_string()));
    };

    let response = request.json(payload).send().await.map_err(|e| ProviderCallError::Request(e.to_string()))?;
    let status = response.status();
    let body: Value = response.json().await.map_err(|e| ProviderCallError::Decode(e.to_string()))?;
    if !status.is_success() {
        return Err(ProviderCallError::HttpStatus(status.as_u16()));
    }
    Ok(body)
}

/// Sign and insert the `provider_execution` record — same
/// signing-timing pattern `logline-kernel-runcode` uses for its
/// `execution` record.
async fn sign_and_insert(ctx: &Ctx, provider: &Span, input: Value, output: Value, error: Value) -> Result<Span, RegistryError> {
    let id = Uuid::now_v7();
    let at = Utc::now();
    let mut new_span = NewSpan::new(EntityType::ProviderExecution, format!("kernel:provider_exec@{}", provider.id), ctx.session().user_id.clone())
        .did("call")
        .this(provider.this.clone())
        .parent(provider.id)
        .related_to([provider.id])
        .input(input)
        .output(output)
        .error(error)
        .id(id)
        .at(at);
    if let Some(tenant_id) = &provider.tenant_id {
        new_span = new_span.tenant(tenant_id.clone()).visibility(provider.visibility);
    }

    let preview = new_span.preview_span(id, 0, at);
    let body = strip_proof_fields(serde_json::to_value(&preview).expect("Span serialization cannot fail"));
    let signing_key_hex = ctx
        .env()
        .signing_key_hex
        .as_deref()
        .ok_or_else(|| RegistryError::InvariantViolation("no signing key configured for this session".into()))?;
    let signing_key = signing_key_from_hex(signing_key_hex)?;
    let envelope = seal(&signing_key, &body);
    let new_span = new_span.sealed(envelope.curr_hash, envelope.signature, envelope.public_key);

    insert_record(ctx.pool(), ctx.session(), new_span).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unsupported_base_url_is_rejected_before_any_request() {
        let client = reqwest::Client::new();
        let metadata = serde_json::json!({"base_url": "https://example.com/v1"});
        let err = call_provider(&client, &metadata, &Value::Null).await.unwrap_err();
        assert!(matches!(err, ProviderCallError::UnsupportedProvider(_)));
    }

    #[tokio::test]
    async fn missing_base_url_is_rejected_before_any_request() {
        let client = reqwest::Client::new();
        let err = call_provider(&client, &serde_json::json!({}), &Value::Null).await.unwrap_err();
        assert!(matches!(err, ProviderCallError::MissingBaseUrl));
    }

    #[tokio::test]
    async fn openai_shape_without_auth_env_configured_fails_before_any_request() {
        let client = reqwest::Client::new();
        let metadata = serde_json::json!({"base_url": "https://api.openai.com/v1"});
        let err = call_provider(&client, &metadata, &Value::Null).await.unwrap_err();
        assert!(matches!(err, ProviderCallError::MissingAuth(_)));
    }

    #[tokio::test]
    async fn local_shape_with_nothing_listening_surfaces_as_a_request_error() {
        let client = reqwest::Client::new();
        let metadata = serde_json::json!({"base_url": "http://localhost:11434"});
        let err = call_provider(&client, &metadata, &Value::Null).await.unwrap_err();
        assert!(matches!(err, ProviderCallError::Request(_)));
    }
}
