//! Axum router and all HTTP handlers for logline-daemon (§6.2).
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use logline_registry::{query_timeline, QueryFilters, RegistryError, Session};
use logline_schemas::{EntityType, NewSpan, Visibility};
use logline_stage0::{boot, BootError, RawBootRequest};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::{
    api_types::{
        ErrorResponse, HealthResponse, RecordInput, RecordsQuery, DEFAULT_RECORDS_LIMIT, MAX_RECORDS_LIMIT,
    },
    state::{AppState, BusMsg},
};

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/boot", post(boot_handler))
        .route("/records", post(create_record).get(list_records))
        .route("/timeline/stream", get(stream))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> Response {
    match logline_registry::status(&st.pool).await {
        Ok(status) => {
            let ok = status.ok && status.has_records_table;
            let body = HealthResponse {
                ok,
                service: st.build.service,
                version: st.build.version,
                has_records_table: status.has_records_table,
            };
            let code = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
            (code, Json(body)).into_response()
        }
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new(format!("store unavailable: {err}"))),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// POST /boot
// ---------------------------------------------------------------------------

pub(crate) async fn boot_handler(
    State(st): State<Arc<AppState>>,
    Json(body): Json<RawBootRequest>,
) -> Response {
    let outcome = boot(
        &st.pool,
        &st.manifest_cache,
        st.settings.signing_key_hex.as_deref(),
        st.settings.environment,
        body,
    )
    .await;

    match outcome {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => {
            info!(%err, "daemon: /boot refused");
            boot_error_response(err)
        }
    }
}

fn boot_error_response(err: BootError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::new(err.to_string()))).into_response()
}

// ---------------------------------------------------------------------------
// Identity headers (§6.2)
// ---------------------------------------------------------------------------

struct Identity {
    session: Session,
    trace_id: Option<uuid::Uuid>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).filter(|s| !s.is_empty())
}

fn extract_identity(headers: &HeaderMap) -> Result<Identity, Response> {
    let Some(user_id) = header_str(headers, "x-user-id") else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("missing required header X-User-Id")),
        )
            .into_response());
    };
    let tenant_id = header_str(headers, "x-tenant-id").map(str::to_string);
    let trace_id = match header_str(headers, "x-trace-id") {
        Some(s) => match uuid::Uuid::parse_str(s) {
            Ok(id) => Some(id),
            Err(_) => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse::new("X-Trace-Id must be a valid UUID")),
                )
                    .into_response())
            }
        },
        None => None,
    };

    Ok(Identity {
        session: Session::new(user_id.to_string(), tenant_id),
        trace_id,
    })
}

// ---------------------------------------------------------------------------
// POST /records
// ---------------------------------------------------------------------------

pub(crate) async fn create_record(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RecordInput>,
) -> Response {
    let identity = match extract_identity(&headers) {
        Ok(identity) => identity,
        Err(resp) => return resp,
    };

    let Some(entity_type) = EntityType::parse(&body.entity_type) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!("unknown entity_type '{}'", body.entity_type))),
        )
            .into_response();
    };

    let visibility = match body.visibility.as_deref() {
        Some(raw) => match Visibility::parse(raw) {
            Some(v) => v,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse::new(format!("unknown visibility '{raw}'"))),
                )
                    .into_response()
            }
        },
        None => Visibility::Private,
    };

    let mut new_span = NewSpan::new(entity_type, "edge:daemon", identity.session.user_id.clone())
        .did(body.did)
        .this(body.this)
        .related_to(body.related_to)
        .visibility(visibility)
        .input(body.input)
        .output(body.output)
        .error(body.error)
        .metadata(body.metadata);

    if let Some(tenant_id) = identity.session.tenant_id.clone() {
        new_span = new_span.tenant(tenant_id);
    }
    if let Some(parent_id) = body.parent_id {
        new_span = new_span.parent(parent_id);
    }
    if let Some(status) = body.status {
        new_span = new_span.status(status);
    }
    if let Some(name) = body.name {
        new_span.name = Some(name);
    }
    if let Some(description) = body.description {
        new_span.description = Some(description);
    }
    if let Some(code) = body.code {
        new_span.code = Some(code);
    }
    if let Some(language) = body.language {
        new_span.language = Some(language);
    }
    if let Some(runtime) = body.runtime {
        new_span.runtime = Some(runtime);
    }
    if let Some(duration_ms) = body.duration_ms {
        new_span = new_span.duration_ms(duration_ms);
    }
    let trace_id = body.trace_id.or(identity.trace_id);
    if let Some(trace_id) = trace_id {
        new_span = new_span.trace_id(trace_id);
    }

    match logline_registry::insert_record(&st.pool, &identity.session, new_span).await {
        Ok(span) => (StatusCode::CREATED, Json(span)).into_response(),
        Err(err) => registry_error_response(err),
    }
}

// ---------------------------------------------------------------------------
// GET /records
// ---------------------------------------------------------------------------

pub(crate) async fn list_records(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let identity = match extract_identity(&headers) {
        Ok(identity) => identity,
        Err(resp) => return resp,
    };

    let entity_type = match query.entity_type.as_deref().map(EntityType::parse) {
        Some(Some(et)) => Some(et),
        Some(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("unknown entity_type filter")),
            )
                .into_response()
        }
        None => None,
    };
    let visibility = match query.visibility.as_deref().map(Visibility::parse) {
        Some(Some(v)) => Some(v),
        Some(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("unknown visibility filter")),
            )
                .into_response()
        }
        None => None,
    };

    let limit = query.limit.unwrap_or(DEFAULT_RECORDS_LIMIT);
    if !(1..=MAX_RECORDS_LIMIT).contains(&limit) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!("limit must be between 1 and {MAX_RECORDS_LIMIT}"))),
        )
            .into_response();
    }

    let filters = QueryFilters {
        entity_type,
        status: query.status,
        owner_id: query.owner_id,
        visibility,
        limit,
        offset: query.offset.unwrap_or(0).max(0),
    };

    match query_timeline(&st.pool, &identity.session, &filters).await {
        Ok(spans) => (StatusCode::OK, Json(spans)).into_response(),
        Err(err) => registry_error_response(err),
    }
}

fn registry_error_response(err: RegistryError) -> Response {
    let status = match &err {
        RegistryError::VisibilityMismatch { .. } => StatusCode::FORBIDDEN,
        RegistryError::Conflict(_) => StatusCode::CONFLICT,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Db(_) => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::AppendOnlyViolation(_)
        | RegistryError::InvariantViolation(_)
        | RegistryError::HashMismatch { .. }
        | RegistryError::SignatureInvalid(_)
        | RegistryError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse::new(err.to_string()))).into_response()
}

// ---------------------------------------------------------------------------
// GET /timeline/stream
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(rx: broadcast::Receiver<BusMsg>) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Record { .. } => "record",
                    BusMsg::Ping { .. } => "ping",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        headers
    }

    #[test]
    fn extract_identity_requires_x_user_id() {
        let headers = HeaderMap::new();
        assert!(extract_identity(&headers).is_err());
    }

    #[test]
    fn extract_identity_reads_user_and_tenant() {
        let headers = headers_with(&[("x-user-id", "alice"), ("x-tenant-id", "acme")]);
        let identity = extract_identity(&headers).ok().unwrap();
        assert_eq!(identity.session.user_id, "alice");
        assert_eq!(identity.session.tenant_id.as_deref(), Some("acme"));
        assert!(identity.trace_id.is_none());
    }

    #[test]
    fn extract_identity_rejects_malformed_trace_id() {
        let headers = headers_with(&[("x-user-id", "alice"), ("x-trace-id", "not-a-uuid")]);
        assert!(extract_identity(&headers).is_err());
    }

    #[test]
    fn limit_over_the_ceiling_is_rejected_not_clamped() {
        assert!((1..=MAX_RECORDS_LIMIT).contains(&DEFAULT_RECORDS_LIMIT));
        assert!(!(1..=MAX_RECORDS_LIMIT).contains(&101));
    }
}
