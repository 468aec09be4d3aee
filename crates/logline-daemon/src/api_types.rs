//! Request and response types for all logline-daemon HTTP endpoints (§6.2).
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded by
//! Axum and decoded by tests. No business logic lives here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub has_records_table: bool,
}

// ---------------------------------------------------------------------------
// Error envelope shared by every non-2xx response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}

// ---------------------------------------------------------------------------
// POST /records
// ---------------------------------------------------------------------------

/// The caller-supplied fields of a new record. `owner_id`/`tenant_id` are
/// never read from the body — they come from the `X-User-Id`/`X-Tenant-Id`
/// headers, matching I6 (a caller cannot write a record under someone
/// else's identity).
#[derive(Debug, Clone, Deserialize)]
pub struct RecordInput {
    pub entity_type: String,
    #[serde(default)]
    pub did: String,
    #[serde(default)]
    pub this: String,
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub related_to: Vec<Uuid>,
    pub status: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub code: Option<String>,
    pub language: Option<String>,
    pub runtime: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Value,
    pub duration_ms: Option<i64>,
    pub trace_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Value,
    /// "private" | "tenant" | "public"; defaults to private (I4).
    pub visibility: Option<String>,
}

// ---------------------------------------------------------------------------
// GET /records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RecordsQuery {
    pub entity_type: Option<String>,
    pub status: Option<String>,
    pub owner_id: Option<String>,
    pub visibility: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// §6.2's `limit<=100` ceiling, applied server-side regardless of what the
/// caller asked for.
pub const MAX_RECORDS_LIMIT: i64 = 100;
pub const DEFAULT_RECORDS_LIMIT: i64 = 50;
