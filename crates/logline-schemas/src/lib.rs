//! Core record ("span") envelope and the entity-type catalog.
//!
//! The registry is one logical table; every row is a [`Span`] tagged by
//! [`EntityType`]. Kind-specific fields live in `input`/`output`/`error`/
//! `metadata` as JSON, not as separate Rust structs per kind — the table
//! is a sum type by `entity_type`, not a family of tables.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Record kind. New entity kinds are added here, never as a new table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Function,
    Request,
    Execution,
    StatusPatch,
    Policy,
    PolicyCursor,
    PolicyViolation,
    PolicyError,
    Provider,
    ProviderExecution,
    Manifest,
    BootEvent,
    Memory,
    MemoryAudit,
    PromptBlock,
    PromptVariant,
    PromptBuild,
    PromptRun,
    PromptEval,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Function => "function",
            EntityType::Request => "request",
            EntityType::Execution => "execution",
            EntityType::StatusPatch => "status_patch",
            EntityType::Policy => "policy",
            EntityType::PolicyCursor => "policy_cursor",
            EntityType::PolicyViolation => "policy_violation",
            EntityType::PolicyError => "policy_error",
            EntityType::Provider => "provider",
            EntityType::ProviderExecution => "provider_execution",
            EntityType::Manifest => "manifest",
            EntityType::BootEvent => "boot_event",
            EntityType::Memory => "memory",
            EntityType::MemoryAudit => "memory_audit",
            EntityType::PromptBlock => "prompt_block",
            EntityType::PromptVariant => "prompt_variant",
            EntityType::PromptBuild => "prompt_build",
            EntityType::PromptRun => "prompt_run",
            EntityType::PromptEval => "prompt_eval",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "function" => EntityType::Function,
            "request" => EntityType::Request,
            "execution" => EntityType::Execution,
            "status_patch" => EntityType::StatusPatch,
            "policy" => EntityType::Policy,
            "policy_cursor" => EntityType::PolicyCursor,
            "policy_violation" => EntityType::PolicyViolation,
            "policy_error" => EntityType::PolicyError,
            "provider" => EntityType::Provider,
            "provider_execution" => EntityType::ProviderExecution,
            "manifest" => EntityType::Manifest,
            "boot_event" => EntityType::BootEvent,
            "memory" => EntityType::Memory,
            "memory_audit" => EntityType::MemoryAudit,
            "prompt_block" => EntityType::PromptBlock,
            "prompt_variant" => EntityType::PromptVariant,
            "prompt_build" => EntityType::PromptBuild,
            "prompt_run" => EntityType::PromptRun,
            "prompt_eval" => EntityType::PromptEval,
            _ => return None,
        })
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// I4: `visibility ∈ {private, tenant, public}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Tenant,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Tenant => "tenant",
            Visibility::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "private" => Visibility::Private,
            "tenant" => Visibility::Tenant,
            "public" => Visibility::Public,
            _ => return None,
        })
    }
}

/// One immutable row in the registry.
///
/// `(id, seq)` is the primary identity (I1). Signing fields
/// (`prev_hash`/`curr_hash`/`signature`/`public_key`) are either all
/// present or all absent (§4.2); see `logline-crypto` for the envelope
/// that produces/verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: Uuid,
    pub seq: i64,

    pub entity_type: EntityType,
    pub who: String,
    pub did: String,
    pub this: String,
    pub at: DateTime<Utc>,

    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub related_to: BTreeSet<Uuid>,

    pub owner_id: String,
    pub tenant_id: Option<String>,
    pub visibility: Visibility,

    pub status: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,

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

    pub prev_hash: Option<String>,
    pub curr_hash: Option<String>,
    pub signature: Option<String>,
    pub public_key: Option<String>,

    #[serde(default)]
    pub metadata: Value,
}

/// Fields a caller supplies to create a brand-new logical record
/// (`seq` is always 0, assigned by the registry — see `NewSpan::revision`
/// for a follow-up revision of an existing `id`).
#[derive(Debug, Clone)]
pub struct NewSpan {
    pub id: Option<Uuid>,
    pub entity_type: EntityType,
    pub who: String,
    pub did: String,
    pub this: String,
    pub parent_id: Option<Uuid>,
    pub related_to: BTreeSet<Uuid>,
    pub owner_id: String,
    pub tenant_id: Option<String>,
    pub visibility: Visibility,
    pub status: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub code: Option<String>,
    pub language: Option<String>,
    pub runtime: Option<String>,
    pub input: Value,
    pub output: Value,
    pub error: Value,
    pub duration_ms: Option<i64>,
    pub trace_id: Option<Uuid>,
    pub metadata: Value,

    /// Pre-computed signing envelope (see `logline-crypto::seal`). A kernel
    /// signs the payload before handing it to the registry; the registry
    /// only re-verifies (I3), it never signs on a caller's behalf.
    pub prev_hash: Option<String>,
    pub curr_hash: Option<String>,
    pub signature: Option<String>,
    pub public_key: Option<String>,

    /// Fixed `at` for a caller who needs to sign the row before insert
    /// (the signature covers `at`, so it must be known ahead of time).
    /// Left `None` for unsigned inserts; the registry then assigns
    /// `now()`.
    pub at: Option<DateTime<Utc>>,
}

impl NewSpan {
    /// Minimal builder for the common case: an event span with no payload.
    pub fn new(entity_type: EntityType, who: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: None,
            entity_type,
            who: who.into(),
            did: String::new(),
            this: String::new(),
            parent_id: None,
            related_to: BTreeSet::new(),
            owner_id: owner_id.into(),
            tenant_id: None,
            visibility: Visibility::Private,
            status: None,
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
            metadata: Value::Null,
            prev_hash: None,
            curr_hash: None,
            signature: None,
            public_key: None,
            at: None,
        }
    }

    pub fn did(mut self, did: impl Into<String>) -> Self {
        self.did = did.into();
        self
    }

    pub fn this(mut self, this: impl Into<String>) -> Self {
        self.this = this.into();
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn related_to(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.related_to.extend(ids);
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn visibility(mut self, v: Visibility) -> Self {
        self.visibility = v;
        self
    }

    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn error(mut self, error: Value) -> Self {
        self.error = error;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn duration_ms(mut self, ms: i64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Attach a signing envelope produced by `logline_crypto::seal`.
    pub fn sealed(mut self, curr_hash: impl Into<String>, signature: impl Into<String>, public_key: impl Into<String>) -> Self {
        self.curr_hash = Some(curr_hash.into());
        self.signature = Some(signature.into());
        self.public_key = Some(public_key.into());
        self
    }

    pub fn prev_hash(mut self, prev_hash: impl Into<String>) -> Self {
        self.prev_hash = Some(prev_hash.into());
        self
    }

    /// Fix the logical id explicitly — used when emitting a revision
    /// (same `id`, a new `seq`) rather than a brand-new logical record.
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Fix `at` explicitly. Required before signing: the registry binds
    /// this value verbatim instead of defaulting to `now()`, so the hash
    /// computed over `preview_span` matches the row the registry stores.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    /// Build the exact `Span` shape the registry will persist for this
    /// insert, for a kernel to hash and sign before calling
    /// `insert_record`. `id`/`seq`/`at` must be fixed by the caller first
    /// (`seq` is 0 for a brand-new logical record); `owner_id`/`tenant_id`
    /// must already match the session the record is inserted under.
    pub fn preview_span(&self, id: Uuid, seq: i64, at: DateTime<Utc>) -> Span {
        Span {
            id,
            seq,
            entity_type: self.entity_type,
            who: self.who.clone(),
            did: self.did.clone(),
            this: self.this.clone(),
            at,
            parent_id: self.parent_id,
            related_to: self.related_to.clone(),
            owner_id: self.owner_id.clone(),
            tenant_id: self.tenant_id.clone(),
            visibility: self.visibility,
            status: self.status.clone(),
            is_deleted: false,
            name: self.name.clone(),
            description: self.description.clone(),
            code: self.code.clone(),
            language: self.language.clone(),
            runtime: self.runtime.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            error: self.error.clone(),
            duration_ms: self.duration_ms,
            trace_id: self.trace_id,
            prev_hash: self.prev_hash.clone(),
            curr_hash: None,
            signature: None,
            public_key: None,
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_round_trips_through_its_wire_string() {
        for et in [
            EntityType::Function,
            EntityType::Request,
            EntityType::Execution,
            EntityType::StatusPatch,
            EntityType::Policy,
            EntityType::PolicyCursor,
            EntityType::PolicyViolation,
            EntityType::PolicyError,
            EntityType::Provider,
            EntityType::ProviderExecution,
            EntityType::Manifest,
            EntityType::BootEvent,
        ] {
            assert_eq!(EntityType::parse(et.as_str()), Some(et));
        }
    }

    #[test]
    fn visibility_rejects_unknown_values() {
        assert_eq!(Visibility::parse("shared"), None);
    }
}
