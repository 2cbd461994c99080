//! Pennant core types, error taxonomy and collaborator traits.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod rule;

pub use rule::FieldRule;

/// Identifier of one orchestration run. Strictly increasing per orchestrator.
pub type RunId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    SharedDataProvider,
    FlagComputation,
}

/// One configured computation unit as returned by a [`MetadataCatalog`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputationUnitDescriptor {
    pub object_type: String,
    pub unit_id: String,
    #[serde(default)]
    pub required_permission: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub order: i64,
    pub kind: UnitKind,
}

fn default_active() -> bool { true }

impl ComputationUnitDescriptor {
    pub fn computation(object_type: impl Into<String>, unit_id: impl Into<String>, order: i64) -> Self {
        Self {
            object_type: object_type.into(),
            unit_id: unit_id.into(),
            required_permission: None,
            is_active: true,
            order,
            kind: UnitKind::FlagComputation,
        }
    }

    pub fn provider(object_type: impl Into<String>, unit_id: impl Into<String>) -> Self {
        Self { kind: UnitKind::SharedDataProvider, ..Self::computation(object_type, unit_id, 0) }
    }

    pub fn with_permission(mut self, perm: impl Into<String>) -> Self {
        self.required_permission = Some(perm.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Sort key: ascending `order`, ties broken by `unit_id`.
    pub fn sort_key(&self) -> (i64, &str) { (self.order, self.unit_id.as_str()) }
}

/// Record snapshot fetched once per run and read by every unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedPayload {
    pub record_id: String,
    pub data: serde_json::Value,
    /// True when no provider was configured and only the record id is known.
    pub is_fallback: bool,
}

impl SharedPayload {
    pub fn new(record_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self { record_id: record_id.into(), data, is_fallback: false }
    }

    pub fn fallback(record_id: impl Into<String>) -> Self {
        let record_id = record_id.into();
        let data = serde_json::json!({ "id": record_id });
        Self { record_id, data, is_fallback: true }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Normal,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagAction {
    pub label: String,
    pub target: String,
}

/// One rendered flag badge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagDescriptor {
    pub severity: Severity,
    pub header: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub actions: SmallVec<[FlagAction; 2]>,
}

impl FlagDescriptor {
    pub fn new(severity: Severity, header: impl Into<String>) -> Self {
        Self { severity, header: header.into(), body: None, actions: SmallVec::new() }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_action(mut self, label: impl Into<String>, target: impl Into<String>) -> Self {
        self.actions.push(FlagAction { label: label.into(), target: target.into() });
        self
    }

    /// A descriptor without a visible header cannot be rendered.
    pub fn is_well_formed(&self) -> bool { !self.header.trim().is_empty() }
}

/// Result of invoking one computation unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum UnitOutcome {
    Flags(Vec<FlagDescriptor>),
    Failure(String),
}

impl UnitOutcome {
    pub fn is_failure(&self) -> bool { matches!(self, UnitOutcome::Failure(_)) }
}

/// A unit outcome tagged with where it belongs: run, catalog slot and unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    pub run_id: RunId,
    /// Position of the unit in the resolved catalog order.
    pub slot: usize,
    pub unit_id: String,
    pub outcome: UnitOutcome,
    pub took_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Resolving,
    FetchingSharedData,
    Dispatching,
    Settled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Info,
    Success,
    Warn,
    Error,
}

impl NoticeKind {
    pub fn default_duration_ms(self) -> u64 {
        match self { NoticeKind::Error => 5000, NoticeKind::Warn => 4000, _ => 3000 }
    }
}

/// Standalone top-level message (toast) distinct from the flag list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notice {
    pub id: uuid::Uuid,
    pub kind: NoticeKind,
    pub text: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
}

impl Notice {
    pub fn new(kind: NoticeKind, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            kind,
            text: text.into(),
            created_at: chrono::Utc::now(),
            duration_ms: kind.default_duration_ms(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self { Self::new(NoticeKind::Error, text) }
}

/// Externally observable result of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AggregateState {
    pub run_id: RunId,
    pub phase: Phase,
    pub flags: Vec<FlagDescriptor>,
    pub has_failures: bool,
    pub is_loading: bool,
    /// Units dispatched but not yet reported.
    pub pending: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<Notice>,
}

/// Per-unit failure notice propagated to the top-level view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitFailureNotice {
    pub run_id: RunId,
    pub unit_id: String,
    pub reason: String,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PennantError {
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("unit {unit_id} failed: {reason}")]
    Unit { unit_id: String, reason: String },
    #[error("validation: {0}")]
    Validation(String),
}

pub type PennantResult<T> = Result<T, PennantError>;

// ---- collaborator seams ----

/// Configuration registry returning unit descriptors for an object type.
#[async_trait::async_trait]
pub trait MetadataCatalog: Send + Sync {
    async fn lookup(&self, object_type: &str) -> anyhow::Result<Vec<ComputationUnitDescriptor>>;
}

/// Fetches the shared record payload once per run.
#[async_trait::async_trait]
pub trait SharedDataProvider: Send + Sync {
    async fn fetch(&self, record_id: &str) -> anyhow::Result<SharedPayload>;
}

/// Pure computation from payload to flags. `Ok(None)` means nothing to show.
#[async_trait::async_trait]
pub trait FlagComputation: Send + Sync {
    async fn compute(&self, payload: &SharedPayload) -> anyhow::Result<Option<Vec<FlagDescriptor>>>;
}

/// Permission check; total and side-effect free.
pub trait AuthorizationContext: Send + Sync {
    fn has_permission(&self, name: &str) -> bool;
}

pub mod prelude {
    pub use super::{
        AggregateState, AuthorizationContext, ComputationUnitDescriptor, FlagAction, FlagComputation,
        FlagDescriptor, MetadataCatalog, Notice, NoticeKind, PennantError, PennantResult, Phase, RunId,
        Severity, SharedDataProvider, SharedPayload, UnitFailureNotice, UnitKind, UnitOutcome, UnitReport,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_payload_carries_only_record_id() {
        let p = SharedPayload::fallback("001A");
        assert!(p.is_fallback);
        assert_eq!(p.record_id, "001A");
        assert_eq!(p.data, serde_json::json!({ "id": "001A" }));
    }

    #[test]
    fn descriptor_defaults_from_yaml_like_json() {
        let d: ComputationUnitDescriptor = serde_json::from_value(serde_json::json!({
            "object_type": "Account",
            "unit_id": "overdue",
            "kind": "flag_computation"
        })).unwrap();
        assert!(d.is_active);
        assert_eq!(d.order, 0);
        assert_eq!(d.required_permission, None);
    }

    #[test]
    fn blank_header_is_malformed() {
        assert!(!FlagDescriptor::new(Severity::Normal, "  ").is_well_formed());
        assert!(FlagDescriptor::new(Severity::Normal, "ok").is_well_formed());
    }
}
