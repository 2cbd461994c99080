//! Pennant public API façade (in-process).
//!
//! This crate defines the surface presentation layers depend on: start a run
//! for a record, refresh it, observe the evolving flag state and the per-unit
//! failure stream.

#![forbid(unsafe_code)]

use std::sync::Arc;

use pennant_catalog::{resolve_units, ResolvedUnits};
use pennant_core::{AggregateState, AuthorizationContext, MetadataCatalog, PennantError, UnitFailureNotice};
use pennant_exec::{Invoker, UnitRegistry};
use pennant_store::StateHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

pub mod config;
pub mod orchestrator;

pub use config::EngineConfig;
pub use orchestrator::{Completion, Orchestrator};

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("catalog: {0}")]
    Catalog(String),
    #[error("provider: {0}")]
    Provider(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<PennantError> for ApiError {
    fn from(e: PennantError) -> Self {
        match e {
            PennantError::CatalogUnavailable(d) => ApiError::Catalog(d),
            PennantError::Provider(d) => ApiError::Provider(d),
            PennantError::Validation(d) => ApiError::Validation(d),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Callback receiving state snapshots as they evolve.
pub type StateCallback = Box<dyn Fn(Arc<AggregateState>) + Send + Sync>;

/// Flag orchestration surface.
#[async_trait::async_trait]
pub trait FlagsApi: Send + Sync {
    /// Begin a run for `record_id`; the returned completion resolves on settlement.
    async fn start(&self, record_id: &str, object_type: &str) -> ApiResult<Completion>;

    /// Re-run the whole pipeline for the current record (host page refresh).
    async fn on_refresh(&self) -> ApiResult<Completion>;

    /// Await settlement of the latest run.
    async fn settled(&self) -> ApiResult<Arc<AggregateState>>;

    /// Deliver every published snapshot to `callback` until cancelled.
    fn subscribe(&self, callback: StateCallback) -> CancelHandle;

    /// Read handle over the published state.
    fn state(&self) -> StateHandle;

    fn current(&self) -> Arc<AggregateState>;

    /// Per-unit failure notices, tagged with their run id.
    fn failures(&self) -> StreamHandle<UnitFailureNotice>;

    /// Units that would run for `object_type` under the current permissions.
    async fn units(&self, object_type: &str) -> ApiResult<ResolvedUnits>;

    fn config(&self) -> EngineConfig;
}

// ----------------- In-process implementation -----------------

/// In-process implementation driving an [`Orchestrator`].
pub struct InProcApi {
    orchestrator: Orchestrator,
    catalog: Arc<dyn MetadataCatalog>,
    auth: Arc<dyn AuthorizationContext>,
    cfg: EngineConfig,
}

impl InProcApi {
    pub fn new(
        catalog: Arc<dyn MetadataCatalog>,
        auth: Arc<dyn AuthorizationContext>,
        registry: UnitRegistry,
        cfg: EngineConfig,
    ) -> Self {
        info!(units = registry.len(), timeout_ms = ?cfg.unit_timeout_ms, queue_cap = cfg.queue_cap, "api: engine starting");
        let invoker = Invoker::new(Arc::new(registry));
        let orchestrator = Orchestrator::spawn(Arc::clone(&catalog), Arc::clone(&auth), invoker, cfg.clone());
        Self { orchestrator, catalog, auth, cfg }
    }

    pub fn orchestrator(&self) -> &Orchestrator { &self.orchestrator }
}

#[async_trait::async_trait]
impl FlagsApi for InProcApi {
    async fn start(&self, record_id: &str, object_type: &str) -> ApiResult<Completion> {
        info!(record_id, object_type, "api: start");
        self.orchestrator.start(record_id, object_type).await
    }

    async fn on_refresh(&self) -> ApiResult<Completion> {
        info!("api: refresh");
        self.orchestrator.refresh().await
    }

    async fn settled(&self) -> ApiResult<Arc<AggregateState>> { self.orchestrator.settled().await }

    fn subscribe(&self, callback: StateCallback) -> CancelHandle {
        let mut handle = self.orchestrator.state();
        let task = tokio::spawn(async move {
            while let Some(state) = handle.changed().await { callback(state); }
            debug!("api: subscription ended");
        });
        CancelHandle { task: Some(task) }
    }

    fn state(&self) -> StateHandle { self.orchestrator.state() }

    fn current(&self) -> Arc<AggregateState> { self.orchestrator.current() }

    fn failures(&self) -> StreamHandle<UnitFailureNotice> {
        let mut sub = self.orchestrator.failures();
        let (tx, rx) = mpsc::channel::<UnitFailureNotice>(self.cfg.queue_cap.max(1));
        let task = tokio::spawn(async move {
            loop {
                match sub.recv().await {
                    Ok(n) => { if tx.send(n).await.is_err() { break; } }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => debug!(skipped, "api: failure stream lagged"),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        StreamHandle { rx, cancel: CancelHandle { task: Some(task) } }
    }

    async fn units(&self, object_type: &str) -> ApiResult<ResolvedUnits> {
        Ok(resolve_units(self.catalog.as_ref(), object_type, self.auth.as_ref()).await?)
    }

    fn config(&self) -> EngineConfig { self.cfg.clone() }
}

// ----------------- Streaming primitives -----------------

/// Cancellation handle that aborts the underlying task.
pub struct CancelHandle { task: Option<tokio::task::JoinHandle<()>> }

impl CancelHandle { pub fn cancel(mut self) { if let Some(h) = self.task.take() { h.abort(); } } }

/// Generic stream handle used by API streaming endpoints.
pub struct StreamHandle<T> { pub rx: tokio::sync::mpsc::Receiver<T>, pub cancel: CancelHandle }
