//! Pennant exec: runs computation units against the shared payload.
//!
//! Every unit runs in its own tokio task. Whatever happens inside that task
//! (an error, a panic, a malformed result, an overrun of the optional time
//! limit) comes back as a [`UnitOutcome::Failure`] for that unit only.

#![forbid(unsafe_code)]

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::FutureExt;
use pennant_core::{
    ComputationUnitDescriptor, PennantError, PennantResult, RunId, SharedPayload, UnitOutcome, UnitReport,
};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

pub mod builtin;
pub mod registry;

pub use builtin::{JsonFileProvider, RuleComputation};
pub use registry::{FnComputation, UnitRegistry};

/// Join handle that aborts its task when dropped.
pub struct TaskGuard<T>(pub JoinHandle<T>);

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) { self.0.abort(); }
}

impl<T> Future for TaskGuard<T> {
    type Output = Result<T, JoinError>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> { Pin::new(&mut self.0).poll(cx) }
}

fn panic_message(p: Box<dyn Any + Send>) -> String {
    if let Some(s) = p.downcast_ref::<&str>() { return (*s).to_string(); }
    if let Some(s) = p.downcast_ref::<String>() { return s.clone(); }
    "non-string panic payload".to_string()
}

#[derive(Clone)]
pub struct Invoker {
    registry: Arc<UnitRegistry>,
    timeout: Option<Duration>,
}

impl Invoker {
    pub fn new(registry: Arc<UnitRegistry>) -> Self { Self { registry, timeout: None } }

    /// Per-unit time limit; `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> { &self.registry }
    pub fn timeout(&self) -> Option<Duration> { self.timeout }

    /// Run one unit. Never fails: every fault becomes `UnitOutcome::Failure`.
    pub async fn invoke(&self, unit: &ComputationUnitDescriptor, payload: Arc<SharedPayload>) -> UnitOutcome {
        let Some(computation) = self.registry.computation(&unit.unit_id) else {
            return UnitOutcome::Failure(format!("no computation registered for {}", unit.unit_id));
        };
        let task = TaskGuard(tokio::spawn(async move { computation.compute(&payload).await }));
        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(j) => j,
                Err(_) => return UnitOutcome::Failure(format!("timed out after {}ms", limit.as_millis())),
            },
            None => task.await,
        };
        match joined {
            Ok(Ok(None)) => UnitOutcome::Flags(Vec::new()),
            Ok(Ok(Some(flags))) => match flags.iter().position(|f| !f.is_well_formed()) {
                Some(i) => UnitOutcome::Failure(format!("malformed result: flag #{} has an empty header", i)),
                None => UnitOutcome::Flags(flags),
            },
            Ok(Err(e)) => UnitOutcome::Failure(format!("{:#}", e)),
            Err(e) if e.is_panic() => UnitOutcome::Failure(format!("unit panicked: {}", panic_message(e.into_panic()))),
            Err(_) => UnitOutcome::Failure("unit cancelled".to_string()),
        }
    }

    /// Spawn one invocation and deliver its tagged outcome on `tx`.
    /// Aborting the returned handle also aborts the computation.
    pub fn dispatch(
        &self,
        run_id: RunId,
        slot: usize,
        unit: ComputationUnitDescriptor,
        payload: Arc<SharedPayload>,
        tx: mpsc::Sender<UnitReport>,
    ) -> JoinHandle<()> {
        let me = self.clone();
        tokio::spawn(async move {
            let t0 = Instant::now();
            let outcome = me.invoke(&unit, payload).await;
            let took_ms = t0.elapsed().as_millis() as u64;
            metrics::counter!("pennant_unit_invocations_total", 1u64);
            metrics::histogram!("pennant_unit_ms", took_ms as f64);
            match &outcome {
                UnitOutcome::Failure(reason) => {
                    metrics::counter!("pennant_unit_failures_total", 1u64);
                    warn!(run_id, unit = %unit.unit_id, reason = %reason, took_ms, "exec: unit failed");
                }
                UnitOutcome::Flags(flags) => debug!(run_id, unit = %unit.unit_id, flags = flags.len(), took_ms, "exec: unit done"),
            }
            let report = UnitReport { run_id, slot, unit_id: unit.unit_id, outcome, took_ms };
            if tx.send(report).await.is_err() {
                debug!(run_id, "exec: report receiver gone");
            }
        })
    }
}

/// Produce the run's single shared payload.
///
/// Without a provider descriptor the fallback payload (record id only) is
/// returned. A configured provider that is missing, errors or panics is fatal
/// for the run.
pub async fn resolve_shared_payload(
    registry: &UnitRegistry,
    record_id: &str,
    provider: Option<&ComputationUnitDescriptor>,
) -> PennantResult<SharedPayload> {
    let Some(desc) = provider else {
        debug!(record_id, "exec: no provider configured; using fallback payload");
        return Ok(SharedPayload::fallback(record_id));
    };
    let p = registry
        .provider(&desc.unit_id)
        .ok_or_else(|| PennantError::Provider(format!("no provider registered for {}", desc.unit_id)))?;
    let t0 = Instant::now();
    metrics::counter!("pennant_provider_fetch_total", 1u64);
    match AssertUnwindSafe(p.fetch(record_id)).catch_unwind().await {
        Ok(Ok(payload)) => {
            info!(record_id, provider = %desc.unit_id, took_ms = %t0.elapsed().as_millis(), "exec: shared payload fetched");
            Ok(payload)
        }
        Ok(Err(e)) => {
            warn!(record_id, provider = %desc.unit_id, error = %e, "exec: provider failed");
            Err(PennantError::Provider(format!("{:#}", e)))
        }
        Err(panic) => {
            let msg = panic_message(panic);
            warn!(record_id, provider = %desc.unit_id, panic = %msg, "exec: provider panicked");
            Err(PennantError::Provider(format!("provider panicked: {}", msg)))
        }
    }
}
