//! Run orchestration: catalog → shared payload → per-unit dispatch → aggregate.
//!
//! A single actor task owns the aggregator and the published state. Each run
//! gets a fresh run id; its pipeline task resolves the catalog and payload and
//! spawns one invocation per unit. Everything the pipeline and the units send
//! back is tagged with the run id, and anything not matching the current run
//! is dropped. Refresh aborts the previous pipeline best-effort.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use pennant_catalog::resolve_units;
use pennant_core::{
    AggregateState, AuthorizationContext, MetadataCatalog, Notice, PennantError, Phase, RunId, UnitFailureNotice,
    UnitOutcome, UnitReport,
};
use pennant_exec::{resolve_shared_payload, Invoker, TaskGuard};
use pennant_store::{fatal_state, state_channel, Aggregator, StateHandle, StatePublisher};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::{ApiError, ApiResult};

/// Resolves with the settled state of the run it was issued for, or of a
/// later run that superseded it.
pub struct Completion {
    rx: oneshot::Receiver<Arc<AggregateState>>,
}

impl Completion {
    pub async fn wait(self) -> ApiResult<Arc<AggregateState>> {
        self.rx.await.map_err(|_| ApiError::Internal("orchestrator stopped before settling".into()))
    }
}

enum Command {
    Start { record_id: String, object_type: String, done: oneshot::Sender<Arc<AggregateState>> },
    Refresh { done: oneshot::Sender<Arc<AggregateState>>, ack: oneshot::Sender<ApiResult<RunId>> },
    Settled { done: oneshot::Sender<Arc<AggregateState>>, ack: oneshot::Sender<ApiResult<RunId>> },
}

enum RunEvent {
    Phase { run_id: RunId, phase: Phase },
    Dispatched { run_id: RunId, units: usize },
    Fatal { run_id: RunId, error: PennantError },
}

impl RunEvent {
    fn run_id(&self) -> RunId {
        match self {
            RunEvent::Phase { run_id, .. } | RunEvent::Dispatched { run_id, .. } | RunEvent::Fatal { run_id, .. } => *run_id,
        }
    }
}

struct Run {
    id: RunId,
    phase: Phase,
    agg: Option<Aggregator>,
    pipeline: JoinHandle<()>,
    started: Instant,
}

/// Collaborators shared by every run.
#[derive(Clone)]
struct Deps {
    catalog: Arc<dyn MetadataCatalog>,
    auth: Arc<dyn AuthorizationContext>,
    invoker: Invoker,
}

pub struct Orchestrator {
    cmd_tx: mpsc::Sender<Command>,
    state: StateHandle,
    failures_tx: broadcast::Sender<UnitFailureNotice>,
    task: JoinHandle<()>,
}

impl Orchestrator {
    pub fn spawn(
        catalog: Arc<dyn MetadataCatalog>,
        auth: Arc<dyn AuthorizationContext>,
        invoker: Invoker,
        cfg: EngineConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(16);
        let (publisher, state) = state_channel();
        let (failures_tx, _) = broadcast::channel::<UnitFailureNotice>(cfg.queue_cap.max(1));
        let invoker = invoker.with_timeout(cfg.unit_timeout());
        let actor = Actor::new(Deps { catalog, auth, invoker }, cfg, publisher, failures_tx.clone());
        let task = tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx, state, failures_tx, task }
    }

    /// Begin a run for a record; any run in flight is superseded.
    pub async fn start(&self, record_id: &str, object_type: &str) -> ApiResult<Completion> {
        if record_id.trim().is_empty() || object_type.trim().is_empty() {
            return Err(ApiError::Validation("record id and object type are required".into()));
        }
        let (done, rx) = oneshot::channel();
        let cmd = Command::Start { record_id: record_id.to_string(), object_type: object_type.to_string(), done };
        self.cmd_tx.send(cmd).await.map_err(|_| ApiError::Internal("orchestrator stopped".into()))?;
        Ok(Completion { rx })
    }

    /// Re-run the pipeline for the last started record.
    pub async fn refresh(&self) -> ApiResult<Completion> {
        let (done, rx) = oneshot::channel();
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx.send(Command::Refresh { done, ack }).await.map_err(|_| ApiError::Internal("orchestrator stopped".into()))?;
        ack_rx.await.map_err(|_| ApiError::Internal("orchestrator stopped".into()))??;
        Ok(Completion { rx })
    }

    /// Settled state of the latest run; resolves immediately if it already settled.
    pub async fn settled(&self) -> ApiResult<Arc<AggregateState>> {
        let (done, rx) = oneshot::channel();
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx.send(Command::Settled { done, ack }).await.map_err(|_| ApiError::Internal("orchestrator stopped".into()))?;
        ack_rx.await.map_err(|_| ApiError::Internal("orchestrator stopped".into()))??;
        Completion { rx }.wait().await
    }

    pub fn state(&self) -> StateHandle { self.state.clone() }
    pub fn current(&self) -> Arc<AggregateState> { self.state.current() }
    pub fn failures(&self) -> broadcast::Receiver<UnitFailureNotice> { self.failures_tx.subscribe() }

    pub fn shutdown(self) { self.task.abort(); }
}

struct Actor {
    deps: Deps,
    cfg: EngineConfig,
    publisher: StatePublisher,
    failures_tx: broadcast::Sender<UnitFailureNotice>,
    events_tx: mpsc::Sender<RunEvent>,
    events_rx: mpsc::Receiver<RunEvent>,
    reports_tx: mpsc::Sender<UnitReport>,
    reports_rx: mpsc::Receiver<UnitReport>,
    target: Option<(String, String)>,
    current: Option<Run>,
    last_run: RunId,
    waiters: Vec<(RunId, oneshot::Sender<Arc<AggregateState>>)>,
    stale: u64,
}

impl Actor {
    fn new(deps: Deps, cfg: EngineConfig, publisher: StatePublisher, failures_tx: broadcast::Sender<UnitFailureNotice>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (reports_tx, reports_rx) = mpsc::channel(cfg.queue_cap.max(1));
        Self {
            deps,
            cfg,
            publisher,
            failures_tx,
            events_tx,
            events_rx,
            reports_tx,
            reports_rx,
            target: None,
            current: None,
            last_run: 0,
            waiters: Vec::new(),
            stale: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            // Events precede reports: a run's Dispatched event is always
            // enqueued before any of its units can report.
            tokio::select! {
                biased;
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                Some(ev) = self.events_rx.recv() => self.on_event(ev),
                Some(report) = self.reports_rx.recv() => self.on_report(report),
            }
        }
        if let Some(run) = self.current.take() { run.pipeline.abort(); }
        debug!(stale = self.stale, "orchestrator: stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { record_id, object_type, done } => {
                self.target = Some((record_id, object_type));
                let run_id = self.start_run();
                self.waiters.push((run_id, done));
            }
            Command::Refresh { done, ack } => {
                if self.target.is_none() {
                    let _ = ack.send(Err(ApiError::Validation("refresh before start: no record selected".into())));
                    return;
                }
                let run_id = self.start_run();
                self.waiters.push((run_id, done));
                let _ = ack.send(Ok(run_id));
            }
            Command::Settled { done, ack } => {
                let Some(run) = self.current.as_ref() else {
                    let _ = ack.send(Err(ApiError::Validation("no run started".into())));
                    return;
                };
                let run_id = run.id;
                if run.phase == Phase::Settled {
                    let _ = done.send(self.publisher.current());
                } else {
                    self.waiters.push((run_id, done));
                }
                let _ = ack.send(Ok(run_id));
            }
        }
    }

    fn start_run(&mut self) -> RunId {
        self.last_run += 1;
        let run_id = self.last_run;
        if let Some(old) = self.current.take() {
            if old.phase != Phase::Settled {
                info!(run_id = old.id, superseded_by = run_id, "orchestrator: run superseded");
            }
            old.pipeline.abort();
        }
        let Some((record_id, object_type)) = self.target.clone() else { return run_id; };
        metrics::counter!("pennant_runs_total", 1u64);
        info!(run_id, record_id = %record_id, object_type = %object_type, "orchestrator: run start");
        let pipeline = tokio::spawn(pipeline(
            run_id,
            record_id,
            object_type,
            self.deps.clone(),
            self.events_tx.clone(),
            self.reports_tx.clone(),
        ));
        self.current = Some(Run { id: run_id, phase: Phase::Resolving, agg: None, pipeline, started: Instant::now() });
        self.publish_phase(run_id, Phase::Resolving);
        run_id
    }

    fn is_current(&self, run_id: RunId) -> bool { self.current.as_ref().map(|r| r.id == run_id).unwrap_or(false) }

    fn drop_stale(&mut self, run_id: RunId, what: &str) {
        self.stale += 1;
        metrics::counter!("pennant_stale_outcomes_total", 1u64);
        debug!(run_id, current = self.last_run, what, "orchestrator: stale message dropped");
    }

    fn on_event(&mut self, ev: RunEvent) {
        if !self.is_current(ev.run_id()) {
            self.drop_stale(ev.run_id(), "event");
            return;
        }
        match ev {
            RunEvent::Phase { run_id, phase } => self.publish_phase(run_id, phase),
            RunEvent::Fatal { run_id, error } => {
                warn!(run_id, error = %error, "orchestrator: run failed");
                let mut notice = Notice::error(notice_text(&error));
                if let Some(ms) = self.cfg.notice_ms { notice.duration_ms = ms; }
                self.settle(fatal_state(run_id, notice));
            }
            RunEvent::Dispatched { run_id, units } => {
                let agg = Aggregator::with_failure_header(run_id, units, self.cfg.failure_header.clone());
                if let Some(run) = self.current.as_mut() {
                    run.agg = Some(agg);
                    run.phase = Phase::Dispatching;
                }
                info!(run_id, units, "orchestrator: dispatching");
                if units == 0 {
                    self.settle_from_aggregator();
                } else {
                    self.publish_from_aggregator(Phase::Dispatching);
                }
            }
        }
    }

    fn on_report(&mut self, report: UnitReport) {
        let run_id = report.run_id;
        let failure = match &report.outcome {
            UnitOutcome::Failure(reason) => Some(UnitFailureNotice { run_id, unit_id: report.unit_id.clone(), reason: reason.clone() }),
            UnitOutcome::Flags(_) => None,
        };
        let accepted = match self.current.as_mut().and_then(|r| r.agg.as_mut()) {
            Some(agg) => agg.accept(report).is_ok(),
            None => false,
        };
        if !accepted {
            self.drop_stale(run_id, "report");
            return;
        }
        if let Some(notice) = failure {
            // no subscribers is fine
            let _ = self.failures_tx.send(notice);
        }
        let complete = self.current.as_ref().and_then(|r| r.agg.as_ref()).map(|a| a.is_complete()).unwrap_or(false);
        if complete { self.settle_from_aggregator(); } else { self.publish_from_aggregator(Phase::Dispatching); }
    }

    fn publish_phase(&mut self, run_id: RunId, phase: Phase) {
        if let Some(run) = self.current.as_mut() { run.phase = phase; }
        let state = AggregateState { run_id, phase, is_loading: phase != Phase::Settled, ..Default::default() };
        self.publisher.publish(state);
    }

    fn publish_from_aggregator(&mut self, phase: Phase) {
        if let Some(agg) = self.current.as_ref().and_then(|r| r.agg.as_ref()) {
            let state = agg.state(phase);
            self.publisher.publish(state);
        }
    }

    fn settle_from_aggregator(&mut self) {
        if let Some(state) = self.current.as_ref().and_then(|r| r.agg.as_ref()).map(|a| a.state(Phase::Settled)) {
            self.settle(state);
        }
    }

    fn settle(&mut self, state: AggregateState) {
        let run_id = state.run_id;
        if let Some(run) = self.current.as_mut() {
            run.phase = Phase::Settled;
            let took_ms = run.started.elapsed().as_millis();
            metrics::histogram!("pennant_run_ms", took_ms as f64);
            info!(
                run_id,
                flags = state.flags.len(),
                has_failures = state.has_failures,
                notice = state.notice.is_some(),
                took_ms = %took_ms,
                "orchestrator: run settled"
            );
        }
        self.publisher.publish(state);
        let settled = self.publisher.current();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters).into_iter().partition(|(id, _)| *id <= run_id);
        self.waiters = waiting;
        for (_, done) in ready { let _ = done.send(Arc::clone(&settled)); }
    }
}

fn notice_text(error: &PennantError) -> String {
    match error {
        PennantError::CatalogUnavailable(d) => format!("Flags could not be loaded: configuration unavailable ({})", d),
        PennantError::Provider(d) => format!("Flags could not be loaded: record data unavailable ({})", d),
        other => format!("Flags could not be loaded: {}", other),
    }
}

async fn pipeline(
    run_id: RunId,
    record_id: String,
    object_type: String,
    deps: Deps,
    events: mpsc::Sender<RunEvent>,
    reports: mpsc::Sender<UnitReport>,
) {
    let resolved = match resolve_units(deps.catalog.as_ref(), &object_type, deps.auth.as_ref()).await {
        Ok(r) => r,
        Err(error) => {
            let _ = events.send(RunEvent::Fatal { run_id, error }).await;
            return;
        }
    };
    if events.send(RunEvent::Phase { run_id, phase: Phase::FetchingSharedData }).await.is_err() { return; }
    let payload = match resolve_shared_payload(deps.invoker.registry(), &record_id, resolved.provider.as_ref()).await {
        Ok(p) => Arc::new(p),
        Err(error) => {
            let _ = events.send(RunEvent::Fatal { run_id, error }).await;
            return;
        }
    };
    if events.send(RunEvent::Dispatched { run_id, units: resolved.units.len() }).await.is_err() { return; }
    let guards: Vec<TaskGuard<()>> = resolved
        .units
        .into_iter()
        .enumerate()
        .map(|(slot, unit)| TaskGuard(deps.invoker.dispatch(run_id, slot, unit, Arc::clone(&payload), reports.clone())))
        .collect();
    // Holding the guards ties unit lifetimes to this pipeline: aborting it on
    // refresh aborts every unit still in flight.
    futures::future::join_all(guards).await;
}
