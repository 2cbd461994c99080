//! Pennant store: merges unit outcomes into one ordered flag list and
//! publishes immutable state snapshots to readers.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use pennant_core::{AggregateState, FlagDescriptor, Notice, Phase, RunId, Severity, UnitOutcome, UnitReport};
use rustc_hash::FxHashSet;
use tokio::sync::watch;
use tracing::{debug, trace};

pub const DEFAULT_FAILURE_HEADER: &str = "Unable to load some flags";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Pending,
    Flags(Vec<FlagDescriptor>),
    Failed,
}

/// Why `accept` refused an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    StaleRun,
    UnknownSlot,
    AlreadyReported,
}

/// Ordered, coalescing merge of unit outcomes for one run.
///
/// Each dispatched unit owns a pre-sized slot at its catalog index. Slots are
/// flushed into `flags` contiguously from the front, so the visible list only
/// ever grows and always follows catalog order regardless of completion order.
/// Failures collapse into one synthetic error flag placed where the first
/// failed slot is flushed; later reasons are appended to its body.
pub struct Aggregator {
    run_id: RunId,
    slots: Vec<Slot>,
    flushed: usize,
    pending: usize,
    flags: Vec<FlagDescriptor>,
    error_at: Option<usize>,
    reasons: Vec<String>,
    seen_reasons: FxHashSet<String>,
    failure_header: String,
    rejected: u64,
}

impl Aggregator {
    pub fn new(run_id: RunId, units: usize) -> Self { Self::with_failure_header(run_id, units, DEFAULT_FAILURE_HEADER) }

    pub fn with_failure_header(run_id: RunId, units: usize, header: impl Into<String>) -> Self {
        Self {
            run_id,
            slots: vec![Slot::Pending; units],
            flushed: 0,
            pending: units,
            flags: Vec::new(),
            error_at: None,
            reasons: Vec::new(),
            seen_reasons: FxHashSet::default(),
            failure_header: header.into(),
            rejected: 0,
        }
    }

    pub fn run_id(&self) -> RunId { self.run_id }
    pub fn pending(&self) -> usize { self.pending }
    pub fn is_complete(&self) -> bool { self.pending == 0 }
    pub fn has_failures(&self) -> bool { !self.reasons.is_empty() }
    pub fn flags(&self) -> &[FlagDescriptor] { &self.flags }
    pub fn rejected(&self) -> u64 { self.rejected }

    /// Distinct failure reasons in arrival order.
    pub fn reasons(&self) -> &[String] { &self.reasons }

    /// Merge one report. Reports for another run, an unknown slot, or a slot
    /// that already reported are ignored.
    pub fn accept(&mut self, report: UnitReport) -> Result<(), Rejected> {
        let why = if report.run_id != self.run_id {
            Some(Rejected::StaleRun)
        } else if report.slot >= self.slots.len() {
            Some(Rejected::UnknownSlot)
        } else if self.slots[report.slot] != Slot::Pending {
            Some(Rejected::AlreadyReported)
        } else {
            None
        };
        if let Some(why) = why {
            self.rejected += 1;
            debug!(run_id = self.run_id, report_run = report.run_id, unit = %report.unit_id, reason = ?why, "aggregator: outcome rejected");
            return Err(why);
        }
        self.pending -= 1;
        match report.outcome {
            UnitOutcome::Flags(list) => {
                trace!(run_id = self.run_id, unit = %report.unit_id, flags = list.len(), "aggregator: flags accepted");
                self.slots[report.slot] = Slot::Flags(list);
            }
            UnitOutcome::Failure(reason) => {
                trace!(run_id = self.run_id, unit = %report.unit_id, reason = %reason, "aggregator: failure accepted");
                self.slots[report.slot] = Slot::Failed;
                self.record_reason(reason);
            }
        }
        self.flush();
        Ok(())
    }

    fn record_reason(&mut self, reason: String) {
        if !self.seen_reasons.insert(reason.clone()) { return; }
        self.reasons.push(reason);
        if let Some(idx) = self.error_at {
            self.flags[idx].body = Some(self.reasons.join("\n"));
        }
    }

    fn flush(&mut self) {
        while self.flushed < self.slots.len() {
            match std::mem::replace(&mut self.slots[self.flushed], Slot::Pending) {
                Slot::Pending => break,
                Slot::Flags(list) => {
                    self.flags.extend(list);
                    // flushed slots keep a non-pending marker so repeats stay rejected
                    self.slots[self.flushed] = Slot::Flags(Vec::new());
                }
                Slot::Failed => {
                    self.slots[self.flushed] = Slot::Failed;
                    if self.error_at.is_none() {
                        self.error_at = Some(self.flags.len());
                        self.flags.push(
                            FlagDescriptor::new(Severity::Error, self.failure_header.clone())
                                .with_body(self.reasons.join("\n")),
                        );
                    }
                }
            }
            self.flushed += 1;
        }
    }

    /// Snapshot for presentation; `is_loading` follows the phase.
    pub fn state(&self, phase: Phase) -> AggregateState {
        AggregateState {
            run_id: self.run_id,
            phase,
            flags: self.flags.clone(),
            has_failures: self.has_failures(),
            is_loading: phase != Phase::Settled,
            pending: self.pending,
            notice: None,
        }
    }
}

/// State for a run that ended before dispatch (catalog or provider failure).
pub fn fatal_state(run_id: RunId, notice: Notice) -> AggregateState {
    AggregateState {
        run_id,
        phase: Phase::Settled,
        flags: Vec::new(),
        has_failures: false,
        is_loading: false,
        pending: 0,
        notice: Some(notice),
    }
}

/// Write side of the published state.
pub struct StatePublisher {
    snap: Arc<ArcSwap<AggregateState>>,
    epoch_tx: watch::Sender<u64>,
    epoch: u64,
}

/// Read side: current snapshot plus change notification.
#[derive(Clone)]
pub struct StateHandle {
    snap: Arc<ArcSwap<AggregateState>>,
    epoch_rx: watch::Receiver<u64>,
}

pub fn state_channel() -> (StatePublisher, StateHandle) {
    let snap = Arc::new(ArcSwap::from_pointee(AggregateState::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    (StatePublisher { snap: Arc::clone(&snap), epoch_tx, epoch: 0 }, StateHandle { snap, epoch_rx })
}

impl StatePublisher {
    pub fn publish(&mut self, state: AggregateState) {
        self.epoch = self.epoch.saturating_add(1);
        metrics::gauge!("pennant_flags_visible", state.flags.len() as f64);
        self.snap.store(Arc::new(state));
        // no receivers is fine: the snapshot stays readable
        let _ = self.epoch_tx.send(self.epoch);
    }

    pub fn current(&self) -> Arc<AggregateState> { self.snap.load_full() }
}

impl StateHandle {
    pub fn current(&self) -> Arc<AggregateState> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Wait for the next publish after the last one seen by this handle.
    /// Returns `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<Arc<AggregateState>> {
        self.epoch_rx.changed().await.ok()?;
        Some(self.current())
    }

    /// Wait until the published state satisfies `pred`.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Option<Arc<AggregateState>>
    where
        F: FnMut(&AggregateState) -> bool,
    {
        loop {
            self.epoch_rx.borrow_and_update();
            let cur = self.current();
            if pred(&cur) { return Some(cur); }
            self.epoch_rx.changed().await.ok()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pennant_core::NoticeKind;

    fn report(run_id: RunId, slot: usize, outcome: UnitOutcome) -> UnitReport {
        UnitReport { run_id, slot, unit_id: format!("u{}", slot), outcome, took_ms: 0 }
    }

    fn flag(h: &str) -> FlagDescriptor { FlagDescriptor::new(Severity::Warning, h) }

    #[test]
    fn out_of_order_completion_flushes_in_slot_order() {
        let mut agg = Aggregator::new(1, 3);
        agg.accept(report(1, 2, UnitOutcome::Flags(vec![flag("c")]))).unwrap();
        assert!(agg.flags().is_empty());
        agg.accept(report(1, 0, UnitOutcome::Flags(vec![flag("a")]))).unwrap();
        assert_eq!(agg.flags().len(), 1);
        agg.accept(report(1, 1, UnitOutcome::Flags(vec![flag("b1"), flag("b2")]))).unwrap();
        let headers: Vec<&str> = agg.flags().iter().map(|f| f.header.as_str()).collect();
        assert_eq!(headers, vec!["a", "b1", "b2", "c"]);
        assert!(agg.is_complete());
    }

    #[test]
    fn empty_flags_are_not_failures() {
        let mut agg = Aggregator::new(1, 1);
        agg.accept(report(1, 0, UnitOutcome::Flags(Vec::new()))).unwrap();
        let st = agg.state(Phase::Settled);
        assert!(st.flags.is_empty());
        assert!(!st.has_failures);
        assert!(!st.is_loading);
    }

    #[test]
    fn identical_reasons_coalesce_into_one_flag() {
        let mut agg = Aggregator::new(7, 4);
        for slot in 0..4 { agg.accept(report(7, slot, UnitOutcome::Failure("boom".into()))).unwrap(); }
        assert_eq!(agg.flags().len(), 1);
        assert_eq!(agg.flags()[0].severity, Severity::Error);
        assert_eq!(agg.flags()[0].body.as_deref(), Some("boom"));
    }

    #[test]
    fn distinct_reasons_accumulate_in_body() {
        let mut agg = Aggregator::new(1, 5);
        let reasons = ["x", "y", "x", "z", "y"];
        for (slot, r) in reasons.iter().enumerate() {
            agg.accept(report(1, slot, UnitOutcome::Failure((*r).into()))).unwrap();
        }
        assert_eq!(agg.flags().len(), 1);
        let body = agg.flags()[0].body.clone().unwrap();
        assert_eq!(body.split('\n').collect::<Vec<_>>(), vec!["x", "y", "z"]);
    }

    #[test]
    fn error_flag_position_is_fixed_once_created() {
        let mut agg = Aggregator::new(1, 3);
        agg.accept(report(1, 0, UnitOutcome::Flags(vec![flag("a")]))).unwrap();
        agg.accept(report(1, 1, UnitOutcome::Failure("r1".into()))).unwrap();
        agg.accept(report(1, 2, UnitOutcome::Flags(vec![flag("c")]))).unwrap();
        let headers: Vec<&str> = agg.flags().iter().map(|f| f.header.as_str()).collect();
        assert_eq!(headers, vec!["a", DEFAULT_FAILURE_HEADER, "c"]);
    }

    #[test]
    fn late_failure_appends_to_existing_error_flag() {
        let mut agg = Aggregator::new(1, 3);
        agg.accept(report(1, 0, UnitOutcome::Failure("first".into()))).unwrap();
        agg.accept(report(1, 1, UnitOutcome::Flags(vec![flag("b")]))).unwrap();
        agg.accept(report(1, 2, UnitOutcome::Failure("second".into()))).unwrap();
        assert_eq!(agg.flags().len(), 2);
        assert_eq!(agg.flags()[0].body.as_deref(), Some("first\nsecond"));
        assert_eq!(agg.flags()[1].header, "b");
    }

    #[test]
    fn rejects_stale_duplicate_and_unknown_reports() {
        let mut agg = Aggregator::new(2, 1);
        assert_eq!(agg.accept(report(1, 0, UnitOutcome::Flags(vec![flag("old")]))), Err(Rejected::StaleRun));
        assert_eq!(agg.accept(report(2, 5, UnitOutcome::Flags(vec![]))), Err(Rejected::UnknownSlot));
        agg.accept(report(2, 0, UnitOutcome::Flags(vec![flag("new")]))).unwrap();
        assert_eq!(agg.accept(report(2, 0, UnitOutcome::Failure("again".into()))), Err(Rejected::AlreadyReported));
        assert_eq!(agg.flags().len(), 1);
        assert!(!agg.has_failures());
        assert_eq!(agg.rejected(), 3);
    }

    #[test]
    fn fatal_state_has_notice_and_no_flags() {
        let st = fatal_state(3, Notice::error("catalog down"));
        assert!(st.flags.is_empty());
        assert!(!st.is_loading);
        assert_eq!(st.notice.as_ref().map(|n| n.kind), Some(NoticeKind::Error));
    }

    #[tokio::test]
    async fn handle_sees_published_snapshots() {
        let (mut publisher, mut handle) = state_channel();
        let agg = Aggregator::new(4, 0);
        publisher.publish(agg.state(Phase::Dispatching));
        let st = handle.changed().await.unwrap();
        assert_eq!(st.run_id, 4);
        assert!(st.is_loading);
        publisher.publish(agg.state(Phase::Settled));
        let settled = handle.wait_for(|s| s.phase == Phase::Settled).await.unwrap();
        assert!(!settled.is_loading);
        drop(publisher);
        assert!(handle.changed().await.is_none());
    }
}
