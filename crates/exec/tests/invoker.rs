#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use pennant_core::{
    ComputationUnitDescriptor, FlagComputation, FlagDescriptor, PennantError, Severity, SharedDataProvider,
    SharedPayload, UnitOutcome,
};
use pennant_exec::{resolve_shared_payload, Invoker, UnitRegistry};

fn unit(id: &str) -> ComputationUnitDescriptor { ComputationUnitDescriptor::computation("Account", id, 0) }

fn payload() -> Arc<SharedPayload> { Arc::new(SharedPayload::fallback("001")) }

struct Sleepy(Duration);

#[async_trait::async_trait]
impl FlagComputation for Sleepy {
    async fn compute(&self, _p: &SharedPayload) -> anyhow::Result<Option<Vec<FlagDescriptor>>> {
        tokio::time::sleep(self.0).await;
        Ok(Some(vec![FlagDescriptor::new(Severity::Normal, "late")]))
    }
}

struct CountingProvider {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait::async_trait]
impl SharedDataProvider for CountingProvider {
    async fn fetch(&self, record_id: &str) -> anyhow::Result<SharedPayload> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail { return Err(anyhow!("store offline")); }
        Ok(SharedPayload::new(record_id, serde_json::json!({ "id": record_id, "tier": "gold" })))
    }
}

struct PanickingProvider;

#[async_trait::async_trait]
impl SharedDataProvider for PanickingProvider {
    async fn fetch(&self, _record_id: &str) -> anyhow::Result<SharedPayload> { panic!("provider exploded") }
}

fn registry() -> UnitRegistry {
    let mut reg = UnitRegistry::new();
    reg.register_fn("ok", |p: &SharedPayload| {
        Ok(Some(vec![FlagDescriptor::new(Severity::Warning, format!("record {}", p.record_id))]))
    })
    .register_fn("none", |_p: &SharedPayload| Ok(None))
    .register_fn("err", |_p: &SharedPayload| Err(anyhow!("quota exceeded")))
    .register_fn("panic", |_p: &SharedPayload| -> anyhow::Result<Option<Vec<FlagDescriptor>>> { panic!("kaboom") })
    .register_fn("blank", |_p: &SharedPayload| Ok(Some(vec![FlagDescriptor::new(Severity::Normal, " ")])))
    .register_computation("slow", Arc::new(Sleepy(Duration::from_secs(30))));
    reg
}

#[tokio::test]
async fn successful_unit_returns_flags() {
    let inv = Invoker::new(Arc::new(registry()));
    let out = inv.invoke(&unit("ok"), payload()).await;
    assert_eq!(out, UnitOutcome::Flags(vec![FlagDescriptor::new(Severity::Warning, "record 001")]));
}

#[tokio::test]
async fn absent_result_is_empty_flags_not_failure() {
    let inv = Invoker::new(Arc::new(registry()));
    assert_eq!(inv.invoke(&unit("none"), payload()).await, UnitOutcome::Flags(Vec::new()));
}

#[tokio::test]
async fn errors_panics_and_malformed_results_become_failures() {
    let inv = Invoker::new(Arc::new(registry()));
    assert_eq!(inv.invoke(&unit("err"), payload()).await, UnitOutcome::Failure("quota exceeded".into()));
    match inv.invoke(&unit("panic"), payload()).await {
        UnitOutcome::Failure(r) => assert!(r.contains("kaboom"), "got {}", r),
        other => panic!("expected failure, got {:?}", other),
    }
    match inv.invoke(&unit("blank"), payload()).await {
        UnitOutcome::Failure(r) => assert!(r.starts_with("malformed result")),
        other => panic!("expected failure, got {:?}", other),
    }
    // the invoker keeps working after a panicking sibling
    assert!(!inv.invoke(&unit("ok"), payload()).await.is_failure());
}

#[tokio::test]
async fn unregistered_unit_is_a_failure() {
    let inv = Invoker::new(Arc::new(registry()));
    assert_eq!(
        inv.invoke(&unit("ghost"), payload()).await,
        UnitOutcome::Failure("no computation registered for ghost".into())
    );
}

#[tokio::test(start_paused = true)]
async fn timeout_turns_slow_unit_into_failure() {
    let inv = Invoker::new(Arc::new(registry())).with_timeout(Some(Duration::from_millis(250)));
    assert_eq!(inv.invoke(&unit("slow"), payload()).await, UnitOutcome::Failure("timed out after 250ms".into()));
}

#[tokio::test(start_paused = true)]
async fn without_timeout_slow_unit_eventually_reports() {
    let inv = Invoker::new(Arc::new(registry()));
    let out = inv.invoke(&unit("slow"), payload()).await;
    assert_eq!(out, UnitOutcome::Flags(vec![FlagDescriptor::new(Severity::Normal, "late")]));
}

#[tokio::test]
async fn fallback_payload_when_no_provider_configured() {
    let p = resolve_shared_payload(&UnitRegistry::new(), "001", None).await.unwrap();
    assert!(p.is_fallback);
    assert_eq!(p.data, serde_json::json!({ "id": "001" }));
}

#[tokio::test]
async fn provider_is_called_once_and_failures_are_fatal() {
    let ok = Arc::new(CountingProvider { calls: AtomicUsize::new(0), fail: false });
    let bad = Arc::new(CountingProvider { calls: AtomicUsize::new(0), fail: true });
    let mut reg = UnitRegistry::new();
    reg.register_provider("good", ok.clone()).register_provider("bad", bad.clone());

    let good = ComputationUnitDescriptor::provider("Account", "good");
    let p = resolve_shared_payload(&reg, "001", Some(&good)).await.unwrap();
    assert_eq!(p.data["tier"], "gold");
    assert_eq!(ok.calls.load(Ordering::SeqCst), 1);

    let bad_desc = ComputationUnitDescriptor::provider("Account", "bad");
    let err = resolve_shared_payload(&reg, "001", Some(&bad_desc)).await.unwrap_err();
    assert_eq!(err, PennantError::Provider("store offline".into()));
    assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_or_panicking_provider_is_a_provider_error() {
    let mut reg = UnitRegistry::new();
    reg.register_provider("boom", Arc::new(PanickingProvider));
    let missing = ComputationUnitDescriptor::provider("Account", "absent");
    assert!(matches!(
        resolve_shared_payload(&reg, "001", Some(&missing)).await,
        Err(PennantError::Provider(m)) if m.contains("no provider registered")
    ));
    let boom = ComputationUnitDescriptor::provider("Account", "boom");
    assert!(matches!(
        resolve_shared_payload(&reg, "001", Some(&boom)).await,
        Err(PennantError::Provider(m)) if m.contains("provider exploded")
    ));
}
