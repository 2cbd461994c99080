//! Explicit `unit_id -> callable` registry populated at startup.

#![forbid(unsafe_code)]

use std::sync::Arc;

use pennant_core::{FieldRule, FlagComputation, FlagDescriptor, SharedDataProvider, SharedPayload};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::builtin::RuleComputation;

#[derive(Default, Clone)]
pub struct UnitRegistry {
    computations: FxHashMap<String, Arc<dyn FlagComputation>>,
    providers: FxHashMap<String, Arc<dyn SharedDataProvider>>,
}

impl UnitRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register_computation(&mut self, unit_id: impl Into<String>, c: Arc<dyn FlagComputation>) -> &mut Self {
        let unit_id = unit_id.into();
        if self.computations.insert(unit_id.clone(), c).is_some() {
            warn!(unit = %unit_id, "registry: computation replaced");
        }
        self
    }

    pub fn register_provider(&mut self, unit_id: impl Into<String>, p: Arc<dyn SharedDataProvider>) -> &mut Self {
        let unit_id = unit_id.into();
        if self.providers.insert(unit_id.clone(), p).is_some() {
            warn!(unit = %unit_id, "registry: provider replaced");
        }
        self
    }

    /// Register a plain closure as a computation.
    pub fn register_fn<F>(&mut self, unit_id: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&SharedPayload) -> anyhow::Result<Option<Vec<FlagDescriptor>>> + Send + Sync + 'static,
    {
        self.register_computation(unit_id, Arc::new(FnComputation(f)))
    }

    /// Register declarative field rules, e.g. those declared in a catalog file.
    pub fn register_rules<'a>(&mut self, rules: impl IntoIterator<Item = &'a (String, FieldRule)>) -> &mut Self {
        for (unit_id, rule) in rules {
            debug!(unit = %unit_id, pointer = %rule.pointer, "registry: rule registered");
            self.register_computation(unit_id.clone(), Arc::new(RuleComputation::new(rule.clone())));
        }
        self
    }

    pub fn computation(&self, unit_id: &str) -> Option<Arc<dyn FlagComputation>> { self.computations.get(unit_id).cloned() }
    pub fn provider(&self, unit_id: &str) -> Option<Arc<dyn SharedDataProvider>> { self.providers.get(unit_id).cloned() }

    pub fn len(&self) -> usize { self.computations.len() + self.providers.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Adapter turning a synchronous closure into a [`FlagComputation`].
pub struct FnComputation<F>(pub F);

#[async_trait::async_trait]
impl<F> FlagComputation for FnComputation<F>
where
    F: Fn(&SharedPayload) -> anyhow::Result<Option<Vec<FlagDescriptor>>> + Send + Sync + 'static,
{
    async fn compute(&self, payload: &SharedPayload) -> anyhow::Result<Option<Vec<FlagDescriptor>>> { (self.0)(payload) }
}
