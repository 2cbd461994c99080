//! Pennant catalog: resolves which computation units apply to an object type.
//!
//! The filter drops inactive units and units whose required permission the
//! caller does not hold, then orders the rest by `(order, unit_id)`. Excluded
//! units are never handed to the invoker.

#![forbid(unsafe_code)]

use std::time::Instant;

use pennant_core::{
    AuthorizationContext, ComputationUnitDescriptor, MetadataCatalog, PennantError, PennantResult, UnitKind,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

pub mod file;

pub use file::{CatalogEntry, CatalogFile, FileCatalog};

/// Output of the catalog filter: the optional provider plus ordered computations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedUnits {
    pub provider: Option<ComputationUnitDescriptor>,
    pub units: Vec<ComputationUnitDescriptor>,
}

impl ResolvedUnits {
    pub fn unit_ids(&self) -> Vec<&str> { self.units.iter().map(|u| u.unit_id.as_str()).collect() }
}

/// Why a descriptor did not make it into the resolved set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    OtherObjectType,
    Inactive,
    /// Not an error: the caller lacks the permission.
    PermissionDenied(String),
    DuplicateUnitId,
    ExtraProvider,
}

/// Pure filter over an already fetched descriptor list.
pub fn filter_units(
    object_type: &str,
    descriptors: Vec<ComputationUnitDescriptor>,
    auth: &dyn AuthorizationContext,
) -> (ResolvedUnits, Vec<(String, Exclusion)>) {
    let mut excluded: Vec<(String, Exclusion)> = Vec::new();
    let mut kept: Vec<ComputationUnitDescriptor> = Vec::with_capacity(descriptors.len());
    for d in descriptors {
        if d.object_type != object_type {
            excluded.push((d.unit_id, Exclusion::OtherObjectType));
            continue;
        }
        if !d.is_active {
            excluded.push((d.unit_id, Exclusion::Inactive));
            continue;
        }
        if let Some(perm) = d.required_permission.as_deref() {
            if !auth.has_permission(perm) {
                let perm = perm.to_string();
                excluded.push((d.unit_id, Exclusion::PermissionDenied(perm)));
                continue;
            }
        }
        kept.push(d);
    }
    kept.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let mut resolved = ResolvedUnits::default();
    let mut seen: FxHashSet<String> = FxHashSet::default();
    for d in kept {
        match d.kind {
            UnitKind::SharedDataProvider => {
                if resolved.provider.is_some() {
                    warn!(object_type, unit = %d.unit_id, "catalog: more than one active provider; keeping the first");
                    excluded.push((d.unit_id, Exclusion::ExtraProvider));
                } else {
                    resolved.provider = Some(d);
                }
            }
            UnitKind::FlagComputation => {
                if !seen.insert(d.unit_id.clone()) {
                    warn!(object_type, unit = %d.unit_id, "catalog: duplicate unit id; keeping the first");
                    excluded.push((d.unit_id, Exclusion::DuplicateUnitId));
                    continue;
                }
                resolved.units.push(d);
            }
        }
    }
    (resolved, excluded)
}

/// Fetch descriptors for `object_type` and apply the filter.
/// A lookup failure surfaces as `CatalogUnavailable`.
pub async fn resolve_units(
    catalog: &dyn MetadataCatalog,
    object_type: &str,
    auth: &dyn AuthorizationContext,
) -> PennantResult<ResolvedUnits> {
    let t0 = Instant::now();
    let descriptors = catalog.lookup(object_type).await.map_err(|e| {
        warn!(object_type, error = %e, "catalog: lookup failed");
        PennantError::CatalogUnavailable(e.to_string())
    })?;
    let total = descriptors.len();
    let (resolved, excluded) = filter_units(object_type, descriptors, auth);
    for (unit, why) in &excluded {
        debug!(object_type, unit = %unit, reason = ?why, "catalog: unit excluded");
    }
    metrics::histogram!("pennant_catalog_resolve_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(
        object_type,
        total,
        eligible = resolved.units.len(),
        provider = %resolved.provider.as_ref().map(|p| p.unit_id.as_str()).unwrap_or("-"),
        took_ms = %t0.elapsed().as_millis(),
        "catalog: resolved"
    );
    Ok(resolved)
}

/// Catalog held in memory, keyed by object type.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    by_type: FxHashMap<String, Vec<ComputationUnitDescriptor>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self { Self::default() }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ComputationUnitDescriptor>) -> Self {
        let mut me = Self::new();
        for d in descriptors { me.insert(d); }
        me
    }

    pub fn insert(&mut self, d: ComputationUnitDescriptor) {
        self.by_type.entry(d.object_type.clone()).or_default().push(d);
    }

    pub fn object_types(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.by_type.keys().map(|s| s.as_str()).collect();
        v.sort_unstable();
        v
    }
}

#[async_trait::async_trait]
impl MetadataCatalog for InMemoryCatalog {
    async fn lookup(&self, object_type: &str) -> anyhow::Result<Vec<ComputationUnitDescriptor>> {
        Ok(self.by_type.get(object_type).cloned().unwrap_or_default())
    }
}

/// Static set of held permission names.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    held: FxHashSet<String>,
}

impl PermissionSet {
    pub fn new<I, S>(perms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { held: perms.into_iter().map(Into::into).collect() }
    }

    pub fn grant(&mut self, perm: impl Into<String>) { self.held.insert(perm.into()); }
}

impl AuthorizationContext for PermissionSet {
    fn has_permission(&self, name: &str) -> bool { self.held.contains(name) }
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthorizationContext for AllowAll {
    fn has_permission(&self, _name: &str) -> bool { true }
}
