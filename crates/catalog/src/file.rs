//! File-backed catalog (YAML or JSON) with optional declarative field rules.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pennant_core::{ComputationUnitDescriptor, FieldRule, MetadataCatalog, UnitKind};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::InMemoryCatalog;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub descriptor: ComputationUnitDescriptor,
    /// Built-in computation for this unit; only valid on flag computations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<FieldRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogFile {
    #[serde(default)]
    pub units: Vec<CatalogEntry>,
}

impl CatalogFile {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let me: Self = serde_yaml::from_str(s).context("parsing catalog YAML")?;
        me.validate()?;
        Ok(me)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let me: Self = serde_json::from_str(s).context("parsing catalog JSON")?;
        me.validate()?;
        Ok(me)
    }

    /// Rules are registered by unit id, so a unit id carrying a rule must be
    /// unique across the whole file.
    fn validate(&self) -> Result<()> {
        let mut rule_owners: FxHashMap<&str, &str> = FxHashMap::default();
        for e in &self.units {
            let d = &e.descriptor;
            if d.object_type.trim().is_empty() { return Err(anyhow!("unit {:?}: object_type is empty", d.unit_id)); }
            if d.unit_id.trim().is_empty() { return Err(anyhow!("unit with empty unit_id for {}", d.object_type)); }
            if let Some(rule) = &e.rule {
                if d.kind != UnitKind::FlagComputation {
                    return Err(anyhow!("unit {}: rules are only allowed on flag computations", d.unit_id));
                }
                rule.validate().with_context(|| format!("unit {}", d.unit_id))?;
                if let Some(prev) = rule_owners.insert(d.unit_id.as_str(), d.object_type.as_str()) {
                    return Err(anyhow!("unit {} has rules for both {} and {}", d.unit_id, prev, d.object_type));
                }
            }
        }
        Ok(())
    }
}

/// Catalog loaded once from disk.
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    inner: InMemoryCatalog,
    rules: Vec<(String, FieldRule)>,
    providers: Vec<String>,
}

impl FileCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading catalog {}", path.display()))?;
        let is_json = path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("json")).unwrap_or(false);
        let file = if is_json { CatalogFile::from_json_str(&text)? } else { CatalogFile::from_yaml_str(&text)? };
        let me = Self::from_file(file);
        info!(path = %path.display(), object_types = me.inner.object_types().len(), rules = me.rules.len(), "catalog: loaded file");
        Ok(me)
    }

    pub fn from_file(file: CatalogFile) -> Self {
        let mut inner = InMemoryCatalog::new();
        let mut rules = Vec::new();
        let mut providers: Vec<String> = Vec::new();
        for e in file.units {
            if let Some(rule) = e.rule { rules.push((e.descriptor.unit_id.clone(), rule)); }
            if e.descriptor.kind == UnitKind::SharedDataProvider && !providers.contains(&e.descriptor.unit_id) {
                providers.push(e.descriptor.unit_id.clone());
            }
            inner.insert(e.descriptor);
        }
        Self { inner, rules, providers }
    }

    /// Unit ids of every shared data provider declared in the file.
    pub fn provider_ids(&self) -> &[String] { &self.providers }

    /// `(unit_id, rule)` pairs declared in the file.
    pub fn rules(&self) -> &[(String, FieldRule)] { &self.rules }

    pub fn object_types(&self) -> Vec<&str> { self.inner.object_types() }
}

#[async_trait::async_trait]
impl MetadataCatalog for FileCatalog {
    async fn lookup(&self, object_type: &str) -> anyhow::Result<Vec<ComputationUnitDescriptor>> {
        self.inner.lookup(object_type).await
    }
}
