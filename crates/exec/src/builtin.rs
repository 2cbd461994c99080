//! Built-in units: declarative field rules and a JSON file provider.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pennant_core::{FieldRule, FlagComputation, FlagDescriptor, SharedDataProvider, SharedPayload};
use rustc_hash::FxHashMap;
use tracing::info;

pub struct RuleComputation {
    rule: FieldRule,
}

impl RuleComputation {
    pub fn new(rule: FieldRule) -> Self { Self { rule } }
}

#[async_trait::async_trait]
impl FlagComputation for RuleComputation {
    async fn compute(&self, payload: &SharedPayload) -> Result<Option<Vec<FlagDescriptor>>> {
        Ok(self.rule.evaluate(&payload.data)?.map(|f| vec![f]))
    }
}

/// Records keyed by id, loaded from a JSON object `{ "<id>": { ... }, ... }`.
#[derive(Debug, Clone, Default)]
pub struct JsonFileProvider {
    records: FxHashMap<String, serde_json::Value>,
}

impl JsonFileProvider {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading records {}", path.display()))?;
        let me = Self::from_json_str(&text).with_context(|| format!("parsing records {}", path.display()))?;
        info!(path = %path.display(), records = me.records.len(), "provider: records loaded");
        Ok(me)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let v: serde_json::Value = serde_json::from_str(s)?;
        let obj = v.as_object().ok_or_else(|| anyhow!("records file must be a JSON object keyed by record id"))?;
        Ok(Self { records: obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect() })
    }

    pub fn insert(&mut self, record_id: impl Into<String>, data: serde_json::Value) {
        self.records.insert(record_id.into(), data);
    }
}

#[async_trait::async_trait]
impl SharedDataProvider for JsonFileProvider {
    async fn fetch(&self, record_id: &str) -> Result<SharedPayload> {
        let data = self.records.get(record_id).cloned().ok_or_else(|| anyhow!("record {} not found", record_id))?;
        Ok(SharedPayload::new(record_id, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pennant_core::Severity;

    #[tokio::test]
    async fn rule_computation_yields_single_flag_or_none() {
        let rule = FieldRule {
            pointer: "/vip".into(),
            equals: Some(serde_json::Value::Bool(true)),
            severity: Severity::Success,
            header: "VIP".into(),
            body: None,
            actions: Vec::new(),
        };
        let c = RuleComputation::new(rule);
        let hit = c.compute(&SharedPayload::new("1", serde_json::json!({ "vip": true }))).await.unwrap();
        assert_eq!(hit.unwrap()[0].header, "VIP");
        let miss = c.compute(&SharedPayload::new("2", serde_json::json!({ "vip": false }))).await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn json_provider_fetches_by_id() {
        let p = JsonFileProvider::from_json_str(r#"{ "001": { "name": "Acme" } }"#).unwrap();
        let got = p.fetch("001").await.unwrap();
        assert_eq!(got.data["name"], "Acme");
        assert!(!got.is_fallback);
        assert!(p.fetch("002").await.is_err());
        assert!(JsonFileProvider::from_json_str("[1,2]").is_err());
    }
}
