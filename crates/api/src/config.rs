//! Engine configuration read from `PENNANT_*` environment variables.

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use pennant_store::DEFAULT_FAILURE_HEADER;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Per-unit time limit. `None` waits indefinitely for every unit.
    pub unit_timeout_ms: Option<u64>,
    /// Capacity of the unit outcome channel.
    pub queue_cap: usize,
    /// Header of the coalesced error flag.
    pub failure_header: String,
    /// Overrides the per-kind notice display duration.
    pub notice_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { unit_timeout_ms: None, queue_cap: 256, failure_header: DEFAULT_FAILURE_HEADER.to_string(), notice_ms: None }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from an arbitrary key lookup; unparsable values fall back to defaults.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let unit_timeout_ms = get("PENNANT_UNIT_TIMEOUT_MS").and_then(|s| s.parse::<u64>().ok()).filter(|v| *v > 0);
        let queue_cap = get("PENNANT_QUEUE_CAP").and_then(|s| s.parse::<usize>().ok()).filter(|v| *v > 0).unwrap_or(d.queue_cap);
        let failure_header = get("PENNANT_FAILURE_HEADER").filter(|s| !s.trim().is_empty()).unwrap_or(d.failure_header);
        let notice_ms = get("PENNANT_NOTICE_MS").and_then(|s| s.parse::<u64>().ok());
        Self { unit_timeout_ms, queue_cap, failure_header, notice_ms }
    }

    pub fn unit_timeout(&self) -> Option<Duration> { self.unit_timeout_ms.map(Duration::from_millis) }

    pub fn with_unit_timeout_ms(mut self, ms: Option<u64>) -> Self {
        self.unit_timeout_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = EngineConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.unit_timeout(), None);
    }

    #[test]
    fn parses_values_and_ignores_garbage() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("PENNANT_UNIT_TIMEOUT_MS", "1500"),
            ("PENNANT_QUEUE_CAP", "nope"),
            ("PENNANT_FAILURE_HEADER", "Some flags failed"),
            ("PENNANT_NOTICE_MS", "900"),
        ]));
        assert_eq!(cfg.unit_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(cfg.queue_cap, 256);
        assert_eq!(cfg.failure_header, "Some flags failed");
        assert_eq!(cfg.notice_ms, Some(900));
    }

    #[test]
    fn zero_timeout_means_no_timeout() {
        let cfg = EngineConfig::from_lookup(lookup(&[("PENNANT_UNIT_TIMEOUT_MS", "0")]));
        assert_eq!(cfg.unit_timeout_ms, None);
    }
}
