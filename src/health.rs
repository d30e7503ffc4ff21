//! Extension health tracking.
//!
//! The manager reports every install/enable outcome here and asks for
//! remediation decisions. [`ThresholdHealthMonitor`] disables after a run of
//! consecutive failures and uninstalls after too many failures overall.

use crate::config::HealthConfig;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Outcome sink and remediation oracle
pub trait HealthMonitor: Send + Sync {
    fn record_success(&self, id: &str);
    fn record_failure(&self, id: &str, reason: &str);
    fn should_auto_disable(&self, id: &str) -> bool;
    fn should_auto_uninstall(&self, id: &str) -> bool;
    /// Forget everything recorded for `id`
    fn reset(&self, id: &str);
    /// Ids with an open failure streak
    fn unhealthy(&self) -> Vec<String>;
}

/// Per-extension counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthRecord {
    pub successes: u32,
    pub failures: u32,
    pub consecutive_failures: u32,
    pub last_failure: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Threshold-based [`HealthMonitor`]
pub struct ThresholdHealthMonitor {
    config: HealthConfig,
    records: Mutex<HashMap<String, HealthRecord>>,
}

impl ThresholdHealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the record for `id`
    pub fn record(&self, id: &str) -> Option<HealthRecord> {
        if let Ok(records) = self.records.lock() {
            return records.get(id).cloned();
        }
        None
    }

    fn with_record<T>(&self, id: &str, f: impl FnOnce(&HealthRecord) -> T) -> Option<T> {
        if let Ok(records) = self.records.lock() {
            return records.get(id).map(f);
        }
        None
    }
}

impl Default for ThresholdHealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl HealthMonitor for ThresholdHealthMonitor {
    fn record_success(&self, id: &str) {
        if let Ok(mut records) = self.records.lock() {
            let record = records.entry(id.to_string()).or_default();
            record.successes += 1;
            record.consecutive_failures = 0;
        }
    }

    fn record_failure(&self, id: &str, reason: &str) {
        if let Ok(mut records) = self.records.lock() {
            let record = records.entry(id.to_string()).or_default();
            record.failures += 1;
            record.consecutive_failures += 1;
            record.last_failure = Some(reason.to_string());
            record.last_failure_at = Some(Utc::now());
            debug!(
                id = %id,
                failures = record.failures,
                consecutive = record.consecutive_failures,
                "Recorded extension failure"
            );
        }
    }

    fn should_auto_disable(&self, id: &str) -> bool {
        let threshold = self.config.disable_after_failures;
        threshold > 0
            && self
                .with_record(id, |r| r.consecutive_failures >= threshold)
                .unwrap_or(false)
    }

    fn should_auto_uninstall(&self, id: &str) -> bool {
        let threshold = self.config.uninstall_after_failures;
        threshold > 0
            && self
                .with_record(id, |r| r.failures >= threshold)
                .unwrap_or(false)
    }

    fn reset(&self, id: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.remove(id);
        }
    }

    fn unhealthy(&self) -> Vec<String> {
        let mut ids: Vec<String> = match self.records.lock() {
            Ok(records) => records
                .iter()
                .filter(|(_, r)| r.consecutive_failures > 0)
                .map(|(id, _)| id.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }
}
