//! Telemetry publish gate
//!
//! Pure decision logic: given the effective settings, the last published
//! value of each metric and a fresh sample, decide what goes out. The
//! scheduler owns sampling and publishing.

use crate::protocol::snapshots::{SystemMetrics, METRIC_NAMES};
use crate::storage::TelemetrySettings;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// `|value - last| / |last| * 100 > threshold`. Any move away from zero counts.
pub fn exceeds_threshold(last: f64, value: f64, threshold_percent: f64) -> bool {
    if last == 0.0 {
        return value != 0.0;
    }
    (value - last).abs() / last.abs() * 100.0 > threshold_percent
}

#[derive(Debug, Clone, Copy)]
struct LastPublish {
    value: f64,
    at: Instant,
}

/// Last published value per metric
#[derive(Debug, Default)]
pub struct TelemetryGate {
    last: HashMap<&'static str, LastPublish>,
}

impl TelemetryGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_publish(
        &self,
        settings: &TelemetrySettings,
        metric: &str,
        value: f64,
        now: Instant,
    ) -> bool {
        if !settings.metric_enabled(metric) {
            return false;
        }
        let Some(last) = self.last.get(metric) else {
            return true;
        };
        let interval = Duration::from_secs(settings.interval_s);
        now.saturating_duration_since(last.at) >= interval
            || exceeds_threshold(last.value, value, settings.change_threshold_percent)
    }

    /// Metrics due for publishing, recorded as published at `now`
    pub fn select(
        &mut self,
        settings: &TelemetrySettings,
        metrics: &SystemMetrics,
        now: Instant,
    ) -> Vec<(&'static str, f64)> {
        let mut due = Vec::new();
        for metric in METRIC_NAMES {
            let Some(value) = metrics.get(metric) else {
                continue;
            };
            if self.should_publish(settings, metric, value, now) {
                self.last.insert(metric, LastPublish { value, at: now });
                due.push((metric, value));
            }
        }
        due
    }

    pub fn last_value(&self, metric: &str) -> Option<f64> {
        self.last.get(metric).map(|last| last.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn settings(threshold: f64) -> TelemetrySettings {
        TelemetrySettings {
            enabled: true,
            metrics: BTreeMap::new(),
            interval_s: 60,
            change_threshold_percent: threshold,
        }
    }

    fn metrics(cpu: f64) -> SystemMetrics {
        SystemMetrics {
            cpu_percent: cpu,
            memory_percent: 50.0,
            disk_percent: 10.0,
        }
    }

    #[test]
    fn test_threshold_examples() {
        assert!(!exceeds_threshold(100.0, 105.0, 10.0));
        assert!(exceeds_threshold(100.0, 115.0, 10.0));
        assert!(exceeds_threshold(100.0, 85.0, 10.0));
        assert!(exceeds_threshold(0.0, 3.0, 10.0));
        assert!(!exceeds_threshold(0.0, 0.0, 10.0));
        assert!(!exceeds_threshold(50.0, 50.0, 0.0));
    }

    #[test]
    fn test_first_sample_always_publishes() {
        let mut gate = TelemetryGate::new();
        let due = gate.select(&settings(10.0), &metrics(100.0), Instant::now());
        assert_eq!(due.len(), 3);
        assert_eq!(gate.last_value("cpu_percent"), Some(100.0));
    }

    #[test]
    fn test_suppression_within_interval() {
        let mut gate = TelemetryGate::new();
        let start = Instant::now();
        let settings = settings(10.0);
        gate.select(&settings, &metrics(100.0), start);

        let soon = start + Duration::from_secs(1);
        let due = gate.select(&settings, &metrics(105.0), soon);
        assert!(due.is_empty());

        let due = gate.select(&settings, &metrics(115.0), soon);
        assert_eq!(due, vec![("cpu_percent", 115.0)]);
    }

    #[test]
    fn test_interval_elapsed_publishes_unchanged_values() {
        let mut gate = TelemetryGate::new();
        let start = Instant::now();
        let settings = settings(10.0);
        gate.select(&settings, &metrics(100.0), start);
        let later = start + Duration::from_secs(60);
        assert_eq!(gate.select(&settings, &metrics(100.0), later).len(), 3);
    }

    #[test]
    fn test_disabled_metrics_never_publish() {
        let mut gate = TelemetryGate::new();
        let mut settings = settings(10.0);
        settings.metrics.insert("memory_percent".to_string(), false);
        let due = gate.select(&settings, &metrics(1.0), Instant::now());
        let names: Vec<&str> = due.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["cpu_percent", "disk_percent"]);

        settings.enabled = false;
        let mut gate = TelemetryGate::new();
        assert!(gate.select(&settings, &metrics(1.0), Instant::now()).is_empty());
    }
}
