//! Retained snapshot payloads
//!
//! Pure builders for `metadata`, `status`, `state`, `cfg` and
//! `cfg/telemetry`, plus the per-component metadata and status. The only
//! impure piece is [`MetricsSampler`], which reads host metrics through
//! `sysinfo`.

use super::messages::{StatusPayload, StatusState};
use crate::storage::config_store::TelemetrySettings;
use crate::storage::registry::RegistryMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use sysinfo::{Disks, System};

/// Names of the host metrics sampled for `state` and telemetry
pub const METRIC_NAMES: [&str; 3] = ["cpu_percent", "memory_percent", "disk_percent"];

pub fn build_metadata(agent_id: &str, version: &str) -> Value {
    json!({
        "agent_id": agent_id,
        "version": version,
        "platform": std::env::consts::OS,
        "architecture": std::env::consts::ARCH,
        "config_schema": {
            "telemetry": {
                "enabled": "boolean",
                "metrics": "object<string, boolean>",
                "interval_s": "integer (min: 1)",
                "change_threshold_percent": "number (min: 0)",
            },
            "heartbeat_s": "integer (min: 5, max: 3600)",
            "log_level": "string (enum: DEBUG, INFO, WARNING, ERROR, CRITICAL)",
            "logs_enabled": "boolean",
        },
    })
}

/// Status with uptime derived from `connected_since` at call time
pub fn build_status(
    state: StatusState,
    connected_since: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> StatusPayload {
    let uptime_s = connected_since
        .map(|since| (now - since).num_seconds().max(0) as u64)
        .unwrap_or(0);
    StatusPayload {
        state,
        connected_since_ts: connected_since,
        uptime_s,
    }
}

/// One entry of `state.components`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ComponentSummary {
    pub component_id: String,
    pub version: String,
    pub enabled: bool,
    pub running: bool,
}

pub fn build_components_list(
    registry: &RegistryMap,
    running: &BTreeSet<String>,
) -> Vec<ComponentSummary> {
    registry
        .iter()
        .map(|(component_id, record)| ComponentSummary {
            component_id: component_id.clone(),
            version: record.version.clone(),
            enabled: record.enabled,
            running: running.contains(component_id),
        })
        .collect()
}

/// Host resource usage in percent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl SystemMetrics {
    pub fn get(&self, metric: &str) -> Option<f64> {
        match metric {
            "cpu_percent" => Some(self.cpu_percent),
            "memory_percent" => Some(self.memory_percent),
            "disk_percent" => Some(self.disk_percent),
            _ => None,
        }
    }
}

pub fn build_state(metrics: SystemMetrics, components: &[ComponentSummary]) -> Value {
    json!({
        "cpu_percent": metrics.cpu_percent,
        "memory_percent": metrics.memory_percent,
        "disk_percent": metrics.disk_percent,
        "components": components,
    })
}

/// Full cfg with the telemetry object completed from defaults
pub fn build_cfg(cfg: &Map<String, Value>) -> Value {
    let mut result = cfg.clone();
    let defaults = TelemetrySettings::default();
    let mut telemetry = match result.remove("telemetry") {
        Some(Value::Object(telemetry)) => telemetry,
        _ => Map::new(),
    };
    telemetry
        .entry("enabled")
        .or_insert(Value::Bool(defaults.enabled));
    telemetry
        .entry("metrics")
        .or_insert_with(|| Value::Object(Map::new()));
    telemetry
        .entry("interval_s")
        .or_insert(json!(defaults.interval_s));
    telemetry
        .entry("change_threshold_percent")
        .or_insert(json!(defaults.change_threshold_percent));
    result.insert("telemetry".to_string(), Value::Object(telemetry));
    Value::Object(result)
}

/// Effective telemetry settings, legacy flag applied
pub fn build_cfg_telemetry(cfg: &Map<String, Value>) -> Value {
    serde_json::to_value(TelemetrySettings::from_config(cfg)).unwrap_or_else(|_| json!({}))
}

pub fn build_component_metadata(
    component_id: &str,
    version: Option<&str>,
    capabilities: &[String],
    enabled: bool,
) -> Value {
    json!({
        "component_id": component_id,
        "version": version,
        "capabilities": capabilities,
        "enabled": enabled,
    })
}

pub fn build_component_status(running: bool) -> Value {
    json!({ "state": if running { "running" } else { "stopped" } })
}

/// Samples CPU, memory and root-disk usage
pub struct MetricsSampler {
    system: Mutex<System>,
}

impl std::fmt::Debug for MetricsSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsSampler").finish_non_exhaustive()
    }
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta, prime it so the first real sample has a baseline
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }

    pub fn sample(&self) -> SystemMetrics {
        let (cpu_percent, memory_percent) = {
            let mut system = match self.system.lock() {
                Ok(system) => system,
                Err(poisoned) => poisoned.into_inner(),
            };
            system.refresh_cpu_usage();
            system.refresh_memory();
            let total = system.total_memory();
            let memory = if total == 0 {
                0.0
            } else {
                system.used_memory() as f64 / total as f64 * 100.0
            };
            (f64::from(system.global_cpu_usage()), memory)
        };

        SystemMetrics {
            cpu_percent: round1(cpu_percent),
            memory_percent: round1(memory_percent),
            disk_percent: round1(root_disk_percent()),
        }
    }
}

fn root_disk_percent() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| {
            let total = disk.total_space();
            if total == 0 {
                0.0
            } else {
                (total - disk.available_space().min(total)) as f64 / total as f64 * 100.0
            }
        })
        .unwrap_or(0.0)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::registry::tests::sample_record;
    use chrono::Duration;

    #[test]
    fn test_metadata_contract_keys() {
        let metadata = build_metadata("agent_1", "1.0.0");
        let obj = metadata.as_object().unwrap();
        for key in ["agent_id", "version", "platform", "architecture", "config_schema"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert_eq!(obj["agent_id"], "agent_1");
    }

    #[test]
    fn test_status_uptime_derived_from_connected_since() {
        let now = Utc::now();
        let since = now - Duration::seconds(90);
        let status = build_status(StatusState::Online, Some(since), now);
        assert_eq!(status.uptime_s, 90);
        assert_eq!(status.connected_since_ts, Some(since));

        let never = build_status(StatusState::Offline, None, now);
        assert_eq!(never.uptime_s, 0);
    }

    #[test]
    fn test_status_uptime_never_negative() {
        let now = Utc::now();
        let status = build_status(StatusState::Online, Some(now + Duration::seconds(5)), now);
        assert_eq!(status.uptime_s, 0);
    }

    #[test]
    fn test_components_list_marks_running() {
        let mut registry = RegistryMap::new();
        registry.insert("cpu".to_string(), sample_record("1.0.0"));
        let mut disabled = sample_record("2.0.0");
        disabled.enabled = false;
        registry.insert("gpio".to_string(), disabled);

        let running = BTreeSet::from(["cpu".to_string()]);
        let list = build_components_list(&registry, &running);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].component_id, "cpu");
        assert!(list[0].running);
        assert!(list[0].enabled);
        assert_eq!(list[1].version, "2.0.0");
        assert!(!list[1].running);
        assert!(!list[1].enabled);
    }

    #[test]
    fn test_state_shape() {
        let state = build_state(
            SystemMetrics {
                cpu_percent: 1.5,
                memory_percent: 20.0,
                disk_percent: 30.0,
            },
            &[],
        );
        assert_eq!(state["cpu_percent"], 1.5);
        assert_eq!(state["components"], json!([]));
    }

    #[test]
    fn test_cfg_fills_telemetry_defaults() {
        let cfg = json!({"heartbeat_s": 30, "telemetry": {"enabled": true}});
        let built = build_cfg(cfg.as_object().unwrap());
        assert_eq!(built["heartbeat_s"], 30);
        assert_eq!(
            built["telemetry"],
            json!({"enabled": true, "metrics": {}, "interval_s": 2, "change_threshold_percent": 2.0})
        );

        let empty = build_cfg(&Map::new());
        assert_eq!(empty["telemetry"]["enabled"], false);
    }

    #[test]
    fn test_cfg_telemetry_respects_legacy_flag() {
        let cfg = json!({"telemetry_enabled": true});
        let telemetry = build_cfg_telemetry(cfg.as_object().unwrap());
        assert_eq!(telemetry["enabled"], true);
        assert_eq!(telemetry["interval_s"], 2);
    }

    #[test]
    fn test_component_payloads() {
        let metadata =
            build_component_metadata("dummy", Some("0.1.0"), &["reset".to_string()], true);
        assert_eq!(metadata["capabilities"], json!(["reset"]));
        assert_eq!(build_component_status(true)["state"], "running");
        assert_eq!(build_component_status(false)["state"], "stopped");
    }

    #[test]
    fn test_system_metrics_lookup() {
        let metrics = SystemMetrics {
            cpu_percent: 1.0,
            memory_percent: 2.0,
            disk_percent: 3.0,
        };
        assert_eq!(metrics.get("memory_percent"), Some(2.0));
        assert_eq!(metrics.get("gpu_percent"), None);
    }

    #[test]
    fn test_sampler_produces_percentages() {
        let sample = MetricsSampler::new().sample();
        for value in [sample.cpu_percent, sample.memory_percent, sample.disk_percent] {
            assert!((0.0..=100.0).contains(&value), "out of range: {value}");
        }
    }
}
