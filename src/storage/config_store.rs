//! Runtime configuration store
//!
//! A whitelisted JSON object persisted at `<base>/data/core_config.json`.
//! Reads are served from an in-memory cache; writes validate the merged
//! result, persist it atomically under the file lock, then refresh the cache.

use super::atomic::{lock_path_for, quarantine, write_json_atomic, FileLock};
use crate::protocol::messages::{optional_str, CommandResult};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{info, warn};

pub const MIN_HEARTBEAT_S: i64 = 5;
pub const MAX_HEARTBEAT_S: i64 = 3600;
pub const LOG_LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];
pub const TELEMETRY_METRICS: [&str; 3] = ["cpu_percent", "memory_percent", "disk_percent"];

const TELEMETRY_KEYS: [&str; 4] = ["enabled", "metrics", "interval_s", "change_threshold_percent"];
const DEFAULT_TELEMETRY_INTERVAL_S: u64 = 2;
const DEFAULT_CHANGE_THRESHOLD_PERCENT: f64 = 2.0;

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("config I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config task failed: {0}")]
    TaskFailed(String),
}

/// Validate a complete config object against the whitelist
pub fn validate(cfg: &Map<String, Value>) -> Result<(), String> {
    for (key, value) in cfg {
        match key.as_str() {
            "heartbeat_s" => {
                let secs = value
                    .as_i64()
                    .filter(|_| value.is_i64() || value.is_u64())
                    .ok_or_else(|| "heartbeat_s must be an integer".to_string())?;
                if !(MIN_HEARTBEAT_S..=MAX_HEARTBEAT_S).contains(&secs) {
                    return Err(format!(
                        "heartbeat_s must be between {MIN_HEARTBEAT_S} and {MAX_HEARTBEAT_S}"
                    ));
                }
            }
            "log_level" => {
                let level = value
                    .as_str()
                    .ok_or_else(|| "log_level must be a string".to_string())?;
                if !LOG_LEVELS.contains(&level) {
                    return Err(format!("log_level must be one of {}", LOG_LEVELS.join(", ")));
                }
            }
            "telemetry_enabled" | "logs_enabled" => {
                if !value.is_boolean() {
                    return Err(format!("{key} must be a boolean"));
                }
            }
            "telemetry" => validate_telemetry(value)?,
            other => return Err(format!("unknown config key: {other}")),
        }
    }
    Ok(())
}

fn validate_telemetry(value: &Value) -> Result<(), String> {
    let telemetry = value
        .as_object()
        .ok_or_else(|| "telemetry must be an object".to_string())?;
    for (key, value) in telemetry {
        match key.as_str() {
            "enabled" => {
                if !value.is_boolean() {
                    return Err("telemetry.enabled must be a boolean".to_string());
                }
            }
            "metrics" => {
                let metrics = value
                    .as_object()
                    .ok_or_else(|| "telemetry.metrics must be an object".to_string())?;
                for (metric, flag) in metrics {
                    if !TELEMETRY_METRICS.contains(&metric.as_str()) {
                        return Err(format!("unknown telemetry metric: {metric}"));
                    }
                    if !flag.is_boolean() {
                        return Err(format!("telemetry.metrics.{metric} must be a boolean"));
                    }
                }
            }
            "interval_s" => {
                let ok = (value.is_u64() || value.is_i64())
                    && value.as_i64().is_some_and(|secs| secs >= 1);
                if !ok {
                    return Err("telemetry.interval_s must be an integer >= 1".to_string());
                }
            }
            "change_threshold_percent" => {
                if !value.as_f64().is_some_and(|pct| pct >= 0.0) {
                    return Err("telemetry.change_threshold_percent must be a number >= 0".to_string());
                }
            }
            other => {
                return Err(format!(
                    "unknown telemetry key: {other} (allowed: {})",
                    TELEMETRY_KEYS.join(", ")
                ))
            }
        }
    }
    Ok(())
}

/// Merge `update` into `base`; the `telemetry` object merges one level deep
pub fn merge(base: &Map<String, Value>, update: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in update {
        match (key.as_str(), merged.get_mut(key), value) {
            ("telemetry", Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (k, v) in incoming {
                    existing.insert(k.clone(), v.clone());
                }
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Typed view of the telemetry settings with defaults filled in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub metrics: BTreeMap<String, bool>,
    pub interval_s: u64,
    pub change_threshold_percent: f64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            metrics: BTreeMap::new(),
            interval_s: DEFAULT_TELEMETRY_INTERVAL_S,
            change_threshold_percent: DEFAULT_CHANGE_THRESHOLD_PERCENT,
        }
    }
}

impl TelemetrySettings {
    pub fn from_config(cfg: &Map<String, Value>) -> Self {
        let mut settings = Self {
            enabled: cfg
                .get("telemetry_enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ..Self::default()
        };
        let Some(telemetry) = cfg.get("telemetry").and_then(Value::as_object) else {
            return settings;
        };
        if let Some(enabled) = telemetry.get("enabled").and_then(Value::as_bool) {
            settings.enabled = enabled;
        }
        if let Some(metrics) = telemetry.get("metrics").and_then(Value::as_object) {
            settings.metrics = metrics
                .iter()
                .filter_map(|(k, v)| v.as_bool().map(|b| (k.clone(), b)))
                .collect();
        }
        if let Some(interval) = telemetry.get("interval_s").and_then(Value::as_u64) {
            settings.interval_s = interval.max(1);
        }
        if let Some(pct) = telemetry
            .get("change_threshold_percent")
            .and_then(Value::as_f64)
        {
            settings.change_threshold_percent = pct.max(0.0);
        }
        settings
    }

    /// A metric missing from `metrics` follows the global switch
    pub fn metric_enabled(&self, metric: &str) -> bool {
        self.enabled && self.metrics.get(metric).copied().unwrap_or(true)
    }
}

/// Outcome of a `cfg/set` request
#[derive(Debug, Clone)]
pub struct ConfigSetOutcome {
    /// Config in effect after the request (unchanged on failure)
    pub config: Map<String, Value>,
    pub result: CommandResult,
    pub changed: bool,
}

/// Persistent runtime config with an in-memory cache
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    lock_path: PathBuf,
    cache: RwLock<Option<Map<String, Value>>>,
    apply_guard: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self {
            path,
            lock_path,
            cache: RwLock::new(None),
            apply_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ConfigStoreError {
        ConfigStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Load from disk and refresh the cache. Bad content falls back to defaults.
    pub fn load(&self) -> Result<Map<String, Value>, ConfigStoreError> {
        let cfg = self.read_from_disk()?;
        self.set_cache(cfg.clone());
        Ok(cfg)
    }

    fn read_from_disk(&self) -> Result<Map<String, Value>, ConfigStoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "Config file not found, using defaults");
                return Ok(Map::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let cfg = match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(cfg)) => cfg,
            Ok(_) | Err(_) => {
                match quarantine(&self.path) {
                    Ok(moved) => warn!(
                        path = %self.path.display(),
                        quarantined = %moved.display(),
                        "Config file corrupt, moved aside and using defaults"
                    ),
                    Err(e) => warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Config file corrupt and could not be moved aside, using defaults"
                    ),
                }
                return Ok(Map::new());
            }
        };

        if let Err(reason) = validate(&cfg) {
            warn!(path = %self.path.display(), reason = %reason, "Config failed validation, using defaults");
            return Ok(Map::new());
        }
        Ok(cfg)
    }

    fn set_cache(&self, cfg: Map<String, Value>) {
        match self.cache.write() {
            Ok(mut cache) => *cache = Some(cfg),
            Err(poisoned) => *poisoned.into_inner() = Some(cfg),
        }
    }

    /// Cached config, loading it on first use
    pub fn cached(&self) -> Map<String, Value> {
        let cached = match self.cache.read() {
            Ok(cache) => cache.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(cfg) = cached {
            return cfg;
        }
        self.load().unwrap_or_else(|e| {
            warn!(error = %e, "Config load failed, using defaults");
            Map::new()
        })
    }

    /// Validate and atomically persist a complete config
    pub fn save(&self, cfg: &Map<String, Value>) -> Result<(), ConfigStoreError> {
        validate(cfg).map_err(ConfigStoreError::Invalid)?;
        let _lock = FileLock::acquire(&self.lock_path).map_err(|e| self.io_error(e))?;
        write_json_atomic(&self.path, cfg).map_err(|e| self.io_error(e))?;
        self.set_cache(cfg.clone());
        Ok(())
    }

    pub fn heartbeat_s(&self) -> Option<u64> {
        self.cached().get("heartbeat_s").and_then(Value::as_u64)
    }

    pub fn log_level(&self) -> Option<String> {
        self.cached()
            .get("log_level")
            .and_then(Value::as_str)
            .map(String::from)
    }

    pub fn logs_enabled(&self) -> bool {
        self.cached()
            .get("logs_enabled")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn telemetry(&self) -> TelemetrySettings {
        TelemetrySettings::from_config(&self.cached())
    }

    /// Apply `{request_id, set: {...}}`.
    ///
    /// The merged config is validated as a whole before anything is written;
    /// on any failure the cache and file stay as they were.
    pub fn apply_set(&self, payload: &Map<String, Value>) -> ConfigSetOutcome {
        let _guard = match self.apply_guard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let current = self.cached();
        let request_id = optional_str(payload, "request_id")
            .ok()
            .flatten()
            .unwrap_or_default()
            .to_string();

        let fail = |error: String| ConfigSetOutcome {
            config: current.clone(),
            result: CommandResult::failure(request_id.clone(), error),
            changed: false,
        };

        let update = match payload.get("set") {
            Some(Value::Object(update)) if !update.is_empty() => update,
            _ => return fail("set must be a non-empty object".to_string()),
        };

        let merged = merge(&current, update);
        if let Err(reason) = validate(&merged) {
            warn!(reason = %reason, "Rejected config update");
            return fail(reason);
        }

        if let Err(e) = self.save(&merged) {
            warn!(error = %e, "Failed to persist config update");
            return fail(e.to_string());
        }

        info!(keys = ?update.keys().collect::<Vec<_>>(), "Config updated");
        ConfigSetOutcome {
            config: merged,
            result: CommandResult::success(request_id)
                .with_field("applied", Value::Object(update.clone())),
            changed: true,
        }
    }

    pub async fn apply_set_async(
        self: &Arc<Self>,
        payload: Map<String, Value>,
    ) -> Result<ConfigSetOutcome, ConfigStoreError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.apply_set(&payload))
            .await
            .map_err(|e| ConfigStoreError::TaskFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn store_in(dir: &TempDir) -> ConfigStore {
        ConfigStore::new(dir.path().join("data").join("core_config.json"))
    }

    #[test]
    fn test_validate_whitelist() {
        assert!(validate(&obj(json!({"heartbeat_s": 30, "log_level": "INFO"}))).is_ok());
        assert!(validate(&obj(json!({"logs_enabled": true, "telemetry_enabled": false}))).is_ok());
        assert!(validate(&obj(json!({"nope": 1})))
            .unwrap_err()
            .contains("unknown config key"));
    }

    #[test]
    fn test_validate_heartbeat_range() {
        assert!(validate(&obj(json!({"heartbeat_s": 5}))).is_ok());
        assert!(validate(&obj(json!({"heartbeat_s": 3600}))).is_ok());
        assert!(validate(&obj(json!({"heartbeat_s": 4}))).is_err());
        assert!(validate(&obj(json!({"heartbeat_s": 3601}))).is_err());
        assert!(validate(&obj(json!({"heartbeat_s": 30.5}))).is_err());
        assert!(validate(&obj(json!({"heartbeat_s": true}))).is_err());
    }

    #[test]
    fn test_validate_log_level_enum() {
        for level in LOG_LEVELS {
            assert!(validate(&obj(json!({ "log_level": level }))).is_ok());
        }
        assert!(validate(&obj(json!({"log_level": "info"}))).is_err());
        assert!(validate(&obj(json!({"log_level": "TRACE"}))).is_err());
    }

    #[test]
    fn test_validate_telemetry_object() {
        let good = json!({"telemetry": {
            "enabled": true,
            "metrics": {"cpu_percent": true, "disk_percent": false},
            "interval_s": 1,
            "change_threshold_percent": 0
        }});
        assert!(validate(&obj(good)).is_ok());
        assert!(validate(&obj(json!({"telemetry": {"interval_s": 0}}))).is_err());
        assert!(validate(&obj(json!({"telemetry": {"change_threshold_percent": -1}}))).is_err());
        assert!(validate(&obj(json!({"telemetry": {"metrics": {"gpu": true}}}))).is_err());
        assert!(validate(&obj(json!({"telemetry": {"extra": 1}}))).is_err());
        assert!(validate(&obj(json!({"telemetry": 3}))).is_err());
    }

    #[test]
    fn test_merge_telemetry_one_level_deep() {
        let base = obj(json!({"heartbeat_s": 30, "telemetry": {"enabled": true, "interval_s": 5}}));
        let update = obj(json!({"telemetry": {"interval_s": 10}}));
        let merged = merge(&base, &update);
        assert_eq!(
            Value::Object(merged),
            json!({"heartbeat_s": 30, "telemetry": {"enabled": true, "interval_s": 10}})
        );
    }

    #[test]
    fn test_telemetry_settings_defaults() {
        let settings = TelemetrySettings::from_config(&Map::new());
        assert_eq!(settings, TelemetrySettings::default());
        assert_eq!(settings.interval_s, 2);
        assert_eq!(settings.change_threshold_percent, 2.0);
        assert!(!settings.metric_enabled("cpu_percent"));
    }

    #[test]
    fn test_metric_enabled_follows_global_switch() {
        let cfg = obj(json!({"telemetry": {"enabled": true, "metrics": {"disk_percent": false}}}));
        let settings = TelemetrySettings::from_config(&cfg);
        assert!(settings.metric_enabled("cpu_percent"));
        assert!(!settings.metric_enabled("disk_percent"));
    }

    #[test]
    fn test_apply_set_persists_and_caches() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let outcome = store.apply_set(&obj(json!({
            "request_id": "r1",
            "set": {"heartbeat_s": 60, "log_level": "DEBUG"}
        })));
        assert!(outcome.result.ok, "{:?}", outcome.result.error);
        assert!(outcome.changed);
        assert_eq!(outcome.result.request_id, "r1");
        assert_eq!(
            outcome.result.fields["applied"],
            json!({"heartbeat_s": 60, "log_level": "DEBUG"})
        );
        assert_eq!(store.heartbeat_s(), Some(60));

        let reloaded = store_in(&dir);
        assert_eq!(reloaded.log_level().as_deref(), Some("DEBUG"));
    }

    #[test]
    fn test_apply_set_rejects_without_touching_state() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .save(&obj(json!({"heartbeat_s": 30})))
            .unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        let outcome = store.apply_set(&obj(json!({
            "request_id": "r2",
            "set": {"heartbeat_s": 60, "log_level": "LOUD"}
        })));
        assert!(!outcome.result.ok);
        assert!(!outcome.changed);
        assert!(outcome.result.error.unwrap().contains("log_level"));
        assert_eq!(Value::Object(outcome.config), json!({"heartbeat_s": 30}));
        assert_eq!(store.heartbeat_s(), Some(30));
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn test_apply_set_requires_set_object() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        for payload in [json!({"request_id": "r"}), json!({"set": {}}), json!({"set": [1]})] {
            let outcome = store.apply_set(&obj(payload));
            assert!(!outcome.result.ok);
            assert!(!store.path().exists());
        }
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), r#"{"heartbeat_s": 1}"#).unwrap();
        assert!(store.load().unwrap().is_empty());
        assert!(store.path().exists(), "valid JSON is kept for inspection");
    }

    #[test]
    fn test_corrupt_file_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{\"heartbeat_s\": ").unwrap();
        assert!(store.load().unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_apply_set_async() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&dir));
        let outcome = store
            .apply_set_async(obj(json!({"request_id": "a", "set": {"logs_enabled": true}})))
            .await
            .unwrap();
        assert!(outcome.result.ok);
        assert!(store.logs_enabled());
    }
}
