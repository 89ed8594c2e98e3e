//! Message envelopes for the LUCID agent protocol
//!
//! Commands arrive as UTF-8 JSON objects carrying a `request_id`. Every
//! command produces exactly one result carrying at least
//! `{request_id, ok, error, restart_required, ts}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Agent presence states published on the retained status topic
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Online,
    Offline,
    Error,
    Starting,
}

/// Status payload, shared by normal status publishes and the last will
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusPayload {
    pub state: StatusState,
    pub connected_since_ts: Option<DateTime<Utc>>,
    pub uptime_s: u64,
}

/// Generic result envelope for commands without a dedicated result type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub request_id: String,
    pub ok: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub restart_required: bool,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CommandResult {
    pub fn success(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ok: true,
            error: None,
            restart_required: false,
            ts: Utc::now(),
            fields: Map::new(),
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ok: false,
            error: Some(error.into()),
            restart_required: false,
            ts: Utc::now(),
            fields: Map::new(),
        }
    }

    /// Adds an operation-specific field; envelope keys cannot be overridden
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        const RESERVED: [&str; 5] = ["request_id", "ok", "error", "restart_required", "ts"];
        if !RESERVED.contains(&key) {
            self.fields.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn with_restart_required(mut self, restart_required: bool) -> Self {
        self.restart_required = restart_required;
        self
    }
}

/// Telemetry sample published on `telemetry/<metric>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySample {
    pub value: f64,
    pub ts: DateTime<Utc>,
}

/// Log record published on the `logs` stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogPayload {
    pub level: String,
    pub target: String,
    pub message: String,
    pub ts: DateTime<Utc>,
}

/// Parse a command payload tolerantly.
///
/// An empty payload is an empty object. Anything that is not a JSON object
/// is reported as an error string suitable for an `ok=false` result.
pub fn parse_payload(raw: &str) -> Result<Map<String, Value>, String> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("payload must be a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON payload: {e}")),
    }
}

/// Best-effort `request_id` extraction, used when a handler fails before
/// the payload was validated.
pub fn extract_request_id(raw: &str) -> String {
    parse_payload(raw)
        .ok()
        .and_then(|map| map.get("request_id").and_then(Value::as_str).map(String::from))
        .unwrap_or_default()
}

/// Read an optional string field, rejecting non-string values
pub fn optional_str<'a>(map: &'a Map<String, Value>, key: &str) -> Result<Option<&'a str>, String> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(format!("{key} must be a string")),
    }
}

/// Read a required non-empty string field
pub fn required_str<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a str, String> {
    match optional_str(map, key)? {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(format!("{key} must be a non-empty string")),
    }
}
