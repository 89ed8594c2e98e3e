//! Topic namespace for the LUCID agent protocol
//!
//! Every topic the agent publishes or subscribes to is built here from a
//! validated agent id (and, where relevant, a validated component id).
//! Nothing else in the crate concatenates topic strings.
//!
//! Layout, rooted at `lucid/agents/<agent_id>`:
//!
//! - retained: `metadata`, `status`, `state`, `cfg`, `cfg/telemetry`
//! - streams: `logs`, `telemetry/<metric>`
//! - commands: `cmd/<action>`
//! - results: `evt/<action>/result`
//! - component scoped: `components/<component_id>/...`

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").expect("valid id regex"));

/// Root of the agent namespace
pub const TOPIC_ROOT: &str = "lucid/agents";

/// Errors raised when an identifier cannot be used in a topic
#[derive(Debug, Error, PartialEq)]
pub enum TopicSchemaError {
    #[error("agent_id must be a non-empty string")]
    EmptyAgentId,
    #[error("agent_id '{0}' is invalid; allowed: [a-z0-9_]+")]
    InvalidAgentId(String),
    #[error("component_id must be a non-empty string")]
    EmptyComponentId,
    #[error("component_id '{0}' is invalid; allowed: [a-z0-9_]+")]
    InvalidComponentId(String),
    #[error("topic segment '{0}' is invalid")]
    InvalidSegment(String),
}

pub fn validate_agent_id(agent_id: &str) -> Result<(), TopicSchemaError> {
    if agent_id.is_empty() {
        return Err(TopicSchemaError::EmptyAgentId);
    }
    if !ID_RE.is_match(agent_id) {
        return Err(TopicSchemaError::InvalidAgentId(agent_id.to_string()));
    }
    Ok(())
}

pub fn validate_component_id(component_id: &str) -> Result<(), TopicSchemaError> {
    if component_id.is_empty() {
        return Err(TopicSchemaError::EmptyComponentId);
    }
    if !ID_RE.is_match(component_id) {
        return Err(TopicSchemaError::InvalidComponentId(
            component_id.to_string(),
        ));
    }
    Ok(())
}

/// Action and metric segments may be nested (`components/install`) but never
/// contain wildcards or empty levels.
fn validate_segment(segment: &str) -> Result<(), TopicSchemaError> {
    let bad = segment.is_empty()
        || segment.starts_with('/')
        || segment.ends_with('/')
        || segment.contains("//")
        || segment.contains('+')
        || segment.contains('#');
    if bad {
        return Err(TopicSchemaError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

/// Topic builder for a single agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSchema {
    agent_id: String,
    base: String,
}

impl TopicSchema {
    pub fn new(agent_id: &str) -> Result<Self, TopicSchemaError> {
        validate_agent_id(agent_id)?;
        Ok(Self {
            agent_id: agent_id.to_string(),
            base: format!("{TOPIC_ROOT}/{agent_id}"),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    // Agent retained

    pub fn metadata(&self) -> String {
        format!("{}/metadata", self.base)
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.base)
    }

    pub fn state(&self) -> String {
        format!("{}/state", self.base)
    }

    pub fn cfg(&self) -> String {
        format!("{}/cfg", self.base)
    }

    pub fn cfg_telemetry(&self) -> String {
        format!("{}/cfg/telemetry", self.base)
    }

    // Agent streams

    pub fn logs(&self) -> String {
        format!("{}/logs", self.base)
    }

    pub fn telemetry(&self, metric: &str) -> Result<String, TopicSchemaError> {
        validate_segment(metric)?;
        Ok(format!("{}/telemetry/{metric}", self.base))
    }

    // Agent commands and results

    /// `cmd/<action>`, e.g. `cmd/components/install`
    pub fn cmd(&self, action: &str) -> Result<String, TopicSchemaError> {
        validate_segment(action)?;
        Ok(format!("{}/cmd/{action}", self.base))
    }

    /// `evt/<action>/result`, e.g. `evt/cfg/set/result`
    pub fn evt_result(&self, action: &str) -> Result<String, TopicSchemaError> {
        validate_segment(action)?;
        Ok(format!("{}/evt/{action}/result", self.base))
    }

    /// Strips the `cmd/` prefix from a command topic of this agent
    pub fn action_of(&self, topic: &str) -> Option<String> {
        let prefix = format!("{}/cmd/", self.base);
        topic
            .strip_prefix(&prefix)
            .filter(|action| !action.is_empty())
            .map(str::to_string)
    }

    // Component topics

    pub fn component_base(&self, component_id: &str) -> Result<String, TopicSchemaError> {
        validate_component_id(component_id)?;
        Ok(format!("{}/components/{component_id}", self.base))
    }

    pub fn component_metadata(&self, component_id: &str) -> Result<String, TopicSchemaError> {
        Ok(format!("{}/metadata", self.component_base(component_id)?))
    }

    pub fn component_status(&self, component_id: &str) -> Result<String, TopicSchemaError> {
        Ok(format!("{}/status", self.component_base(component_id)?))
    }

    pub fn component_state(&self, component_id: &str) -> Result<String, TopicSchemaError> {
        Ok(format!("{}/state", self.component_base(component_id)?))
    }

    pub fn component_cfg(&self, component_id: &str) -> Result<String, TopicSchemaError> {
        Ok(format!("{}/cfg", self.component_base(component_id)?))
    }

    pub fn component_cmd(
        &self,
        component_id: &str,
        action: &str,
    ) -> Result<String, TopicSchemaError> {
        validate_segment(action)?;
        Ok(format!("{}/cmd/{action}", self.component_base(component_id)?))
    }

    pub fn component_evt_result(
        &self,
        component_id: &str,
        action: &str,
    ) -> Result<String, TopicSchemaError> {
        validate_segment(action)?;
        Ok(format!(
            "{}/evt/{action}/result",
            self.component_base(component_id)?
        ))
    }
}
