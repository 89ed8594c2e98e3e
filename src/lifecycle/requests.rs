//! Strictly validated lifecycle requests
//!
//! Each request is parsed from the command payload once and is immutable
//! afterwards. Unknown keys are ignored.

use super::LifecycleError;
use crate::storage::registry::{ReleaseSource, GITHUB_RELEASE};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::ffi::OsStr;
use std::path::Path;

static COMPONENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").expect("valid component id regex"));
static ENTRYPOINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*:[A-Za-z_][A-Za-z0-9_]*$")
        .expect("valid entrypoint regex")
});
static SEMVER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("valid semver regex"));
static SHA256_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-fA-F0-9]{64}$").expect("valid sha256 regex"));
static GH_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("valid github name regex"));
static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.+-]*$").expect("valid release tag regex"));

fn invalid(message: impl Into<String>) -> LifecycleError {
    LifecycleError::Validation(message.into())
}

fn required_key<'a>(payload: &'a Map<String, Value>, key: &str) -> Result<&'a Value, LifecycleError> {
    payload
        .get(key)
        .ok_or_else(|| invalid(format!("missing required key: {key}")))
}

fn string_or_empty<'a>(payload: &'a Map<String, Value>, key: &str) -> Result<&'a str, LifecycleError> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(""),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(invalid(format!("{key} must be a string"))),
    }
}

fn validate_request_id(request_id: &str) -> Result<(), LifecycleError> {
    if request_id.is_empty() {
        return Err(invalid("request_id must be a non-empty string"));
    }
    Ok(())
}

fn validate_component_id(component_id: &str) -> Result<(), LifecycleError> {
    if !COMPONENT_ID_RE.is_match(component_id) {
        return Err(invalid(format!(
            "component_id must match ^[a-z0-9_]+$: {component_id}"
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<(), LifecycleError> {
    if !SEMVER_RE.is_match(version) {
        return Err(invalid("version must be semver like 1.2.3"));
    }
    Ok(())
}

fn validate_release_type(payload: &Map<String, Value>) -> Result<(), LifecycleError> {
    let release_type = match payload.get("release_type") {
        None | Some(Value::Null) => GITHUB_RELEASE,
        Some(Value::String(s)) => s.as_str(),
        Some(_) => return Err(invalid("release_type must be a string")),
    };
    if release_type != GITHUB_RELEASE {
        return Err(invalid(r#"release_type must be "github_release""#));
    }
    Ok(())
}

/// A single path component safe to join onto a download directory
pub fn is_bare_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && !name.contains("..")
        && Path::new(name).file_name() == Some(OsStr::new(name))
}

pub fn is_sha256_hex(value: &str) -> bool {
    SHA256_RE.is_match(value)
}

/// `{base}/{owner}/{repo}/releases/download/{tag}/{asset}`
pub fn release_asset_url(base: &str, owner: &str, repo: &str, tag: &str, asset: &str) -> String {
    format!(
        "{}/{owner}/{repo}/releases/download/{tag}/{asset}",
        base.trim_end_matches('/')
    )
}

/// `lucid_agent_cpu-1.0.0-py3-none-any.whl` → `lucid-agent-cpu`
pub fn dist_name_from_asset(asset: &str) -> String {
    let stem = asset.strip_suffix(".whl").unwrap_or(asset);
    let name = stem.split('-').next().unwrap_or(stem);
    name.replace('_', "-")
}

/// Pure-python wheel filename for a distribution at a version
pub fn wheel_filename(dist_name: &str, version: &str) -> String {
    format!("{}-{version}-py3-none-any.whl", dist_name.replace('-', "_"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub request_id: String,
    pub component_id: String,
    pub version: String,
    pub entrypoint: String,
    pub source: ReleaseSource,
}

impl InstallRequest {
    pub fn parse(payload: &Map<String, Value>) -> Result<Self, LifecycleError> {
        for key in ["request_id", "component_id", "version", "entrypoint", "source"] {
            required_key(payload, key)?;
        }
        let source = match payload.get("source") {
            Some(Value::Object(source)) => source,
            _ => return Err(invalid("source must be an object")),
        };

        let request = Self {
            request_id: string_or_empty(payload, "request_id")?.to_string(),
            component_id: string_or_empty(payload, "component_id")?.to_string(),
            version: string_or_empty(payload, "version")?.to_string(),
            entrypoint: string_or_empty(payload, "entrypoint")?.to_string(),
            source: ReleaseSource {
                kind: string_or_empty(source, "type")?.to_string(),
                owner: string_or_empty(source, "owner")?.to_string(),
                repo: string_or_empty(source, "repo")?.to_string(),
                tag: string_or_empty(source, "tag")?.to_string(),
                asset: string_or_empty(source, "asset")?.to_string(),
                sha256: string_or_empty(source, "sha256")?.to_string(),
            },
        };
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<(), LifecycleError> {
        validate_request_id(&self.request_id)?;
        validate_component_id(&self.component_id)?;
        validate_version(&self.version)?;
        if !ENTRYPOINT_RE.is_match(&self.entrypoint) {
            return Err(invalid("entrypoint must be module:ClassName"));
        }

        let source = &self.source;
        if source.kind != GITHUB_RELEASE {
            return Err(invalid(r#"source.type must be "github_release""#));
        }
        if !GH_NAME_RE.is_match(&source.owner) {
            return Err(invalid("source.owner is invalid"));
        }
        if !GH_NAME_RE.is_match(&source.repo) {
            return Err(invalid("source.repo is invalid"));
        }
        if source.tag.is_empty() {
            return Err(invalid("source.tag must be a non-empty string"));
        }
        if !TAG_RE.is_match(&source.tag) {
            return Err(invalid("source.tag is invalid"));
        }
        if !is_bare_filename(&source.asset) {
            return Err(invalid("source.asset must be a bare filename"));
        }
        if !source.asset.ends_with(".whl") {
            return Err(invalid("source.asset must be a .whl filename"));
        }
        if !is_sha256_hex(&source.sha256) {
            return Err(invalid("source.sha256 must be 64 hex chars"));
        }
        Ok(())
    }

    /// `owner/repo`
    pub fn repo(&self) -> String {
        format!("{}/{}", self.source.owner, self.source.repo)
    }

    pub fn wheel_url(&self, release_base: &str) -> String {
        release_asset_url(
            release_base,
            &self.source.owner,
            &self.source.repo,
            &self.source.tag,
            &self.source.asset,
        )
    }

    pub fn dist_name(&self) -> String {
        dist_name_from_asset(&self.source.asset)
    }

    pub fn sha256(&self) -> String {
        self.source.sha256.to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallRequest {
    pub request_id: String,
    pub component_id: String,
    /// Fallback for records written before `dist_name` was tracked
    pub dist_name: Option<String>,
}

impl UninstallRequest {
    pub fn parse(payload: &Map<String, Value>) -> Result<Self, LifecycleError> {
        for key in ["request_id", "component_id"] {
            required_key(payload, key)?;
        }
        let request_id = string_or_empty(payload, "request_id")?.to_string();
        let component_id = string_or_empty(payload, "component_id")?.to_string();
        validate_request_id(&request_id)?;
        validate_component_id(&component_id)?;

        let dist_name = Some(string_or_empty(payload, "dist_name")?)
            .filter(|name| !name.is_empty())
            .map(String::from);
        Ok(Self {
            request_id,
            component_id,
            dist_name,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub request_id: String,
    pub component_id: String,
    pub version: String,
    pub sha256: String,
}

impl UpgradeRequest {
    pub fn parse(payload: &Map<String, Value>) -> Result<Self, LifecycleError> {
        let request = Self {
            request_id: string_or_empty(payload, "request_id")?.to_string(),
            component_id: string_or_empty(payload, "component_id")?.to_string(),
            version: string_or_empty(payload, "version")?.to_string(),
            sha256: string_or_empty(payload, "sha256")?.to_string(),
        };
        validate_request_id(&request.request_id)?;
        validate_component_id(&request.component_id)?;
        validate_release_type(payload)?;
        validate_version(&request.version)?;
        if !is_sha256_hex(&request.sha256) {
            return Err(invalid("sha256 must be 64 hex chars"));
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreUpgradeRequest {
    pub request_id: String,
    pub version: String,
    pub sha256: String,
}

impl CoreUpgradeRequest {
    pub fn parse(payload: &Map<String, Value>) -> Result<Self, LifecycleError> {
        let request = Self {
            request_id: string_or_empty(payload, "request_id")?.to_string(),
            version: string_or_empty(payload, "version")?.to_string(),
            sha256: string_or_empty(payload, "sha256")?.to_string(),
        };
        validate_request_id(&request.request_id)?;
        validate_release_type(payload)?;
        validate_version(&request.version)?;
        if !is_sha256_hex(&request.sha256) {
            return Err(invalid("sha256 must be 64 hex chars"));
        }
        Ok(request)
    }
}

/// Enable or disable request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleRequest {
    pub request_id: String,
    pub component_id: String,
}

impl ToggleRequest {
    pub fn parse(payload: &Map<String, Value>) -> Result<Self, LifecycleError> {
        let request_id = string_or_empty(payload, "request_id")?.to_string();
        let component_id = string_or_empty(payload, "component_id")?.to_string();
        validate_request_id(&request_id)?;
        if component_id.is_empty() {
            return Err(invalid("component_id is required"));
        }
        validate_component_id(&component_id)?;
        Ok(Self {
            request_id,
            component_id,
        })
    }
}
