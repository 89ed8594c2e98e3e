//! Component lifecycle: install, uninstall, upgrade, enable, disable and
//! the agent's own upgrade, plus the restart that follows them.
//!
//! Every operation either completes its final registry write or leaves the
//! registry exactly as it was.

pub mod download;
pub mod manager;
pub mod package_manager;
pub mod requests;
pub mod restart;

use crate::storage::registry::RegistryError;
use serde_json::{Map, Value};
use thiserror::Error;

pub use download::{ArtifactFetcher, DownloadedArtifact};
pub use manager::{LifecycleManager, LifecycleSettings};
pub use package_manager::{CommandOutput, PackageManager, PipPackageManager};
pub use restart::{ProcessSignaller, RestartCoordinator, SigtermSignaller};

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Malformed request; nothing was touched
    #[error("validation_error: {0}")]
    Validation(String),
    /// Artifact digest did not match; nothing was installed
    #[error("{0}")]
    Integrity(String),
    /// Download, package manager or entrypoint failure
    #[error("{0}")]
    Operational(String),
    /// Durable write failed
    #[error("{0}")]
    Persistence(String),
}

impl From<RegistryError> for LifecycleError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::NotFound(_) => LifecycleError::Operational(error.to_string()),
            other => LifecycleError::Persistence(other.to_string()),
        }
    }
}

/// What a successful operation did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationReport {
    pub restart_required: bool,
    pub registry_changed: bool,
    /// Operation-specific result fields
    pub fields: Map<String, Value>,
}

impl OperationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn restart_required(mut self, restart_required: bool) -> Self {
        self.restart_required = restart_required;
        self
    }

    pub fn registry_changed(mut self, registry_changed: bool) -> Self {
        self.registry_changed = registry_changed;
        self
    }
}
