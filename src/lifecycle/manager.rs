//! Lifecycle operations over the registry, the package manager and the
//! in-process component instances

use super::download::{
    ArtifactFetcher, DEFAULT_DOWNLOAD_TIMEOUT, DEFAULT_MAX_ARTIFACT_BYTES,
};
use super::package_manager::{CommandOutput, PackageManager};
use super::requests::{
    release_asset_url, wheel_filename, CoreUpgradeRequest, InstallRequest, ToggleRequest,
    UninstallRequest, UpgradeRequest,
};
use super::{LifecycleError, OperationReport};
use crate::components::{ComponentManager, ComponentState};
use crate::storage::registry::{is_same_install, ComponentRecord, Registry, RegistryError};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

pub const DEFAULT_RELEASE_BASE_URL: &str = "https://github.com";
pub const DEFAULT_CORE_OWNER: &str = "LucidLabPlatform";
pub const DEFAULT_CORE_REPO: &str = "lucid-agent-core";
pub const DEFAULT_CORE_PACKAGE: &str = "lucid_agent_core";

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleSettings {
    pub release_base_url: String,
    pub download_timeout: Duration,
    pub max_artifact_bytes: u64,
    pub core_owner: String,
    pub core_repo: String,
    pub core_package: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            release_base_url: DEFAULT_RELEASE_BASE_URL.to_string(),
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
            core_owner: DEFAULT_CORE_OWNER.to_string(),
            core_repo: DEFAULT_CORE_REPO.to_string(),
            core_package: DEFAULT_CORE_PACKAGE.to_string(),
        }
    }
}

pub struct LifecycleManager {
    registry: Registry,
    settings: LifecycleSettings,
    fetcher: ArtifactFetcher,
    package_manager: Arc<dyn PackageManager>,
    components: Arc<ComponentManager>,
    /// Serializes operations on the same component id
    op_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    pub fn new(
        registry: Registry,
        settings: LifecycleSettings,
        package_manager: Arc<dyn PackageManager>,
        components: Arc<ComponentManager>,
    ) -> Result<Self, LifecycleError> {
        let fetcher = ArtifactFetcher::new(settings.download_timeout, settings.max_artifact_bytes)?;
        Ok(Self {
            registry,
            settings,
            fetcher,
            package_manager,
            components,
            op_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn lock_component(&self, component_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .op_locks
            .lock()
            .await
            .entry(component_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn ensure_settled(&self, component_id: &str, state: Option<ComponentState>) -> Result<(), LifecycleError> {
        match state {
            Some(state) if state.is_transitional() => Err(LifecycleError::Operational(format!(
                "component {component_id} is {state}"
            ))),
            _ => Ok(()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Download, verify, then hand the artifact to the package manager.
    /// The digest is checked before anything is installed.
    async fn fetch_verify_install(
        &self,
        url: &str,
        asset: &str,
        expected_sha256: &str,
    ) -> Result<CommandOutput, LifecycleError> {
        let artifact = self.fetcher.fetch(url, asset).await?;
        artifact.verify_sha256(expected_sha256)?;
        self.package_manager.install(artifact.path()).await
    }

    fn check_entrypoint(&self, entrypoint: &str) -> Result<(), LifecycleError> {
        if !self.components.factories().contains(entrypoint) {
            return Err(LifecycleError::Operational(format!(
                "entrypoint not importable: {entrypoint}"
            )));
        }
        Ok(())
    }

    pub async fn install(&self, payload: &Map<String, Value>) -> Result<OperationReport, LifecycleError> {
        let request = InstallRequest::parse(payload)?;
        let component_id = request.component_id.clone();
        let repo = request.repo();
        let _guard = self.lock_component(&component_id).await;

        let current = self.registry.load_async().await?;
        if is_same_install(
            current.get(&component_id),
            &repo,
            &request.version,
            &request.entrypoint,
        ) {
            info!(component_id = %component_id, version = %request.version, "Component already installed");
            return Ok(OperationReport::new()
                .with_field("component_id", component_id)
                .with_field("version", request.version)
                .with_field("noop", true));
        }

        let wheel_url = request.wheel_url(&self.settings.release_base_url);
        let sha256 = request.sha256();
        info!(component_id = %component_id, version = %request.version, url = %wheel_url, "Installing component");
        let output = self
            .fetch_verify_install(&wheel_url, &request.source.asset, &sha256)
            .await?;
        self.check_entrypoint(&request.entrypoint)?;

        let mut source = request.source.clone();
        source.sha256 = sha256.clone();
        let record = ComponentRecord {
            repo,
            version: request.version.clone(),
            entrypoint: request.entrypoint.clone(),
            wheel_url: wheel_url.clone(),
            sha256: sha256.clone(),
            source,
            dist_name: Some(request.dist_name()),
            enabled: true,
            installed_at: Some(Utc::now()),
            upgraded_at: None,
        };
        let key = component_id.clone();
        self.registry
            .update_async(move |registry| {
                registry.insert(key, record);
                Ok(())
            })
            .await?;
        info!(component_id = %component_id, version = %request.version, "Component installed");

        Ok(OperationReport::new()
            .restart_required(true)
            .registry_changed(true)
            .with_field("component_id", component_id)
            .with_field("version", request.version)
            .with_field("wheel_url", wheel_url)
            .with_field("sha256", sha256)
            .with_field("pip_stdout", output.stdout_tail)
            .with_field("pip_stderr", output.stderr_tail))
    }

    pub async fn uninstall(&self, payload: &Map<String, Value>) -> Result<OperationReport, LifecycleError> {
        let request = UninstallRequest::parse(payload)?;
        let component_id = request.component_id.clone();
        let _guard = self.lock_component(&component_id).await;
        self.ensure_settled(&component_id, self.components.state_of(&component_id).await)?;

        let current = self.registry.load_async().await?;
        let Some(record) = current.get(&component_id) else {
            info!(component_id = %component_id, "Component not installed, nothing to uninstall");
            return Ok(OperationReport::new()
                .with_field("component_id", component_id)
                .with_field("noop", true));
        };

        let dist_name = record
            .dist_name
            .clone()
            .or(request.dist_name)
            .ok_or_else(|| {
                LifecycleError::Operational(
                    "registry missing dist_name for component; provide dist_name in uninstall payload for migration"
                        .to_string(),
                )
            })?;
        let version = record.version.clone();

        let output = self.package_manager.uninstall(&dist_name).await?;

        let key = component_id.clone();
        self.registry
            .update_async(move |registry| {
                registry.remove(&key);
                Ok(())
            })
            .await?;
        if let Err(e) = self.components.unload(&component_id).await {
            warn!(component_id = %component_id, error = %e, "Uninstalled component did not stop cleanly");
        }
        info!(component_id = %component_id, dist_name = %dist_name, "Component uninstalled");

        Ok(OperationReport::new()
            .restart_required(true)
            .registry_changed(true)
            .with_field("component_id", component_id)
            .with_field("version", version)
            .with_field("dist_name", dist_name)
            .with_field("pip_stdout", output.stdout_tail)
            .with_field("pip_stderr", output.stderr_tail))
    }

    pub async fn upgrade(&self, payload: &Map<String, Value>) -> Result<OperationReport, LifecycleError> {
        let request = UpgradeRequest::parse(payload)?;
        let component_id = request.component_id.clone();
        let _guard = self.lock_component(&component_id).await;

        let current = self.registry.load_async().await?;
        let record = current.get(&component_id).cloned().ok_or_else(|| {
            LifecycleError::Validation(format!("component not found in registry: {component_id}"))
        })?;

        if record.version == request.version {
            info!(component_id = %component_id, version = %request.version, "Component already at requested version");
            return Ok(OperationReport::new()
                .with_field("component_id", component_id)
                .with_field("version", request.version)
                .with_field("noop", true));
        }

        let dist_name = record.dist_name.clone().ok_or_else(|| {
            LifecycleError::Validation(format!("dist_name not found in registry for {component_id}"))
        })?;
        let (owner, repo) = record.repo.split_once('/').ok_or_else(|| {
            LifecycleError::Operational(format!("registry repo is not owner/repo: {}", record.repo))
        })?;

        let asset = wheel_filename(&dist_name, &request.version);
        let tag = format!("v{}", request.version);
        let wheel_url = release_asset_url(&self.settings.release_base_url, owner, repo, &tag, &asset);
        let sha256 = request.sha256.to_ascii_lowercase();

        info!(
            component_id = %component_id,
            from_version = %record.version,
            to_version = %request.version,
            "Upgrading component"
        );
        let output = self.fetch_verify_install(&wheel_url, &asset, &sha256).await?;
        self.check_entrypoint(&record.entrypoint)?;

        let key = component_id.clone();
        let version = request.version.clone();
        let (url, digest) = (wheel_url.clone(), sha256.clone());
        self.registry
            .update_async(move |registry| {
                let entry = registry
                    .get_mut(&key)
                    .ok_or_else(|| RegistryError::NotFound(key.clone()))?;
                entry.version = version;
                entry.sha256 = digest.clone();
                entry.wheel_url = url;
                entry.source.tag = tag;
                entry.source.asset = asset;
                entry.source.sha256 = digest;
                entry.upgraded_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        info!(component_id = %component_id, version = %request.version, "Component upgraded");

        Ok(OperationReport::new()
            .restart_required(true)
            .registry_changed(true)
            .with_field("component_id", component_id)
            .with_field("from_version", record.version)
            .with_field("version", request.version)
            .with_field("wheel_url", wheel_url)
            .with_field("sha256", sha256)
            .with_field("pip_stdout", output.stdout_tail)
            .with_field("pip_stderr", output.stderr_tail))
    }

    /// Upgrade the agent's own package. Nothing is written to the registry.
    pub async fn core_upgrade(&self, payload: &Map<String, Value>) -> Result<OperationReport, LifecycleError> {
        let request = CoreUpgradeRequest::parse(payload)?;
        let settings = &self.settings;
        let asset = wheel_filename(&settings.core_package, &request.version);
        let tag = format!("v{}", request.version);
        let wheel_url = release_asset_url(
            &settings.release_base_url,
            &settings.core_owner,
            &settings.core_repo,
            &tag,
            &asset,
        );
        let sha256 = request.sha256.to_ascii_lowercase();

        info!(version = %request.version, url = %wheel_url, "Upgrading agent core");
        let output = self.fetch_verify_install(&wheel_url, &asset, &sha256).await?;
        info!(version = %request.version, "Agent core upgraded");

        Ok(OperationReport::new()
            .restart_required(true)
            .with_field("version", request.version)
            .with_field("wheel_url", wheel_url)
            .with_field("sha256", sha256)
            .with_field("pip_stdout", output.stdout_tail)
            .with_field("pip_stderr", output.stderr_tail))
    }

    pub async fn enable(&self, payload: &Map<String, Value>) -> Result<OperationReport, LifecycleError> {
        self.toggle(payload, true).await
    }

    pub async fn disable(&self, payload: &Map<String, Value>) -> Result<OperationReport, LifecycleError> {
        self.toggle(payload, false).await
    }

    async fn toggle(&self, payload: &Map<String, Value>, enabled: bool) -> Result<OperationReport, LifecycleError> {
        let request = ToggleRequest::parse(payload)?;
        let component_id = request.component_id;
        let _guard = self.lock_component(&component_id).await;
        self.ensure_settled(&component_id, self.components.state_of(&component_id).await)?;

        let key = component_id.clone();
        let record = self
            .registry
            .update_async(move |registry| {
                let entry = registry
                    .get_mut(&key)
                    .ok_or_else(|| RegistryError::NotFound(key.clone()))?;
                entry.enabled = enabled;
                Ok(entry.clone())
            })
            .await?;

        let outcome = if enabled {
            self.components.start(&component_id, &record.entrypoint).await
        } else {
            self.components.stop(&component_id).await
        };
        let running = self.components.state_of(&component_id).await == Some(ComponentState::Running);
        info!(component_id = %component_id, enabled, running, "Component toggled");

        let mut report = OperationReport::new()
            .registry_changed(true)
            .with_field("component_id", component_id.clone())
            .with_field("enabled", enabled)
            .with_field("running", running);
        if let Err(e) = outcome {
            // the flag is persisted; the instance catches up on next load
            warn!(component_id = %component_id, error = %e, "Component did not follow its enabled flag");
            report = report.with_field("warning", e.to_string());
        }
        Ok(report)
    }
}
