//! Durable component registry
//!
//! One JSON document mapping component id to its install record. Loading
//! never fails on bad content: a corrupt document is quarantined and an
//! empty registry is returned. Non-object entries and invalid ids are
//! dropped. Object entries that do not parse as a record are kept verbatim
//! and written back untouched by [`Registry::update`].

use super::atomic::{lock_path_for, quarantine, write_json_atomic, FileLock};
use crate::protocol::topics::validate_component_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// The only provenance type accepted for artifacts
pub const GITHUB_RELEASE: &str = "github_release";

/// Where an installed artifact came from
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReleaseSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub owner: String,
    pub repo: String,
    pub tag: String,
    pub asset: String,
    pub sha256: String,
}

/// Install record for one component
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentRecord {
    /// `owner/repo`
    pub repo: String,
    pub version: String,
    pub entrypoint: String,
    #[serde(default)]
    pub wheel_url: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub source: ReleaseSource,
    /// Distribution name handed to the package manager on uninstall.
    /// Absent on records written before it was tracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgraded_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

pub type RegistryMap = BTreeMap<String, ComponentRecord>;

/// Object entries that did not parse as a [`ComponentRecord`]
type UnparsedEntries = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("component not found: {0}")]
    NotFound(String),
    #[error("registry task failed: {0}")]
    TaskFailed(String),
}

/// Pure duplicate-install check
pub fn is_same_install(
    existing: Option<&ComponentRecord>,
    repo: &str,
    version: &str,
    entrypoint: &str,
) -> bool {
    existing.is_some_and(|record| {
        record.repo == repo && record.version == version && record.entrypoint == entrypoint
    })
}

/// Handle on the on-disk registry document
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Read the registry. Absent file means empty.
    pub fn load(&self) -> Result<RegistryMap, RegistryError> {
        self.load_document().map(|(registry, _)| registry)
    }

    fn load_document(&self) -> Result<(RegistryMap, UnparsedEntries), RegistryError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Registry file absent, starting empty");
                return Ok(Default::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let document = match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                self.quarantine_corrupt("top-level value is not an object");
                return Ok(Default::default());
            }
            Err(e) => {
                self.quarantine_corrupt(&e.to_string());
                return Ok(Default::default());
            }
        };

        Ok(filter_entries(document))
    }

    fn quarantine_corrupt(&self, reason: &str) {
        match quarantine(&self.path) {
            Ok(moved) => warn!(
                path = %self.path.display(),
                quarantined = %moved.display(),
                reason,
                "Registry file corrupt, moved aside and starting empty"
            ),
            Err(e) => warn!(
                path = %self.path.display(),
                reason,
                error = %e,
                "Registry file corrupt and could not be moved aside, starting empty"
            ),
        }
    }

    /// Replace the registry document atomically under the file lock
    pub fn write(&self, registry: &RegistryMap) -> Result<(), RegistryError> {
        let _lock = FileLock::acquire(&self.lock_path).map_err(|e| self.io_error(e))?;
        write_json_atomic(&self.path, registry).map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), entries = registry.len(), "Registry written");
        Ok(())
    }

    /// Load, mutate and write back under a single lock hold.
    ///
    /// Nothing is written when `mutate` returns an error. Entries that did
    /// not parse are written back as they were unless `mutate` inserted a
    /// record under the same id.
    pub fn update<F, R>(&self, mutate: F) -> Result<R, RegistryError>
    where
        F: FnOnce(&mut RegistryMap) -> Result<R, RegistryError>,
    {
        let _lock = FileLock::acquire(&self.lock_path).map_err(|e| self.io_error(e))?;
        let (mut registry, unparsed) = self.load_document()?;
        let out = mutate(&mut registry)?;

        let mut document = serde_json::Map::new();
        for (component_id, record) in &registry {
            let value = serde_json::to_value(record)
                .map_err(|e| self.io_error(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
            document.insert(component_id.clone(), value);
        }
        for (component_id, raw) in unparsed {
            document.entry(component_id).or_insert(raw);
        }
        write_json_atomic(&self.path, &document).map_err(|e| self.io_error(e))?;
        info!(path = %self.path.display(), entries = registry.len(), "Registry updated");
        Ok(out)
    }

    pub async fn load_async(&self) -> Result<RegistryMap, RegistryError> {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || registry.load())
            .await
            .map_err(|e| RegistryError::TaskFailed(e.to_string()))?
    }

    pub async fn write_async(&self, map: RegistryMap) -> Result<(), RegistryError> {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || registry.write(&map))
            .await
            .map_err(|e| RegistryError::TaskFailed(e.to_string()))?
    }

    pub async fn update_async<F, R>(&self, mutate: F) -> Result<R, RegistryError>
    where
        F: FnOnce(&mut RegistryMap) -> Result<R, RegistryError> + Send + 'static,
        R: Send + 'static,
    {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || registry.update(mutate))
            .await
            .map_err(|e| RegistryError::TaskFailed(e.to_string()))?
    }
}

fn filter_entries(document: serde_json::Map<String, Value>) -> (RegistryMap, UnparsedEntries) {
    let mut registry = RegistryMap::new();
    let mut unparsed = UnparsedEntries::new();
    for (component_id, value) in document {
        if validate_component_id(&component_id).is_err() {
            warn!(component_id = %component_id, "Dropping registry entry with invalid id");
            continue;
        }
        if !value.is_object() {
            warn!(component_id = %component_id, "Dropping registry entry that is not an object");
            continue;
        }
        match serde_json::from_value::<ComponentRecord>(value.clone()) {
            Ok(record) => {
                registry.insert(component_id, record);
            }
            Err(e) => {
                warn!(component_id = %component_id, error = %e, "Registry entry not loadable, preserving as-is");
                unparsed.insert(component_id, value);
            }
        }
    }
    (registry, unparsed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    pub(crate) fn sample_record(version: &str) -> ComponentRecord {
        ComponentRecord {
            repo: "lucid/cpu".to_string(),
            version: version.to_string(),
            entrypoint: "lucid.components.cpu:CpuComponent".to_string(),
            wheel_url: format!(
                "https://github.com/lucid/cpu/releases/download/v{version}/lucid_cpu-{version}-py3-none-any.whl"
            ),
            sha256: "a".repeat(64),
            source: ReleaseSource {
                kind: GITHUB_RELEASE.to_string(),
                owner: "lucid".to_string(),
                repo: "cpu".to_string(),
                tag: format!("v{version}"),
                asset: format!("lucid_cpu-{version}-py3-none-any.whl"),
                sha256: "a".repeat(64),
            },
            dist_name: Some("lucid-cpu".to_string()),
            enabled: true,
            installed_at: Some(Utc::now()),
            upgraded_at: None,
        }
    }

    fn registry_in(dir: &TempDir) -> Registry {
        Registry::new(dir.path().join("data").join("components_registry.json"))
    }

    #[test]
    fn test_load_absent_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(registry_in(&dir).load().unwrap().is_empty());
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let mut map = RegistryMap::new();
        map.insert("cpu".to_string(), sample_record("1.2.3"));
        let mut legacy = sample_record("0.1.0");
        legacy.dist_name = None;
        legacy.enabled = false;
        map.insert("legacy_led".to_string(), legacy);

        registry.write(&map).unwrap();
        assert_eq!(registry.load().unwrap(), map);
    }

    #[test]
    fn test_corrupt_file_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        std::fs::create_dir_all(registry.path().parent().unwrap()).unwrap();
        std::fs::write(registry.path(), "{\"cpu\": {").unwrap();

        let loaded = registry.load().unwrap();
        assert!(loaded.is_empty());
        assert!(!registry.path().exists());

        let quarantined: Vec<_> = std::fs::read_dir(registry.path().parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("components_registry.corrupt."))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn test_malformed_entries_are_dropped() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let good = serde_json::to_value(sample_record("1.0.0")).unwrap();
        let doc = serde_json::json!({
            "cpu": good,
            "not_object": 42,
            "missing_fields": {"version": "1.0.0"},
            "Bad-Id": good,
        });
        std::fs::create_dir_all(registry.path().parent().unwrap()).unwrap();
        std::fs::write(registry.path(), doc.to_string()).unwrap();

        let loaded = registry.load().unwrap();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), vec!["cpu"]);
    }

    #[test]
    fn test_record_without_provenance_loads() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let doc = serde_json::json!({
            "legacy": {"repo": "a/b", "version": "1.0.0", "entrypoint": "m:C", "enabled": true},
        });
        std::fs::create_dir_all(registry.path().parent().unwrap()).unwrap();
        std::fs::write(registry.path(), doc.to_string()).unwrap();

        let loaded = registry.load().unwrap();
        let legacy = &loaded["legacy"];
        assert_eq!(legacy.version, "1.0.0");
        assert_eq!(legacy.wheel_url, "");
        assert_eq!(legacy.installed_at, None);
    }

    #[test]
    fn test_update_preserves_unrelated_entries() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let legacy = serde_json::json!({"repo": "a/b", "version": "1.0.0", "entrypoint": "m:C", "enabled": true});
        let odd = serde_json::json!({"version": 7, "note": "hand edited"});
        let doc = serde_json::json!({"legacy": legacy, "odd": odd});
        std::fs::create_dir_all(registry.path().parent().unwrap()).unwrap();
        std::fs::write(registry.path(), doc.to_string()).unwrap();

        registry
            .update(|reg| {
                reg.insert("cpu".to_string(), sample_record("1.0.0"));
                Ok(())
            })
            .unwrap();

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(registry.path()).unwrap()).unwrap();
        assert_eq!(on_disk["legacy"], legacy);
        assert_eq!(on_disk["odd"], odd);
        assert_eq!(on_disk["cpu"]["version"], "1.0.0");

        let loaded = registry.load().unwrap();
        assert!(loaded.contains_key("legacy") && loaded.contains_key("cpu"));
        assert!(!loaded.contains_key("odd"));
    }

    #[test]
    fn test_update_skips_write_on_error() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let mut map = RegistryMap::new();
        map.insert("cpu".to_string(), sample_record("1.0.0"));
        registry.write(&map).unwrap();
        let before = std::fs::read_to_string(registry.path()).unwrap();

        let result = registry.update(|reg| {
            reg.clear();
            Err::<(), _>(RegistryError::NotFound("led".to_string()))
        });
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
        assert_eq!(std::fs::read_to_string(registry.path()).unwrap(), before);
    }

    #[test]
    fn test_interrupted_write_never_visible() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let mut map = RegistryMap::new();
        map.insert("cpu".to_string(), sample_record("1.0.0"));
        registry.write(&map).unwrap();

        // A writer that died mid-way leaves only a partial temp file behind.
        let data_dir = registry.path().parent().unwrap();
        let mut partial = tempfile::NamedTempFile::new_in(data_dir).unwrap();
        std::io::Write::write_all(&mut partial, b"{\"cpu\": {\"repo\": \"luc").unwrap();
        let (_file, _kept) = partial.keep().unwrap();

        assert_eq!(registry.load().unwrap(), map);
    }

    #[test]
    fn test_is_same_install() {
        let record = sample_record("1.2.3");
        let ep = "lucid.components.cpu:CpuComponent";
        assert!(is_same_install(Some(&record), "lucid/cpu", "1.2.3", ep));
        assert!(!is_same_install(Some(&record), "lucid/cpu", "1.2.4", ep));
        assert!(!is_same_install(Some(&record), "other/cpu", "1.2.3", ep));
        assert!(!is_same_install(Some(&record), "lucid/cpu", "1.2.3", "x:Y"));
        assert!(!is_same_install(None, "lucid/cpu", "1.2.3", ep));
    }

    #[tokio::test]
    async fn test_async_update_persists() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry
            .update_async(|reg| {
                reg.insert("cpu".to_string(), sample_record("2.0.0"));
                Ok(())
            })
            .await
            .unwrap();

        let loaded = registry.load_async().await.unwrap();
        assert_eq!(loaded["cpu"].version, "2.0.0");
    }

    proptest! {
        #[test]
        fn test_round_trip_any_well_formed_registry(
            entries in proptest::collection::btree_map(
                "[a-z0-9_]{1,12}",
                ("[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}", any::<bool>(), any::<bool>()),
                0..6,
            )
        ) {
            let dir = TempDir::new().unwrap();
            let registry = registry_in(&dir);
            let map: RegistryMap = entries
                .into_iter()
                .map(|(id, (version, enabled, has_dist))| {
                    let mut record = sample_record(&version);
                    record.enabled = enabled;
                    if !has_dist {
                        record.dist_name = None;
                    }
                    (id, record)
                })
                .collect();

            registry.write(&map).unwrap();
            prop_assert_eq!(registry.load().unwrap(), map);
        }
    }
}
