//! Filesystem layout derived from a single base directory
//!
//! ```text
//! <base>/
//! ├── venv/bin/pip
//! ├── data/components_registry.json
//! ├── data/core_config.json
//! ├── logs/
//! └── run/restart.requested
//! ```

use std::path::{Path, PathBuf};

pub const DEFAULT_BASE_DIR: &str = "/home/lucid/lucid-agent-core";
pub const BASE_DIR_ENV: &str = "LUCID_AGENT_BASE_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    base_dir: PathBuf,
}

impl AgentPaths {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Base dir from `LUCID_AGENT_BASE_DIR`, then `configured`, then the default
    pub fn resolve(configured: Option<&Path>) -> Self {
        if let Ok(dir) = std::env::var(BASE_DIR_ENV) {
            if !dir.is_empty() {
                return Self::new(dir);
            }
        }
        match configured {
            Some(dir) => Self::new(dir),
            None => Self::new(DEFAULT_BASE_DIR),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.base_dir.join("venv")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.base_dir.join("run")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir().join("components_registry.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir().join("core_config.json")
    }

    pub fn restart_sentinel_path(&self) -> PathBuf {
        self.runtime_dir().join("restart.requested")
    }

    pub fn pip_path(&self) -> PathBuf {
        self.venv_dir().join("bin").join("pip")
    }

    /// Create the data, log and runtime directories
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [self.data_dir(), self.log_dir(), self.runtime_dir()] {
            std::fs::create_dir_all(&dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o750))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_is_rooted_at_base() {
        let paths = AgentPaths::new("/srv/lucid");
        assert_eq!(
            paths.registry_path(),
            PathBuf::from("/srv/lucid/data/components_registry.json")
        );
        assert_eq!(
            paths.config_path(),
            PathBuf::from("/srv/lucid/data/core_config.json")
        );
        assert_eq!(
            paths.restart_sentinel_path(),
            PathBuf::from("/srv/lucid/run/restart.requested")
        );
        assert_eq!(paths.pip_path(), PathBuf::from("/srv/lucid/venv/bin/pip"));
    }

    #[test]
    fn test_ensure_dirs_creates_tree() {
        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::new(dir.path().join("agent"));
        paths.ensure_dirs().unwrap();
        assert!(paths.data_dir().is_dir());
        assert!(paths.log_dir().is_dir());
        assert!(paths.runtime_dir().is_dir());
        // idempotent
        paths.ensure_dirs().unwrap();
    }
}
