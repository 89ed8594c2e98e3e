//! Package manager subprocess
//!
//! Components ship as wheels installed into the agent's venv; the
//! production implementation drives that venv's `pip`.

use super::LifecycleError;
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{info, warn};

/// Characters of stdout/stderr kept in results
pub const OUTPUT_TAIL_CHARS: usize = 4000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout_tail: String,
    pub stderr_tail: String,
}

/// Last `max_chars` characters of `text`
pub fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Install or upgrade from a local artifact
    async fn install(&self, artifact: &Path) -> Result<CommandOutput, LifecycleError>;

    async fn uninstall(&self, dist_name: &str) -> Result<CommandOutput, LifecycleError>;
}

#[derive(Debug, Clone)]
pub struct PipPackageManager {
    pip: PathBuf,
}

impl PipPackageManager {
    pub fn new(pip: impl Into<PathBuf>) -> Self {
        Self { pip: pip.into() }
    }

    pub fn pip(&self) -> &Path {
        &self.pip
    }

    async fn run(&self, verb: &str, args: &[&OsStr]) -> Result<CommandOutput, LifecycleError> {
        if !self.pip.exists() {
            return Err(LifecycleError::Operational(format!(
                "pip executable not found: {}",
                self.pip.display()
            )));
        }

        // output() drains both pipes while waiting, so a chatty child cannot deadlock
        let output = tokio::process::Command::new(&self.pip)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                LifecycleError::Operational(format!("failed to spawn {}: {e}", self.pip.display()))
            })?;

        let result = CommandOutput {
            stdout_tail: tail(&String::from_utf8_lossy(&output.stdout), OUTPUT_TAIL_CHARS),
            stderr_tail: tail(&String::from_utf8_lossy(&output.stderr), OUTPUT_TAIL_CHARS),
        };

        if !output.status.success() {
            let rc = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |code| code.to_string());
            warn!(verb, rc = %rc, "pip failed");
            return Err(LifecycleError::Operational(format!(
                "pip {verb} failed rc={rc}\nstdout:\n{}\nstderr:\n{}",
                result.stdout_tail.trim(),
                result.stderr_tail.trim()
            )));
        }
        info!(verb, "pip succeeded");
        Ok(result)
    }
}

#[async_trait]
impl PackageManager for PipPackageManager {
    async fn install(&self, artifact: &Path) -> Result<CommandOutput, LifecycleError> {
        self.run(
            "install",
            &[
                OsStr::new("install"),
                OsStr::new("--upgrade"),
                artifact.as_os_str(),
            ],
        )
        .await
    }

    async fn uninstall(&self, dist_name: &str) -> Result<CommandOutput, LifecycleError> {
        self.run(
            "uninstall",
            &[OsStr::new("uninstall"), OsStr::new("-y"), OsStr::new(dist_name)],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tail_keeps_last_chars() {
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ééé", 2), "éé");
    }

    #[tokio::test]
    async fn test_missing_pip_is_operational() {
        let pm = PipPackageManager::new("/nonexistent/venv/bin/pip");
        let err = pm.uninstall("lucid-cpu").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Operational(_)));
        assert!(err.to_string().contains("pip executable not found"));
    }

    #[cfg(unix)]
    fn fake_pip(dir: &TempDir, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("pip");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pip_invocation_and_output() {
        let dir = TempDir::new().unwrap();
        let pm = PipPackageManager::new(fake_pip(&dir, r#"echo "args: $@"; echo warn >&2"#));
        let output = pm.install(Path::new("/tmp/x.whl")).await.unwrap();
        assert_eq!(output.stdout_tail.trim(), "args: install --upgrade /tmp/x.whl");
        assert_eq!(output.stderr_tail.trim(), "warn");

        let output = pm.uninstall("lucid-cpu").await.unwrap();
        assert_eq!(output.stdout_tail.trim(), "args: uninstall -y lucid-cpu");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pip_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let pm = PipPackageManager::new(fake_pip(&dir, "echo boom >&2; exit 3"));
        let err = pm.uninstall("lucid-cpu").await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("pip uninstall failed rc=3"), "{message}");
        assert!(message.contains("boom"));
    }
}
