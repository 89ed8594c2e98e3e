//! Self-restart through the service supervisor
//!
//! The agent never restarts itself in-process. It sends SIGTERM to its own
//! pid; the normal shutdown path publishes `offline` and exits, and the
//! supervisor (systemd `Restart=always`) starts it again. A sentinel file's
//! mtime debounces restart storms.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

pub const DEFAULT_RESTART_DEBOUNCE: Duration = Duration::from_secs(10);

/// Any of these in the environment means a supervisor will restart us
pub const SUPERVISION_ENV_VARS: [&str; 3] = ["INVOCATION_ID", "NOTIFY_SOCKET", "JOURNAL_STREAM"];

pub fn detect_supervision<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    SUPERVISION_ENV_VARS
        .iter()
        .any(|name| lookup(name).is_some_and(|value| !value.is_empty()))
}

/// Delivers the termination signal
pub trait ProcessSignaller: Send + Sync {
    fn terminate_self(&self) -> std::io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SigtermSignaller;

impl ProcessSignaller for SigtermSignaller {
    fn terminate_self(&self) -> std::io::Result<()> {
        // SAFETY: kill(2) with our own pid has no memory-safety preconditions
        let rc = unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

pub struct RestartCoordinator {
    sentinel: PathBuf,
    debounce: Duration,
    supervised: bool,
    signaller: Arc<dyn ProcessSignaller>,
}

impl std::fmt::Debug for RestartCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartCoordinator")
            .field("sentinel", &self.sentinel)
            .field("debounce", &self.debounce)
            .field("supervised", &self.supervised)
            .finish_non_exhaustive()
    }
}

impl RestartCoordinator {
    pub fn new(
        sentinel: impl Into<PathBuf>,
        debounce: Duration,
        supervised: bool,
        signaller: Arc<dyn ProcessSignaller>,
    ) -> Self {
        Self {
            sentinel: sentinel.into(),
            debounce,
            supervised,
            signaller,
        }
    }

    /// Supervision from the environment unless `assume_supervised` is set
    pub fn from_env(
        sentinel: impl Into<PathBuf>,
        debounce: Duration,
        assume_supervised: Option<bool>,
        signaller: Arc<dyn ProcessSignaller>,
    ) -> Self {
        let supervised =
            assume_supervised.unwrap_or_else(|| detect_supervision(|name| std::env::var(name).ok()));
        Self::new(sentinel, debounce, supervised, signaller)
    }

    pub fn is_supervised(&self) -> bool {
        self.supervised
    }

    pub fn sentinel(&self) -> &Path {
        &self.sentinel
    }

    /// Whether [`request`](Self::request) would signal right now
    pub fn is_available(&self) -> bool {
        self.supervised && !self.recently_requested(SystemTime::now())
    }

    /// Returns `true` if the termination signal was sent
    pub fn request(&self, reason: &str) -> bool {
        if !self.supervised {
            warn!(reason, "Restart requested but no supervisor detected, ignoring");
            return false;
        }

        let now = SystemTime::now();
        if self.recently_requested(now) {
            warn!(
                reason,
                debounce_s = self.debounce.as_secs(),
                "Restart suppressed, one was requested recently"
            );
            return false;
        }

        if let Err(e) = self.touch_sentinel() {
            warn!(error = %e, path = %self.sentinel.display(), "Could not write restart sentinel");
        }

        info!(reason, pid = std::process::id(), "Restart requested, sending SIGTERM");
        match self.signaller.terminate_self() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to signal own process");
                false
            }
        }
    }

    fn recently_requested(&self, now: SystemTime) -> bool {
        let Ok(modified) = std::fs::metadata(&self.sentinel).and_then(|meta| meta.modified()) else {
            return false;
        };
        match now.duration_since(modified) {
            Ok(age) => age < self.debounce,
            // mtime in the future: clock moved back, treat as fresh
            Err(_) => true,
        }
    }

    fn touch_sentinel(&self) -> std::io::Result<()> {
        if let Some(parent) = self.sentinel.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.sentinel, chrono::Utc::now().to_rfc3339())
    }
}
