//! Crash-safe file primitives shared by the registry and config store
//!
//! Writes go to a temp file in the destination directory, are flushed and
//! fsynced, renamed into place, and the directory is fsynced afterwards.
//! Writers serialize on an exclusive `flock` held on a sibling `.lock` file.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Exclusive advisory lock released on drop
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is held
    pub fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if result != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        debug!(lock = %path.display(), "Acquired file lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// `<file>.lock` next to the guarded file
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
///
/// The caller is expected to hold the file's [`FileLock`].
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(io::Error::from)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    fsync_dir(&dir)?;
    Ok(())
}

/// Flush directory metadata so the rename survives a crash
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Name used to preserve an unreadable file: `<stem>.corrupt.<YYYYMMDDTHHMMSSZ>.json`
pub fn quarantine_path(path: &Path, at: DateTime<Utc>) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let stamp = at.format("%Y%m%dT%H%M%SZ");
    path.with_file_name(format!("{stem}.corrupt.{stamp}.json"))
}

/// Rename a corrupt file aside and return where it went
pub fn quarantine(path: &Path) -> io::Result<PathBuf> {
    let target = quarantine_path(path, Utc::now());
    std::fs::rename(path, &target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_appends_suffix() {
        let path = Path::new("/var/lib/lucid/data/components_registry.json");
        assert_eq!(
            lock_path_for(path),
            PathBuf::from("/var/lib/lucid/data/components_registry.json.lock")
        );
    }

    #[test]
    fn test_quarantine_name_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let path = Path::new("/tmp/data/core_config.json");
        assert_eq!(
            quarantine_path(path, at),
            PathBuf::from("/tmp/data/core_config.corrupt.20240305T070809Z.json")
        );
    }

    #[test]
    fn test_write_json_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        write_json_atomic(&path, &json!({"a": 1})).unwrap();
        write_json_atomic(&path, &json!({"a": 2, "b": [true]})).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value, json!({"a": 2, "b": [true]}));
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &json!({"k": "v"})).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("doc.json")]);
    }

    #[test]
    fn test_lock_is_reacquirable_after_drop() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("x.lock");
        {
            let lock = FileLock::acquire(&lock_path).unwrap();
            assert_eq!(lock.path(), lock_path.as_path());
        }
        let _again = FileLock::acquire(&lock_path).unwrap();
    }

    #[test]
    fn test_quarantine_moves_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("components_registry.json");
        std::fs::write(&path, "{broken").unwrap();

        let moved = quarantine(&path).unwrap();
        assert!(!path.exists());
        assert!(moved.exists());
        let name = moved.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("components_registry.corrupt."));
        assert!(name.ends_with(".json"));
    }
}
