//! Per-project advisory lock inside the snapshot directory.
//!
//! `<dir>/.<project>.lock` is held with an exclusive `flock` for as long as
//! the [`ProjectLock`] lives. The file body records who holds it so a
//! second invocation can report the owner.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::naming::check_project_id;
use crate::error::{Result, StaxError};

/// Records older than this are reported as stale when taken over.
pub const STALE_AFTER: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".into()),
            acquired_at: Utc::now(),
        }
    }
}

/// Held lock. Released and removed on drop.
#[derive(Debug)]
pub struct ProjectLock {
    project_id: String,
    path: PathBuf,
    file: File,
}

impl ProjectLock {
    pub fn acquire(dir: &Path, project_id: &str) -> Result<Self> {
        Self::acquire_with(dir, project_id, STALE_AFTER)
    }

    /// Take the lock. A held `flock` always means a live holder and yields
    /// `Busy`. A record left behind by an exited holder is taken over;
    /// `stale_after` only decides how loudly that is logged.
    pub fn acquire_with(dir: &Path, project_id: &str, stale_after: Duration) -> Result<Self> {
        check_project_id(project_id)?;
        fs::create_dir_all(dir).map_err(|e| StaxError::snapshot_io(dir, e))?;
        let path = dir.join(format!(".{}.lock", project_id));

        // A releasing holder may unlink the file between our open and flock.
        for _ in 0..3 {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| StaxError::snapshot_io(&path, e))?;

            if file.try_lock_exclusive().is_err() {
                return Err(StaxError::Busy {
                    project: project_id.to_string(),
                    pid: read_info(&path).map(|i| i.pid),
                });
            }
            if !same_file(&path, &file) {
                let _ = FileExt::unlock(&file);
                continue;
            }

            if let Some(info) = read_info(&path) {
                if is_stale(&path, Some(&info), stale_after) {
                    tracing::warn!(
                        project = project_id,
                        holder = info.pid,
                        host = %info.hostname,
                        "breaking stale snapshot lock"
                    );
                } else {
                    tracing::debug!(
                        project = project_id,
                        holder = info.pid,
                        "taking over lock left by an exited process"
                    );
                }
            }

            let mut lock = Self {
                project_id: project_id.to_string(),
                path,
                file,
            };
            lock.record()?;
            return Ok(lock);
        }
        Err(StaxError::Busy {
            project: project_id.to_string(),
            pid: read_info(&path).map(|i| i.pid),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn record(&mut self) -> Result<()> {
        let body = serde_json::to_vec(&LockInfo::current())?;
        self.file
            .set_len(0)
            .and_then(|()| self.file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| self.file.write_all(&body))
            .and_then(|()| self.file.sync_all())
            .map_err(|e| StaxError::snapshot_io(&self.path, e))
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        // Unlink only our own inode, while the flock is still held.
        if same_file(&self.path, &self.file) {
            let _ = fs::remove_file(&self.path);
        }
        let _ = FileExt::unlock(&self.file);
    }
}

fn read_info(path: &Path) -> Option<LockInfo> {
    let mut body = String::new();
    File::open(path).ok()?.read_to_string(&mut body).ok()?;
    serde_json::from_str(&body).ok()
}

#[cfg(unix)]
fn same_file(path: &Path, file: &File) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(path), file.metadata()) {
        (Ok(on_disk), Ok(held)) => on_disk.dev() == held.dev() && on_disk.ino() == held.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(path: &Path, _file: &File) -> bool {
    path.exists()
}

fn is_stale(path: &Path, info: Option<&LockInfo>, stale_after: Duration) -> bool {
    let age = match info {
        Some(info) => (Utc::now() - info.acquired_at).to_std().unwrap_or_default(),
        None => fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default(),
    };
    age >= stale_after
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_busy_with_pid() {
        let dir = tempfile::tempdir().unwrap();
        let held = ProjectLock::acquire(dir.path(), "mysite").unwrap();
        let err = ProjectLock::acquire(dir.path(), "mysite").unwrap_err();
        match err {
            StaxError::Busy { project, pid } => {
                assert_eq!(project, "mysite");
                assert_eq!(pid, Some(std::process::id()));
            }
            other => panic!("expected Busy, got {other:?}"),
        }
        // Other projects are independent.
        let _other = ProjectLock::acquire(dir.path(), "othersite").unwrap();
        drop(held);
        ProjectLock::acquire(dir.path(), "mysite").unwrap();
    }

    #[test]
    fn live_holder_is_never_broken_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let _held = ProjectLock::acquire(dir.path(), "mysite").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let err = ProjectLock::acquire_with(dir.path(), "mysite", Duration::from_millis(1))
            .unwrap_err();
        assert!(matches!(err, StaxError::Busy { pid: Some(_), .. }), "{err:?}");
    }

    #[test]
    fn leftover_record_without_holder_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".mysite.lock");
        let old = LockInfo {
            pid: 1,
            hostname: "elsewhere".into(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();

        let lock = ProjectLock::acquire(dir.path(), "mysite").unwrap();
        assert_eq!(read_info(&path).unwrap().pid, std::process::id());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn release_keeps_a_successors_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".mysite.lock");
        let first = ProjectLock::acquire(dir.path(), "mysite").unwrap();

        // Replace the file under the first holder, as a successor would
        // after the original path was unlinked.
        fs::remove_file(&path).unwrap();
        let second = ProjectLock::acquire(dir.path(), "mysite").unwrap();
        drop(first);

        assert!(path.exists());
        let err = ProjectLock::acquire(dir.path(), "mysite").unwrap_err();
        assert!(matches!(err, StaxError::Busy { .. }));
        drop(second);
        assert!(!path.exists());
    }

    #[test]
    fn released_lock_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ProjectLock::acquire(dir.path(), "mysite").unwrap();
        let path = dir.path().join(".mysite.lock");
        assert!(path.exists());
        assert_eq!(read_info(&path).unwrap().pid, std::process::id());
        drop(lock);
        assert!(!path.exists());
    }
}
