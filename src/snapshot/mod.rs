//! Snapshot store: compressed database dumps with a metadata sidecar.
//!
//! Layout under the configured directory:
//!
//! ```text
//! <dir>/<project>-<YYYYMMDD-HHMMSS>-<auto|manual>[-<n>].sql.gz
//! <dir>/.metadata.yaml
//! <dir>/.<project>.lock
//! ```

mod lock;
mod metadata;
mod naming;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;

pub use lock::{LockInfo, ProjectLock, STALE_AFTER};
pub use metadata::MetadataEntry;
pub use naming::{SnapshotKind, check_project_id};

use crate::container::DatabaseDumper;
use crate::db::SqliteDatabase;
use crate::error::{Result, StaxError};
use crate::importer::{ImportJob, ImportStats, Importer};
use crate::process::Budget;
use crate::transport::sanitize::safe_join;
use crate::warnings::{WarningSource, Warnings};
use metadata::Sidecar;

/// Age limits applied by [`SnapshotStore::prune`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub auto_days: u32,
    pub manual_days: u32,
}

impl RetentionPolicy {
    fn max_age(&self, kind: SnapshotKind) -> ChronoDuration {
        let days = match kind {
            SnapshotKind::Auto => self.auto_days,
            SnapshotKind::Manual => self.manual_days,
        };
        ChronoDuration::days(i64::from(days))
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            auto_days: 7,
            manual_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub kind: SnapshotKind,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub project_id: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub kept: usize,
    pub failed: Vec<(String, String)>,
}

impl DatabaseDumper for SqliteDatabase {
    fn dump(&self, out: &mut dyn Write, budget: &Budget) -> Result<()> {
        budget.check()?;
        SqliteDatabase::dump(self, out)?;
        Ok(())
    }
}

/// Removes a partially written snapshot unless disarmed.
struct PartialFile<'a> {
    path: &'a Path,
    armed: bool,
}

impl Drop for PartialFile<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(self.path);
        }
    }
}

pub struct SnapshotStore {
    dir: PathBuf,
    database: String,
    dumper: Arc<dyn DatabaseDumper>,
    importer: Importer,
    warnings: Warnings,
}

impl SnapshotStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        dumper: Arc<dyn DatabaseDumper>,
        importer: Importer,
        warnings: Warnings,
    ) -> Self {
        Self {
            dir: dir.into(),
            database: "db".to_string(),
            dumper,
            importer,
            warnings,
        }
    }

    /// Database that restores import into.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn sidecar(&self) -> Sidecar {
        Sidecar::new(&self.dir)
    }

    /// Take the per-project lock. Held for the life of the returned guard.
    pub fn lock(&self, project_id: &str) -> Result<ProjectLock> {
        ProjectLock::acquire(&self.dir, project_id)
    }

    pub fn create(
        &self,
        project_id: &str,
        kind: SnapshotKind,
        description: Option<&str>,
        budget: &Budget,
    ) -> Result<Snapshot> {
        let lock = self.lock(project_id)?;
        self.create_locked(&lock, kind, description, budget)
    }

    /// Create a snapshot while already holding the project lock.
    pub fn create_locked(
        &self,
        lock: &ProjectLock,
        kind: SnapshotKind,
        description: Option<&str>,
        budget: &Budget,
    ) -> Result<Snapshot> {
        let project_id = lock.project_id();
        let created_at = Utc::now();
        let (file_name, path, file) = self.reserve(project_id, created_at, kind)?;
        let mut guard = PartialFile {
            path: &path,
            armed: true,
        };

        let mut gz = GzEncoder::new(BufWriter::new(file), Compression::default());
        self.dumper.dump(&mut gz, budget)?;
        let written = gz
            .finish()
            .and_then(|mut w| {
                w.flush()?;
                w.into_inner().map_err(|e| e.into_error())
            })
            .and_then(|f| {
                f.sync_all()?;
                f.metadata()
            })
            .map_err(|e| StaxError::snapshot_io(&path, e))?;

        let entry = MetadataEntry {
            file_name: file_name.clone(),
            project_id: project_id.to_string(),
            kind,
            created_at,
            size_bytes: written.len(),
            description: description.map(str::to_string),
        };
        self.sidecar().append(&entry)?;
        guard.armed = false;

        tracing::info!(snapshot = %file_name, bytes = entry.size_bytes, "snapshot created");
        Ok(Snapshot {
            absolute_path: path.clone(),
            file_name,
            kind,
            created_at,
            size_bytes: entry.size_bytes,
            project_id: project_id.to_string(),
            description: entry.description,
        })
    }

    /// Claim a file name that no other snapshot uses.
    fn reserve(
        &self,
        project_id: &str,
        created_at: DateTime<Utc>,
        kind: SnapshotKind,
    ) -> Result<(String, PathBuf, File)> {
        fs::create_dir_all(&self.dir).map_err(|e| StaxError::snapshot_io(&self.dir, e))?;
        for counter in 0..1000 {
            let name = naming::file_name(project_id, created_at, kind, counter);
            let path = self.dir.join(&name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((name, path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StaxError::snapshot_io(&path, e)),
            }
        }
        Err(StaxError::snapshot_io(
            &self.dir,
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "too many snapshots within one second",
            ),
        ))
    }

    /// Snapshots for one project, oldest first. Files without a sidecar
    /// entry are listed and reported as orphans.
    pub fn list(&self, project_id: &str) -> Result<Vec<Snapshot>> {
        check_project_id(project_id)?;
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StaxError::snapshot_io(&self.dir, e)),
        };

        let metadata: HashMap<String, MetadataEntry> = self
            .sidecar()
            .read()?
            .into_iter()
            .filter(|e| e.project_id == project_id)
            .map(|e| (e.file_name.clone(), e))
            .collect();

        let mut found = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| StaxError::snapshot_io(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(parsed) = naming::parse(&name) else {
                continue;
            };
            if parsed.project_id != project_id {
                continue;
            }
            let size = entry
                .metadata()
                .map_err(|e| StaxError::snapshot_io(entry.path(), e))?
                .len();
            let meta = metadata.get(&name);
            if meta.is_none() {
                self.warnings.push(
                    WarningSource::Snapshot,
                    format!("orphan snapshot file without metadata: {}", name),
                );
            }
            seen.insert(name.clone());
            found.push((
                parsed.counter,
                Snapshot {
                    absolute_path: entry.path(),
                    kind: parsed.kind,
                    created_at: meta.map(|m| m.created_at).unwrap_or(parsed.created_at),
                    size_bytes: size,
                    project_id: parsed.project_id,
                    description: meta.and_then(|m| m.description.clone()),
                    file_name: name,
                },
            ));
        }
        for name in metadata.keys().filter(|n| !seen.contains(*n)) {
            self.warnings.push(
                WarningSource::Snapshot,
                format!("metadata entry without snapshot file: {}", name),
            );
        }

        found.sort_by(|(ca, a), (cb, b)| {
            a.created_at
                .cmp(&b.created_at)
                .then(ca.cmp(cb))
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        Ok(found.into_iter().map(|(_, s)| s).collect())
    }

    /// Resolve a snapshot name or path to a file inside the snapshot
    /// directory. The `.sql.gz` extension may be omitted.
    pub fn resolve(&self, path_or_name: &str) -> Result<PathBuf> {
        let candidate = Path::new(path_or_name);
        if candidate.is_absolute() {
            let dir = self
                .dir
                .canonicalize()
                .map_err(|e| StaxError::snapshot_io(&self.dir, e))?;
            let file = candidate
                .canonicalize()
                .map_err(|e| StaxError::snapshot_io(candidate, e))?;
            if file.parent() != Some(dir.as_path()) {
                return Err(StaxError::invalid(format!(
                    "{} is not inside the snapshot directory {}",
                    path_or_name,
                    self.dir.display()
                )));
            }
            return Ok(file);
        }
        if path_or_name.contains('/') || path_or_name.starts_with('.') {
            return Err(StaxError::invalid(format!(
                "snapshot name '{}' must be a plain file name",
                path_or_name
            )));
        }
        let name = if path_or_name.ends_with(naming::EXTENSION) {
            path_or_name.to_string()
        } else {
            format!("{}{}", path_or_name, naming::EXTENSION)
        };
        safe_join(&self.dir, &name)
    }

    /// Stream a snapshot into the local database.
    pub fn restore(&self, path_or_name: &str, budget: &Budget) -> Result<ImportStats> {
        let path = self.resolve(path_or_name)?;
        if !path.is_file() {
            return Err(StaxError::invalid(format!(
                "snapshot {} does not exist",
                path.display()
            )));
        }
        let job = ImportJob {
            source_file: path.clone(),
            target_database: self.database.clone(),
            suppress_debug: true,
            skip_post_hooks: false,
            remove_source: false,
        };
        tracing::info!(snapshot = %path.display(), "restoring snapshot");
        self.importer.import(&job, budget)
    }

    /// Remove a snapshot and its metadata. Returns false, with a warning,
    /// when nothing existed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let path = self.resolve(name)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let removed_file = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(StaxError::snapshot_io(&path, e)),
        };
        let removed_meta = self.sidecar().remove(&[file_name.as_str()])?;

        if !removed_file && removed_meta == 0 {
            self.warnings.push(
                WarningSource::Snapshot,
                format!("snapshot {} does not exist; nothing deleted", file_name),
            );
            return Ok(false);
        }
        tracing::info!(snapshot = %file_name, "snapshot deleted");
        Ok(true)
    }

    pub fn prune(&self, project_id: &str, retention: RetentionPolicy) -> Result<PruneReport> {
        self.prune_at(project_id, retention, Utc::now())
    }

    /// Delete expired snapshots of one project, oldest first. A failed
    /// deletion is recorded and the sweep continues.
    pub fn prune_at(
        &self,
        project_id: &str,
        retention: RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        let mut expired_names = Vec::new();
        for snapshot in self.list(project_id)? {
            if now - snapshot.created_at > retention.max_age(snapshot.kind) {
                match fs::remove_file(&snapshot.absolute_path) {
                    Ok(()) => {
                        expired_names.push(snapshot.file_name.clone());
                        report.deleted.push(snapshot.file_name);
                    }
                    Err(e) => {
                        self.warnings.push(
                            WarningSource::Snapshot,
                            format!("could not prune {}: {}", snapshot.file_name, e),
                        );
                        report.failed.push((snapshot.file_name, e.to_string()));
                    }
                }
            } else {
                report.kept += 1;
            }
        }
        if !expired_names.is_empty() {
            let names: Vec<&str> = expired_names.iter().map(String::as_str).collect();
            self.sidecar().remove(&names)?;
        }
        tracing::info!(
            project = project_id,
            deleted = report.deleted.len(),
            kept = report.kept,
            "snapshots pruned"
        );
        Ok(report)
    }
}
