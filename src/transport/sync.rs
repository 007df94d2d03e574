//! One-way file sync from a remote tree into a local directory.
//!
//! Restartable at file granularity: files whose size and mtime already
//! match are skipped, and each download lands in a partial file that is
//! renamed into place only when complete.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::filter::FilterSet;
use super::sanitize::safe_join;
use super::ssh::{EntryKind, RemoteEntry, RemoteSession};
use super::throttle::{Throttle, ThrottledWriter};
use crate::error::{Result, StaxError};
use crate::process::Budget;
use crate::warnings::{WarningSource, Warnings};

const PARTIAL_SUFFIX: &str = ".stax-partial";

/// Knobs for one sync.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub dry_run: bool,
    /// Remove local files absent on the remote. Never on by default.
    pub delete_extraneous: bool,
    /// KiB/s, 0 means unlimited.
    pub bandwidth_limit_kibibytes_per_sec: u64,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub preserve_attributes: bool,
    /// Must stay false; remote symlinks are skipped with a warning.
    pub follow_symlinks: bool,
    /// Callers run [`SyncEngine::verify`] after the sync when set.
    pub verify_after: bool,
    pub workers: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            delete_extraneous: false,
            bandwidth_limit_kibibytes_per_sec: 0,
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
            preserve_attributes: false,
            follow_symlinks: false,
            verify_after: false,
            workers: 4,
        }
    }
}

/// Counters for a sync or a verify pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Files transferred (or, in a dry run, that would be).
    pub files: u64,
    pub bytes: u64,
    /// Files already identical locally.
    pub unchanged: u64,
    pub deleted: u64,
}

/// What a sync will do, computed before any byte moves.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub directories: Vec<String>,
    pub transfers: Vec<RemoteEntry>,
    pub unchanged: Vec<String>,
    pub deletions: Vec<PathBuf>,
}

impl SyncPlan {
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            files: self.transfers.len() as u64,
            bytes: self.transfers.iter().map(|e| e.size).sum(),
            unchanged: self.unchanged.len() as u64,
            deleted: self.deletions.len() as u64,
        }
    }
}

fn mtime_secs(meta: &fs::Metadata) -> Option<u64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

fn is_identical(local: &Path, remote: &RemoteEntry) -> bool {
    match fs::symlink_metadata(local) {
        Ok(meta) if meta.is_file() => {
            meta.len() == remote.size
                && remote.mtime.is_some()
                && mtime_secs(&meta) == remote.mtime
        }
        _ => false,
    }
}

fn join_remote(root: &str, rel: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), rel)
}

/// Regular files under `root`, relative, never following symlinks.
fn local_files(root: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let dir = root.join(&rel);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let child = rel.join(entry.file_name());
            let kind = entry.file_type()?;
            if kind.is_dir() {
                stack.push(child);
            } else if kind.is_file() {
                out.push(child.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Syncs one remote root into one local root.
pub struct SyncEngine<'a> {
    session: &'a dyn RemoteSession,
    warnings: Warnings,
}

impl<'a> SyncEngine<'a> {
    pub fn new(session: &'a dyn RemoteSession, warnings: Warnings) -> Self {
        Self { session, warnings }
    }

    /// Compare the remote listing against the local tree.
    pub fn plan(
        &self,
        remote_root: &str,
        local_root: &Path,
        opts: &TransferOptions,
        budget: &Budget,
    ) -> Result<SyncPlan> {
        if opts.follow_symlinks {
            return Err(StaxError::invalid("following symlinks is not supported"));
        }
        let filter = FilterSet::new(&opts.include_globs, &opts.exclude_globs)?;
        let listing = self
            .session
            .list_tree(remote_root, &|dir| filter.descend(dir), budget)?;

        let mut plan = SyncPlan::default();
        let mut remote_files = HashSet::new();
        for entry in listing {
            match entry.kind {
                EntryKind::Symlink => {
                    if filter.allows(&entry.path, false) {
                        self.warnings.push(
                            WarningSource::FileSync,
                            format!("skipped remote symlink {}", entry.path),
                        );
                    }
                }
                EntryKind::Dir => {
                    if filter.allows(&entry.path, true) {
                        plan.directories.push(entry.path);
                    }
                }
                EntryKind::File => {
                    if !filter.allows(&entry.path, false) {
                        continue;
                    }
                    let local = safe_join(local_root, &entry.path)?;
                    remote_files.insert(entry.path.clone());
                    if is_identical(&local, &entry) {
                        plan.unchanged.push(entry.path);
                    } else {
                        plan.transfers.push(entry);
                    }
                }
            }
        }

        if opts.delete_extraneous {
            for rel in local_files(local_root)? {
                if rel.ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                // Excluded paths are left alone, like rsync without --delete-excluded.
                if !remote_files.contains(&rel) && filter.allows(&rel, false) {
                    plan.deletions.push(safe_join(local_root, &rel)?);
                }
            }
        }

        Ok(plan)
    }

    /// Sync `remote_root` into `local_root`.
    pub fn sync(
        &self,
        remote_root: &str,
        local_root: &Path,
        opts: &TransferOptions,
        budget: &Budget,
    ) -> Result<SyncStats> {
        let plan = self.plan(remote_root, local_root, opts, budget)?;
        if opts.dry_run {
            for entry in &plan.transfers {
                tracing::info!(path = %entry.path, size = entry.size, "would transfer");
            }
            for path in &plan.deletions {
                tracing::info!(path = %path.display(), "would delete");
            }
            return Ok(plan.stats());
        }

        fs::create_dir_all(local_root)?;
        for dir in &plan.directories {
            fs::create_dir_all(safe_join(local_root, dir)?)?;
        }

        let (files, bytes) = self.transfer_all(remote_root, local_root, &plan.transfers, opts, budget)?;

        let mut deleted = 0;
        for path in &plan.deletions {
            budget.check()?;
            match fs::remove_file(path) {
                Ok(()) => deleted += 1,
                Err(e) => self.warnings.push(
                    WarningSource::FileSync,
                    format!("could not delete {}: {}", path.display(), e),
                ),
            }
        }

        let stats = SyncStats {
            files,
            bytes,
            unchanged: plan.unchanged.len() as u64,
            deleted,
        };
        tracing::info!(
            remote = remote_root,
            files = stats.files,
            bytes = stats.bytes,
            unchanged = stats.unchanged,
            deleted = stats.deleted,
            "file sync finished"
        );
        Ok(stats)
    }

    fn transfer_all(
        &self,
        remote_root: &str,
        local_root: &Path,
        entries: &[RemoteEntry],
        opts: &TransferOptions,
        budget: &Budget,
    ) -> Result<(u64, u64)> {
        let throttle = Throttle::per_kib(opts.bandwidth_limit_kibibytes_per_sec);
        let next = AtomicUsize::new(0);
        let files = AtomicU64::new(0);
        let bytes = AtomicU64::new(0);
        let abort = AtomicBool::new(false);
        let first_error: Mutex<Option<StaxError>> = Mutex::new(None);
        let workers = opts.workers.max(1).min(entries.len().max(1));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    while !abort.load(Ordering::Relaxed) {
                        let idx = next.fetch_add(1, Ordering::Relaxed);
                        let Some(entry) = entries.get(idx) else { break };
                        let result = budget.check().and_then(|()| {
                            self.transfer_one(remote_root, local_root, entry, opts, throttle.clone(), budget)
                        });
                        match result {
                            Ok(n) => {
                                files.fetch_add(1, Ordering::Relaxed);
                                bytes.fetch_add(n, Ordering::Relaxed);
                            }
                            Err(e) => {
                                abort.store(true, Ordering::Relaxed);
                                if let Ok(mut slot) = first_error.lock()
                                    && slot.is_none()
                                {
                                    *slot = Some(e);
                                }
                            }
                        }
                    }
                });
            }
        });

        if let Some(e) = first_error.into_inner().ok().flatten() {
            return Err(e);
        }
        Ok((files.into_inner(), bytes.into_inner()))
    }

    fn transfer_one(
        &self,
        remote_root: &str,
        local_root: &Path,
        entry: &RemoteEntry,
        opts: &TransferOptions,
        throttle: Option<std::sync::Arc<Throttle>>,
        budget: &Budget,
    ) -> Result<u64> {
        let target = safe_join(local_root, &entry.path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial = target.with_file_name(format!(".{}{}", file_name, PARTIAL_SUFFIX));

        let result = (|| -> Result<u64> {
            let file = File::create(&partial)?;
            let mut writer = ThrottledWriter::new(BufWriter::new(file), throttle);
            let n = self
                .session
                .download(&join_remote(remote_root, &entry.path), &mut writer, budget)?;
            writer.flush()?;
            drop(writer);
            fs::rename(&partial, &target)?;
            Ok(n)
        })();

        let n = match result {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };

        if let Some(mtime) = entry.mtime {
            let handle = OpenOptions::new().write(true).open(&target)?;
            handle.set_modified(UNIX_EPOCH + Duration::from_secs(mtime))?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if opts.preserve_attributes
                && let Some(mode) = entry.mode
            {
                fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))?;
            }
        }
        #[cfg(not(unix))]
        let _ = opts;

        tracing::debug!(path = %entry.path, bytes = n, "transferred");
        Ok(n)
    }

    /// Compare file counts and total sizes on both sides. Differences are
    /// warnings, not failures. Returns the remote-side totals.
    pub fn verify(
        &self,
        remote_root: &str,
        local_root: &Path,
        opts: &TransferOptions,
        budget: &Budget,
    ) -> Result<SyncStats> {
        let filter = FilterSet::new(&opts.include_globs, &opts.exclude_globs)?;
        let listing = self
            .session
            .list_tree(remote_root, &|dir| filter.descend(dir), budget)?;

        let remote: Vec<&RemoteEntry> = listing
            .iter()
            .filter(|e| e.kind == EntryKind::File && filter.allows(&e.path, false))
            .collect();
        let remote_stats = SyncStats {
            files: remote.len() as u64,
            bytes: remote.iter().map(|e| e.size).sum(),
            ..Default::default()
        };

        let mut local_stats = SyncStats::default();
        for rel in local_files(local_root)? {
            if rel.ends_with(PARTIAL_SUFFIX) || !filter.allows(&rel, false) {
                continue;
            }
            local_stats.files += 1;
            local_stats.bytes += fs::metadata(local_root.join(&rel))?.len();
        }

        if remote_stats.files != local_stats.files || remote_stats.bytes != local_stats.bytes {
            self.warnings.push(
                WarningSource::FileSync,
                format!(
                    "verify {}: remote has {} files / {} bytes, local has {} files / {} bytes",
                    remote_root,
                    remote_stats.files,
                    remote_stats.bytes,
                    local_stats.files,
                    local_stats.bytes
                ),
            );
        }
        Ok(remote_stats)
    }
}

/// Seconds since the epoch for a `SystemTime`, used by tests and fakes.
pub fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    /// In-memory remote tree.
    #[derive(Default)]
    struct FakeRemote {
        files: BTreeMap<String, (Vec<u8>, u64)>,
        links: Vec<String>,
        downloads: AtomicUsize,
    }

    impl FakeRemote {
        fn file(mut self, path: &str, body: &str, mtime: u64) -> Self {
            self.files
                .insert(path.to_string(), (body.as_bytes().to_vec(), mtime));
            self
        }
    }

    impl RemoteSession for FakeRemote {
        fn exec_line(
            &self,
            _line: &str,
            _stdout: &mut dyn Write,
            _stderr: &mut dyn Write,
            _budget: &Budget,
        ) -> Result<i32> {
            Ok(0)
        }

        fn list_tree(
            &self,
            _root: &str,
            descend: &(dyn Fn(&str) -> bool + Sync),
            _budget: &Budget,
        ) -> Result<Vec<RemoteEntry>> {
            let mut dirs = std::collections::BTreeSet::new();
            let mut out = Vec::new();
            for (path, (body, mtime)) in &self.files {
                let mut parts: Vec<&str> = path.split('/').collect();
                parts.pop();
                let mut prefix = String::new();
                let mut visible = true;
                for part in parts {
                    if !prefix.is_empty() {
                        prefix.push('/');
                    }
                    prefix.push_str(part);
                    if dirs.insert(prefix.clone()) && visible {
                        out.push(RemoteEntry {
                            path: prefix.clone(),
                            kind: EntryKind::Dir,
                            size: 0,
                            mtime: None,
                            mode: None,
                        });
                    }
                    visible = visible && descend(&prefix);
                }
                if visible {
                    out.push(RemoteEntry {
                        path: path.clone(),
                        kind: EntryKind::File,
                        size: body.len() as u64,
                        mtime: Some(*mtime),
                        mode: Some(0o644),
                    });
                }
            }
            for link in &self.links {
                out.push(RemoteEntry {
                    path: link.clone(),
                    kind: EntryKind::Symlink,
                    size: 0,
                    mtime: None,
                    mode: None,
                });
            }
            Ok(out)
        }

        fn download(&self, remote: &str, out: &mut dyn Write, _budget: &Budget) -> Result<u64> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let rel = remote.trim_start_matches("/remote/");
            let (body, _) = self
                .files
                .get(rel)
                .ok_or_else(|| StaxError::transport(format!("no such file {}", remote)))?;
            out.write_all(body)?;
            Ok(body.len() as u64)
        }

        fn stat(&self, _remote: &str) -> Result<Option<RemoteEntry>> {
            Ok(None)
        }

        fn remove_file(&self, _remote: &str) -> Result<()> {
            Ok(())
        }
    }

    fn remote() -> FakeRemote {
        FakeRemote::default()
            .file("uploads/2024/a.jpg", "jpeg-bytes", 1_700_000_000)
            .file("plugins/p/p.php", "<?php", 1_700_000_100)
            .file("plugins/p/node_modules/x.js", "js", 1_700_000_100)
            .file("debug.log", "noise", 1_700_000_100)
    }

    #[test]
    fn sync_copies_filtered_tree_and_sets_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let fake = remote();
        let engine = SyncEngine::new(&fake, Warnings::new());

        let stats = engine
            .sync("/remote", dir.path(), &TransferOptions::default(), &Budget::unbounded("sync"))
            .unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes, 15);

        let jpg = dir.path().join("uploads/2024/a.jpg");
        assert_eq!(fs::read_to_string(&jpg).unwrap(), "jpeg-bytes");
        assert_eq!(
            epoch_secs(fs::metadata(&jpg).unwrap().modified().unwrap()),
            1_700_000_000
        );
        assert!(!dir.path().join("debug.log").exists());
        assert!(!dir.path().join("plugins/p/node_modules").exists());
    }

    #[test]
    fn second_sync_skips_identical_files() {
        let dir = tempfile::tempdir().unwrap();
        let fake = remote();
        let engine = SyncEngine::new(&fake, Warnings::new());
        let budget = Budget::unbounded("sync");

        engine.sync("/remote", dir.path(), &TransferOptions::default(), &budget).unwrap();
        let stats = engine
            .sync("/remote", dir.path(), &TransferOptions::default(), &budget)
            .unwrap();
        assert_eq!(stats.files, 0);
        assert_eq!(stats.unchanged, 2);
        assert_eq!(fake.downloads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fake = remote();
        let engine = SyncEngine::new(&fake, Warnings::new());
        let opts = TransferOptions {
            dry_run: true,
            ..Default::default()
        };

        let stats = engine
            .sync("/remote", dir.path(), &opts, &Budget::unbounded("sync"))
            .unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(fake.downloads.load(Ordering::SeqCst), 0);
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn extraneous_files_survive_unless_opted_in() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("local-only.txt"), "mine").unwrap();
        let fake = remote();
        let engine = SyncEngine::new(&fake, Warnings::new());
        let budget = Budget::unbounded("sync");

        engine.sync("/remote", dir.path(), &TransferOptions::default(), &budget).unwrap();
        assert!(dir.path().join("local-only.txt").exists());

        let opts = TransferOptions {
            delete_extraneous: true,
            ..Default::default()
        };
        let stats = engine.sync("/remote", dir.path(), &opts, &budget).unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(!dir.path().join("local-only.txt").exists());
    }

    #[test]
    fn remote_symlinks_become_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = remote();
        fake.links.push("uploads/latest".into());
        let warnings = Warnings::new();
        let engine = SyncEngine::new(&fake, warnings.clone());

        engine
            .sync("/remote", dir.path(), &TransferOptions::default(), &Budget::unbounded("sync"))
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings.snapshot()[0].message.contains("uploads/latest"));
    }

    #[test]
    fn verify_reports_differences_as_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let fake = remote();
        let warnings = Warnings::new();
        let engine = SyncEngine::new(&fake, warnings.clone());
        let budget = Budget::unbounded("verify");

        engine.verify("/remote", dir.path(), &TransferOptions::default(), &budget).unwrap();
        assert_eq!(warnings.len(), 1);

        engine.sync("/remote", dir.path(), &TransferOptions::default(), &budget).unwrap();
        let totals = engine
            .verify("/remote", dir.path(), &TransferOptions::default(), &budget)
            .unwrap();
        assert_eq!(totals.files, 2);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn cancelled_budget_stops_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let fake = remote();
        let engine = SyncEngine::new(&fake, Warnings::new());
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let budget = Budget::new(token, None, "sync");

        let err = engine
            .sync("/remote", dir.path(), &TransferOptions::default(), &budget)
            .unwrap_err();
        assert!(matches!(err, StaxError::Cancelled));
        assert_eq!(fake.downloads.load(Ordering::SeqCst), 0);
    }
}
