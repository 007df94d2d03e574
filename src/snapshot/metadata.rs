//! The `.metadata.yaml` sidecar.
//!
//! The file is a YAML sequence. New entries are appended as sequence items;
//! removals rewrite the whole file through a temp file and a rename.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::naming::SnapshotKind;
use crate::error::{Result, StaxError};

pub const FILE_NAME: &str = ".metadata.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub file_name: String,
    pub project_id: String,
    pub kind: SnapshotKind,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Sidecar {
    path: PathBuf,
}

impl Sidecar {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(FILE_NAME),
        }
    }

    pub fn read(&self) -> Result<Vec<MetadataEntry>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StaxError::snapshot_io(&self.path, e)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_yaml::from_str(&content).map_err(|e| {
            StaxError::snapshot_io(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
            )
        })
    }

    pub fn append(&self, entry: &MetadataEntry) -> Result<()> {
        let item = serde_yaml::to_string(&[entry])?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StaxError::snapshot_io(&self.path, e))?;
        file.write_all(item.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| StaxError::snapshot_io(&self.path, e))
    }

    /// Drop entries for the given file names. Returns how many were removed.
    pub fn remove(&self, file_names: &[&str]) -> Result<usize> {
        let entries = self.read()?;
        let before = entries.len();
        let kept: Vec<MetadataEntry> = entries
            .into_iter()
            .filter(|e| !file_names.contains(&e.file_name.as_str()))
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.rewrite(&kept)?;
        }
        Ok(removed)
    }

    fn rewrite(&self, entries: &[MetadataEntry]) -> Result<()> {
        let tmp = self.path.with_extension("yaml.tmp");
        let body = if entries.is_empty() {
            String::new()
        } else {
            serde_yaml::to_string(entries)?
        };
        fs::write(&tmp, body)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| StaxError::snapshot_io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(name: &str, description: Option<&str>) -> MetadataEntry {
        MetadataEntry {
            file_name: name.into(),
            project_id: "mysite".into(),
            kind: SnapshotKind::Manual,
            created_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            size_bytes: 42,
            description: description.map(str::to_string),
        }
    }

    #[test]
    fn appended_entries_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::new(dir.path());
        assert!(sidecar.read().unwrap().is_empty());

        sidecar.append(&entry("a.sql.gz", Some("before plugin update"))).unwrap();
        sidecar.append(&entry("b.sql.gz", None)).unwrap();

        let entries = sidecar.read().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].description.as_deref(), Some("before plugin update"));
        assert_eq!(entries[1].file_name, "b.sql.gz");
    }

    #[test]
    fn remove_rewrites_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::new(dir.path());
        sidecar.append(&entry("a.sql.gz", None)).unwrap();
        sidecar.append(&entry("b.sql.gz", None)).unwrap();

        assert_eq!(sidecar.remove(&["a.sql.gz", "zzz.sql.gz"]).unwrap(), 1);
        let entries = sidecar.read().unwrap();
        assert_eq!(entries, vec![entry("b.sql.gz", None)]);

        assert_eq!(sidecar.remove(&["b.sql.gz"]).unwrap(), 1);
        assert!(sidecar.read().unwrap().is_empty());
        sidecar.append(&entry("c.sql.gz", None)).unwrap();
        assert_eq!(sidecar.read().unwrap().len(), 1);
    }
}
