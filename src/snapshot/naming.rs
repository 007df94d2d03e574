//! Snapshot file names: `<project>-<YYYYMMDD-HHMMSS>-<kind>[-<n>].sql.gz`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StaxError};

pub const EXTENSION: &str = ".sql.gz";
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

static NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<project>[A-Za-z0-9._-]+)-(?P<ts>\d{8}-\d{6})-(?P<kind>auto|manual)(?:-(?P<n>\d+))?\.sql\.gz$",
    )
    .ok()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Taken by the pull pipeline before an import.
    Auto,
    /// Taken on request.
    Manual,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Auto => "auto",
            SnapshotKind::Manual => "manual",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotKind {
    type Err = StaxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(SnapshotKind::Auto),
            "manual" => Ok(SnapshotKind::Manual),
            other => Err(StaxError::invalid(format!(
                "unknown snapshot kind '{}' (expected auto or manual)",
                other
            ))),
        }
    }
}

/// Fields recoverable from a snapshot file name alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: SnapshotKind,
    pub counter: u32,
}

/// Project ids become part of file names and lock names.
pub fn check_project_id(project_id: &str) -> Result<()> {
    let ok = !project_id.is_empty()
        && !project_id.starts_with('.')
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(StaxError::invalid(format!(
            "project id '{}' may only contain letters, digits, '.', '_' and '-'",
            project_id
        )))
    }
}

pub fn file_name(
    project_id: &str,
    created_at: DateTime<Utc>,
    kind: SnapshotKind,
    counter: u32,
) -> String {
    let ts = created_at.format(TIMESTAMP_FORMAT);
    if counter == 0 {
        format!("{}-{}-{}{}", project_id, ts, kind, EXTENSION)
    } else {
        format!("{}-{}-{}-{}{}", project_id, ts, kind, counter, EXTENSION)
    }
}

pub fn parse(file_name: &str) -> Option<ParsedName> {
    let caps = NAME.as_ref()?.captures(file_name)?;
    let created_at = NaiveDateTime::parse_from_str(&caps["ts"], TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    Some(ParsedName {
        project_id: caps["project"].to_string(),
        created_at,
        kind: caps["kind"].parse().ok()?,
        counter: caps
            .name("n")
            .map(|n| n.as_str().parse().unwrap_or(0))
            .unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn names_round_trip_with_hyphenated_projects() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 14, 5, 7).unwrap();
        let name = file_name("my-site", at, SnapshotKind::Manual, 0);
        assert_eq!(name, "my-site-20260309-140507-manual.sql.gz");
        let parsed = parse(&name).unwrap();
        assert_eq!(parsed.project_id, "my-site");
        assert_eq!(parsed.created_at, at);
        assert_eq!(parsed.kind, SnapshotKind::Manual);

        let second = file_name("my-site", at, SnapshotKind::Manual, 2);
        assert_eq!(second, "my-site-20260309-140507-manual-2.sql.gz");
        assert_eq!(parse(&second).unwrap().counter, 2);
    }

    #[test]
    fn foreign_files_are_ignored() {
        assert!(parse(".metadata.yaml").is_none());
        assert!(parse("mysite-2026-03-09-auto.sql.gz").is_none());
        assert!(parse("mysite-20260309-140507-weekly.sql.gz").is_none());
    }

    #[test]
    fn project_ids_are_restricted() {
        assert!(check_project_id("my_site.v2").is_ok());
        assert!(check_project_id("../etc").is_err());
        assert!(check_project_id(".hidden").is_err());
        assert!(check_project_id("").is_err());
    }
}
