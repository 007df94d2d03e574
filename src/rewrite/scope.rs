//! Which tables a rewrite touches: single site, whole network, or one
//! subsite.

use std::sync::LazyLock;

use regex::Regex;

use crate::db::{ColumnInfo, Database, KeyValue, ScanRequest, TableInfo};
use crate::error::{Result, StaxError};

/// Tables a multisite network shares between all sites, without prefix.
pub const GLOBAL_TABLES: &[&str] = &[
    "users",
    "usermeta",
    "blogs",
    "blogmeta",
    "site",
    "sitemeta",
    "signups",
    "registration_log",
    "blog_versions",
];

static LOG_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(^|_)(logs?|log_entries|audit_?log|activity_?log|simple_history|redirection_404|actionscheduler_logs|wsal_occurrences|wsal_metadata)$").ok()
});

static LOG_COMMENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\b(logs?|logging|audit trail)\b").ok());

/// Whether a table holds logs, judged by its name or comment.
pub fn is_log_table(table: &TableInfo) -> bool {
    LOG_NAME.as_ref().is_some_and(|re| re.is_match(&table.name))
        || LOG_COMMENT.as_ref().is_some_and(|re| re.is_match(&table.comment))
}

/// Who a table belongs to in a (possibly multisite) install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOwner {
    /// Shared by every site of the network.
    Global,
    /// Belongs to one site. The main site is blog 1.
    Blog(u64),
    /// Outside the WordPress table prefix.
    Foreign,
}

pub fn classify(table: &str, prefix: &str) -> TableOwner {
    let Some(rest) = table.strip_prefix(prefix) else {
        return TableOwner::Foreign;
    };
    if let Some((id, tail)) = rest.split_once('_')
        && !id.is_empty()
        && !tail.is_empty()
        && id.bytes().all(|b| b.is_ascii_digit())
        && let Ok(id) = id.parse::<u64>()
    {
        return TableOwner::Blog(id);
    }
    if GLOBAL_TABLES.contains(&rest) {
        TableOwner::Global
    } else {
        TableOwner::Blog(1)
    }
}

/// Table prefix of one blog: `wp_` for the main site, `wp_<id>_` otherwise.
pub fn blog_prefix(prefix: &str, blog_id: u64) -> String {
    if blog_id == 1 {
        prefix.to_string()
    } else {
        format!("{}{}_", prefix, blog_id)
    }
}

/// One row of `<prefix>blogs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub blog_id: u64,
    pub domain: String,
    pub path: String,
}

impl Site {
    pub fn matches(&self, host: &str, path: &str) -> bool {
        self.domain.eq_ignore_ascii_case(host) && normalize_path(&self.path) == normalize_path(path)
    }
}

/// `/`-terminated path with a leading `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// Host and path of a site URL.
pub fn split_url(url: &str) -> Result<(String, String)> {
    let absolute = if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{}", url.trim_start_matches("//"))
    };
    let parsed = reqwest::Url::parse(&absolute)
        .map_err(|e| StaxError::invalid(format!("'{}' is not a site URL: {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| StaxError::invalid(format!("'{}' has no host", url)))?;
    let host = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    Ok((host, normalize_path(parsed.path())))
}

/// Sites of a network, or `None` when the install is single-site.
pub fn network_sites(db: &dyn Database, prefix: &str) -> Result<Option<Vec<Site>>> {
    let table = format!("{}blogs", prefix);
    if !db.tables()?.iter().any(|t| t.name == table) {
        return Ok(None);
    }
    let columns = db.columns(&table)?;
    let key: Vec<ColumnInfo> = columns
        .iter()
        .filter(|c| c.name == "blog_id")
        .cloned()
        .collect();
    if key.is_empty() {
        return Err(StaxError::invalid(format!("{} has no blog_id column", table)));
    }
    let wanted = ["domain".to_string(), "path".to_string()];

    let mut sites = Vec::new();
    let mut after = None;
    loop {
        let rows = db.scan(&ScanRequest {
            table: &table,
            key_columns: &key,
            columns: &wanted,
            after: after.as_ref(),
            needles: &[],
            predicates: &[],
            limit: 500,
        })?;
        let Some(last) = rows.last() else { break };
        after = Some(last.key.clone());
        for row in &rows {
            let blog_id = match row.key.0.first() {
                Some(KeyValue::Int(i)) => u64::try_from(*i).unwrap_or_default(),
                Some(KeyValue::Bytes(b)) => String::from_utf8_lossy(b).parse().unwrap_or_default(),
                None => 0,
            };
            let text = |i: usize| {
                row.values
                    .get(i)
                    .and_then(|v| v.as_ref())
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default()
            };
            sites.push(Site {
                blog_id,
                domain: text(0),
                path: text(1),
            });
        }
    }
    Ok(Some(sites))
}
