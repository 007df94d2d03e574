//! Schema-aware URL rewriter.
//!
//! Every text column of every in-scope table is scanned in primary-key
//! order, in bounded pages, for rows containing a `from` URL. Matching
//! values are rewritten payload-aware (see [`payload`]) and written back
//! inside one transaction per table. `guid` columns are never touched.

mod payload;
mod php;
mod scope;

use std::collections::{BTreeMap, HashSet};

pub use payload::{PayloadKind, Replacer, Rewritten, detect, rewrite as rewrite_value};
pub use php::{PhpError, PhpValue, looks_serialized};
pub use scope::{
    GLOBAL_TABLES, Site, TableOwner, blog_prefix, classify, is_log_table, network_sites,
    normalize_path, split_url,
};

use crate::db::{ColumnInfo, Database, DbError, Predicate, RowKey, ScanRequest, TableInfo};
use crate::error::{Result, StaxError};
use crate::process::Budget;
use crate::warnings::{WarningSource, Warnings};

/// Rows per scan page and per flush.
pub const DEFAULT_BATCH_SIZE: usize = 500;

const TRANSIENT_PREFIXES: &[&[u8]] = &[b"_transient_", b"_site_transient_"];

const SITE_OPTIONS: &[&str] = &["siteurl", "home"];

/// One `from → to` substitution, optionally limited to a single subsite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementPair {
    pub from: String,
    pub to: String,
    /// `siteurl` of the only subsite whose tables this pair applies to.
    pub site_url_constraint: Option<String>,
}

impl ReplacementPair {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            site_url_constraint: None,
        }
    }

    pub fn for_site(mut self, site_url: impl Into<String>) -> Self {
        self.site_url_constraint = Some(site_url.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RewriteMode {
    #[default]
    SingleSite,
    /// Every site of a multisite network plus the shared tables.
    Network,
    /// Only the tables of the subsite with this `siteurl`.
    Scoped { site_url: String },
}

#[derive(Debug, Clone)]
pub struct RewriteOptions {
    pub mode: RewriteMode,
    pub table_prefix: String,
    /// Also visit tables outside the prefix.
    pub all_tables: bool,
    /// Exact table names to leave alone.
    pub skip_tables: Vec<String>,
    pub skip_logs: bool,
    pub skip_transients: bool,
    pub skip_spam: bool,
    pub dry_run: bool,
    pub batch_size: usize,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            mode: RewriteMode::SingleSite,
            table_prefix: "wp_".to_string(),
            all_tables: false,
            skip_tables: Vec::new(),
            skip_logs: false,
            skip_transients: false,
            skip_spam: false,
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableReport {
    pub table: String,
    pub rows_changed: usize,
    /// Rewritten values per column.
    pub columns: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub tables: Vec<TableReport>,
    /// `(table, reason)` for tables left out on purpose.
    pub skipped: Vec<(String, String)>,
    /// `(table, cause)` for tables abandoned after a constraint violation.
    pub failed: Vec<(String, String)>,
    /// `siteurl`/`home` options and network domain rows updated.
    pub site_records: usize,
    pub dry_run: bool,
}

impl RewriteReport {
    pub fn replacements(&self) -> usize {
        self.tables.iter().flat_map(|t| t.columns.values()).sum()
    }

    pub fn rows_changed(&self) -> usize {
        self.tables.iter().map(|t| t.rows_changed).sum()
    }
}

/// Columns never rewritten, by table suffix after the blog prefix.
fn skipped_columns(suffix: &str) -> &'static [&'static str] {
    match suffix {
        "posts" => &["guid"],
        _ => &[],
    }
}

/// Table name without its blog prefix, e.g. `wp_2_posts` → `posts`.
fn table_suffix<'t>(table: &'t str, prefix: &str) -> &'t str {
    match classify(table, prefix) {
        TableOwner::Foreign => table,
        TableOwner::Global | TableOwner::Blog(1) => &table[prefix.len()..],
        TableOwner::Blog(id) => &table[blog_prefix(prefix, id).len()..],
    }
}

enum TableError {
    Db(DbError),
    Stop(StaxError),
}

impl From<DbError> for TableError {
    fn from(e: DbError) -> Self {
        TableError::Db(e)
    }
}

/// A host/path move derived from a pair of site URLs.
#[derive(Debug, Clone)]
struct DomainMove {
    from_host: String,
    from_path: String,
    to_host: String,
    to_path: String,
}

impl DomainMove {
    fn from_pair(pair: &ReplacementPair) -> Option<Self> {
        let (from_host, from_path) = split_url(&pair.from).ok()?;
        let (to_host, to_path) = split_url(&pair.to).ok()?;
        Some(Self {
            from_host,
            from_path,
            to_host,
            to_path,
        })
    }

    /// New `(domain, path)` for a site row, if this move covers it.
    fn apply(&self, domain: &str, path: &str) -> Option<(String, String)> {
        let path = normalize_path(path);
        if !domain.eq_ignore_ascii_case(&self.from_host) || !path.starts_with(&self.from_path) {
            return None;
        }
        let rest = &path[self.from_path.len()..];
        Some((self.to_host.clone(), format!("{}{}", self.to_path, rest)))
    }
}

fn strip_scheme(url: &str) -> &str {
    let url = url.trim_end_matches('/');
    url.split_once("://").map(|(_, rest)| rest).unwrap_or(url)
}

pub struct UrlRewriter<'a> {
    db: &'a dyn Database,
    options: RewriteOptions,
    warnings: Warnings,
}

impl<'a> UrlRewriter<'a> {
    pub fn new(db: &'a dyn Database, options: RewriteOptions, warnings: Warnings) -> Self {
        Self {
            db,
            options,
            warnings,
        }
    }

    pub fn run(&self, pairs: &[ReplacementPair], budget: &Budget) -> Result<RewriteReport> {
        if pairs.is_empty() {
            return Err(StaxError::invalid("no replacement pairs given"));
        }
        for pair in pairs {
            if pair.from.is_empty() || pair.from == pair.to {
                return Err(StaxError::invalid(format!(
                    "replacement '{}' -> '{}' changes nothing",
                    pair.from, pair.to
                )));
            }
        }

        let prefix = self.options.table_prefix.as_str();
        let sites = network_sites(self.db, prefix)?;
        let blogs = self.blogs_in_scope(sites.as_deref())?;
        let constraints = self.resolve_constraints(pairs, sites.as_deref())?;

        let mut report = RewriteReport {
            dry_run: self.options.dry_run,
            ..Default::default()
        };

        for table in self.db.tables()? {
            budget.check()?;
            let owner = classify(&table.name, prefix);
            let in_scope = match owner {
                TableOwner::Foreign => self.options.all_tables,
                TableOwner::Global => !matches!(self.options.mode, RewriteMode::Scoped { .. }),
                TableOwner::Blog(id) => blogs.as_ref().is_none_or(|b| b.contains(&id)),
            };
            if !in_scope {
                continue;
            }
            if self.options.skip_tables.iter().any(|s| s == &table.name) {
                report.skipped.push((table.name.clone(), "excluded".into()));
                continue;
            }
            if self.options.skip_logs && is_log_table(&table) {
                report.skipped.push((table.name.clone(), "log table".into()));
                continue;
            }

            let applicable: Vec<(String, String)> = pairs
                .iter()
                .zip(&constraints)
                .filter(|(_, c)| match (c, owner) {
                    (None, _) => true,
                    (Some(blog), TableOwner::Blog(id)) => *blog == id,
                    (Some(_), _) => false,
                })
                .map(|(p, _)| (p.from.clone(), p.to.clone()))
                .collect();
            if applicable.is_empty() {
                continue;
            }
            let replacer = Replacer::new(&applicable);

            match self.rewrite_table_with_retry(&table, &replacer, budget) {
                Ok(Some(t)) => report.tables.push(t),
                Ok(None) => report
                    .skipped
                    .push((table.name.clone(), "no usable primary key".into())),
                Err(TableError::Db(DbError::Constraint(cause))) => {
                    self.warnings.push(
                        WarningSource::Rewrite,
                        format!("{}: constraint violation, table left unchanged: {}", table.name, cause),
                    );
                    report.failed.push((table.name.clone(), cause));
                }
                Err(TableError::Db(e)) => return Err(StaxError::rewrite(&table.name, e)),
                Err(TableError::Stop(e)) => return Err(e),
            }
        }

        report.site_records = self
            .update_site_records(pairs, &constraints, sites.as_deref(), blogs.as_ref(), budget)
            .map_err(|e| match e {
                TableError::Db(e) => StaxError::rewrite("site records", e),
                TableError::Stop(e) => e,
            })?;

        tracing::info!(
            tables = report.tables.len(),
            rows = report.rows_changed(),
            replacements = report.replacements(),
            site_records = report.site_records,
            dry_run = report.dry_run,
            "URL rewrite finished"
        );
        Ok(report)
    }

    /// Blog ids whose tables are in scope. `None` means every blog.
    fn blogs_in_scope(&self, sites: Option<&[Site]>) -> Result<Option<HashSet<u64>>> {
        match (&self.options.mode, sites) {
            (RewriteMode::SingleSite, _) => Ok(None),
            (RewriteMode::Network, None) => Err(StaxError::invalid(
                "network mode needs a multisite install, but there is no blogs table",
            )),
            (RewriteMode::Network, Some(sites)) => {
                let mut ids: HashSet<u64> = sites.iter().map(|s| s.blog_id).collect();
                ids.insert(1);
                Ok(Some(ids))
            }
            (RewriteMode::Scoped { site_url }, sites) => {
                let id = self.blog_for_url(site_url, sites)?;
                Ok(Some(HashSet::from([id])))
            }
        }
    }

    fn blog_for_url(&self, site_url: &str, sites: Option<&[Site]>) -> Result<u64> {
        let Some(sites) = sites else {
            return Err(StaxError::invalid(format!(
                "cannot scope to {}: not a multisite install",
                site_url
            )));
        };
        let (host, path) = split_url(site_url)?;
        sites
            .iter()
            .find(|s| s.matches(&host, &path))
            .map(|s| s.blog_id)
            .ok_or_else(|| StaxError::invalid(format!("no site in the network has URL {}", site_url)))
    }

    fn resolve_constraints(
        &self,
        pairs: &[ReplacementPair],
        sites: Option<&[Site]>,
    ) -> Result<Vec<Option<u64>>> {
        pairs
            .iter()
            .map(|p| match &p.site_url_constraint {
                None => Ok(None),
                Some(url) if sites.is_none() => {
                    tracing::debug!(site = %url, "single-site install; constraint maps to the main site");
                    Ok(Some(1))
                }
                Some(url) => self.blog_for_url(url, sites).map(Some),
            })
            .collect()
    }

    fn rewrite_table_with_retry(
        &self,
        table: &TableInfo,
        replacer: &Replacer,
        budget: &Budget,
    ) -> std::result::Result<Option<TableReport>, TableError> {
        match self.rewrite_table(table, replacer, budget) {
            Err(TableError::Db(DbError::Connection(cause))) => {
                self.warnings.push(
                    WarningSource::Rewrite,
                    format!("{}: connection lost ({}), retrying table once", table.name, cause),
                );
                self.rewrite_table(table, replacer, budget)
            }
            other => other,
        }
    }

    fn key_columns(&self, table: &str, columns: &[ColumnInfo]) -> Option<Vec<ColumnInfo>> {
        let keys: Vec<ColumnInfo> = columns.iter().filter(|c| c.is_primary).cloned().collect();
        if !keys.is_empty() {
            return Some(keys);
        }
        match self.db.row_id() {
            Some(row_id) => Some(vec![row_id]),
            None => {
                self.warnings.push(
                    WarningSource::Rewrite,
                    format!("{}: no primary key, table skipped", table),
                );
                None
            }
        }
    }

    fn row_predicates(&self, suffix: &str, columns: &[ColumnInfo]) -> Vec<Predicate> {
        let has = |name: &str| columns.iter().any(|c| c.name == name);
        let mut predicates = Vec::new();
        if self.options.skip_transients {
            let column = match suffix {
                "options" if has("option_name") => Some("option_name"),
                "sitemeta" if has("meta_key") => Some("meta_key"),
                _ => None,
            };
            if let Some(column) = column {
                for prefix in TRANSIENT_PREFIXES {
                    predicates.push(Predicate::NotPrefix {
                        column: column.to_string(),
                        prefix: prefix.to_vec(),
                    });
                }
            }
        }
        if self.options.skip_spam && suffix == "comments" && has("comment_approved") {
            predicates.push(Predicate::NotEquals {
                column: "comment_approved".to_string(),
                value: b"spam".to_vec(),
            });
        }
        predicates
    }

    fn rewrite_table(
        &self,
        table: &TableInfo,
        replacer: &Replacer,
        budget: &Budget,
    ) -> std::result::Result<Option<TableReport>, TableError> {
        let name = table.name.as_str();
        let columns = self.db.columns(name)?;
        let Some(keys) = self.key_columns(name, &columns) else {
            return Ok(None);
        };
        let suffix = table_suffix(name, &self.options.table_prefix);
        let skipped = skipped_columns(suffix);
        let candidates: Vec<String> = columns
            .iter()
            .filter(|c| c.is_text() && !c.is_primary && !skipped.contains(&c.name.as_str()))
            .map(|c| c.name.clone())
            .collect();

        let mut report = TableReport {
            table: name.to_string(),
            ..Default::default()
        };
        if candidates.is_empty() {
            return Ok(Some(report));
        }
        let predicates = self.row_predicates(suffix, &columns);
        let needles = replacer.needles();
        let writing = !self.options.dry_run;

        if writing {
            self.db.begin()?;
        }
        let outcome = self.scan_and_update(
            name,
            &keys,
            &candidates,
            &needles,
            &predicates,
            replacer,
            budget,
            &mut report,
        );
        let outcome = match outcome {
            Ok(()) if writing => self.db.commit().map_err(TableError::Db),
            other => other,
        };
        if let Err(e) = outcome {
            if writing && let Err(rb) = self.db.rollback() {
                tracing::warn!(table = name, error = %rb, "rollback failed");
            }
            return Err(e);
        }

        if report.rows_changed > 0 {
            tracing::info!(
                table = name,
                rows = report.rows_changed,
                columns = ?report.columns,
                "table rewritten"
            );
        }
        Ok(Some(report))
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_and_update(
        &self,
        table: &str,
        keys: &[ColumnInfo],
        candidates: &[String],
        needles: &[Vec<u8>],
        predicates: &[Predicate],
        replacer: &Replacer,
        budget: &Budget,
        report: &mut TableReport,
    ) -> std::result::Result<(), TableError> {
        let limit = self.options.batch_size.max(1);
        let mut after: Option<RowKey> = None;
        loop {
            budget.check().map_err(TableError::Stop)?;
            let rows = self.db.scan(&ScanRequest {
                table,
                key_columns: keys,
                columns: candidates,
                after: after.as_ref(),
                needles,
                predicates,
                limit,
            })?;

            for row in &rows {
                let mut changed = false;
                for (column, value) in candidates.iter().zip(&row.values) {
                    let Some(value) = value else { continue };
                    let Some(rewritten) = rewrite_value(replacer, value) else {
                        continue;
                    };
                    for fallback in &rewritten.fallbacks {
                        self.warnings.push(
                            WarningSource::Rewrite,
                            format!(
                                "{}.{} row {}: {}; replaced as plain text",
                                table, column, row.key, fallback
                            ),
                        );
                    }
                    if !self.options.dry_run {
                        self.db
                            .update(table, keys, &row.key, column, &rewritten.value)?;
                    }
                    *report.columns.entry(column.clone()).or_default() += 1;
                    changed = true;
                }
                if changed {
                    report.rows_changed += 1;
                }
            }
            if !self.options.dry_run {
                self.db.flush()?;
            }

            match rows.last() {
                Some(last) if rows.len() == limit => after = Some(last.key.clone()),
                _ => return Ok(()),
            }
        }
    }

    /// `siteurl`/`home` options written with a different scheme, plus
    /// network `domain`/`path` rows.
    fn update_site_records(
        &self,
        pairs: &[ReplacementPair],
        constraints: &[Option<u64>],
        sites: Option<&[Site]>,
        blogs: Option<&HashSet<u64>>,
        budget: &Budget,
    ) -> std::result::Result<usize, TableError> {
        let prefix = self.options.table_prefix.as_str();
        let tables: HashSet<String> = self
            .db
            .tables()?
            .into_iter()
            .map(|t| t.name)
            .filter(|t| !self.options.skip_tables.contains(t))
            .collect();
        let mut updated = 0;

        // Options tables of every blog in scope.
        let blog_ids: Vec<u64> = match (blogs, sites) {
            (Some(b), _) => b.iter().copied().collect(),
            (None, Some(s)) => s.iter().map(|s| s.blog_id).collect(),
            (None, None) => vec![1],
        };
        for id in blog_ids {
            budget.check().map_err(TableError::Stop)?;
            let table = format!("{}options", blog_prefix(prefix, id));
            if !tables.contains(&table) {
                continue;
            }
            let rules: Vec<(&str, &str)> = pairs
                .iter()
                .zip(constraints)
                .filter(|(_, c)| c.is_none_or(|b| b == id))
                .map(|(p, _)| (strip_scheme(&p.from), p.to.as_str()))
                .collect();
            updated += self.update_rows(&table, &["option_value"], Some(("option_name", SITE_OPTIONS)), |_, values| {
                let current = String::from_utf8_lossy(values[0].as_deref()?).into_owned();
                let (_, to) = rules.iter().find(|(from, _)| strip_scheme(&current) == *from)?;
                let mut new = to.trim_end_matches('/').to_string();
                if current.ends_with('/') {
                    new.push('/');
                }
                (new != current).then(|| vec![Some(new.into_bytes())])
            })?;
        }

        let network = matches!(
            self.options.mode,
            RewriteMode::Network | RewriteMode::Scoped { .. }
        );
        if !network || sites.is_none() {
            return Ok(updated);
        }
        let moves: Vec<DomainMove> = pairs
            .iter()
            .filter(|p| p.site_url_constraint.is_none())
            .filter_map(DomainMove::from_pair)
            .collect();
        let pick = |domain: &str, path: &str| {
            moves
                .iter()
                .filter_map(|m| m.apply(domain, path).map(|to| (m.from_path.len(), to)))
                .max_by_key(|(len, _)| *len)
                .map(|(_, to)| to)
        };
        let domain_update = |_: &RowKey, values: &[Option<Vec<u8>>]| {
            let domain = String::from_utf8_lossy(values[0].as_deref()?).into_owned();
            let path = String::from_utf8_lossy(values[1].as_deref()?).into_owned();
            let (new_domain, new_path) = pick(&domain, &path)?;
            if new_domain == domain && new_path == path {
                return None;
            }
            Some(vec![Some(new_domain.into_bytes()), Some(new_path.into_bytes())])
        };

        budget.check().map_err(TableError::Stop)?;
        let blogs_table = format!("{}blogs", prefix);
        if tables.contains(&blogs_table) {
            let scoped = match (&self.options.mode, blogs) {
                (RewriteMode::Scoped { .. }, Some(ids)) => Some(ids),
                _ => None,
            };
            updated += self.update_rows(&blogs_table, &["domain", "path"], None, |key, values| {
                if let Some(ids) = scoped {
                    let id: u64 = key.to_string().parse().ok()?;
                    if !ids.contains(&id) {
                        return None;
                    }
                }
                domain_update(key, values)
            })?;
        }
        let site_table = format!("{}site", prefix);
        if matches!(self.options.mode, RewriteMode::Network) && tables.contains(&site_table) {
            updated += self.update_rows(&site_table, &["domain", "path"], None, domain_update)?;
        }
        Ok(updated)
    }

    /// Scan `columns` of a small table and write back the values `change`
    /// returns, positionally. `None` entries are left as they are.
    fn update_rows<F>(
        &self,
        table: &str,
        columns: &[&str],
        only: Option<(&str, &[&str])>,
        change: F,
    ) -> std::result::Result<usize, TableError>
    where
        F: Fn(&RowKey, &[Option<Vec<u8>>]) -> Option<Vec<Option<Vec<u8>>>>,
    {
        let all = self.db.columns(table)?;
        if !columns.iter().all(|c| all.iter().any(|a| a.name == *c)) {
            return Ok(0);
        }
        let Some(keys) = self.key_columns(table, &all) else {
            return Ok(0);
        };
        let wanted: Vec<String> = columns.iter().map(|c| c.to_string()).collect();

        let mut pending: Vec<(RowKey, Vec<Option<Vec<u8>>>)> = Vec::new();
        let selectors: Vec<Vec<Predicate>> = match only {
            Some((column, values)) => values
                .iter()
                .map(|v| {
                    vec![Predicate::Equals {
                        column: column.to_string(),
                        value: v.as_bytes().to_vec(),
                    }]
                })
                .collect(),
            None => vec![Vec::new()],
        };
        for predicates in &selectors {
            let mut after: Option<RowKey> = None;
            loop {
                let rows = self.db.scan(&ScanRequest {
                    table,
                    key_columns: &keys,
                    columns: &wanted,
                    after: after.as_ref(),
                    needles: &[],
                    predicates,
                    limit: DEFAULT_BATCH_SIZE,
                })?;
                for row in &rows {
                    if let Some(new) = change(&row.key, &row.values) {
                        pending.push((row.key.clone(), new));
                    }
                }
                match rows.last() {
                    Some(last) if rows.len() == DEFAULT_BATCH_SIZE => after = Some(last.key.clone()),
                    _ => break,
                }
            }
        }
        if pending.is_empty() || self.options.dry_run {
            return Ok(pending.len());
        }

        self.db.begin()?;
        let written = (|| -> std::result::Result<(), DbError> {
            for (key, values) in &pending {
                for (column, value) in columns.iter().zip(values) {
                    if let Some(value) = value {
                        self.db.update(table, &keys, key, column, value)?;
                    }
                }
            }
            self.db.flush()?;
            self.db.commit()
        })();
        if let Err(e) = written {
            if let Err(rb) = self.db.rollback() {
                tracing::warn!(table, error = %rb, "rollback failed");
            }
            return Err(TableError::Db(e));
        }
        Ok(pending.len())
    }

    /// Replace user emails with `user<ID>@example.test` and clear
    /// activation keys. Returns the number of users changed.
    pub fn sanitize_users(&self, budget: &Budget) -> Result<usize> {
        budget.check()?;
        let table = format!("{}users", self.options.table_prefix);
        if !self.db.tables()?.iter().any(|t| t.name == table) {
            return Ok(0);
        }
        let changed = self
            .update_rows(&table, &["user_email", "user_activation_key"], None, |key, values| {
                let email = format!("user{}@example.test", key);
                let new_email = (values[0].as_deref() != Some(email.as_bytes()))
                    .then(|| email.into_bytes());
                let clear_key = values[1].as_deref().is_some_and(|k| !k.is_empty()).then(Vec::new);
                if new_email.is_none() && clear_key.is_none() {
                    return None;
                }
                Some(vec![new_email, clear_key])
            })
            .map_err(|e| match e {
                TableError::Db(e) => StaxError::rewrite(&table, e),
                TableError::Stop(e) => e,
            })?;
        tracing::info!(table = %table, users = changed, "user data sanitized");
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;

    const REMOTE: &str = "https://example.wpengine.com";
    const LOCAL: &str = "https://mysite.ddev.site";

    fn single_site() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch(
            r#"
            CREATE TABLE wp_options (option_id INTEGER PRIMARY KEY, option_name VARCHAR(191), option_value LONGTEXT);
            INSERT INTO wp_options VALUES (1, 'siteurl', 'https://example.wpengine.com');
            INSERT INTO wp_options VALUES (2, 'home', 'http://example.wpengine.com/');
            INSERT INTO wp_options VALUES (3, 'widget', 'a:1:{s:3:"url";s:28:"https://example.wpengine.com";}');
            INSERT INTO wp_options VALUES (4, '_transient_feed', 'https://example.wpengine.com/feed');
            CREATE TABLE wp_posts (ID INTEGER PRIMARY KEY, post_content LONGTEXT, guid VARCHAR(255));
            INSERT INTO wp_posts VALUES (1, '<a href="https://example.wpengine.com/about">About</a>', 'https://example.wpengine.com/?p=1');
            CREATE TABLE wp_comments (comment_ID INTEGER PRIMARY KEY, comment_content TEXT, comment_approved VARCHAR(20));
            INSERT INTO wp_comments VALUES (1, 'see https://example.wpengine.com', '1');
            INSERT INTO wp_comments VALUES (2, 'buy https://example.wpengine.com', 'spam');
            CREATE TABLE wp_stats (id INTEGER PRIMARY KEY, url BLOB);
            INSERT INTO wp_stats VALUES (1, CAST('https://example.wpengine.com' AS BLOB));
            "#,
        )
        .unwrap();
        db
    }

    fn value(db: &SqliteDatabase, sql: &str) -> String {
        db.query_column(sql).unwrap().remove(0).unwrap_or_default()
    }

    fn run(db: &SqliteDatabase, options: RewriteOptions, pairs: &[ReplacementPair]) -> RewriteReport {
        UrlRewriter::new(db, options, Warnings::new())
            .run(pairs, &Budget::unbounded("rewrite"))
            .unwrap()
    }

    #[test]
    fn single_site_rewrite_leaves_guid_alone() {
        let db = single_site();
        let report = run(&db, RewriteOptions::default(), &[ReplacementPair::new(REMOTE, LOCAL)]);

        assert_eq!(value(&db, "SELECT option_value FROM wp_options WHERE option_id = 1"), LOCAL);
        assert_eq!(
            value(&db, "SELECT option_value FROM wp_options WHERE option_id = 2"),
            "https://mysite.ddev.site/"
        );
        assert_eq!(
            value(&db, "SELECT option_value FROM wp_options WHERE option_id = 3"),
            r#"a:1:{s:3:"url";s:24:"https://mysite.ddev.site";}"#
        );
        assert_eq!(
            value(&db, "SELECT post_content FROM wp_posts"),
            r#"<a href="https://mysite.ddev.site/about">About</a>"#
        );
        assert_eq!(value(&db, "SELECT guid FROM wp_posts"), "https://example.wpengine.com/?p=1");
        // Binary columns are not text.
        assert_eq!(
            value(&db, "SELECT CAST(url AS TEXT) FROM wp_stats"),
            "https://example.wpengine.com"
        );
        assert_eq!(report.site_records, 1);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn second_run_changes_nothing() {
        let db = single_site();
        let pairs = [ReplacementPair::new(REMOTE, LOCAL)];
        let first = run(&db, RewriteOptions::default(), &pairs);
        assert!(first.replacements() > 0);
        let second = run(&db, RewriteOptions::default(), &pairs);
        assert_eq!(second.replacements(), 0);
        assert_eq!(second.site_records, 0);
    }

    #[test]
    fn row_level_skips() {
        let db = single_site();
        let options = RewriteOptions {
            skip_transients: true,
            skip_spam: true,
            ..Default::default()
        };
        run(&db, options, &[ReplacementPair::new(REMOTE, LOCAL)]);
        assert_eq!(
            value(&db, "SELECT option_value FROM wp_options WHERE option_id = 4"),
            "https://example.wpengine.com/feed"
        );
        assert_eq!(
            value(&db, "SELECT comment_content FROM wp_comments WHERE comment_ID = 1"),
            "see https://mysite.ddev.site"
        );
        assert_eq!(
            value(&db, "SELECT comment_content FROM wp_comments WHERE comment_ID = 2"),
            "buy https://example.wpengine.com"
        );
    }

    #[test]
    fn dry_run_counts_without_writing() {
        let db = single_site();
        let options = RewriteOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = run(&db, options, &[ReplacementPair::new(REMOTE, LOCAL)]);
        assert!(report.replacements() >= 5);
        assert_eq!(
            value(&db, "SELECT option_value FROM wp_options WHERE option_id = 1"),
            REMOTE
        );
    }

    #[test]
    fn small_batches_cover_every_row() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE wp_postmeta (meta_id INTEGER PRIMARY KEY, meta_value LONGTEXT);")
            .unwrap();
        for i in 1..=23 {
            db.execute_batch(&format!(
                "INSERT INTO wp_postmeta VALUES ({}, 'https://example.wpengine.com/{}');",
                i, i
            ))
            .unwrap();
        }
        let options = RewriteOptions {
            batch_size: 5,
            ..Default::default()
        };
        let report = run(&db, options, &[ReplacementPair::new(REMOTE, LOCAL)]);
        assert_eq!(report.rows_changed(), 23);
        assert_eq!(
            value(&db, "SELECT count(*) FROM wp_postmeta WHERE meta_value LIKE 'https://mysite.ddev.site/%'"),
            "23"
        );
    }

    #[test]
    fn excluded_and_log_tables_are_skipped() {
        let db = single_site();
        db.execute_batch(
            "CREATE TABLE wp_actionscheduler_logs (log_id INTEGER PRIMARY KEY, message TEXT);
             INSERT INTO wp_actionscheduler_logs VALUES (1, 'fetched https://example.wpengine.com');",
        )
        .unwrap();
        let options = RewriteOptions {
            skip_logs: true,
            skip_tables: vec!["wp_comments".into()],
            ..Default::default()
        };
        let report = run(&db, options, &[ReplacementPair::new(REMOTE, LOCAL)]);
        assert!(report.skipped.contains(&("wp_comments".to_string(), "excluded".to_string())));
        assert!(report
            .skipped
            .iter()
            .any(|(t, _)| t == "wp_actionscheduler_logs"));
        assert_eq!(
            value(&db, "SELECT message FROM wp_actionscheduler_logs"),
            "fetched https://example.wpengine.com"
        );
    }

    #[test]
    fn cancelled_budget_rolls_back() {
        let db = single_site();
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let err = UrlRewriter::new(&db, RewriteOptions::default(), Warnings::new())
            .run(
                &[ReplacementPair::new(REMOTE, LOCAL)],
                &Budget::new(token, None, "rewrite"),
            )
            .unwrap_err();
        assert!(matches!(err, StaxError::Cancelled));
        assert_eq!(
            value(&db, "SELECT option_value FROM wp_options WHERE option_id = 1"),
            REMOTE
        );
    }

    #[test]
    fn sanitize_replaces_emails() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE wp_users (ID INTEGER PRIMARY KEY, user_email VARCHAR(100), user_activation_key VARCHAR(255));
             INSERT INTO wp_users VALUES (1, 'admin@client.com', 'abc');
             INSERT INTO wp_users VALUES (7, 'editor@client.com', '');",
        )
        .unwrap();
        let rewriter = UrlRewriter::new(&db, RewriteOptions::default(), Warnings::new());
        assert_eq!(rewriter.sanitize_users(&Budget::unbounded("sanitize")).unwrap(), 2);
        assert_eq!(
            db.query_column("SELECT user_email FROM wp_users ORDER BY ID").unwrap(),
            vec![
                Some("user1@example.test".to_string()),
                Some("user7@example.test".to_string())
            ]
        );
        assert_eq!(value(&db, "SELECT user_activation_key FROM wp_users WHERE ID = 1"), "");
        assert_eq!(rewriter.sanitize_users(&Budget::unbounded("sanitize")).unwrap(), 0);
    }

    #[test]
    fn failed_sanitize_rolls_back_every_user() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE wp_users (ID INTEGER PRIMARY KEY, user_email VARCHAR(100) UNIQUE, user_activation_key VARCHAR(255));
             INSERT INTO wp_users VALUES (1, 'admin@client.com', 'abc');
             INSERT INTO wp_users VALUES (7, 'user1@example.test', '');",
        )
        .unwrap();
        let err = UrlRewriter::new(&db, RewriteOptions::default(), Warnings::new())
            .sanitize_users(&Budget::unbounded("sanitize"))
            .unwrap_err();

        assert!(matches!(err, StaxError::RewriteFailed { .. }), "{err:?}");
        assert_eq!(value(&db, "SELECT user_email FROM wp_users WHERE ID = 1"), "admin@client.com");
        assert_eq!(value(&db, "SELECT user_activation_key FROM wp_users WHERE ID = 1"), "abc");
        // The connection is usable again after the rollback.
        db.execute_batch("UPDATE wp_users SET user_activation_key = 'x' WHERE ID = 7").unwrap();
    }

    fn network() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch(
            r#"
            CREATE TABLE wp_blogs (blog_id INTEGER PRIMARY KEY, domain VARCHAR(200), path VARCHAR(100));
            INSERT INTO wp_blogs VALUES (1, 'example.com', '/');
            INSERT INTO wp_blogs VALUES (2, 'shop.example.com', '/');
            CREATE TABLE wp_site (id INTEGER PRIMARY KEY, domain VARCHAR(200), path VARCHAR(100));
            INSERT INTO wp_site VALUES (1, 'example.com', '/');
            CREATE TABLE wp_options (option_id INTEGER PRIMARY KEY, option_name VARCHAR(191), option_value LONGTEXT);
            INSERT INTO wp_options VALUES (1, 'siteurl', 'https://example.com');
            CREATE TABLE wp_2_options (option_id INTEGER PRIMARY KEY, option_name VARCHAR(191), option_value LONGTEXT);
            INSERT INTO wp_2_options VALUES (1, 'siteurl', 'https://shop.example.com');
            CREATE TABLE wp_users (ID INTEGER PRIMARY KEY, user_url VARCHAR(100));
            INSERT INTO wp_users VALUES (1, 'https://example.com/me');
            "#,
        )
        .unwrap();
        db
    }

    fn network_pairs() -> Vec<ReplacementPair> {
        vec![
            ReplacementPair::new("https://example.com", "https://example.ddev.site"),
            ReplacementPair::new("https://shop.example.com", "https://shop.example.ddev.site"),
        ]
    }

    #[test]
    fn network_rewrite_updates_every_site() {
        let db = network();
        let options = RewriteOptions {
            mode: RewriteMode::Network,
            ..Default::default()
        };
        let report = run(&db, options, &network_pairs());

        assert_eq!(value(&db, "SELECT option_value FROM wp_options"), "https://example.ddev.site");
        assert_eq!(
            value(&db, "SELECT option_value FROM wp_2_options"),
            "https://shop.example.ddev.site"
        );
        assert_eq!(value(&db, "SELECT user_url FROM wp_users"), "https://example.ddev.site/me");
        assert_eq!(
            db.query_column("SELECT domain FROM wp_blogs ORDER BY blog_id").unwrap(),
            vec![
                Some("example.ddev.site".to_string()),
                Some("shop.example.ddev.site".to_string())
            ]
        );
        assert_eq!(value(&db, "SELECT domain FROM wp_site"), "example.ddev.site");
        assert_eq!(report.site_records, 3);
    }

    #[test]
    fn network_mode_requires_multisite() {
        let db = single_site();
        let options = RewriteOptions {
            mode: RewriteMode::Network,
            ..Default::default()
        };
        let err = UrlRewriter::new(&db, options, Warnings::new())
            .run(&[ReplacementPair::new(REMOTE, LOCAL)], &Budget::unbounded("rewrite"))
            .unwrap_err();
        assert!(matches!(err, StaxError::InvalidArgument(_)));
    }

    #[test]
    fn scoped_rewrite_touches_one_subsite() {
        let db = network();
        let options = RewriteOptions {
            mode: RewriteMode::Scoped {
                site_url: "https://shop.example.com".into(),
            },
            ..Default::default()
        };
        let report = run(&db, options, &network_pairs());

        assert_eq!(
            value(&db, "SELECT option_value FROM wp_2_options"),
            "https://shop.example.ddev.site"
        );
        assert_eq!(value(&db, "SELECT option_value FROM wp_options"), "https://example.com");
        assert_eq!(value(&db, "SELECT user_url FROM wp_users"), "https://example.com/me");
        assert_eq!(
            db.query_column("SELECT domain FROM wp_blogs ORDER BY blog_id").unwrap(),
            vec![
                Some("example.com".to_string()),
                Some("shop.example.ddev.site".to_string())
            ]
        );
        assert_eq!(value(&db, "SELECT domain FROM wp_site"), "example.com");
        assert_eq!(report.site_records, 1);
    }

    #[test]
    fn constrained_pair_applies_to_its_site_only() {
        let db = network();
        let options = RewriteOptions {
            mode: RewriteMode::Network,
            ..Default::default()
        };
        let pairs = [ReplacementPair::new("https://example.com", "https://cdn.example.test")
            .for_site("https://shop.example.com")];
        run(&db, options, &pairs);
        assert_eq!(value(&db, "SELECT option_value FROM wp_options"), "https://example.com");
        assert_eq!(value(&db, "SELECT user_url FROM wp_users"), "https://example.com/me");
    }

    #[test]
    fn constraint_violation_fails_only_that_table() {
        let db = single_site();
        db.execute_batch(
            "CREATE TABLE wp_links (link_id INTEGER PRIMARY KEY, link_url VARCHAR(255) UNIQUE, link_notes TEXT);
             INSERT INTO wp_links VALUES (1, 'https://example.wpengine.com', 'https://example.wpengine.com');
             INSERT INTO wp_links VALUES (2, 'https://mysite.ddev.site', '');",
        )
        .unwrap();
        let warnings = Warnings::new();
        let report = UrlRewriter::new(&db, RewriteOptions::default(), warnings.clone())
            .run(&[ReplacementPair::new(REMOTE, LOCAL)], &Budget::unbounded("rewrite"))
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "wp_links");
        assert!(!warnings.is_empty());
        // Whole table rolled back, other tables still rewritten.
        assert_eq!(
            value(&db, "SELECT link_notes FROM wp_links WHERE link_id = 1"),
            "https://example.wpengine.com"
        );
        assert!(value(&db, "SELECT post_content FROM wp_posts").contains(LOCAL));
    }

    #[test]
    fn domain_moves_keep_subdirectory_paths() {
        let mv = DomainMove::from_pair(&ReplacementPair::new(
            "https://example.com",
            "https://example.ddev.site",
        ))
        .unwrap();
        assert_eq!(
            mv.apply("example.com", "/shop/"),
            Some(("example.ddev.site".to_string(), "/shop/".to_string()))
        );
        assert_eq!(mv.apply("sub.example.com", "/"), None);
    }
}
