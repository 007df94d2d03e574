//! The pull pipeline: remote database and files into the local environment.
//!
//! Stages run in a fixed order. Snapshot, file sync, rewrite and hooks can
//! be skipped; teardown always runs. Every collaborator sits behind a trait
//! so the whole pipeline can be driven against fakes.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Timeouts;
use crate::container::LocalEnvironment;
use crate::credentials::{CredentialResolver, Credentials, DEFAULT_KEY_NAMES, Secret};
use crate::db::Database;
use crate::error::{Result, StaxError};
use crate::importer::{ImportJob, ImportStats, Importer};
use crate::process::Budget;
use crate::provider::{Environment, ProviderApi, ProviderClient, ProviderSite, RemotePaths};
use crate::rewrite::{
    ReplacementPair, RewriteMode, RewriteOptions, RewriteReport, Site, UrlRewriter,
    network_sites, split_url,
};
use crate::snapshot::{ProjectLock, Snapshot, SnapshotKind, SnapshotStore};
use crate::transport::ssh::login_name;
use crate::transport::throttle::{Throttle, ThrottledWriter};
use crate::transport::{
    HostKeyStatus, KnownHostsStore, RemoteSession, SshSession, SshTarget, SyncEngine, SyncStats,
    TransferOptions,
};
use crate::warnings::{Warning, WarningSource, Warnings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolveCredentials,
    EnsureLocalEnvReady,
    PrePullSnapshot,
    OpenTransport,
    ExportRemoteDb,
    ImportDb,
    FileSync,
    RewriteUrls,
    PostImportHooks,
    Teardown,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ResolveCredentials => "resolve_credentials",
            Stage::EnsureLocalEnvReady => "ensure_local_env_ready",
            Stage::PrePullSnapshot => "pre_pull_snapshot",
            Stage::OpenTransport => "open_transport",
            Stage::ExportRemoteDb => "export_remote_db",
            Stage::ImportDb => "import_db",
            Stage::FileSync => "file_sync",
            Stage::RewriteUrls => "rewrite_urls",
            Stage::PostImportHooks => "post_import_hooks",
            Stage::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    pub duration: Duration,
}

/// Which part of `wp-content` the file sync covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileScope {
    #[default]
    All,
    ThemesOnly,
    PluginsOnly,
}

/// Everything one pull needs to know, assembled from flags and config.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub project_id: String,
    pub environment: Environment,
    pub install: String,
    /// Local site URL, e.g. `https://mysite.ddev.site`.
    pub local_url: String,
    pub table_prefix: String,
    pub target_database: String,
    pub snapshot: bool,
    pub skip_files: bool,
    pub file_scope: FileScope,
    pub exclude_uploads: bool,
    pub skip_replace: bool,
    pub skip_hooks: bool,
    pub exclude_tables: Vec<String>,
    pub skip_logs: bool,
    pub skip_transients: bool,
    pub skip_spam: bool,
    pub sanitize: bool,
    pub dry_run: bool,
    /// Remote URL to rewrite from instead of the install's primary URL.
    pub from_url: Option<String>,
    pub transfer: TransferOptions,
    pub local_content_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub ssh_gateway: (String, u16),
    pub ssh_key_name: Option<String>,
    pub timeouts: Timeouts,
}

impl PullRequest {
    pub fn new(
        project_id: impl Into<String>,
        environment: Environment,
        install: impl Into<String>,
        local_url: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            environment,
            install: install.into(),
            local_url: local_url.into(),
            table_prefix: "wp_".into(),
            target_database: "db".into(),
            snapshot: true,
            skip_files: false,
            file_scope: FileScope::All,
            exclude_uploads: false,
            skip_replace: false,
            skip_hooks: false,
            exclude_tables: Vec::new(),
            skip_logs: false,
            skip_transients: false,
            skip_spam: false,
            sanitize: false,
            dry_run: false,
            from_url: None,
            transfer: TransferOptions::default(),
            local_content_dir: PathBuf::from("wp-content"),
            temp_dir: std::env::temp_dir(),
            ssh_gateway: (crate::config::DEFAULT_SSH_GATEWAY.into(), 22),
            ssh_key_name: None,
            timeouts: Timeouts::default(),
        }
    }
}

/// Outcome of a pull. Always produced, even when a stage failed.
#[derive(Debug, Default)]
pub struct PullReport {
    pub project_id: String,
    pub dry_run: bool,
    pub stages: Vec<StageRecord>,
    pub credential_source: Option<String>,
    pub site: Option<ProviderSite>,
    pub host_key: Option<HostKeyStatus>,
    pub snapshot: Option<Snapshot>,
    pub export_bytes: Option<u64>,
    pub import: Option<ImportStats>,
    pub files: Option<SyncStats>,
    pub verify: Option<SyncStats>,
    pub pairs: Vec<ReplacementPair>,
    pub rewrite: Option<RewriteReport>,
    pub sanitized_users: Option<usize>,
    pub hooks_run: Option<usize>,
    pub warnings: Vec<Warning>,
    pub error: Option<StaxError>,
}

impl PullReport {
    fn new(project_id: &str, dry_run: bool) -> Self {
        Self {
            project_id: project_id.to_string(),
            dry_run,
            ..Default::default()
        }
    }

    /// 0 on success, 1 on a terminal failure, 2 when warnings were emitted.
    pub fn exit_code(&self) -> i32 {
        match &self.error {
            Some(e) => e.exit_code(),
            None if !self.warnings.is_empty() => 2,
            None => 0,
        }
    }

    pub fn status(&self, stage: Stage) -> Option<&StageStatus> {
        self.stages
            .iter()
            .rev()
            .find(|r| r.stage == stage)
            .map(|r| &r.status)
    }

    fn record(&mut self, stage: Stage, status: StageStatus, duration: Duration) {
        match &status {
            StageStatus::Completed => {
                tracing::info!(stage = %stage, elapsed_ms = duration.as_millis() as u64, "stage completed")
            }
            StageStatus::Skipped(reason) => tracing::info!(stage = %stage, %reason, "stage skipped"),
            StageStatus::Failed(cause) => tracing::error!(stage = %stage, %cause, "stage failed"),
        }
        self.stages.push(StageRecord {
            stage,
            status,
            duration,
        });
    }

    fn skip(&mut self, stage: Stage, reason: &str) {
        self.record(stage, StageStatus::Skipped(reason.to_string()), Duration::ZERO);
    }

    fn run<T>(&mut self, stage: Stage, f: impl FnOnce() -> Result<T>) -> Result<T> {
        tracing::debug!(stage = %stage, "stage started");
        let started = Instant::now();
        let result = f();
        let status = match &result {
            Ok(_) => StageStatus::Completed,
            Err(e) => StageStatus::Failed(e.to_string()),
        };
        self.record(stage, status, started.elapsed());
        result
    }
}

/// Builds a provider API client once credentials are known.
pub trait ProviderFactory: Send + Sync {
    fn client(&self, credentials: &Credentials) -> Result<Arc<dyn ProviderApi>>;
}

pub struct ApiProviderFactory {
    base: String,
}

impl ApiProviderFactory {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }
}

impl ProviderFactory for ApiProviderFactory {
    fn client(&self, credentials: &Credentials) -> Result<Arc<dyn ProviderApi>> {
        Ok(Arc::new(ProviderClient::new(&self.base, credentials)?))
    }
}

/// Opens authenticated sessions to the provider.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        target: &SshTarget,
        key: &Secret,
    ) -> Result<(Box<dyn RemoteSession>, HostKeyStatus)>;
}

pub struct SshConnector {
    known_hosts: KnownHostsStore,
}

impl SshConnector {
    pub fn new(known_hosts: KnownHostsStore) -> Self {
        Self { known_hosts }
    }
}

impl Connector for SshConnector {
    fn connect(
        &self,
        target: &SshTarget,
        key: &Secret,
    ) -> Result<(Box<dyn RemoteSession>, HostKeyStatus)> {
        let (session, status) = SshSession::connect(target, key, &self.known_hosts)?;
        Ok((Box::new(session), status))
    }
}

/// The collaborators a pull drives.
pub struct Collaborators {
    pub resolver: CredentialResolver,
    pub provider: Arc<dyn ProviderFactory>,
    pub connector: Arc<dyn Connector>,
    pub local: Arc<dyn LocalEnvironment>,
    pub snapshots: Arc<SnapshotStore>,
    pub importer: Importer,
    pub database: Arc<dyn Database>,
}

/// Resolved in the async part of the pull, consumed by the blocking part.
struct Resolved {
    credentials: Credentials,
    key: Secret,
    site: ProviderSite,
}

/// Resources teardown must release.
#[derive(Default)]
struct Held {
    lock: Option<ProjectLock>,
    session: Option<Box<dyn RemoteSession>>,
    temp_file: Option<PathBuf>,
}

#[derive(Clone)]
pub struct Coordinator {
    parts: Arc<Collaborators>,
    warnings: Warnings,
}

impl Coordinator {
    pub fn new(parts: Collaborators, warnings: Warnings) -> Self {
        Self {
            parts: Arc::new(parts),
            warnings,
        }
    }

    /// Run a pull to completion or first terminal failure.
    pub async fn pull(&self, request: PullRequest, cancel: CancellationToken) -> PullReport {
        let mut report = PullReport::new(&request.project_id, request.dry_run);
        let mut held = Held::default();

        let resolved = match self.prepare(&request, &cancel, &mut report, &mut held).await {
            Ok(resolved) => resolved,
            Err(e) => return self.finish(report, held, Err(e)),
        };

        let this = self.clone();
        let task = tokio::task::spawn_blocking(move || {
            let outcome = this.run_stages(&request, &resolved, &cancel, &mut report, &mut held);
            this.finish(report, held, outcome)
        });
        match task.await {
            Ok(report) => report,
            Err(e) => {
                let mut report = PullReport::new("", false);
                report.error = Some(e.into());
                report.warnings = self.warnings.snapshot();
                report
            }
        }
    }

    /// Lock the project, then stage 1.
    async fn prepare(
        &self,
        request: &PullRequest,
        cancel: &CancellationToken,
        report: &mut PullReport,
        held: &mut Held,
    ) -> Result<Resolved> {
        held.lock = Some(self.parts.snapshots.lock(&request.project_id)?);

        let started = Instant::now();
        let result = self.resolve(request, cancel, report).await;
        let status = match &result {
            Ok(_) => StageStatus::Completed,
            Err(e) => StageStatus::Failed(e.to_string()),
        };
        report.record(Stage::ResolveCredentials, status, started.elapsed());
        result
    }

    async fn resolve(
        &self,
        request: &PullRequest,
        cancel: &CancellationToken,
        report: &mut PullReport,
    ) -> Result<Resolved> {
        let resolver = &self.parts.resolver;
        let resolution = resolver.resolve(&request.install)?;
        report.credential_source = Some(resolution.source.clone());
        for shadowed in &resolution.shadowed {
            tracing::info!(source = %shadowed, "credentials available but lower precedence");
        }
        self.warnings
            .extend(WarningSource::Credentials, resolution.warnings.iter().cloned());
        let credentials = resolution.credentials;

        let key = match &credentials.ssh_private_key_pem {
            Some(key) => key.clone(),
            None => match &request.ssh_key_name {
                Some(name) => resolver.resolve_ssh_key(name)?,
                None => resolver.resolve_ssh_key_from(&DEFAULT_KEY_NAMES)?,
            },
        };

        let site = if credentials.api_user.is_some() && credentials.api_password.is_some() {
            let api = self.parts.provider.client(&credentials)?;
            let site = tokio::select! {
                _ = cancel.cancelled() => return Err(StaxError::Cancelled),
                site = api.get_install(&request.install) => site?,
            };
            if site.environment != request.environment {
                self.warnings.push(
                    WarningSource::Coordinator,
                    format!(
                        "install {} is a {} environment, but {} was requested",
                        site.install_name, site.environment, request.environment
                    ),
                );
            }
            site
        } else {
            self.warnings.push(
                WarningSource::Credentials,
                "no API credentials; assuming the install's default provider domain",
            );
            ProviderSite {
                install_name: request.install.clone(),
                environment: request.environment,
                primary_domain: format!("{}.wpengine.com", request.install),
                additional_domains: Vec::new(),
                php_version: None,
            }
        };
        report.site = Some(site.clone());

        Ok(Resolved {
            credentials,
            key,
            site,
        })
    }

    /// Stages 2 to 9. Stops at the first terminal failure.
    fn run_stages(
        &self,
        request: &PullRequest,
        resolved: &Resolved,
        cancel: &CancellationToken,
        report: &mut PullReport,
        held: &mut Held,
    ) -> Result<()> {
        let parts = &self.parts;
        let budget = |timeout: Option<Duration>, op: &str| Budget::new(cancel.clone(), timeout, op);
        let paths = RemotePaths::for_install(&request.install);

        report.run(Stage::EnsureLocalEnvReady, || {
            budget(None, "environment check").check()?;
            if parts.local.is_running()? {
                Ok(())
            } else {
                Err(StaxError::invalid(
                    "the local environment is not running; start it and retry",
                ))
            }
        })?;

        if request.dry_run {
            report.skip(Stage::PrePullSnapshot, "dry run");
        } else if !request.snapshot {
            report.skip(Stage::PrePullSnapshot, "disabled");
        } else {
            let snapshot = report.run(Stage::PrePullSnapshot, || {
                let lock = held
                    .lock
                    .as_ref()
                    .ok_or_else(|| StaxError::Internal("project lock not held".into()))?;
                parts.snapshots.create_locked(
                    lock,
                    SnapshotKind::Auto,
                    Some("before pull"),
                    &budget(None, "snapshot"),
                )
            })?;
            report.snapshot = Some(snapshot);
        }

        let (session, status) = report.run(Stage::OpenTransport, || {
            budget(None, "open transport").check()?;
            let target = ssh_target(request, &resolved.credentials);
            parts.connector.connect(&target, &resolved.key)
        })?;
        if let HostKeyStatus::Pinned { fingerprint } = &status {
            tracing::info!(%fingerprint, "pinned host key on first contact");
        }
        report.host_key = Some(status);
        let session = &**held.session.insert(session);

        let mut imported = false;
        if request.dry_run {
            report.skip(Stage::ExportRemoteDb, "dry run");
            report.skip(Stage::ImportDb, "dry run");
        } else {
            let export_budget = budget(Some(request.timeouts.db_export), "database export");
            let local = request.temp_dir.join(format!(
                "stax-{}-{}.sql",
                request.project_id,
                Uuid::new_v4().simple()
            ));
            held.temp_file = Some(local.clone());
            let bytes = report.run(Stage::ExportRemoteDb, || {
                self.export(
                    session,
                    &paths,
                    &local,
                    request.transfer.bandwidth_limit_kibibytes_per_sec,
                    &export_budget,
                )
            })?;
            report.export_bytes = Some(bytes);

            let stats = report.run(Stage::ImportDb, || {
                budget(None, "import").check()?;
                if !parts.local.is_running()? {
                    return Err(StaxError::invalid("the local environment stopped before import"));
                }
                let job = ImportJob {
                    skip_post_hooks: true,
                    remove_source: true,
                    ..ImportJob::new(&local, &request.target_database)
                };
                parts
                    .importer
                    .import(&job, &budget(Some(request.timeouts.import), "import"))
            })?;
            report.import = Some(stats);
            imported = true;
        }

        if request.skip_files {
            report.skip(Stage::FileSync, "disabled");
        } else {
            let sync_budget = budget(Some(request.timeouts.file_sync), "file sync");
            let (files, verify) = report.run(Stage::FileSync, || {
                self.sync_files(session, request, &paths, &sync_budget)
            })?;
            report.files = Some(files);
            report.verify = verify;
        }

        let rewrite_wanted = !request.skip_replace;
        if request.dry_run {
            report.skip(Stage::RewriteUrls, "dry run");
        } else if !rewrite_wanted && !request.sanitize {
            report.skip(Stage::RewriteUrls, "disabled");
        } else if !imported && request.from_url.is_none() {
            report.skip(Stage::RewriteUrls, "no database was imported in this run");
        } else {
            let rewrite_budget = budget(None, "url rewrite");
            let site = &resolved.site;
            let (pairs, rewritten, sanitized) = report.run(Stage::RewriteUrls, || {
                let db = &*parts.database;
                let sites = network_sites(db, &request.table_prefix)?;
                let options = RewriteOptions {
                    mode: if sites.is_some() {
                        RewriteMode::Network
                    } else {
                        RewriteMode::SingleSite
                    },
                    table_prefix: request.table_prefix.clone(),
                    skip_tables: request.exclude_tables.clone(),
                    skip_logs: request.skip_logs,
                    skip_transients: request.skip_transients,
                    skip_spam: request.skip_spam,
                    ..Default::default()
                };
                let rewriter = UrlRewriter::new(db, options, self.warnings.clone());
                let mut pairs = Vec::new();
                let mut rewritten = None;
                if rewrite_wanted {
                    let remote_url = request.from_url.clone().unwrap_or_else(|| site.primary_url());
                    pairs = replacement_pairs(
                        &remote_url,
                        &site.additional_domains,
                        &request.local_url,
                        sites.as_deref(),
                    )?;
                    let result = rewriter.run(&pairs, &rewrite_budget)?;
                    if !result.failed.is_empty() {
                        tracing::warn!(tables = result.failed.len(), "some tables were left unchanged");
                    }
                    rewritten = Some(result);
                }
                let sanitized = if request.sanitize {
                    Some(rewriter.sanitize_users(&rewrite_budget)?)
                } else {
                    None
                };
                Ok((pairs, rewritten, sanitized))
            })?;
            report.pairs = pairs;
            report.rewrite = rewritten;
            report.sanitized_users = sanitized;
        }

        if request.dry_run {
            report.skip(Stage::PostImportHooks, "dry run");
        } else if request.skip_hooks {
            report.skip(Stage::PostImportHooks, "disabled");
        } else {
            let ran = report.run(Stage::PostImportHooks, || {
                parts.importer.run_post_hooks(&budget(None, "post-import hooks"))
            })?;
            report.hooks_run = Some(ran);
        }

        Ok(())
    }

    /// Export on the remote, download under the bandwidth limit, and check
    /// the result is non-empty.
    fn export(
        &self,
        session: &dyn RemoteSession,
        paths: &RemotePaths,
        local: &std::path::Path,
        kib_per_sec: u64,
        budget: &Budget,
    ) -> Result<u64> {
        let site_path = format!("--path={}", paths.site_root);
        let argv = ["wp", "db", "export", paths.db_export_path.as_str(), site_path.as_str()];
        session.exec(&argv, budget)?.success("wp db export")?;

        let size = session
            .stat(&paths.db_export_path)?
            .map(|entry| entry.size)
            .unwrap_or(0);
        if size == 0 {
            return Err(StaxError::ExportEmpty(format!(
                "{} is missing or empty on the remote",
                paths.db_export_path
            )));
        }

        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(local)?;
        crate::utils::permissions::restrict_file_permissions(local)?;
        let mut out =
            ThrottledWriter::new(BufWriter::new(file), Throttle::per_kib(kib_per_sec));
        let written = session.download(&paths.db_export_path, &mut out, budget)?;
        out.flush()?;
        let out = out.into_inner();
        out.get_ref().sync_all()?;
        tracing::info!(bytes = written, path = %local.display(), "database export downloaded");

        if let Err(e) = session.remove_file(&paths.db_export_path) {
            self.warnings.push(
                WarningSource::Transport,
                format!("could not remove remote export {}: {}", paths.db_export_path, e),
            );
        }
        if written == 0 {
            return Err(StaxError::ExportEmpty("downloaded dump is empty".into()));
        }
        Ok(written)
    }

    fn sync_files(
        &self,
        session: &dyn RemoteSession,
        request: &PullRequest,
        paths: &RemotePaths,
        budget: &Budget,
    ) -> Result<(SyncStats, Option<SyncStats>)> {
        let (remote, local) = match request.file_scope {
            FileScope::All => (paths.content_root.clone(), request.local_content_dir.clone()),
            FileScope::ThemesOnly => (
                format!("{}/themes", paths.content_root),
                request.local_content_dir.join("themes"),
            ),
            FileScope::PluginsOnly => (
                format!("{}/plugins", paths.content_root),
                request.local_content_dir.join("plugins"),
            ),
        };
        let mut options = request.transfer.clone();
        options.dry_run = request.dry_run;
        if request.exclude_uploads {
            options
                .exclude_globs
                .push(format!("/{}/", paths.uploads_subpath));
        }

        let engine = SyncEngine::new(session, self.warnings.clone());
        let stats = engine.sync(&remote, &local, &options, budget)?;
        let verify = if options.verify_after && !options.dry_run {
            Some(engine.verify(&remote, &local, &options, budget)?)
        } else {
            None
        };
        Ok((stats, verify))
    }

    /// Stage 10, then fold the outcome into the report.
    fn finish(&self, mut report: PullReport, mut held: Held, outcome: Result<()>) -> PullReport {
        let started = Instant::now();
        if let Some(path) = held.temp_file.take()
            && let Err(e) = fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            self.warnings.push(
                WarningSource::Coordinator,
                format!("could not remove {}: {}", path.display(), e),
            );
        }
        if let Some(session) = held.session.take() {
            session.close();
        }
        drop(held.lock.take());
        report.record(Stage::Teardown, StageStatus::Completed, started.elapsed());

        if let Err(e) = outcome {
            if matches!(e, StaxError::Cancelled) && report.snapshot.is_some() {
                tracing::info!("pull cancelled; the pre-pull snapshot is kept");
            }
            report.error = Some(e);
        }
        report.warnings = self.warnings.snapshot();
        report
    }
}

fn ssh_target(request: &PullRequest, credentials: &Credentials) -> SshTarget {
    let (host, port) = &request.ssh_gateway;
    SshTarget {
        host: credentials
            .ssh_gateway_host
            .clone()
            .unwrap_or_else(|| host.clone()),
        port: credentials.ssh_gateway_port.unwrap_or(*port),
        user: login_name(&request.install, credentials.ssh_user.as_deref()),
    }
}

/// Local host for a remote subsite domain: subdomains of the primary keep
/// their label, unrelated domains are flattened under the local host.
pub fn local_host_for(domain: &str, remote_host: &str, local_host: &str) -> String {
    let domain = domain.to_ascii_lowercase();
    let remote_host = remote_host.to_ascii_lowercase();
    if domain == remote_host {
        return local_host.to_string();
    }
    match domain.strip_suffix(&format!(".{}", remote_host)) {
        Some(label) => format!("{}.{}", label, local_host),
        None => format!("{}.{}", domain.replace('.', "-"), local_host),
    }
}

/// Pairs for a pull: the primary URL (both schemes), additional domains,
/// then one pair per subsite on its own domain.
pub fn replacement_pairs(
    remote_url: &str,
    additional_domains: &[String],
    local_url: &str,
    sites: Option<&[Site]>,
) -> Result<Vec<ReplacementPair>> {
    let local_base = local_url.trim_end_matches('/');
    let local_scheme = local_base.split_once("://").map(|(s, _)| s).unwrap_or("https");
    let (local_host, _) = split_url(local_base)?;
    let (remote_host, remote_path) = split_url(remote_url)?;
    let remote_path = remote_path.trim_end_matches('/');

    let mut pairs: Vec<ReplacementPair> = Vec::new();
    let mut push = |from: String, to: String| {
        if from != to && !pairs.iter().any(|p| p.from == from) {
            pairs.push(ReplacementPair::new(from, to));
        }
    };

    for scheme in ["https", "http"] {
        push(format!("{}://{}{}", scheme, remote_host, remote_path), local_base.to_string());
    }
    for domain in additional_domains {
        let domain = domain.trim().trim_end_matches('/');
        if domain.is_empty() || domain.eq_ignore_ascii_case(&remote_host) {
            continue;
        }
        for scheme in ["https", "http"] {
            push(format!("{}://{}", scheme, domain), local_base.to_string());
        }
    }
    for site in sites.unwrap_or_default() {
        let domain = site.domain.trim();
        if domain.is_empty()
            || domain.eq_ignore_ascii_case(&remote_host)
            || additional_domains.iter().any(|d| d.trim().eq_ignore_ascii_case(domain))
        {
            continue;
        }
        let path = site.path.trim_end_matches('/');
        let to = format!(
            "{}://{}{}",
            local_scheme,
            local_host_for(domain, &remote_host, &local_host),
            path
        );
        for scheme in ["https", "http"] {
            push(format!("{}://{}{}", scheme, domain, path), to.clone());
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(id: u64, domain: &str, path: &str) -> Site {
        Site {
            blog_id: id,
            domain: domain.into(),
            path: path.into(),
        }
    }

    #[test]
    fn single_site_pairs_cover_both_schemes() {
        let pairs = replacement_pairs(
            "https://example.wpengine.com",
            &[],
            "https://mysite.ddev.site/",
            None,
        )
        .unwrap();
        assert_eq!(
            pairs,
            vec![
                ReplacementPair::new("https://example.wpengine.com", "https://mysite.ddev.site"),
                ReplacementPair::new("http://example.wpengine.com", "https://mysite.ddev.site"),
            ]
        );
    }

    #[test]
    fn subsite_domains_map_under_the_local_host() {
        let sites = [
            site(1, "example.com", "/"),
            site(2, "sub.example.com", "/"),
            site(3, "other.org", "/"),
        ];
        let pairs = replacement_pairs(
            "https://example.com",
            &["www.example.com".to_string()],
            "https://example.ddev.site",
            Some(&sites),
        )
        .unwrap();
        let map: Vec<(&str, &str)> = pairs.iter().map(|p| (p.from.as_str(), p.to.as_str())).collect();
        assert!(map.contains(&("https://example.com", "https://example.ddev.site")));
        assert!(map.contains(&("https://www.example.com", "https://example.ddev.site")));
        assert!(map.contains(&("https://sub.example.com", "https://sub.example.ddev.site")));
        assert!(map.contains(&("http://sub.example.com", "https://sub.example.ddev.site")));
        assert!(map.contains(&("https://other.org", "https://other-org.example.ddev.site")));
        assert_eq!(pairs.len(), 8);
    }

    #[test]
    fn local_hosts_for_subsites() {
        assert_eq!(local_host_for("Example.com", "example.com", "x.ddev.site"), "x.ddev.site");
        assert_eq!(local_host_for("a.example.com", "example.com", "x.ddev.site"), "a.x.ddev.site");
        assert_eq!(local_host_for("shop.net", "example.com", "x.ddev.site"), "shop-net.x.ddev.site");
    }

    #[test]
    fn exit_codes() {
        let mut report = PullReport::new("p", false);
        assert_eq!(report.exit_code(), 0);
        report.warnings.push(Warning {
            source: WarningSource::Hooks,
            message: "cache flush failed".into(),
        });
        assert_eq!(report.exit_code(), 2);
        report.error = Some(StaxError::Cancelled);
        assert_eq!(report.exit_code(), 1);
    }
}
