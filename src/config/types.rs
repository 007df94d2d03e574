//! Configuration type definitions.

use knuffel::Decode;
use std::path::PathBuf;
use std::time::Duration;

use crate::provider::Environment;
use crate::snapshot::RetentionPolicy;

/// Default SSH gateway for WP Engine installs.
pub const DEFAULT_SSH_GATEWAY: &str = "ssh.wpengine.net";

/// Default provider API base URL.
pub const DEFAULT_API_BASE: &str = "https://api.wpengineapi.com/v1";

/// Expand tilde (~) prefix to the user's home directory.
/// Handles both "~" alone and "~/path/to/something" patterns.
pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// The tool's own state directory (`~/.stax`).
pub fn stax_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".stax"))
        .unwrap_or_else(|| PathBuf::from(".stax"))
}

/// Main configuration structure parsed from stax.kdl.
#[derive(Debug, Decode, Clone, Default)]
pub struct Config {
    #[knuffel(child)]
    pub defaults: Option<Defaults>,

    #[knuffel(children(name = "project"))]
    pub projects: Vec<ProjectConfig>,
}

/// Global settings.
#[derive(Debug, Decode, Clone, Default)]
pub struct Defaults {
    #[knuffel(property(name = "snapshots_dir"))]
    pub snapshots_dir: Option<String>,

    #[knuffel(property(name = "known_hosts"))]
    pub known_hosts: Option<String>,

    #[knuffel(property(name = "credentials_file"))]
    pub credentials_file: Option<String>,

    #[knuffel(property(name = "temp_dir"))]
    pub temp_dir: Option<String>,

    /// Parallel file-transfer workers.
    #[knuffel(property)]
    pub workers: Option<u32>,

    #[knuffel(property(name = "api_base"))]
    pub api_base: Option<String>,

    /// Project used when `--project` is omitted.
    #[knuffel(property(name = "default_project"))]
    pub default_project: Option<String>,
}

/// One local project mirrored from a provider install.
#[derive(Debug, Decode, Clone)]
pub struct ProjectConfig {
    #[knuffel(argument)]
    pub id: String,

    /// Local site URL, e.g. `https://mysite.ddev.site`.
    #[knuffel(property(name = "local_url"))]
    pub local_url: String,

    #[knuffel(property(name = "table_prefix"))]
    pub table_prefix: Option<String>,

    /// Local directory that mirrors the remote `wp-content`.
    #[knuffel(property(name = "content_dir"))]
    pub content_dir: Option<String>,

    #[knuffel(children(name = "install"))]
    pub installs: Vec<InstallMapping>,

    #[knuffel(child)]
    pub container: Option<ContainerConfig>,

    #[knuffel(child)]
    pub database: Option<DatabaseConfig>,

    #[knuffel(child)]
    pub ssh: Option<SshConfig>,

    #[knuffel(child)]
    pub retention: Option<RetentionConfig>,

    #[knuffel(child)]
    pub transfer: Option<TransferConfig>,

    #[knuffel(children(name = "hook"))]
    pub hooks: Vec<HookConfig>,

    #[knuffel(children(name = "skip_table"))]
    pub skip_tables: Vec<SkipTable>,
}

/// `install "production" "mysite"`
#[derive(Debug, Decode, Clone)]
pub struct InstallMapping {
    #[knuffel(argument)]
    pub environment: String,

    #[knuffel(argument)]
    pub name: String,
}

#[derive(Debug, Decode, Clone, Default)]
pub struct ContainerConfig {
    #[knuffel(property)]
    pub program: Option<String>,

    #[knuffel(property)]
    pub dir: Option<String>,
}

#[derive(Debug, Decode, Clone, Default)]
pub struct DatabaseConfig {
    /// `mysql` (through the container CLI) or `sqlite`.
    #[knuffel(property)]
    pub engine: Option<String>,

    #[knuffel(property)]
    pub name: Option<String>,

    /// Database file for the sqlite engine.
    #[knuffel(property)]
    pub path: Option<String>,
}

#[derive(Debug, Decode, Clone, Default)]
pub struct SshConfig {
    #[knuffel(property)]
    pub gateway: Option<String>,

    #[knuffel(property)]
    pub port: Option<u16>,

    /// Key file name under `~/.ssh`.
    #[knuffel(property)]
    pub key: Option<String>,
}

#[derive(Debug, Decode, Clone, Default)]
pub struct RetentionConfig {
    #[knuffel(property(name = "auto_days"))]
    pub auto_days: Option<u32>,

    #[knuffel(property(name = "manual_days"))]
    pub manual_days: Option<u32>,
}

#[derive(Debug, Decode, Clone, Default)]
pub struct TransferConfig {
    /// KiB/s, 0 means unlimited.
    #[knuffel(property(name = "bandwidth_limit"))]
    pub bandwidth_limit: Option<u64>,

    #[knuffel(children(name = "exclude"))]
    pub excludes: Vec<Pattern>,

    #[knuffel(children(name = "include"))]
    pub includes: Vec<Pattern>,
}

#[derive(Debug, Decode, Clone)]
pub struct Pattern {
    #[knuffel(argument)]
    pub glob: String,
}

/// `hook "wp" "cache" "flush"`
#[derive(Debug, Decode, Clone)]
pub struct HookConfig {
    #[knuffel(arguments)]
    pub argv: Vec<String>,
}

#[derive(Debug, Decode, Clone)]
pub struct SkipTable {
    #[knuffel(argument)]
    pub name: String,
}

/// Which engine the URL rewriter talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseEngine {
    Mysql { name: String },
    Sqlite { path: PathBuf },
}

impl Config {
    /// Directory holding snapshot dumps, defaulting to `~/.stax/snapshots`.
    pub fn snapshots_dir(&self) -> PathBuf {
        self.defaults
            .as_ref()
            .and_then(|d| d.snapshots_dir.as_deref())
            .map(expand_tilde)
            .unwrap_or_else(|| stax_home().join("snapshots"))
    }

    /// Managed known-hosts file, defaulting to `~/.stax/known_hosts`.
    pub fn known_hosts_file(&self) -> PathBuf {
        self.defaults
            .as_ref()
            .and_then(|d| d.known_hosts.as_deref())
            .map(expand_tilde)
            .unwrap_or_else(|| stax_home().join("known_hosts"))
    }

    /// Credentials file, defaulting to `~/.stax/credentials.yml`.
    pub fn credentials_file(&self) -> PathBuf {
        self.defaults
            .as_ref()
            .and_then(|d| d.credentials_file.as_deref())
            .map(expand_tilde)
            .unwrap_or_else(|| stax_home().join("credentials.yml"))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.defaults
            .as_ref()
            .and_then(|d| d.temp_dir.as_deref())
            .map(expand_tilde)
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Parallel transfer workers, defaulting to 4.
    pub fn workers(&self) -> usize {
        self.defaults
            .as_ref()
            .and_then(|d| d.workers)
            .map(|w| w.max(1) as usize)
            .unwrap_or(4)
    }

    pub fn api_base(&self) -> String {
        self.defaults
            .as_ref()
            .and_then(|d| d.api_base.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
    }

    /// Find a project by id, or the default project, or the only project.
    pub fn project(&self, id: Option<&str>) -> Result<&ProjectConfig, String> {
        let wanted = id
            .map(str::to_string)
            .or_else(|| self.defaults.as_ref().and_then(|d| d.default_project.clone()));

        match wanted {
            Some(id) => self
                .projects
                .iter()
                .find(|p| p.id == id)
                .ok_or_else(|| format!("Unknown project '{}'. Add it to stax.kdl.", id)),
            None => match self.projects.as_slice() {
                [only] => Ok(only),
                [] => Err("No projects configured. Run 'stax config generate' first.".into()),
                _ => Err("Several projects configured; pass --project.".into()),
            },
        }
    }
}

impl ProjectConfig {
    pub fn table_prefix(&self) -> String {
        self.table_prefix.clone().unwrap_or_else(|| "wp_".into())
    }

    /// Local `wp-content` directory, defaulting to `./wp-content`.
    pub fn content_dir(&self) -> PathBuf {
        self.content_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| PathBuf::from("wp-content"))
    }

    /// Install name for an environment.
    pub fn install_for(&self, environment: Environment) -> Option<&str> {
        self.installs
            .iter()
            .find(|i| i.environment.eq_ignore_ascii_case(environment.as_str()))
            .map(|i| i.name.as_str())
    }

    pub fn container_program(&self) -> String {
        self.container
            .as_ref()
            .and_then(|c| c.program.clone())
            .unwrap_or_else(|| "ddev".into())
    }

    pub fn container_dir(&self) -> PathBuf {
        self.container
            .as_ref()
            .and_then(|c| c.dir.as_deref())
            .map(expand_tilde)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn database_engine(&self) -> DatabaseEngine {
        let db = self.database.clone().unwrap_or_default();
        match db.engine.as_deref() {
            Some("sqlite") => DatabaseEngine::Sqlite {
                path: db
                    .path
                    .as_deref()
                    .map(expand_tilde)
                    .unwrap_or_else(|| PathBuf::from("wp-content/database/.ht.sqlite")),
            },
            _ => DatabaseEngine::Mysql {
                name: db.name.unwrap_or_else(|| "db".into()),
            },
        }
    }

    pub fn ssh_gateway(&self) -> (String, u16) {
        let ssh = self.ssh.clone().unwrap_or_default();
        (
            ssh.gateway.unwrap_or_else(|| DEFAULT_SSH_GATEWAY.into()),
            ssh.port.unwrap_or(22),
        )
    }

    pub fn ssh_key_name(&self) -> Option<String> {
        self.ssh.as_ref().and_then(|s| s.key.clone())
    }

    /// Retention policy, defaulting to 7 days for auto and 30 for manual.
    pub fn retention(&self) -> RetentionPolicy {
        let r = self.retention.clone().unwrap_or_default();
        RetentionPolicy {
            auto_days: r.auto_days.unwrap_or(7),
            manual_days: r.manual_days.unwrap_or(30),
        }
    }

    pub fn bandwidth_limit(&self) -> Option<u64> {
        self.transfer
            .as_ref()
            .and_then(|t| t.bandwidth_limit)
            .filter(|l| *l > 0)
    }

    /// User exclude globs from the transfer block.
    pub fn transfer_excludes(&self) -> Vec<String> {
        self.transfer
            .as_ref()
            .map(|t| t.excludes.iter().map(|p| p.glob.clone()).collect())
            .unwrap_or_default()
    }

    pub fn transfer_includes(&self) -> Vec<String> {
        self.transfer
            .as_ref()
            .map(|t| t.includes.iter().map(|p| p.glob.clone()).collect())
            .unwrap_or_default()
    }

    /// Post-import hooks, defaulting to a cache flush and a rewrite flush.
    pub fn hooks(&self) -> Vec<Vec<String>> {
        if self.hooks.is_empty() {
            return vec![
                vec!["wp".into(), "cache".into(), "flush".into()],
                vec!["wp".into(), "rewrite".into(), "flush".into()],
            ];
        }
        self.hooks
            .iter()
            .filter(|h| !h.argv.is_empty())
            .map(|h| h.argv.clone())
            .collect()
    }

    pub fn skip_tables(&self) -> Vec<String> {
        self.skip_tables.iter().map(|s| s.name.clone()).collect()
    }
}

/// Per-operation timeouts.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub db_export: Duration,
    pub file_sync: Duration,
    pub import: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            db_export: Duration::from_secs(10 * 60),
            file_sync: Duration::from_secs(30 * 60),
            import: Duration::from_secs(600),
        }
    }
}
