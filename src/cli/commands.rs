//! Command and subcommand definitions.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Part of wp-content the file sync covers.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum FilesScope {
    /// Everything under wp-content
    #[default]
    All,
    /// Only wp-content/themes
    Themes,
    /// Only wp-content/plugins
    Plugins,
    /// Skip the file sync
    None,
}

/// Top-level commands available in stax.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pull the remote database and files into the local environment
    Pull(PullArgs),
    /// Manage local database snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
    /// Search and replace a URL in the local database
    Replace(ReplaceArgs),
    /// Check credentials, keychain access and file permissions
    Doctor,
    /// List installs visible to the API credentials
    Installs,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Environment to pull from: production, staging or development
    #[arg(short, long, default_value = "production")]
    pub environment: String,

    /// Take a snapshot of the local database first
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub snapshot: bool,

    /// Import the database but leave remote URLs in place
    #[arg(long)]
    pub skip_replace: bool,

    /// Comma-separated tables the URL rewrite leaves alone
    #[arg(long, value_delimiter = ',', value_name = "TABLES")]
    pub exclude_tables: Vec<String>,

    /// Leave log tables alone during the rewrite
    #[arg(long)]
    pub skip_logs: bool,

    /// Leave transient options alone during the rewrite
    #[arg(long)]
    pub skip_transients: bool,

    /// Leave spam comments alone during the rewrite
    #[arg(long)]
    pub skip_spam: bool,

    /// Replace user emails with placeholders after the rewrite
    #[arg(long)]
    pub sanitize: bool,

    /// Show what would happen without changing local state
    #[arg(long)]
    pub dry_run: bool,

    /// Transfer limit in KiB/s
    #[arg(long, value_name = "KIBPS")]
    pub bandwidth_limit: Option<u64>,

    /// Which files to sync
    #[arg(long, value_enum, default_value_t = FilesScope::All)]
    pub files: FilesScope,

    /// Leave wp-content/uploads out of the file sync
    #[arg(long)]
    pub exclude_uploads: bool,

    /// Delete local files that are gone on the remote
    #[arg(long)]
    pub delete_extraneous: bool,

    /// Compare file counts and sizes after the sync
    #[arg(long)]
    pub verify: bool,

    /// Skip cache flush and other post-import hooks
    #[arg(long)]
    pub skip_hooks: bool,

    /// Remote URL to rewrite from instead of the install's primary domain
    #[arg(long, value_name = "URL")]
    pub from: Option<String>,
}

#[derive(Args, Debug)]
pub struct ReplaceArgs {
    /// URL to replace
    #[arg(long)]
    pub from: String,

    /// Replacement URL
    #[arg(long)]
    pub to: String,

    /// Rewrite every site of a multisite network
    #[arg(long, conflicts_with = "url")]
    pub network: bool,

    /// Rewrite only the subsite with this siteurl
    #[arg(long, value_name = "SITEURL")]
    pub url: Option<String>,

    /// Also visit tables outside the WordPress prefix
    #[arg(long)]
    pub all_tables: bool,

    /// Comma-separated tables to leave alone
    #[arg(long, value_delimiter = ',', value_name = "TABLES")]
    pub exclude_tables: Vec<String>,

    #[arg(long)]
    pub skip_logs: bool,

    #[arg(long)]
    pub skip_transients: bool,

    #[arg(long)]
    pub skip_spam: bool,

    /// Count replacements without writing
    #[arg(long)]
    pub dry_run: bool,
}

/// Subcommands for snapshot management.
#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// Dump the local database into a new snapshot
    Create {
        /// Free-form note stored with the snapshot
        #[arg(short, long)]
        description: Option<String>,
    },
    /// List snapshots of the project, oldest first
    List,
    /// Load a snapshot back into the local database
    Restore {
        /// Snapshot file name or absolute path inside the snapshot directory
        name: String,
    },
    /// Delete a snapshot and its metadata
    Delete { name: String },
    /// Delete snapshots past the retention policy
    Prune {
        /// Days to keep automatic snapshots (overrides config)
        #[arg(long)]
        auto_days: Option<u32>,

        /// Days to keep manual snapshots (overrides config)
        #[arg(long)]
        manual_days: Option<u32>,
    },
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Write a commented config template
    Generate {
        /// Where to write it (default: ./stax.kdl)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        overwrite: bool,
    },
    /// Print the effective configuration
    Show,
}
