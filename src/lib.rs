//! stax - pull a WP Engine hosted WordPress site into a local ddev environment.
//!
//! This crate provides functionality to:
//! - Resolve provider credentials from the environment, the OS keychain or a file
//! - Export the remote database over SSH and sync `wp-content`
//! - Snapshot and restore the local database
//! - Import dumps and rewrite URLs, including inside PHP-serialized values
//!
//! # Example
//!
//! ```no_run
//! use stax::{Config, commands::ProjectContext};
//! use tokio_util::sync::CancellationToken;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let ctx = ProjectContext::new(config, None, CancellationToken::new())?;
//!
//!     for snapshot in ctx.snapshots()?.list(&ctx.project.id)? {
//!         println!("{} ({} bytes)", snapshot.file_name, snapshot.size_bytes);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod container;
pub mod credentials;
pub mod db;
pub mod error;
pub mod importer;
pub mod process;
pub mod provider;
pub mod pull;
pub mod rewrite;
pub mod snapshot;
pub mod transport;
pub mod utils;
pub mod warnings;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{Result, StaxError};
pub use pull::{Coordinator, PullReport, PullRequest};
pub use snapshot::SnapshotStore;
pub use warnings::Warnings;
