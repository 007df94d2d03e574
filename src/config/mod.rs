//! Configuration loading and management.

mod loader;
mod types;

pub(crate) use types::expand_tilde;
pub use types::{
    Config, DEFAULT_API_BASE, DEFAULT_SSH_GATEWAY, DatabaseEngine, Defaults, ProjectConfig,
    Timeouts, stax_home,
};
