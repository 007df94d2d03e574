//! Command handlers for the stax CLI.
//!
//! Each handler prints its own output and returns the process exit code.

mod config_cmd;
mod context;
mod doctor;
mod installs;
mod pull;
mod replace;
mod snapshot;

pub use config_cmd::handle_config;
pub use context::ProjectContext;
pub use doctor::handle_doctor;
pub use installs::handle_installs;
pub use pull::{build_request, handle_pull};
pub use replace::handle_replace;
pub use snapshot::handle_snapshot;
