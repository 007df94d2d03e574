//! Provider API: installs and their derived remote paths.

mod client;
pub mod http;
mod types;

pub use client::{ApiBackoff, ProviderApi, ProviderClient};
pub use types::{Environment, ProviderSite, RemotePaths};
