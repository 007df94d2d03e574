//! Provider-side data model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StaxError;

/// Root of every install on the provider's SSH gateway.
const SITES_ROOT: &str = "/home/wpe-user/sites";

/// A variant of an install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Development,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Development => "development",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = StaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" | "stage" => Ok(Environment::Staging),
            "development" | "dev" => Ok(Environment::Development),
            other => Err(StaxError::invalid(format!(
                "unknown environment '{}' (expected production, staging or development)",
                other
            ))),
        }
    }
}

/// An install as returned by the provider API. Read-only to stax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSite {
    #[serde(rename = "name")]
    pub install_name: String,
    pub environment: Environment,
    pub primary_domain: String,
    #[serde(default)]
    pub additional_domains: Vec<String>,
    #[serde(default)]
    pub php_version: Option<String>,
}

impl ProviderSite {
    /// Remote site URL built from the primary domain.
    pub fn primary_url(&self) -> String {
        format!("https://{}", self.primary_domain.trim_end_matches('/'))
    }
}

/// Remote locations derived from an install name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePaths {
    pub site_root: String,
    pub db_export_path: String,
    pub content_root: String,
    /// Relative to `content_root`.
    pub uploads_subpath: String,
}

impl RemotePaths {
    pub fn for_install(install_name: &str) -> Self {
        let site_root = format!("{}/{}", SITES_ROOT, install_name);
        Self {
            db_export_path: format!("{}/_wpeprivate/stax-db-export.sql", site_root),
            content_root: format!("{}/wp-content", site_root),
            uploads_subpath: "uploads".to_string(),
            site_root,
        }
    }
}
