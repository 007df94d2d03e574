//! Installs command handler - listing installs visible to the API credentials.

use crate::config::Config;
use crate::config::ProjectConfig;
use crate::credentials::{CredentialField, CredentialResolver};
use crate::error::Result;
use crate::provider::{Environment, ProviderApi, ProviderClient};

/// Credentials lookup key when no project names an install.
const ANY_INSTALL: &str = "default";

pub async fn handle_installs(config: &Config, project: Option<&ProjectConfig>) -> Result<i32> {
    let install = project
        .and_then(|p| p.install_for(Environment::Production))
        .unwrap_or(ANY_INSTALL);
    let resolution = CredentialResolver::standard(config.credentials_file()).resolve(install)?;
    for w in &resolution.warnings {
        eprintln!("warning: {}", w);
    }
    resolution
        .credentials
        .require(&[CredentialField::ApiUser, CredentialField::ApiPassword])?;

    let client = ProviderClient::new(&config.api_base(), &resolution.credentials)?;
    let mut installs = client.list_installs().await?;
    if installs.is_empty() {
        println!("No installs visible to these credentials.");
        return Ok(0);
    }
    installs.sort_by(|a, b| a.install_name.cmp(&b.install_name));

    for site in installs {
        print!(
            "{:<24} {:<12} {}",
            site.install_name, site.environment, site.primary_domain
        );
        if let Some(php) = &site.php_version {
            print!("  php {}", php);
        }
        println!();
        for domain in &site.additional_domains {
            println!("{:<37} {}", "", domain);
        }
    }
    Ok(if resolution.warnings.is_empty() { 0 } else { 2 })
}
