//! Configuration file loading.

use std::path::{Path, PathBuf};

use super::types::{Config, stax_home};
use crate::error::{Result, StaxError};

impl Config {
    /// Get the explicit ~/.config/stax/stax.kdl path (XDG-style, cross-platform)
    fn xdg_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".config/stax/stax.kdl"))
    }

    /// Get the list of config file search paths in priority order
    fn get_config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // 1. ./stax.kdl (project-local config)
        paths.push(PathBuf::from("stax.kdl"));

        // 2. ~/.config/stax/stax.kdl
        if let Some(xdg_path) = Self::xdg_config_path() {
            paths.push(xdg_path);
        }

        // 3. Platform-native config directory, skipped when it equals the XDG path
        if let Some(config_dir) = dirs::config_dir() {
            let native_path = config_dir.join("stax/stax.kdl");
            if Self::xdg_config_path().as_ref() != Some(&native_path) {
                paths.push(native_path);
            }
        }

        // 4. ~/.stax/stax.kdl
        paths.push(stax_home().join("stax.kdl"));

        paths
    }

    /// Find existing config file by searching all standard locations
    pub fn find_existing_config() -> Option<PathBuf> {
        Self::get_config_search_paths()
            .into_iter()
            .find(|path| path.exists())
    }

    /// Get the default config path (~/.config/stax/stax.kdl)
    pub fn default_config_path() -> PathBuf {
        Self::xdg_config_path().unwrap_or_else(|| PathBuf::from("stax.kdl"))
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StaxError::config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Decode KDL text.
    pub fn parse(content: &str) -> Result<Self> {
        knuffel::parse::<Config>("stax.kdl", content)
            .map_err(|e| StaxError::config(e.to_string()))
    }

    /// Load configuration from stax.kdl, searching multiple locations.
    /// An explicit path always wins.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }
        match Self::find_existing_config() {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::load_from_path(&path)
            }
            None => Ok(Config::default()),
        }
    }

    /// Generate a config file with commented defaults.
    pub fn generate_config_file(path: Option<PathBuf>, overwrite: bool) -> Result<PathBuf> {
        let config_path = path.unwrap_or_else(Self::default_config_path);

        if config_path.exists() && !overwrite {
            return Err(StaxError::config(format!(
                "Config file already exists at: {}. Use --overwrite to replace it.",
                config_path.display()
            )));
        }

        if let Some(parent) = config_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }

        let kdl_content = r#"// Global defaults
// workers is the number of parallel file-transfer workers
defaults snapshots_dir="~/.stax/snapshots" known_hosts="~/.stax/known_hosts" credentials_file="~/.stax/credentials.yml" workers=4

// One block per local project
project "mysite" local_url="https://mysite.ddev.site" table_prefix="wp_" content_dir="./wp-content" {
    install "production" "mysite"
    // install "staging" "mysitestg"

    container program="ddev" dir="."
    database engine="mysql" name="db"
    ssh gateway="ssh.wpengine.net" port=22 key="id_ed25519"

    // Days to keep snapshots before `stax snapshot prune` removes them
    retention auto_days=7 manual_days=30

    // bandwidth_limit is in KiB/s, 0 means unlimited
    transfer bandwidth_limit=0 {
        // exclude "*.zip"
    }

    // Post-import hooks run through the container CLI
    // hook "wp" "cache" "flush"
}
"#;

        std::fs::write(&config_path, kdl_content)?;
        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_template_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stax.kdl");
        Config::generate_config_file(Some(path.clone()), false).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        let project = config.project(Some("mysite")).unwrap();
        assert_eq!(project.local_url, "https://mysite.ddev.site");
        assert_eq!(project.ssh_key_name().as_deref(), Some("id_ed25519"));
    }

    #[test]
    fn generate_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stax.kdl");
        Config::generate_config_file(Some(path.clone()), false).unwrap();
        assert!(Config::generate_config_file(Some(path.clone()), false).is_err());
        assert!(Config::generate_config_file(Some(path), true).is_ok());
    }
}
