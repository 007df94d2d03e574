//! YAML credentials file (`~/.stax/credentials.yml`).
//!
//! ```yaml
//! api_user: me@example.com
//! api_password: secret
//! ssh_gateway: ssh.wpengine.net:22
//! installs:
//!   mysite:
//!     api_user: other@example.com
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use super::sources::{CredentialRecord, Lookup, SecretSource};
use super::DiagnosticReport;
use crate::utils::permissions::broader_than_owner;

#[derive(Debug, Default, Deserialize)]
struct CredentialsFile {
    #[serde(flatten)]
    global: CredentialRecord,
    #[serde(default)]
    installs: BTreeMap<String, CredentialRecord>,
}

#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<Option<CredentialsFile>, String> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("{}: {}", self.path.display(), e)),
        };
        if content.trim().is_empty() {
            return Ok(Some(CredentialsFile::default()));
        }
        serde_yaml::from_str(&content)
            .map(Some)
            .map_err(|e| format!("{}: {}", self.path.display(), e))
    }

    fn mode_warning(&self) -> Option<String> {
        match broader_than_owner(&self.path) {
            Ok(Some(mode)) => Some(format!(
                "{} has mode {:o}; restrict it to 600",
                self.path.display(),
                mode
            )),
            _ => None,
        }
    }
}

impl SecretSource for FileSource {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn lookup(&self, install: &str) -> Lookup {
        let file = match self.read() {
            Ok(Some(f)) => f,
            Ok(None) => return Lookup::Missing,
            Err(e) => return Lookup::Failed(e),
        };
        let record = match file.installs.get(install) {
            Some(specific) => specific.clone().or(&file.global),
            None => file.global,
        };
        match record.into_credentials() {
            Ok(creds) if creds.is_empty() => Lookup::Missing,
            Ok(creds) => Lookup::Found(creds),
            Err(e) => Lookup::Failed(format!("{}: {}", self.path.display(), e)),
        }
    }

    fn notices(&self) -> Vec<String> {
        self.mode_warning().into_iter().collect()
    }

    fn diagnose(&self) -> DiagnosticReport {
        match self.read() {
            Ok(None) => DiagnosticReport::ok(
                "credentials file",
                format!("{} not present", self.path.display()),
            ),
            Ok(Some(file)) => {
                let report = match self.mode_warning() {
                    Some(w) => DiagnosticReport::warning("credentials file", w),
                    None => DiagnosticReport::ok(
                        "credentials file",
                        format!("{} readable", self.path.display()),
                    ),
                };
                report.with_detail(
                    file.installs
                        .keys()
                        .map(|name| format!("install entry: {}", name)),
                )
            }
            Err(e) => DiagnosticReport::error("credentials file", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::DiagnosticStatus;

    const SAMPLE: &str = "api_user: file-u\napi_password: file-p\ninstalls:\n  mysite:\n    api_user: site-u\n";

    #[test]
    fn install_entry_overlays_global_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.yml");
        std::fs::write(&path, SAMPLE).unwrap();
        crate::utils::permissions::restrict_file_permissions(&path).unwrap();

        let source = FileSource::new(&path);
        let Lookup::Found(creds) = source.lookup("mysite") else {
            panic!("expected credentials");
        };
        assert_eq!(creds.api_user.as_deref(), Some("site-u"));
        assert_eq!(creds.api_password.unwrap().expose(), "file-p");

        let Lookup::Found(other) = source.lookup("elsewhere") else {
            panic!("expected global credentials");
        };
        assert_eq!(other.api_user.as_deref(), Some("file-u"));
        assert!(source.notices().is_empty());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new(dir.path().join("nope.yml"));
        assert!(matches!(source.lookup("mysite"), Lookup::Missing));
        assert_eq!(source.diagnose().status, DiagnosticStatus::Ok);
    }

    #[test]
    fn malformed_file_fails_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.yml");
        std::fs::write(&path, "api_user: [unterminated").unwrap();
        assert!(matches!(FileSource::new(&path).lookup("x"), Lookup::Failed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn broad_mode_is_a_notice_not_a_failure() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.yml");
        std::fs::write(&path, SAMPLE).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let source = FileSource::new(&path);
        assert!(matches!(source.lookup("mysite"), Lookup::Found(_)));
        assert_eq!(source.notices().len(), 1);
        assert_eq!(source.diagnose().status, DiagnosticStatus::Warning);
    }
}
