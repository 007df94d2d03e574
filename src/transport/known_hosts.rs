//! Managed known-hosts file (OpenSSH format).
//!
//! Lookups hold a shared lock on the file; pinning a first-contact key holds
//! an exclusive lock and re-reads the file under it, so two concurrent first
//! contacts record one entry.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use fs2::FileExt;
use sha2::{Digest, Sha256};

use crate::error::{Result, StaxError};

/// One parsed known-hosts line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    pub pattern: String,
    pub key_type: String,
    pub key: Vec<u8>,
}

impl KnownHost {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.key)
    }
}

/// Outcome of a successful host-key check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// The offered key matches the pinned entry.
    Trusted,
    /// First contact: the key was recorded.
    Pinned { fingerprint: String },
}

/// `SHA256:<base64>` as printed by `ssh-keygen -l`.
pub fn fingerprint(key: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(key)))
}

/// Host field of a known-hosts line: bare for port 22, `[host]:port` otherwise.
pub fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Parse known-hosts text, ignoring comments, hashed names, markers and
/// malformed lines.
pub fn parse(content: &str) -> Vec<KnownHost> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(hosts), Some(key_type), Some(blob)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Ok(key) = STANDARD.decode(blob) else {
            continue;
        };
        for pattern in hosts.split(',') {
            if pattern.starts_with('|') {
                continue;
            }
            entries.push(KnownHost {
                pattern: pattern.to_string(),
                key_type: key_type.to_string(),
                key: key.clone(),
            });
        }
    }
    entries
}

/// Known-hosts file owned by stax.
#[derive(Debug, Clone)]
pub struct KnownHostsStore {
    path: PathBuf,
}

impl KnownHostsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_locked(file: &mut File) -> Result<String> {
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        Ok(content)
    }

    /// Pinned entries for `host:port`, read under a shared lock.
    pub fn lookup(&self, host: &str, port: u16) -> Result<Vec<KnownHost>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;
        let content = Self::read_locked(&mut file);
        let _ = FileExt::unlock(&file);

        let pattern = host_pattern(host, port);
        Ok(parse(&content?)
            .into_iter()
            .filter(|e| e.pattern == pattern)
            .collect())
    }

    /// Check an offered key; pin it on first contact.
    pub fn verify(&self, host: &str, port: u16, key_type: &str, key: &[u8]) -> Result<HostKeyStatus> {
        let pinned = self.lookup(host, port)?;
        if !pinned.is_empty() {
            return Self::compare(host, &pinned, key_type, key);
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = self.pin_locked(&mut file, host, port, key_type, key);
        let _ = FileExt::unlock(&file);
        result
    }

    fn pin_locked(
        &self,
        file: &mut File,
        host: &str,
        port: u16,
        key_type: &str,
        key: &[u8],
    ) -> Result<HostKeyStatus> {
        let pattern = host_pattern(host, port);
        let content = Self::read_locked(file)?;
        let raced: Vec<KnownHost> = parse(&content)
            .into_iter()
            .filter(|e| e.pattern == pattern)
            .collect();
        if !raced.is_empty() {
            return Self::compare(host, &raced, key_type, key);
        }

        let mut line = String::new();
        if !content.is_empty() && !content.ends_with('\n') {
            line.push('\n');
        }
        line.push_str(&format!("{} {} {}\n", pattern, key_type, STANDARD.encode(key)));
        file.write_all(line.as_bytes())?;
        file.sync_all()?;

        let fingerprint = fingerprint(key);
        tracing::info!(host = %pattern, %fingerprint, "pinned host key on first contact");
        Ok(HostKeyStatus::Pinned { fingerprint })
    }

    fn compare(host: &str, pinned: &[KnownHost], key_type: &str, key: &[u8]) -> Result<HostKeyStatus> {
        if pinned
            .iter()
            .any(|e| e.key_type == key_type && e.key == key)
        {
            return Ok(HostKeyStatus::Trusted);
        }
        Err(StaxError::HostKeyMismatch {
            host: host.to_string(),
            expected: pinned
                .iter()
                .map(|e| format!("{} {}", e.key_type, e.fingerprint()))
                .collect::<Vec<_>>()
                .join(", "),
            actual: format!("{} {}", key_type, fingerprint(key)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_bracketed_hosts() {
        let text = "# comment\n\
                    ssh.example.net ssh-ed25519 AAAA\n\
                    [ssh.example.net]:2222,alias ssh-rsa AAAB\n\
                    |1|hash|salt ssh-rsa AAAA\n\
                    broken-line\n";
        let entries = parse(text);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].pattern, "[ssh.example.net]:2222");
        assert_eq!(entries[2].pattern, "alias");
    }

    #[test]
    fn first_contact_pins_then_trusts() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownHostsStore::new(dir.path().join("known_hosts"));

        let status = store.verify("ssh.example.net", 22, "ssh-ed25519", b"key-one").unwrap();
        assert_eq!(
            status,
            HostKeyStatus::Pinned {
                fingerprint: fingerprint(b"key-one")
            }
        );
        assert_eq!(
            store.verify("ssh.example.net", 22, "ssh-ed25519", b"key-one").unwrap(),
            HostKeyStatus::Trusted
        );

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.starts_with("ssh.example.net ssh-ed25519 "));
    }

    #[test]
    fn changed_key_is_a_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownHostsStore::new(dir.path().join("known_hosts"));
        store.verify("h", 2222, "ssh-ed25519", b"original").unwrap();

        let err = store.verify("h", 2222, "ssh-ed25519", b"imposter").unwrap_err();
        match err {
            StaxError::HostKeyMismatch { expected, actual, .. } => {
                assert!(expected.contains(&fingerprint(b"original")));
                assert!(actual.contains(&fingerprint(b"imposter")));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Ports are pinned independently.
        assert!(matches!(
            store.verify("h", 22, "ssh-ed25519", b"imposter").unwrap(),
            HostKeyStatus::Pinned { .. }
        ));
    }

    #[test]
    fn fingerprint_matches_ssh_keygen_format() {
        let fp = fingerprint(b"");
        assert_eq!(fp, "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU");
    }
}
