//! Unified error type for stax.
//!
//! Every stage of the pull pipeline converts its underlying failures into one
//! of the variants below before returning. Anything that cannot be classified
//! becomes [`StaxError::Internal`], which is always terminal.

use std::fmt;
use std::path::PathBuf;

/// The unified error type for all stax operations.
#[derive(Debug)]
pub enum StaxError {
    // ── Credentials ────────────────────────────────────────────────────
    /// No source produced credentials. Lists every location consulted.
    CredentialsNotFound {
        tried: Vec<String>,
        last_error: Option<String>,
    },

    /// No SSH private key could be loaded.
    SshKeyNotFound {
        tried: Vec<String>,
        last_error: Option<String>,
    },

    /// The provider API or the SSH gateway refused the credentials.
    CredentialsRejected(String),

    // ── Transport ──────────────────────────────────────────────────────
    /// Network-level failure that persisted after retries.
    TransportUnavailable(String),

    /// The SSH host key differs from the pinned fingerprint.
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    /// A remote command exited non-zero.
    RemoteCommandFailed {
        command: String,
        exit_code: i32,
        stderr_tail: String,
    },

    /// The downloaded database export is empty or unreadable.
    ExportEmpty(String),

    // ── Local database ─────────────────────────────────────────────────
    /// The container-side import tool exited non-zero.
    ImportFailed {
        exit_code: i32,
        stderr_tail: String,
    },

    /// A terminal failure of the URL rewriter.
    RewriteFailed { table: String, cause: String },

    // ── Snapshots ──────────────────────────────────────────────────────
    /// Filesystem failure inside the snapshot directory.
    SnapshotIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Another invocation holds the project lock.
    Busy { project: String, pid: Option<u32> },

    // ── Input / control ────────────────────────────────────────────────
    /// Input failed boundary validation.
    InvalidArgument(String),

    /// Configuration file could not be read or decoded.
    Config(String),

    /// A per-operation deadline elapsed.
    Timeout { operation: String },

    /// The cancellation signal reached the stage.
    Cancelled,

    // ── Catch-all ──────────────────────────────────────────────────────
    /// Unclassified failure. Always terminal.
    Internal(String),
}

// ── Display ────────────────────────────────────────────────────────────

impl fmt::Display for StaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaxError::CredentialsNotFound { tried, last_error } => {
                write!(f, "no credentials found (tried: {})", tried.join(", "))?;
                if let Some(e) = last_error {
                    write!(f, "; last error: {}", e)?;
                }
                Ok(())
            }
            StaxError::SshKeyNotFound { tried, last_error } => {
                write!(f, "no SSH private key found (tried: {})", tried.join(", "))?;
                if let Some(e) = last_error {
                    write!(f, "; last error: {}", e)?;
                }
                Ok(())
            }
            StaxError::CredentialsRejected(msg) => write!(f, "credentials rejected: {}", msg),
            StaxError::TransportUnavailable(msg) => write!(f, "transport unavailable: {}", msg),
            StaxError::HostKeyMismatch {
                host,
                expected,
                actual,
            } => write!(
                f,
                "host key for {} changed (pinned {}, offered {})",
                host, expected, actual
            ),
            StaxError::RemoteCommandFailed {
                command,
                exit_code,
                stderr_tail,
            } => write!(
                f,
                "remote command '{}' exited with {}: {}",
                command, exit_code, stderr_tail
            ),
            StaxError::ExportEmpty(msg) => write!(f, "database export unusable: {}", msg),
            StaxError::ImportFailed {
                exit_code,
                stderr_tail,
            } => write!(f, "import exited with {}: {}", exit_code, stderr_tail),
            StaxError::RewriteFailed { table, cause } => {
                write!(f, "URL rewrite failed on {}: {}", table, cause)
            }
            StaxError::SnapshotIo { path, source } => {
                write!(f, "snapshot I/O error at {}: {}", path.display(), source)
            }
            StaxError::Busy { project, pid } => match pid {
                Some(pid) => write!(f, "project '{}' is busy (held by pid {})", project, pid),
                None => write!(f, "project '{}' is busy", project),
            },
            StaxError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            StaxError::Config(msg) => write!(f, "config error: {}", msg),
            StaxError::Timeout { operation } => write!(f, "{} timed out", operation),
            StaxError::Cancelled => write!(f, "cancelled"),
            StaxError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for StaxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StaxError::SnapshotIo { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ── From implementations for common error types ────────────────────────

impl From<std::io::Error> for StaxError {
    fn from(e: std::io::Error) -> Self {
        StaxError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for StaxError {
    fn from(e: serde_json::Error) -> Self {
        StaxError::Internal(format!("JSON error: {}", e))
    }
}

impl From<serde_yaml::Error> for StaxError {
    fn from(e: serde_yaml::Error) -> Self {
        StaxError::Internal(format!("YAML error: {}", e))
    }
}

impl From<tokio::task::JoinError> for StaxError {
    fn from(e: tokio::task::JoinError) -> Self {
        StaxError::Internal(format!("background task failed: {}", e))
    }
}

impl From<String> for StaxError {
    fn from(s: String) -> Self {
        StaxError::Internal(s)
    }
}

impl From<&str> for StaxError {
    fn from(s: &str) -> Self {
        StaxError::Internal(s.to_string())
    }
}

// ── Convenience constructors ───────────────────────────────────────────

impl StaxError {
    /// Create an invalid-argument error.
    pub fn invalid(message: impl Into<String>) -> Self {
        StaxError::InvalidArgument(message.into())
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        StaxError::TransportUnavailable(message.into())
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        StaxError::Config(message.into())
    }

    /// Wrap an I/O error that happened inside the snapshot directory.
    pub fn snapshot_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StaxError::SnapshotIo {
            path: path.into(),
            source,
        }
    }

    /// Create a rewrite failure for a table.
    pub fn rewrite(table: impl Into<String>, cause: impl fmt::Display) -> Self {
        StaxError::RewriteFailed {
            table: table.into(),
            cause: cause.to_string(),
        }
    }

    /// Process exit code for a terminal failure.
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// Short machine-friendly name of the variant, used in reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StaxError::CredentialsNotFound { .. } => "CredentialsNotFound",
            StaxError::SshKeyNotFound { .. } => "SSHKeyNotFound",
            StaxError::CredentialsRejected(_) => "CredentialsRejected",
            StaxError::TransportUnavailable(_) => "TransportUnavailable",
            StaxError::HostKeyMismatch { .. } => "HostKeyMismatch",
            StaxError::RemoteCommandFailed { .. } => "RemoteCommandFailed",
            StaxError::ExportEmpty(_) => "ExportEmpty",
            StaxError::ImportFailed { .. } => "ImportFailed",
            StaxError::RewriteFailed { .. } => "RewriteFailed",
            StaxError::SnapshotIo { .. } => "SnapshotIOError",
            StaxError::Busy { .. } => "Busy",
            StaxError::InvalidArgument(_) => "InvalidArgument",
            StaxError::Config(_) => "Config",
            StaxError::Timeout { .. } => "Timeout",
            StaxError::Cancelled => "Cancelled",
            StaxError::Internal(_) => "Internal",
        }
    }
}

/// Keep the last `max_lines` lines of a stderr capture for error surfaces.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Convenience type alias for Results using StaxError.
pub type Result<T> = std::result::Result<T, StaxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_lists_every_source() {
        let err = StaxError::CredentialsNotFound {
            tried: vec!["env".into(), "keychain".into(), "file".into()],
            last_error: Some("permission denied".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("env, keychain, file"));
        assert!(msg.contains("permission denied"));
        assert_eq!(err.kind(), "CredentialsNotFound");
    }

    #[test]
    fn tail_keeps_last_lines() {
        let text = "a\nb\nc\nd";
        assert_eq!(tail_lines(text, 2), "c\nd");
        assert_eq!(tail_lines(text, 10), "a\nb\nc\nd");
    }

    #[test]
    fn busy_reports_pid_when_known() {
        let err = StaxError::Busy {
            project: "mysite".into(),
            pid: Some(4242),
        };
        assert!(err.to_string().contains("4242"));
    }
}
