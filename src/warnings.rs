//! Accumulator for non-fatal problems reported at teardown.
//!
//! Stages push warnings (skipped symlinks, benign stderr lines, orphan
//! snapshot files, row-level serialization fallbacks) instead of failing.
//! Their presence turns a successful pull into exit code 2.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Where a warning came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSource {
    Credentials,
    Transport,
    FileSync,
    Snapshot,
    Import,
    Rewrite,
    Hooks,
    Coordinator,
}

impl fmt::Display for WarningSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WarningSource::Credentials => "credentials",
            WarningSource::Transport => "transport",
            WarningSource::FileSync => "file-sync",
            WarningSource::Snapshot => "snapshot",
            WarningSource::Import => "import",
            WarningSource::Rewrite => "rewrite",
            WarningSource::Hooks => "hooks",
            WarningSource::Coordinator => "pull",
        };
        f.write_str(name)
    }
}

/// A single non-fatal problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub source: WarningSource,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.source, self.message)
    }
}

/// Shared, cloneable warning sink. Clones push into the same list.
#[derive(Debug, Clone, Default)]
pub struct Warnings {
    inner: Arc<Mutex<Vec<Warning>>>,
}

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning and log it.
    pub fn push(&self, source: WarningSource, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(%source, "{}", message);
        if let Ok(mut list) = self.inner.lock() {
            list.push(Warning { source, message });
        }
    }

    /// Append several messages from one source.
    pub fn extend<I, S>(&self, source: WarningSource, messages: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for message in messages {
            self.push(source, message);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map(|l| l.is_empty()).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Copy of every warning recorded so far.
    pub fn snapshot(&self) -> Vec<Warning> {
        self.inner.lock().map(|l| l.clone()).unwrap_or_default()
    }
}
