//! The local container runtime's CLI (`ddev` by default).
//!
//! Only the narrow subset the pull pipeline needs: a running check, a
//! database export to stdout, command execution inside the web container,
//! and the database client. Every call uses an explicit argument vector.

use std::ffi::OsStr;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, StaxError, tail_lines};
use crate::process::{Budget, STDERR_TAIL_LINES, TailCapture, run_captured, wait_with_deadline};

const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(60);
const HOOK_TIMEOUT: Duration = Duration::from_secs(300);
const DUMP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Answers whether the local environment is up.
pub trait LocalEnvironment: Send + Sync {
    fn is_running(&self) -> Result<bool>;
}

/// Produces an uncompressed SQL dump of the local database.
pub trait DatabaseDumper: Send + Sync {
    fn dump(&self, out: &mut dyn Write, budget: &Budget) -> Result<()>;
}

/// Runs a post-import hook inside the local environment.
pub trait HookRunner: Send + Sync {
    fn run_hook(&self, argv: &[String], budget: &Budget) -> Result<()>;
}

#[derive(Deserialize)]
struct Describe {
    #[serde(default)]
    raw: DescribeRaw,
}

#[derive(Deserialize, Default)]
struct DescribeRaw {
    #[serde(default)]
    status: String,
}

/// `ddev`-compatible container CLI rooted at a project directory.
#[derive(Debug, Clone)]
pub struct ContainerCli {
    program: String,
    dir: PathBuf,
    database: String,
}

impl ContainerCli {
    pub fn new(program: impl Into<String>, dir: impl Into<PathBuf>, database: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            dir: dir.into(),
            database: database.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// `<program> <args...>` in the project directory.
    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).current_dir(&self.dir);
        cmd
    }

    /// The database client: `<program> mysql --database=<db> <args...>`.
    pub fn mysql_command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(["mysql".to_string(), format!("--database={}", self.database)]);
        cmd.args(args);
        cmd
    }

    fn failed(operation: &str, code: i32, stderr: &str) -> StaxError {
        StaxError::Internal(format!(
            "{} exited with {}: {}",
            operation,
            code,
            tail_lines(stderr.trim(), STDERR_TAIL_LINES)
        ))
    }
}

impl LocalEnvironment for ContainerCli {
    fn is_running(&self) -> Result<bool> {
        let captured = run_captured(
            self.command(["describe", "-j"]),
            DESCRIBE_TIMEOUT,
            &tokio_util::sync::CancellationToken::new(),
            "describe",
        )?;
        if !captured.status.success() {
            tracing::debug!(stderr = %captured.stderr, "describe failed");
            return Ok(false);
        }
        let describe: Describe = serde_json::from_slice(&captured.stdout)?;
        Ok(describe.raw.status == "running")
    }
}

impl DatabaseDumper for ContainerCli {
    fn dump(&self, out: &mut dyn Write, budget: &Budget) -> Result<()> {
        let mut child = self
            .command([
                "export-db".to_string(),
                format!("--database={}", self.database),
                "--gzip=false".to_string(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StaxError::Internal(format!("export-db: cannot start: {}", e)))?;

        let stderr = child
            .stderr
            .take()
            .map(|s| TailCapture::spawn(s, STDERR_TAIL_LINES, |_| true));

        let copied = match child.stdout.take() {
            Some(mut stdout) => std::io::copy(&mut stdout, out).map_err(StaxError::from),
            None => Err(StaxError::Internal("export-db: no stdout".into())),
        };
        let timeout = budget.remaining().unwrap_or(DUMP_TIMEOUT);
        let status = wait_with_deadline(&mut child, timeout, budget.token(), "export-db")?;
        let tail = stderr.map(TailCapture::finish).unwrap_or_default();
        copied?;

        if !status.success() {
            return Err(Self::failed("export-db", status.code().unwrap_or(-1), &tail));
        }
        Ok(())
    }
}

impl HookRunner for ContainerCli {
    fn run_hook(&self, argv: &[String], budget: &Budget) -> Result<()> {
        if argv.is_empty() {
            return Err(StaxError::invalid("empty hook"));
        }
        let mut args = vec!["exec".to_string()];
        args.extend(argv.iter().cloned());
        let captured = run_captured(
            self.command(&args),
            budget.remaining().unwrap_or(HOOK_TIMEOUT),
            budget.token(),
            &argv.join(" "),
        )?;
        if !captured.status.success() {
            return Err(Self::failed(&argv.join(" "), captured.code(), &captured.stderr));
        }
        Ok(())
    }
}
