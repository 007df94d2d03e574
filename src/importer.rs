//! Database importer: streams a dump into the local database.
//!
//! The dump is never held in memory. Gzip input is detected by its magic
//! bytes and decompressed on the fly, and `CREATE TABLE` statements are
//! counted as the bytes pass through.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use flate2::read::MultiGzDecoder;
use regex::RegexSet;

use crate::container::{ContainerCli, HookRunner};
use crate::db::SqliteDatabase;
use crate::error::{Result, StaxError, tail_lines};
use crate::process::{Budget, STDERR_TAIL_LINES, TailCapture, wait_with_deadline};
use crate::warnings::{WarningSource, Warnings};

/// Default deadline for one import.
pub const IMPORT_TIMEOUT: Duration = Duration::from_secs(600);

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const CHUNK: usize = 64 * 1024;

/// stderr lines the import tool prints on every healthy run.
static BENIGN_STDERR: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)using a password on the command line interface can be insecure",
        r"(?i)^mysql: \[warning\]",
        r"(?i)^mariadb: \[warning\]",
        r"(?i)deprecated program name",
        r"(?i)^warning: .*(deprecated|will be removed)",
        r"(?i)^importing database",
        r"(?i)^\s*[\d.]+\s*[kmg]?i?b\b.*\d+%",
        r"^\s*$",
    ])
    .unwrap_or_else(|_| RegexSet::empty())
});

pub fn is_benign(line: &str) -> bool {
    BENIGN_STDERR.is_match(line)
}

/// One import request.
#[derive(Debug, Clone)]
pub struct ImportJob {
    pub source_file: PathBuf,
    pub target_database: String,
    pub suppress_debug: bool,
    pub skip_post_hooks: bool,
    /// Delete `source_file` once the import finishes, successful or not.
    pub remove_source: bool,
}

impl ImportJob {
    pub fn new(source_file: impl Into<PathBuf>, target_database: impl Into<String>) -> Self {
        Self {
            source_file: source_file.into(),
            target_database: target_database.into(),
            suppress_debug: true,
            skip_post_hooks: false,
            remove_source: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStats {
    pub tables: usize,
    pub rows: Option<u64>,
    pub duration: Duration,
}

/// Anything that can materialize a SQL dump stream.
pub trait DumpLoader: Send + Sync {
    fn load(
        &self,
        input: &mut dyn Read,
        database: &str,
        suppress_debug: bool,
        budget: &Budget,
    ) -> Result<()>;
}

impl DumpLoader for ContainerCli {
    fn load(
        &self,
        input: &mut dyn Read,
        database: &str,
        suppress_debug: bool,
        budget: &Budget,
    ) -> Result<()> {
        let mut child = self
            .command(["import-db".to_string(), format!("--database={}", database)])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StaxError::ImportFailed {
                exit_code: -1,
                stderr_tail: format!("cannot start {} import-db: {}", self.program(), e),
            })?;

        let stderr = child.stderr.take().map(|s| {
            TailCapture::spawn(s, STDERR_TAIL_LINES, move |line| {
                tracing::debug!(target: "stax::importer", "{}", line);
                !(suppress_debug && is_benign(line))
            })
        });

        let fed = match child.stdin.take() {
            Some(mut stdin) => feed(input, &mut stdin, budget),
            None => Err(StaxError::Internal("import-db: no stdin".into())),
        };
        if fed.is_err() {
            let _ = child.kill();
        }
        let timeout = budget.remaining().unwrap_or(IMPORT_TIMEOUT);
        let status = wait_with_deadline(&mut child, timeout, budget.token(), "database import");
        let tail = stderr.map(TailCapture::finish).unwrap_or_default();

        match fed {
            Err(StaxError::Cancelled) => return Err(StaxError::Cancelled),
            Err(StaxError::Timeout { operation }) => return Err(StaxError::Timeout { operation }),
            _ => {}
        }
        let status = status?;
        if !status.success() {
            return Err(StaxError::ImportFailed {
                exit_code: status.code().unwrap_or(-1),
                stderr_tail: tail_lines(tail.trim(), STDERR_TAIL_LINES),
            });
        }
        // A closed pipe with a zero exit is a tool bug, not a success.
        fed.map(|_| ()).map_err(|e| StaxError::ImportFailed {
            exit_code: 0,
            stderr_tail: e.to_string(),
        })
    }
}

impl DumpLoader for SqliteDatabase {
    fn load(
        &self,
        input: &mut dyn Read,
        _database: &str,
        _suppress_debug: bool,
        budget: &Budget,
    ) -> Result<()> {
        budget.check()?;
        SqliteDatabase::load(self, input).map_err(|e| StaxError::ImportFailed {
            exit_code: 1,
            stderr_tail: e.to_string(),
        })?;
        Ok(())
    }
}

/// Copy in chunks, checking the budget between chunks.
fn feed(input: &mut dyn Read, out: &mut dyn Write, budget: &Budget) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        budget.check()?;
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        total += n as u64;
    }
    out.flush()?;
    Ok(total)
}

/// Counts `CREATE TABLE` statements in the bytes it passes through.
struct TableCounter<R> {
    inner: R,
    line_start: Vec<u8>,
    at_line_start: bool,
    tables: usize,
}

const CREATE_TABLE: &[u8] = b"CREATE TABLE";

impl<R: Read> TableCounter<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            line_start: Vec::with_capacity(CREATE_TABLE.len()),
            at_line_start: true,
            tables: 0,
        }
    }

    fn observe(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' {
                self.line_start.clear();
                self.at_line_start = true;
                continue;
            }
            if !self.at_line_start {
                continue;
            }
            self.line_start.push(b.to_ascii_uppercase());
            if self.line_start.len() == CREATE_TABLE.len() {
                if self.line_start == CREATE_TABLE {
                    self.tables += 1;
                }
                self.at_line_start = false;
            }
        }
    }
}

impl<R: Read> Read for TableCounter<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.observe(&buf[..n]);
        Ok(n)
    }
}

/// Open a dump, transparently decompressing gzip.
pub fn open_dump(path: &std::path::Path) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path).map_err(|e| {
        StaxError::invalid(format!("cannot open dump {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);
    let head = reader.fill_buf()?;
    if head.is_empty() {
        return Err(StaxError::invalid(format!("dump {} is empty", path.display())));
    }
    if head.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(MultiGzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Removes a file when dropped.
struct RemoveOnDrop(Option<PathBuf>);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if let Some(path) = self.0.take()
            && let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "could not remove import source");
        }
    }
}

/// Runs import jobs against a loader and post-import hooks against the
/// local environment.
#[derive(Clone)]
pub struct Importer {
    loader: Arc<dyn DumpLoader>,
    hook_runner: Option<Arc<dyn HookRunner>>,
    hooks: Vec<Vec<String>>,
    warnings: Warnings,
}

impl Importer {
    pub fn new(loader: Arc<dyn DumpLoader>, warnings: Warnings) -> Self {
        Self {
            loader,
            hook_runner: None,
            hooks: Vec::new(),
            warnings,
        }
    }

    pub fn with_hooks(mut self, runner: Arc<dyn HookRunner>, hooks: Vec<Vec<String>>) -> Self {
        self.hook_runner = Some(runner);
        self.hooks = hooks;
        self
    }

    pub fn import(&self, job: &ImportJob, budget: &Budget) -> Result<ImportStats> {
        let _cleanup = RemoveOnDrop(job.remove_source.then(|| job.source_file.clone()));
        let started = Instant::now();
        budget.check()?;

        let mut input = TableCounter::new(open_dump(&job.source_file)?);
        tracing::info!(
            source = %job.source_file.display(),
            database = %job.target_database,
            "importing dump"
        );
        self.loader
            .load(&mut input, &job.target_database, job.suppress_debug, budget)?;

        let stats = ImportStats {
            tables: input.tables,
            rows: None,
            duration: started.elapsed(),
        };
        tracing::info!(tables = stats.tables, elapsed_ms = stats.duration.as_millis() as u64, "import finished");

        if !job.skip_post_hooks {
            self.run_post_hooks(budget)?;
        }
        Ok(stats)
    }

    /// Run every configured hook. Failures become warnings; only
    /// cancellation stops the sequence. Returns the number that succeeded.
    pub fn run_post_hooks(&self, budget: &Budget) -> Result<usize> {
        let Some(runner) = &self.hook_runner else {
            return Ok(0);
        };
        let mut ok = 0;
        for hook in &self.hooks {
            budget.check()?;
            match runner.run_hook(hook, budget) {
                Ok(()) => ok += 1,
                Err(StaxError::Cancelled) => return Err(StaxError::Cancelled),
                Err(e) => self.warnings.push(
                    WarningSource::Hooks,
                    format!("hook '{}' failed: {}", hook.join(" "), e),
                ),
            }
        }
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLoader {
        seen: Mutex<Vec<u8>>,
    }

    impl DumpLoader for RecordingLoader {
        fn load(&self, input: &mut dyn Read, _: &str, _: bool, _: &Budget) -> Result<()> {
            let mut buf = Vec::new();
            input.read_to_end(&mut buf)?;
            *self.seen.lock().unwrap() = buf;
            Ok(())
        }
    }

    struct FailingHooks;

    impl HookRunner for FailingHooks {
        fn run_hook(&self, argv: &[String], _: &Budget) -> Result<()> {
            if argv[1] == "cache" {
                Err(StaxError::Internal("object cache offline".into()))
            } else {
                Ok(())
            }
        }
    }

    const DUMP: &str = "-- dump\nCREATE TABLE `wp_options` (id int);\nINSERT INTO wp_options VALUES (1);\ncreate table wp_posts (id int);\n";

    #[test]
    fn gzip_input_is_detected_and_tables_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.sql.gz");
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(DUMP.as_bytes()).unwrap();
        std::fs::write(&path, gz.finish().unwrap()).unwrap();

        let loader = Arc::new(RecordingLoader::default());
        let importer = Importer::new(loader.clone(), Warnings::new());
        let stats = importer
            .import(&ImportJob::new(&path, "db"), &Budget::unbounded("import"))
            .unwrap();
        assert_eq!(stats.tables, 2);
        assert_eq!(loader.seen.lock().unwrap().as_slice(), DUMP.as_bytes());
        assert!(path.exists());
    }

    #[test]
    fn temp_source_removed_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("download.sql");
        std::fs::write(&path, DUMP).unwrap();

        struct Broken;
        impl DumpLoader for Broken {
            fn load(&self, _: &mut dyn Read, _: &str, _: bool, _: &Budget) -> Result<()> {
                Err(StaxError::ImportFailed {
                    exit_code: 1,
                    stderr_tail: "ERROR 1064".into(),
                })
            }
        }

        let importer = Importer::new(Arc::new(Broken), Warnings::new());
        let mut job = ImportJob::new(&path, "db");
        job.remove_source = true;
        let err = importer.import(&job, &Budget::unbounded("import")).unwrap_err();
        assert!(matches!(err, StaxError::ImportFailed { exit_code: 1, .. }));
        assert!(!path.exists());
    }

    #[test]
    fn empty_dump_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.sql");
        std::fs::write(&path, b"").unwrap();
        let importer = Importer::new(Arc::new(RecordingLoader::default()), Warnings::new());
        assert!(matches!(
            importer.import(&ImportJob::new(&path, "db"), &Budget::unbounded("import")),
            Err(StaxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn hook_failures_become_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.sql");
        std::fs::write(&path, DUMP).unwrap();

        let warnings = Warnings::new();
        let importer = Importer::new(Arc::new(RecordingLoader::default()), warnings.clone())
            .with_hooks(
                Arc::new(FailingHooks),
                vec![
                    vec!["wp".into(), "cache".into(), "flush".into()],
                    vec!["wp".into(), "rewrite".into(), "flush".into()],
                ],
            );
        importer
            .import(&ImportJob::new(&path, "db"), &Budget::unbounded("import"))
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings.snapshot()[0].message.contains("wp cache flush"));

        let mut job = ImportJob::new(&path, "db");
        job.skip_post_hooks = true;
        importer.import(&job, &Budget::unbounded("import")).unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn benign_lines_recognized() {
        assert!(is_benign(
            "mysql: [Warning] Using a password on the command line interface can be insecure."
        ));
        assert!(!is_benign("ERROR 1064 (42000) at line 12: You have an error"));
    }

    #[test]
    fn cancelled_budget_stops_feed() {
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let budget = Budget::new(token, None, "import");
        let mut out = Vec::new();
        let err = feed(&mut DUMP.as_bytes(), &mut out, &budget).unwrap_err();
        assert!(matches!(err, StaxError::Cancelled));
        assert!(out.is_empty());
    }

    #[test]
    fn sqlite_loader_restores_dump() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.sql");
        std::fs::write(
            &path,
            "CREATE TABLE wp_posts (ID INTEGER PRIMARY KEY, post_title TEXT);\nINSERT INTO wp_posts VALUES (1, 'Hello');\n",
        )
        .unwrap();
        let importer = Importer::new(Arc::new(db.clone()), Warnings::new());
        let stats = importer
            .import(&ImportJob::new(&path, "main"), &Budget::unbounded("import"))
            .unwrap();
        assert_eq!(stats.tables, 1);
        assert_eq!(
            db.query_column("SELECT post_title FROM wp_posts").unwrap(),
            vec![Some("Hello".to_string())]
        );
    }
}
