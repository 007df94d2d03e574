//! Subprocess helpers: deadlines, cancellation and bounded stderr capture.
//!
//! Every local subprocess (container CLI, database client) is started with an
//! explicit argument vector. Nothing here goes through a shell.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Result, StaxError};

/// How often a waiting loop checks for exit, deadline and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum number of stderr lines kept for error surfaces.
pub const STDERR_TAIL_LINES: usize = 40;

/// Cancellation handle plus an optional deadline, checked by blocking loops
/// between units of work (chunks, files, batches).
#[derive(Debug, Clone)]
pub struct Budget {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    operation: String,
}

impl Budget {
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>, operation: &str) -> Self {
        Self {
            cancel,
            deadline: timeout.map(|t| Instant::now() + t),
            operation: operation.to_string(),
        }
    }

    /// No deadline and a token nobody cancels.
    pub fn unbounded(operation: &str) -> Self {
        Self::new(CancellationToken::new(), None, operation)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StaxError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StaxError::Timeout {
                operation: self.operation.clone(),
            });
        }
        Ok(())
    }
}

/// Wait for a child to exit, killing it when the deadline passes or the
/// token is cancelled.
pub fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancellationToken,
    operation: &str,
) -> Result<ExitStatus> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(StaxError::Cancelled);
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(StaxError::Timeout {
                operation: operation.to_string(),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Output of [`run_captured`].
#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl Captured {
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Run a command to completion under a deadline, collecting both streams.
pub fn run_captured(
    mut command: std::process::Command,
    timeout: Duration,
    cancel: &CancellationToken,
    operation: &str,
) -> Result<Captured> {
    use std::process::Stdio;

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| StaxError::Internal(format!("{}: cannot start: {}", operation, e)))?;

    let stdout = child.stdout.take().map(|mut out| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr = child.stderr.take().map(|mut err| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    let status = wait_with_deadline(&mut child, timeout, cancel, operation)?;
    Ok(Captured {
        status,
        stdout: stdout.and_then(|h| h.join().ok()).unwrap_or_default(),
        stderr: stderr.and_then(|h| h.join().ok()).unwrap_or_default(),
    })
}

/// Captures the tail of a stream on a background thread.
///
/// Every line is also handed to `on_line`, which the importer uses to keep
/// full stderr in verbose logs while surfacing only the tail.
pub struct TailCapture {
    lines: Arc<Mutex<VecDeque<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl TailCapture {
    pub fn spawn<R, F>(stream: R, max_lines: usize, on_line: F) -> Self
    where
        R: Read + Send + 'static,
        F: Fn(&str) -> bool + Send + 'static,
    {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(max_lines)));
        let sink = Arc::clone(&lines);
        let handle = std::thread::spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.split(b'\n') {
                let Ok(line) = line else { break };
                let text = String::from_utf8_lossy(&line).trim_end().to_string();
                // on_line returns false for lines that must not reach the tail
                if !on_line(&text) {
                    continue;
                }
                if let Ok(mut buf) = sink.lock() {
                    if buf.len() == max_lines {
                        buf.pop_front();
                    }
                    buf.push_back(text);
                }
            }
        });
        Self {
            lines,
            handle: Some(handle),
        }
    }

    /// Wait for the stream to close and return the captured tail.
    pub fn finish(mut self) -> String {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.lines
            .lock()
            .map(|l| l.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn tail_capture_keeps_last_lines_and_filters() {
        let input = Cursor::new(b"one\nskip me\ntwo\nthree\n".to_vec());
        let capture = TailCapture::spawn(input, 2, |line| !line.starts_with("skip"));
        assert_eq!(capture.finish(), "two\nthree");
    }

    #[test]
    fn budget_reports_cancel_before_timeout() {
        let token = CancellationToken::new();
        let budget = Budget::new(token.clone(), Some(Duration::ZERO), "export");
        assert!(matches!(budget.check(), Err(StaxError::Timeout { .. })));
        token.cancel();
        assert!(matches!(budget.check(), Err(StaxError::Cancelled)));
        assert!(Budget::unbounded("x").check().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn run_captured_collects_both_streams() {
        let mut cmd = std::process::Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let captured =
            run_captured(cmd, Duration::from_secs(5), &CancellationToken::new(), "sh").unwrap();
        assert_eq!(captured.code(), 3);
        assert_eq!(captured.stdout, b"out\n");
        assert_eq!(captured.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn deadline_kills_slow_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("sleep should spawn");
        let err = wait_with_deadline(
            &mut child,
            Duration::from_millis(200),
            &CancellationToken::new(),
            "sleep",
        )
        .unwrap_err();
        assert!(matches!(err, StaxError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("sleep should spawn");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err =
            wait_with_deadline(&mut child, Duration::from_secs(10), &cancel, "sleep").unwrap_err();
        assert!(matches!(err, StaxError::Cancelled));
    }
}
