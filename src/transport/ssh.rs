//! SSH sessions to the provider gateway.
//!
//! [`RemoteSession`] is the seam the sync engine and the coordinator talk
//! to; [`SshSession`] implements it over libssh2 in blocking mode. The
//! private key is handed to libssh2 from memory and never written to disk.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use ssh2::{HostKeyType, Session};

use super::known_hosts::{HostKeyStatus, KnownHostsStore};
use super::sanitize::command_line;
use crate::credentials::Secret;
use crate::error::{Result, StaxError, tail_lines};
use crate::process::{Budget, STDERR_TAIL_LINES};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_SESSION_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Per-call timeout for individual libssh2 operations.
const IO_TIMEOUT: Duration = Duration::from_secs(60);

const READ_CHUNK: usize = 64 * 1024;

/// Output of a buffered remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    /// Turn a non-zero exit into `RemoteCommandFailed`.
    pub fn success(self, command: &str) -> Result<Self> {
        if self.exit_code == 0 {
            Ok(self)
        } else {
            Err(StaxError::RemoteCommandFailed {
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr_tail: tail_lines(&self.stderr, STDERR_TAIL_LINES),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// One node of a remote tree, path relative to the listed root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Seconds since the epoch.
    pub mtime: Option<u64>,
    pub mode: Option<u32>,
}

/// Authenticated channel to the provider.
pub trait RemoteSession: Send + Sync {
    /// Run an already validated command line. Callers go through
    /// [`RemoteSession::exec`] or [`RemoteSession::exec_streaming`].
    /// Implementations must not interleave an exec with transfers on the
    /// same connection.
    fn exec_line(
        &self,
        line: &str,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
        budget: &Budget,
    ) -> Result<i32>;

    /// Recursive listing of `root`. Directories for which `descend`
    /// returns false are reported but not entered.
    fn list_tree(
        &self,
        root: &str,
        descend: &(dyn Fn(&str) -> bool + Sync),
        budget: &Budget,
    ) -> Result<Vec<RemoteEntry>>;

    /// Stream a remote file into `out`, returning the byte count.
    fn download(&self, remote: &str, out: &mut dyn Write, budget: &Budget) -> Result<u64>;

    fn stat(&self, remote: &str) -> Result<Option<RemoteEntry>>;

    fn remove_file(&self, remote: &str) -> Result<()>;

    /// Tear the channel down. Further calls fail.
    fn close(&self) {}

    /// Run a command, streaming its output. Every argument is validated
    /// before anything is sent.
    fn exec_streaming(
        &self,
        argv: &[&str],
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
        budget: &Budget,
    ) -> Result<i32> {
        let line = command_line(argv)?;
        tracing::debug!(command = %line, "remote exec");
        self.exec_line(&line, stdout, stderr, budget)
    }

    /// Run a command and buffer its output.
    fn exec(&self, argv: &[&str], budget: &Budget) -> Result<ExecOutput> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit_code = self.exec_streaming(argv, &mut stdout, &mut stderr, budget)?;
        Ok(ExecOutput {
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}

/// Login name for an install. The gateway expects `<install>@<install>`
/// unless the credentials carry an explicit SSH user.
pub fn login_name(install: &str, ssh_user: Option<&str>) -> String {
    match ssh_user {
        Some(user) if !user.is_empty() => user.to_string(),
        _ => format!("{}@{}", install, install),
    }
}

/// known_hosts name for a libssh2 host-key type.
pub fn key_type_name(kind: HostKeyType) -> &'static str {
    match kind {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        HostKeyType::Unknown => "unknown",
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

/// A live libssh2 session.
pub struct SshSession {
    session: Session,
    /// Exec switches the whole session to non-blocking mode, so it holds
    /// this exclusively while SFTP calls share it.
    io_mode: RwLock<()>,
    label: String,
    opened_at: Instant,
    max_lifetime: Duration,
}

fn ssh_err(context: &str, e: ssh2::Error) -> StaxError {
    StaxError::transport(format!("{}: {}", context, e))
}

fn io_err(context: &str, e: io::Error) -> StaxError {
    match e.kind() {
        io::ErrorKind::TimedOut => StaxError::Timeout {
            operation: context.to_string(),
        },
        _ => StaxError::transport(format!("{}: {}", context, e)),
    }
}

impl SshSession {
    /// Connect, verify the host key against the managed store, and
    /// authenticate with the in-memory key.
    pub fn connect(
        target: &SshTarget,
        key: &Secret,
        known_hosts: &KnownHostsStore,
    ) -> Result<(Self, HostKeyStatus)> {
        let label = format!("{}:{}", target.host, target.port);
        let tcp = Self::dial(&target.host, target.port)?;

        let mut session = Session::new().map_err(|e| ssh_err("ssh init", e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(IO_TIMEOUT.as_millis() as u32);
        session
            .handshake()
            .map_err(|e| ssh_err(&format!("handshake with {}", label), e))?;

        let (key_bytes, key_kind) = session
            .host_key()
            .ok_or_else(|| StaxError::transport(format!("{} offered no host key", label)))?;
        let status = known_hosts.verify(
            &target.host,
            target.port,
            key_type_name(key_kind),
            key_bytes,
        )?;

        session
            .userauth_pubkey_memory(&target.user, None, key.expose(), None)
            .map_err(|e| {
                StaxError::CredentialsRejected(format!(
                    "public key authentication as {} on {} failed: {}",
                    target.user, label, e
                ))
            })?;
        if !session.authenticated() {
            return Err(StaxError::CredentialsRejected(format!(
                "{} did not accept the key for {}",
                label, target.user
            )));
        }
        session.set_keepalive(false, KEEPALIVE_INTERVAL.as_secs() as u32);

        tracing::info!(host = %label, user = %target.user, "ssh session established");
        Ok((
            Self {
                session,
                io_mode: RwLock::new(()),
                label,
                opened_at: Instant::now(),
                max_lifetime: MAX_SESSION_LIFETIME,
            },
            status,
        ))
    }

    fn dial(host: &str, port: u16) -> Result<TcpStream> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| StaxError::transport(format!("resolve {}: {}", host, e)))?;
        let mut last = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = Some(e),
            }
        }
        Err(StaxError::transport(format!(
            "connect {}:{}: {}",
            host,
            port,
            last.map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses".into())
        )))
    }

    fn ensure_fresh(&self) -> Result<()> {
        if self.opened_at.elapsed() >= self.max_lifetime {
            return Err(StaxError::transport(format!(
                "session to {} exceeded its maximum lifetime",
                self.label
            )));
        }
        let _ = self.session.keepalive_send();
        Ok(())
    }

    fn blocking_io(&self) -> Result<RwLockReadGuard<'_, ()>> {
        let guard = self
            .io_mode
            .read()
            .map_err(|_| StaxError::transport(format!("session to {} is poisoned", self.label)))?;
        self.ensure_fresh()?;
        Ok(guard)
    }

    fn exclusive_io(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        let guard = self
            .io_mode
            .write()
            .map_err(|_| StaxError::transport(format!("session to {} is poisoned", self.label)))?;
        self.ensure_fresh()?;
        Ok(guard)
    }

    fn walk(
        &self,
        sftp: &ssh2::Sftp,
        root: &Path,
        rel: &str,
        descend: &(dyn Fn(&str) -> bool + Sync),
        budget: &Budget,
        out: &mut Vec<RemoteEntry>,
    ) -> Result<()> {
        budget.check()?;
        let dir = if rel.is_empty() {
            root.to_path_buf()
        } else {
            root.join(rel)
        };
        let listing = sftp
            .readdir(&dir)
            .map_err(|e| ssh_err(&format!("list {}", dir.display()), e))?;

        for (path, stat) in listing {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let child = if rel.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", rel, name)
            };
            let kind = if stat.file_type().is_symlink() {
                EntryKind::Symlink
            } else if stat.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            out.push(RemoteEntry {
                path: child.clone(),
                kind,
                size: stat.size.unwrap_or(0),
                mtime: stat.mtime,
                mode: stat.perm,
            });
            if kind == EntryKind::Dir && descend(&child) {
                self.walk(sftp, root, &child, descend, budget, out)?;
            }
        }
        Ok(())
    }
}

impl RemoteSession for SshSession {
    fn close(&self) {
        let _ = self.session.disconnect(None, "stax done", None);
    }

    fn exec_line(
        &self,
        line: &str,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
        budget: &Budget,
    ) -> Result<i32> {
        let _exclusive = self.exclusive_io()?;
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| ssh_err("open channel", e))?;
        channel
            .exec(line)
            .map_err(|e| ssh_err(&format!("exec '{}'", line), e))?;

        // Poll both streams so a chatty stderr cannot stall stdout.
        self.session.set_blocking(false);
        let pumped = pump(&mut channel, stdout, stderr, budget);
        self.session.set_blocking(true);
        pumped?;

        channel.wait_close().map_err(|e| ssh_err("close channel", e))?;
        channel.exit_status().map_err(|e| ssh_err("exit status", e))
    }

    fn list_tree(
        &self,
        root: &str,
        descend: &(dyn Fn(&str) -> bool + Sync),
        budget: &Budget,
    ) -> Result<Vec<RemoteEntry>> {
        let _shared = self.blocking_io()?;
        let sftp = self.session.sftp().map_err(|e| ssh_err("sftp", e))?;
        let mut out = Vec::new();
        self.walk(&sftp, Path::new(root), "", descend, budget, &mut out)?;
        Ok(out)
    }

    fn download(&self, remote: &str, out: &mut dyn Write, budget: &Budget) -> Result<u64> {
        let _shared = self.blocking_io()?;
        let sftp = self.session.sftp().map_err(|e| ssh_err("sftp", e))?;
        let mut file = sftp
            .open(Path::new(remote))
            .map_err(|e| ssh_err(&format!("open {}", remote), e))?;

        let mut buf = vec![0u8; READ_CHUNK];
        let mut total = 0u64;
        loop {
            budget.check()?;
            let n = file
                .read(&mut buf)
                .map_err(|e| io_err(&format!("read {}", remote), e))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            total += n as u64;
        }
        out.flush()?;
        Ok(total)
    }

    fn stat(&self, remote: &str) -> Result<Option<RemoteEntry>> {
        let _shared = self.blocking_io()?;
        let sftp = self.session.sftp().map_err(|e| ssh_err("sftp", e))?;
        match sftp.lstat(Path::new(remote)) {
            Ok(stat) => Ok(Some(RemoteEntry {
                path: remote.to_string(),
                kind: if stat.file_type().is_symlink() {
                    EntryKind::Symlink
                } else if stat.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
                size: stat.size.unwrap_or(0),
                mtime: stat.mtime,
                mode: stat.perm,
            })),
            // LIBSSH2_FX_NO_SUCH_FILE
            Err(e) if e.code() == ssh2::ErrorCode::SFTP(2) => Ok(None),
            Err(e) => Err(ssh_err(&format!("stat {}", remote), e)),
        }
    }

    fn remove_file(&self, remote: &str) -> Result<()> {
        let _shared = self.blocking_io()?;
        let sftp = self.session.sftp().map_err(|e| ssh_err("sftp", e))?;
        sftp.unlink(Path::new(remote))
            .map_err(|e| ssh_err(&format!("remove {}", remote), e))
    }
}

/// Drain stdout and stderr of a non-blocking channel until EOF.
fn pump(
    channel: &mut ssh2::Channel,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
    budget: &Budget,
) -> Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        budget.check()?;
        let mut progressed = false;

        match channel.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                stdout.write_all(&buf[..n])?;
                progressed = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(io_err("read stdout", e)),
        }
        match channel.stderr().read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                stderr.write_all(&buf[..n])?;
                progressed = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(io_err("read stderr", e)),
        }

        if channel.eof() && !progressed {
            return Ok(());
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_name_defaults_to_install_pair() {
        assert_eq!(login_name("mysite", None), "mysite@mysite");
        assert_eq!(login_name("mysite", Some("deploy")), "deploy");
        assert_eq!(login_name("mysite", Some("")), "mysite@mysite");
    }

    #[test]
    fn host_key_types_use_openssh_names() {
        assert_eq!(key_type_name(HostKeyType::Ed25519), "ssh-ed25519");
        assert_eq!(key_type_name(HostKeyType::Ecdsa256), "ecdsa-sha2-nistp256");
    }

    #[test]
    fn failed_exec_keeps_bounded_tail() {
        let stderr: String = (0..100).map(|i| format!("line {}\n", i)).collect();
        let err = ExecOutput {
            stdout: Vec::new(),
            stderr,
            exit_code: 3,
        }
        .success("wp db export")
        .unwrap_err();
        match err {
            StaxError::RemoteCommandFailed {
                exit_code,
                stderr_tail,
                ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr_tail.lines().count(), STDERR_TAIL_LINES);
                assert!(stderr_tail.ends_with("line 99"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn exec_waits_for_sftp_calls_to_finish() {
        let ssh = SshSession {
            session: Session::new().unwrap(),
            io_mode: RwLock::new(()),
            label: "host:22".into(),
            opened_at: Instant::now(),
            max_lifetime: MAX_SESSION_LIFETIME,
        };
        let shared = ssh.blocking_io().unwrap();
        assert!(ssh.blocking_io().is_ok());

        std::thread::scope(|scope| {
            let exec = scope.spawn(|| {
                let _exclusive = ssh.exclusive_io().unwrap();
                Instant::now()
            });
            std::thread::sleep(Duration::from_millis(50));
            let released = Instant::now();
            drop(shared);
            assert!(exec.join().unwrap() >= released);
        });
    }
}
