//! Authenticated channels to the provider: SSH sessions, remote commands,
//! file sync and verification.

pub mod filter;
pub mod known_hosts;
pub mod sanitize;
pub mod ssh;
pub mod sync;
pub mod throttle;

pub use known_hosts::{HostKeyStatus, KnownHostsStore};
pub use ssh::{EntryKind, ExecOutput, RemoteEntry, RemoteSession, SshSession, SshTarget};
pub use sync::{SyncEngine, SyncPlan, SyncStats, TransferOptions};
