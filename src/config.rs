// Server settings.
//
// `ServerConfig` carries the values the command line can change and builds the retransmit policy
// and file store from them.

use crate::retransmit::RetransmitPolicy;
use crate::store::FileStore;
use crate::tftp::DEFAULT_PORT;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Everything needed to start a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the single UDP socket binds to.
    pub bind: SocketAddr,

    /// Directory files are served from and stored under.
    pub root: PathBuf,

    /// How long to wait for a reply before resending.
    pub timeout: Duration,

    /// Resends attempted before a silent client's session is dropped.
    pub max_retries: u32,

    /// Upper bound on a single receive, so the retransmit sweep runs even when no traffic arrives.
    pub poll_interval: Duration,

    pub allow_writes: bool,
    pub allow_overwrite: bool,

    /// Requests from new clients are refused once this many sessions are live.
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: (Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            root: PathBuf::from("."),
            timeout: Duration::from_secs(1),
            max_retries: 5,
            poll_interval: Duration::from_millis(100),
            allow_writes: true,
            allow_overwrite: true,
            max_sessions: 1024,
        }
    }
}

impl ServerConfig {
    pub fn retransmit_policy(&self) -> RetransmitPolicy {
        RetransmitPolicy {
            timeout: self.timeout,
            max_retries: self.max_retries,
        }
    }

    pub fn file_store(&self) -> FileStore {
        FileStore::new(self.root.clone())
            .read_only(!self.allow_writes)
            .allow_overwrite(self.allow_overwrite)
    }
}
