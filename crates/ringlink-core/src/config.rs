//! Manager configuration and protocol constants

use std::path::PathBuf;
use std::time::Duration;

/// Default size of the shared block handed to each node
pub const DEFAULT_NODE_SHARED_MEMORY_SIZE: u32 = 4 * 1024 * 1024;

/// Scratch buffer size for draining rings; fits the largest payload
pub const RECEIVE_BUFFER_SIZE: usize = u16::MAX as usize + 1;

/// How long a spawned node may take to connect back
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between polls while waiting for a node to come online
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Exit code of a node whose manager went away
pub const NODE_EXIT_MANAGER_LOST: i32 = 255;

/// Tunables for [`crate::IpcManager`]
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Pending sessions older than this are torn down by `update`
    pub pending_timeout: Duration,
    /// Sleep between `update` calls in `wait_till_node_is_online`
    pub poll_interval: Duration,
    /// Directory for the per-session control sockets
    pub socket_dir: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            socket_dir: std::env::temp_dir(),
        }
    }
}

impl ManagerConfig {
    /// Set the pending timeout
    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// Set the socket directory
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }
}
