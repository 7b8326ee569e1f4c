//! ringlink - Shared-memory packet channels between a manager and its child processes

pub mod config;
pub mod error;
pub mod ipc;
pub mod layout;
pub mod process;
pub mod region;
pub mod ring;
pub mod schedule;
pub mod scheduler;
pub mod shm;

pub use config::{ManagerConfig, DEFAULT_NODE_SHARED_MEMORY_SIZE, NODE_EXIT_MANAGER_LOST};
pub use error::{Error, Result};
pub use ipc::{
    CloseReason, ConnectionDescriptor, IpcManager, IpcNode, Link, Liveness, ManagerHandler, NodeHandler, NodeId,
    NodeState,
};
pub use layout::{DuplexChannel, SharedChannelLayout};
pub use region::{HeapRegion, Region};
pub use ring::{PacketHeader, RingChannel, MAX_PAYLOAD_SIZE};
pub use schedule::Schedule;
pub use scheduler::{run_detached, Priority, Scheduler, TaskTag, WorkerId, MAIN_THREAD_WORKER_ID};
pub use shm::SharedMemory;

/// Install a `tracing` subscriber writing to stderr, filtered by `RUST_LOG`
///
/// Defaults to `info` when `RUST_LOG` is unset. Calling it twice is harmless.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
