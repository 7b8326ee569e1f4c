//! Manager side: spawns nodes and owns their sessions

use super::descriptor::ConnectionDescriptor;
use super::link::{Link, SignalRead};
use super::NodeId;
use crate::config::{ManagerConfig, RECEIVE_BUFFER_SIZE};
use crate::layout::{DuplexChannel, SharedChannelLayout};
use crate::process::{self, OutputLineFn, ProcessHandle};
use crate::ring::RingChannel;
use crate::shm::SharedMemory;
use crate::{Error, Result};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::mem;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// Callbacks driven by [`IpcManager::update`]
pub trait ManagerHandler {
    /// A packet arrived from `node`; `payload` is only valid during the call
    fn on_packet(&mut self, node: NodeId, link: &Link, packet_id: u16, payload: &[u8]);

    /// A signal byte arrived from `node`
    fn on_signal(&mut self, node: NodeId, link: &Link, signal: u8);

    /// The session was torn down by `update`; the node id is no longer valid
    fn on_node_closed(&mut self, node: NodeId, reason: CloseReason) {
        let _ = (node, reason);
    }
}

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Spawned, waiting for the node to connect
    Pending,
    /// Connected; packets and signals flow
    Active,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The node did not connect within the pending timeout
    Timeout,
    /// The control socket reported EOF or a hard error
    Disconnected,
    /// The inbound ring held an impossible packet
    Corrupted,
    /// Closed by [`IpcManager::shutdown_node`] or manager drop
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::Timeout => "timeout",
            CloseReason::Disconnected => "disconnected",
            CloseReason::Corrupted => "corrupted",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

/// Socket file that is removed when dropped
struct SocketFile(PathBuf);

impl SocketFile {
    fn bind(path: PathBuf) -> io::Result<(UnixListener, SocketFile)> {
        // A stale file from a crashed run would make bind fail
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        let file = SocketFile(path);
        listener.set_nonblocking(true)?;
        Ok((listener, file))
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %self.0.display(), error = %e, "failed to remove socket file");
            }
        }
    }
}

enum SessionState {
    Pending {
        listener: UnixListener,
        _socket_file: SocketFile,
        outbound: RingChannel,
    },
    Active {
        link: Arc<Link>,
    },
    Closed,
}

struct Session {
    sid: u32,
    created: Instant,
    process: ProcessHandle,
    shm: Arc<SharedMemory>,
    inbound: RingChannel,
    state: SessionState,
}

impl Session {
    fn state(&self) -> Option<NodeState> {
        match self.state {
            SessionState::Pending { .. } => Some(NodeState::Pending),
            SessionState::Active { .. } => Some(NodeState::Active),
            SessionState::Closed => None,
        }
    }

    /// Accept the node's connection if it has arrived
    fn poll_accept(&mut self) -> io::Result<bool> {
        let SessionState::Pending { listener, .. } = &self.state else {
            return Ok(false);
        };
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                return Ok(false)
            }
            Err(e) => return Err(e),
        };
        stream.set_nonblocking(true)?;

        if let SessionState::Pending { outbound, .. } = mem::replace(&mut self.state, SessionState::Closed) {
            // Listener and socket file are dropped with the pending state
            self.state = SessionState::Active {
                link: Arc::new(Link::new(outbound, stream)),
            };
        }
        Ok(true)
    }

    /// Release everything the session holds; safe to call twice
    fn teardown(&mut self) {
        process::terminate(&self.process);
        match mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Active { link } => link.close(),
            SessionState::Pending { .. } | SessionState::Closed => {}
        }
        if let Err(e) = self.shm.unlink() {
            tracing::debug!(session = self.sid, error = %e, "shared memory already unlinked");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Spawns node processes and multiplexes their channels
///
/// All methods are meant for one driving thread; use [`IpcManager::link`]
/// to send from elsewhere.
pub struct IpcManager {
    config: ManagerConfig,
    receive_buffer: Vec<u8>,
    sessions: HashMap<NodeId, Session>,
}

impl IpcManager {
    /// Create a manager with the default configuration
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    /// Create a manager with `config`
    pub fn with_config(config: ManagerConfig) -> Self {
        Self {
            config,
            receive_buffer: vec![0u8; RECEIVE_BUFFER_SIZE],
            sessions: HashMap::new(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Start `executable` as a node with a fresh shared block of `shared_memory_size` bytes
    ///
    /// The node is [`NodeState::Pending`] until it connects back; drive
    /// [`IpcManager::update`] or [`IpcManager::wait_till_node_is_online`].
    pub fn spawn_node(&mut self, executable: impl AsRef<Path>, shared_memory_size: u32) -> Result<NodeId> {
        let executable = executable.as_ref();
        let sid = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let pid = process::current_process_id();

        let socket_path = self
            .config
            .socket_dir
            .join(format!("ringlink_{}_{}.sock", pid, sid));
        let (listener, socket_file) = SocketFile::bind(socket_path.clone())
            .map_err(|e| Error::Spawn(format!("control socket {}: {}", socket_path.display(), e)))?;

        let shm_name = format!("/ringlink_{}_{}", pid, sid);
        let shm = Arc::new(SharedMemory::create(&shm_name, shared_memory_size as usize)?);
        let DuplexChannel { outbound, inbound } = SharedChannelLayout::format(Arc::clone(&shm))?;

        let descriptor = ConnectionDescriptor {
            socket_path,
            shm_name,
            shm_size: shared_memory_size,
        };

        let on_line: OutputLineFn = Arc::new(move |line: &str| {
            tracing::debug!(session = sid, "{}", line);
        });
        let process = process::spawn(
            executable,
            [descriptor.to_string()],
            on_line,
            move |status| match status {
                Ok(code) => tracing::info!(session = sid, code, "node exited"),
                Err(e) => tracing::warn!(session = sid, error = %e, "failed to reap node"),
            },
        )?;

        let node = NodeId::new(process.id());
        tracing::info!(
            node = %node,
            session = sid,
            executable = %executable.display(),
            shm = %descriptor.shm_name,
            "spawned node"
        );

        self.sessions.insert(
            node,
            Session {
                sid,
                created: Instant::now(),
                process,
                shm,
                inbound,
                state: SessionState::Pending {
                    listener,
                    _socket_file: socket_file,
                    outbound,
                },
            },
        );
        Ok(node)
    }

    /// Advance every session without blocking
    ///
    /// Expires and promotes pending sessions, then drains packets and at
    /// most one signal per active session into `handler`.
    pub fn update<H: ManagerHandler + ?Sized>(&mut self, handler: &mut H) {
        let now = Instant::now();
        let mut closed = Vec::new();

        for (node, session) in self.sessions.iter_mut() {
            if session.state() != Some(NodeState::Pending) {
                continue;
            }
            if now.duration_since(session.created) > self.config.pending_timeout {
                tracing::warn!(node = %node, "node did not connect in time");
                closed.push((*node, CloseReason::Timeout));
                continue;
            }
            match session.poll_accept() {
                Ok(true) => tracing::info!(node = %node, "node online"),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(node = %node, error = %e, "accept failed");
                    closed.push((*node, CloseReason::Disconnected));
                }
            }
        }
        self.close_sessions(&mut closed, handler);

        for (node, session) in self.sessions.iter_mut() {
            let SessionState::Active { link } = &session.state else {
                continue;
            };

            let mut reason = None;
            loop {
                match session.inbound.pop(&mut self.receive_buffer) {
                    Ok(Some(header)) => {
                        handler.on_packet(*node, link, header.id, &self.receive_buffer[..header.payload_size()]);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(node = %node, error = %e, "inbound ring corrupted");
                        reason = Some(CloseReason::Corrupted);
                        break;
                    }
                }
            }

            if reason.is_none() {
                match link.read_signal() {
                    SignalRead::Signal(signal) => handler.on_signal(*node, link, signal),
                    SignalRead::Idle => {}
                    SignalRead::Disconnected => reason = Some(CloseReason::Disconnected),
                }
            }

            if let Some(reason) = reason {
                closed.push((*node, reason));
            }
        }
        self.close_sessions(&mut closed, handler);
    }

    /// Drive `update` until `node` leaves the pending state
    ///
    /// Returns true iff the node is active afterwards.
    pub fn wait_till_node_is_online<H: ManagerHandler + ?Sized>(&mut self, node: NodeId, handler: &mut H) -> bool {
        loop {
            self.update(handler);
            match self.node_state(node) {
                Some(NodeState::Pending) => thread::sleep(self.config.poll_interval),
                Some(NodeState::Active) => return true,
                None => return false,
            }
        }
    }

    /// Kill the node and release its socket and shared memory
    ///
    /// Unknown ids are ignored.
    pub fn shutdown_node(&mut self, node: NodeId) {
        if let Some(mut session) = self.sessions.remove(&node) {
            session.teardown();
            tracing::info!(node = %node, reason = %CloseReason::Shutdown, "session closed");
        }
    }

    /// Queue a packet for an active node
    pub fn send_packet(&self, node: NodeId, packet_id: u16, payload: &[u8]) -> Result<()> {
        self.active_link(node)?.send_packet(packet_id, payload)
    }

    /// Send a one-byte signal to an active node
    pub fn send_signal(&self, node: NodeId, signal: u8) -> Result<()> {
        self.active_link(node)?.send_signal(signal)
    }

    /// Send handle for an active node, usable from other threads
    pub fn link(&self, node: NodeId) -> Option<Arc<Link>> {
        self.active_link(node).ok().cloned()
    }

    /// State of `node`, or `None` once its session is gone
    pub fn node_state(&self, node: NodeId) -> Option<NodeState> {
        self.sessions.get(&node).and_then(Session::state)
    }

    /// Name of the shared block backing `node`
    pub fn shared_memory_name(&self, node: NodeId) -> Option<&str> {
        self.sessions.get(&node).map(|session| session.shm.name())
    }

    /// Number of pending and active sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Ids of all live sessions
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.sessions.keys().copied()
    }

    fn active_link(&self, node: NodeId) -> Result<&Arc<Link>> {
        match self.sessions.get(&node).map(|session| &session.state) {
            Some(SessionState::Active { link }) => Ok(link),
            _ => Err(Error::NodeNotFound(node.get())),
        }
    }

    fn close_sessions<H: ManagerHandler + ?Sized>(&mut self, closed: &mut Vec<(NodeId, CloseReason)>, handler: &mut H) {
        for (node, reason) in closed.drain(..) {
            if let Some(mut session) = self.sessions.remove(&node) {
                session.teardown();
                tracing::info!(node = %node, reason = %reason, "session closed");
                handler.on_node_closed(node, reason);
            }
        }
    }
}

impl Default for IpcManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IpcManager {
    fn drop(&mut self) {
        for (node, mut session) in self.sessions.drain() {
            session.teardown();
            tracing::debug!(node = %node, "session released on manager drop");
        }
    }
}

/// Resolve `name` next to the running executable, falling back to `name` itself
pub fn sibling_executable(name: impl AsRef<OsStr>) -> PathBuf {
    let name = name.as_ref();
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}
