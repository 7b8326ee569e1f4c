//! Node side: connects back to the manager that spawned this process

use super::descriptor::ConnectionDescriptor;
use super::link::{Link, SignalRead};
use crate::config::{NODE_EXIT_MANAGER_LOST, RECEIVE_BUFFER_SIZE};
use crate::layout::{DuplexChannel, SharedChannelLayout};
use crate::ring::RingChannel;
use crate::shm::SharedMemory;
use crate::Result;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

/// Callbacks driven by [`IpcNode::poll`]
pub trait NodeHandler {
    /// A packet arrived from the manager
    fn on_packet(&mut self, link: &Link, packet_id: u16, payload: &[u8]);

    /// A signal byte arrived from the manager
    fn on_signal(&mut self, link: &Link, signal: u8);
}

/// Result of one [`IpcNode::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The control socket closed; the channel is unusable from now on
    ManagerLost,
}

/// Child-side endpoint of a session
pub struct IpcNode {
    descriptor: ConnectionDescriptor,
    shm: Arc<SharedMemory>,
    inbound: RingChannel,
    link: Arc<Link>,
    receive_buffer: Vec<u8>,
}

impl IpcNode {
    /// Connect using the descriptor the manager passed on the command line
    pub fn connect(descriptor: &str) -> Result<Self> {
        let descriptor: ConnectionDescriptor = descriptor.parse()?;

        let socket = UnixStream::connect(&descriptor.socket_path)?;
        socket.set_nonblocking(true)?;

        let shm = Arc::new(SharedMemory::open(&descriptor.shm_name)?);
        let DuplexChannel { outbound, inbound } =
            SharedChannelLayout::attach(Arc::clone(&shm), descriptor.shm_size as usize)?;

        tracing::debug!(
            socket = %descriptor.socket_path.display(),
            shm = %descriptor.shm_name,
            "connected to manager"
        );

        Ok(Self {
            descriptor,
            shm,
            inbound,
            link: Arc::new(Link::new(outbound, socket)),
            receive_buffer: vec![0u8; RECEIVE_BUFFER_SIZE],
        })
    }

    /// Connect using the first command line argument
    pub fn connect_from_args() -> Result<Self> {
        let arg = std::env::args()
            .nth(1)
            .ok_or_else(|| crate::Error::Parse("missing connection descriptor argument".to_string()))?;
        Self::connect(&arg)
    }

    /// Descriptor this node connected with
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Drain pending packets and at most one signal into `handler`
    ///
    /// Never blocks. Once the manager is gone the shared memory name is
    /// unlinked and every later call reports [`Liveness::ManagerLost`].
    pub fn poll<H: NodeHandler + ?Sized>(&mut self, handler: &mut H) -> Result<Liveness> {
        if !self.link.is_open() {
            return Ok(Liveness::ManagerLost);
        }

        while let Some(header) = self.inbound.pop(&mut self.receive_buffer)? {
            handler.on_packet(&self.link, header.id, &self.receive_buffer[..header.payload_size()]);
        }

        match self.link.read_signal() {
            SignalRead::Signal(signal) => {
                handler.on_signal(&self.link, signal);
                Ok(Liveness::Alive)
            }
            SignalRead::Idle => Ok(Liveness::Alive),
            SignalRead::Disconnected => {
                self.abandon();
                Ok(Liveness::ManagerLost)
            }
        }
    }

    /// [`IpcNode::poll`], exiting the process once the manager is gone
    pub fn update<H: NodeHandler + ?Sized>(&mut self, handler: &mut H) {
        match self.poll(handler) {
            Ok(Liveness::Alive) => {}
            Ok(Liveness::ManagerLost) => {
                tracing::warn!("manager disconnected, exiting");
                std::process::exit(NODE_EXIT_MANAGER_LOST);
            }
            Err(e) => {
                tracing::error!(error = %e, "channel failure, exiting");
                self.abandon();
                std::process::exit(NODE_EXIT_MANAGER_LOST);
            }
        }
    }

    /// Queue a packet for the manager
    pub fn send_packet(&self, packet_id: u16, payload: &[u8]) -> Result<()> {
        self.link.send_packet(packet_id, payload)
    }

    /// Send a one-byte signal to the manager
    pub fn send_signal(&self, signal: u8) -> Result<()> {
        self.link.send_signal(signal)
    }

    /// Send handle usable from other threads
    pub fn link(&self) -> Arc<Link> {
        Arc::clone(&self.link)
    }

    fn abandon(&self) {
        self.link.close();
        if let Err(e) = self.shm.unlink() {
            tracing::debug!(error = %e, "shared memory already unlinked");
        }
    }
}
