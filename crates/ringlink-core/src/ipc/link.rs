//! Send side of one duplex session

use crate::ring::RingChannel;
use crate::{Error, Result};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Outbound ring plus control socket, shareable across threads
///
/// The ring only tolerates one writer, so every push goes through the
/// mutex. Once the session is torn down the link is closed and further
/// sends fail with [`Error::LinkClosed`].
pub struct Link {
    outbound: Mutex<RingChannel>,
    socket: UnixStream,
    open: AtomicBool,
}

/// Outcome of a non-blocking signal read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignalRead {
    Signal(u8),
    Idle,
    Disconnected,
}

impl Link {
    pub(crate) fn new(outbound: RingChannel, socket: UnixStream) -> Self {
        Self {
            outbound: Mutex::new(outbound),
            socket,
            open: AtomicBool::new(true),
        }
    }

    /// Whether the session behind this link is still alive
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue a framed packet for the peer
    ///
    /// A full ring is reported as [`Error::RingFull`]; the packet is not queued.
    pub fn send_packet(&self, packet_id: u16, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::LinkClosed);
        }
        let mut ring = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        ring.push(packet_id, payload)
    }

    /// Send a one-byte out-of-band signal over the control socket
    pub fn send_signal(&self, signal: u8) -> Result<()> {
        if !self.is_open() {
            return Err(Error::LinkClosed);
        }
        match (&self.socket).write(&[signal]) {
            Ok(1) => Ok(()),
            Ok(_) => Err(Error::LinkClosed),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Free space left in the outbound ring
    pub fn free_bytes(&self) -> usize {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free_bytes()
    }

    /// Non-blocking read of one signal byte
    pub(crate) fn read_signal(&self) -> SignalRead {
        let mut byte = [0u8; 1];
        match (&self.socket).read(&mut byte) {
            Ok(1) => SignalRead::Signal(byte[0]),
            Ok(_) => SignalRead::Disconnected,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                SignalRead::Idle
            }
            Err(e) => {
                tracing::debug!(error = %e, "control socket read failed");
                SignalRead::Disconnected
            }
        }
    }

    /// Mark closed and shut the socket down so the peer sees EOF
    pub(crate) fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.socket.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}
