//! Node that answers "hello" with "world" and echoes everything else

use ringlink_core::{init_logging, IpcNode, Link, NodeHandler};
use std::thread;
use std::time::Duration;

struct Echo;

impl NodeHandler for Echo {
    fn on_packet(&mut self, link: &Link, packet_id: u16, payload: &[u8]) {
        let reply: &[u8] = if payload == b"hello" { b"world" } else { payload };
        if let Err(e) = link.send_packet(packet_id, reply) {
            tracing::warn!(packet_id, error = %e, "reply dropped");
        }
    }

    fn on_signal(&mut self, link: &Link, signal: u8) {
        tracing::debug!(signal, "signal received");
        if let Err(e) = link.send_signal(signal) {
            tracing::warn!(signal, error = %e, "signal echo failed");
        }
    }
}

fn main() {
    init_logging();

    let mut node = match IpcNode::connect_from_args() {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect");
            std::process::exit(1);
        }
    };

    let mut handler = Echo;
    loop {
        node.update(&mut handler);
        thread::sleep(Duration::from_millis(1));
    }
}
