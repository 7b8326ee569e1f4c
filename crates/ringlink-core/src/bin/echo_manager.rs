//! Spawn echo nodes, greet each of them from the scheduler, print the replies

use ringlink_core::ipc::sibling_executable;
use ringlink_core::{
    init_logging, CloseReason, IpcManager, Link, ManagerHandler, NodeId, Priority, Schedule, Scheduler,
    DEFAULT_NODE_SHARED_MEMORY_SIZE,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Replies {
    received: HashMap<NodeId, Vec<String>>,
}

impl ManagerHandler for Replies {
    fn on_packet(&mut self, node: NodeId, _link: &Link, packet_id: u16, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).into_owned();
        tracing::info!(node = %node, packet_id, reply = %text, "reply");
        self.received.entry(node).or_default().push(text);
    }

    fn on_signal(&mut self, node: NodeId, _link: &Link, signal: u8) {
        tracing::info!(node = %node, signal, "signal");
    }

    fn on_node_closed(&mut self, node: NodeId, reason: CloseReason) {
        tracing::warn!(node = %node, reason = %reason, "node closed");
    }
}

fn main() -> ringlink_core::Result<()> {
    init_logging();

    let node_count: usize = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(2);
    let executable = sibling_executable("echo_node");

    let mut manager = IpcManager::new();
    let mut handler = Replies::default();
    let mut nodes = Vec::with_capacity(node_count);
    for _ in 0..node_count {
        let node = manager.spawn_node(&executable, DEFAULT_NODE_SHARED_MEMORY_SIZE)?;
        if manager.wait_till_node_is_online(node, &mut handler) {
            nodes.push(node);
        }
    }

    // Fan the greetings out over the pool; links are safe to share across threads
    let scheduler = Scheduler::new()?;
    let schedule = Schedule::new();
    for (i, node) in nodes.iter().enumerate() {
        let Some(link) = manager.link(*node) else {
            continue;
        };
        let node = *node;
        scheduler.schedule_task(
            move |worker| {
                for message in ["hello", "ringlink"] {
                    if let Err(e) = link.send_packet(i as u16 + 1, message.as_bytes()) {
                        tracing::warn!(node = %node, worker, error = %e, "send failed");
                    }
                }
            },
            node.get() as u64,
            &schedule,
            Priority::Normal,
        );
    }
    scheduler.wait_for_schedule_completion(&schedule);

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        manager.update(&mut handler);
        let done = nodes
            .iter()
            .all(|node| handler.received.get(node).map_or(0, Vec::len) >= 2);
        if done {
            break;
        }
        std::thread::sleep(manager.config().poll_interval);
    }

    for node in &nodes {
        let replies = handler.received.get(node).cloned().unwrap_or_default();
        println!("{}: {}", node, replies.join(", "));
        manager.shutdown_node(*node);
    }
    scheduler.terminate();
    Ok(())
}
