//! Manager/node lifecycle against the real echo_node binary

use ringlink_core::{
    CloseReason, Error, IpcManager, Link, ManagerConfig, ManagerHandler, NodeId, NodeState, SharedMemory,
};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

const ECHO_NODE: &str = env!("CARGO_BIN_EXE_echo_node");

#[derive(Default)]
struct Collector {
    packets: Vec<(NodeId, u16, Vec<u8>)>,
    signals: Vec<(NodeId, u8)>,
    closed: Vec<(NodeId, CloseReason)>,
}

impl ManagerHandler for Collector {
    fn on_packet(&mut self, node: NodeId, _link: &Link, packet_id: u16, payload: &[u8]) {
        self.packets.push((node, packet_id, payload.to_vec()));
    }

    fn on_signal(&mut self, node: NodeId, _link: &Link, signal: u8) {
        self.signals.push((node, signal));
    }

    fn on_node_closed(&mut self, node: NodeId, reason: CloseReason) {
        self.closed.push((node, reason));
    }
}

fn socket_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ringlink_it_{}_{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn manager(tag: &str) -> (IpcManager, PathBuf) {
    let dir = socket_dir(tag);
    let config = ManagerConfig::default()
        .with_socket_dir(&dir)
        .with_pending_timeout(Duration::from_secs(10));
    (IpcManager::with_config(config), dir)
}

fn pump_until(manager: &mut IpcManager, handler: &mut Collector, done: impl Fn(&Collector) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done(handler) {
        assert!(Instant::now() < deadline, "timed out");
        manager.update(handler);
        thread::sleep(Duration::from_millis(1));
    }
}

fn socket_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

/// A node that ignores its descriptor and never connects
fn sleeper() -> PathBuf {
    static SCRIPT: OnceLock<PathBuf> = OnceLock::new();
    SCRIPT
        .get_or_init(|| {
            let dir = std::env::temp_dir().join(format!("ringlink_it_bin_{}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join("sleeper.sh");
            std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        })
        .clone()
}

fn spawn_sleeper(manager: &mut IpcManager) -> NodeId {
    // A fork on another test thread can briefly hold the fresh script open (ETXTBSY)
    for _ in 0..50 {
        match manager.spawn_node(sleeper(), 64 * 1024) {
            Ok(node) => return node,
            Err(Error::Spawn(_)) => thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("{}", e),
        }
    }
    panic!("sleeper never started");
}

fn is_alive(node: NodeId) -> bool {
    kill(Pid::from_raw(node.get() as i32), None).is_ok()
}

/// Wait for the reaper to collect a killed node
fn wait_gone(node: NodeId) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while is_alive(node) {
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
fn test_hello_world_exchange() {
    let (mut manager, dir) = manager("hello");
    let mut handler = Collector::default();

    let node = manager.spawn_node(ECHO_NODE, 64 * 1024).unwrap();
    assert!(manager.wait_till_node_is_online(node, &mut handler));
    assert_eq!(manager.node_state(node), Some(NodeState::Active));
    // Promotion removes the socket file
    assert_eq!(socket_files(&dir), 0);

    manager.send_packet(node, 1, b"hello").unwrap();
    manager.send_packet(node, 2, b"again").unwrap();
    manager.send_packet(node, 3, b"").unwrap();
    pump_until(&mut manager, &mut handler, |h| h.packets.len() == 3);

    assert_eq!(
        handler.packets,
        vec![
            (node, 1, b"world".to_vec()),
            (node, 2, b"again".to_vec()),
            (node, 3, Vec::new()),
        ]
    );

    manager.send_signal(node, 7).unwrap();
    pump_until(&mut manager, &mut handler, |h| !h.signals.is_empty());
    assert_eq!(handler.signals, vec![(node, 7)]);

    manager.shutdown_node(node);
    assert!(handler.closed.is_empty());
    let _ = std::fs::remove_dir(&dir);
}

#[test]
fn test_send_through_link_from_other_thread() {
    let (mut manager, dir) = manager("link");
    let mut handler = Collector::default();

    let node = manager.spawn_node(ECHO_NODE, 64 * 1024).unwrap();
    assert!(manager.wait_till_node_is_online(node, &mut handler));

    let link = manager.link(node).unwrap();
    let sender = thread::spawn(move || {
        for i in 0..100u16 {
            let payload = i.to_le_bytes();
            while let Err(e) = link.send_packet(i, &payload) {
                assert!(e.is_retryable(), "{}", e);
                thread::yield_now();
            }
        }
        link
    });
    pump_until(&mut manager, &mut handler, |h| h.packets.len() == 100);
    let link = sender.join().unwrap();

    for (i, (from, id, payload)) in handler.packets.iter().enumerate() {
        assert_eq!(*from, node);
        assert_eq!(*id, i as u16);
        assert_eq!(payload, &(i as u16).to_le_bytes());
    }

    manager.shutdown_node(node);
    assert!(!link.is_open());
    assert!(matches!(link.send_packet(1, b"late"), Err(Error::LinkClosed)));
    let _ = std::fs::remove_dir(&dir);
}

#[test]
fn test_shutdown_leaves_no_trace() {
    let (mut manager, dir) = manager("shutdown");
    let mut handler = Collector::default();

    let node = manager.spawn_node(ECHO_NODE, 64 * 1024).unwrap();
    let shm_name = manager.shared_memory_name(node).unwrap().to_string();
    assert!(manager.wait_till_node_is_online(node, &mut handler));

    manager.shutdown_node(node);
    manager.shutdown_node(node);

    assert_eq!(manager.session_count(), 0);
    assert_eq!(manager.node_state(node), None);
    assert!(SharedMemory::open(&shm_name).is_err());
    assert_eq!(socket_files(&dir), 0);
    assert!(matches!(manager.send_packet(node, 1, b"x"), Err(Error::NodeNotFound(_))));
    let _ = std::fs::remove_dir(&dir);
}

#[test]
fn test_manager_drop_releases_pending_and_active() {
    let (mut manager, dir) = manager("drop");
    let mut handler = Collector::default();

    let active = manager.spawn_node(ECHO_NODE, 64 * 1024).unwrap();
    assert!(manager.wait_till_node_is_online(active, &mut handler));
    let pending = spawn_sleeper(&mut manager);
    assert_eq!(manager.node_state(pending), Some(NodeState::Pending));
    assert!(is_alive(pending));

    let names = [
        manager.shared_memory_name(active).unwrap().to_string(),
        manager.shared_memory_name(pending).unwrap().to_string(),
    ];
    drop(manager);

    for name in &names {
        assert!(SharedMemory::open(name).is_err(), "{} survived", name);
    }
    assert!(wait_gone(active));
    assert!(wait_gone(pending));
    assert_eq!(socket_files(&dir), 0);
    let _ = std::fs::remove_dir(&dir);
}

#[test]
fn test_node_that_never_connects_times_out() {
    let dir = socket_dir("timeout");
    let config = ManagerConfig::default()
        .with_socket_dir(&dir)
        .with_pending_timeout(Duration::from_millis(100));
    let mut manager = IpcManager::with_config(config);
    let mut handler = Collector::default();

    let node = spawn_sleeper(&mut manager);
    let shm_name = manager.shared_memory_name(node).unwrap().to_string();
    assert!(is_alive(node));
    assert!(!manager.wait_till_node_is_online(node, &mut handler));

    assert_eq!(handler.closed, vec![(node, CloseReason::Timeout)]);
    assert_eq!(manager.session_count(), 0);
    assert!(wait_gone(node), "timed-out node still running");
    assert!(SharedMemory::open(&shm_name).is_err());
    assert_eq!(socket_files(&dir), 0);
    let _ = std::fs::remove_dir(&dir);
}

#[test]
fn test_node_exit_is_reported_as_disconnect() {
    let (mut manager, dir) = manager("exit");
    let mut handler = Collector::default();

    let node = manager.spawn_node(ECHO_NODE, 64 * 1024).unwrap();
    assert!(manager.wait_till_node_is_online(node, &mut handler));

    kill(Pid::from_raw(node.get() as i32), nix::sys::signal::Signal::SIGKILL).unwrap();
    pump_until(&mut manager, &mut handler, |h| !h.closed.is_empty());

    assert_eq!(handler.closed, vec![(node, CloseReason::Disconnected)]);
    assert_eq!(manager.node_state(node), None);
    let _ = std::fs::remove_dir(&dir);
}
