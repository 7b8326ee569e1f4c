//! Process lifecycle: spawning nodes and carrying their traffic

pub mod descriptor;
pub mod link;
pub mod manager;
pub mod node;

pub use descriptor::ConnectionDescriptor;
pub use link::Link;
pub use manager::{sibling_executable, CloseReason, IpcManager, ManagerHandler, NodeState};
pub use node::{IpcNode, Liveness, NodeHandler};

use std::fmt;

/// Identifies a spawned node; the child's process id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// Wrap a raw process id
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw process id
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}
