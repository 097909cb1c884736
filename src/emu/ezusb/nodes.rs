//! The bridge's node tree.
//!
//! Built once when the emulator is constructed and never reshaped. Nodes
//! live in a flat arena addressed by [`NodeIndex`]; parent/child links are
//! indices. Each node guards its own protocol state, so handles talking to
//! different nodes never contend.

use super::msg::{NodeMessage, NodeReply, node_status};
use super::node_misc::{FpgaNode, RootNode, Seg16Node, WatchdogNode};
use super::node_security::SecurityNode;
use super::node_serial::SerialNode;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

pub mod id {
    pub const ROOT: u8 = 0x00;
    pub const FPGA: u8 = 0x01;
    pub const SECURITY: u8 = 0x03;
    pub const SERIAL: u8 = 0x04;
    pub const SEG16: u8 = 0x05;
    pub const WATCHDOG: u8 = 0x06;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex(usize);

pub enum NodeHandler {
    Root(RootNode),
    Fpga(FpgaNode),
    Security(SecurityNode),
    Serial(SerialNode),
    Seg16(Seg16Node),
    Watchdog(WatchdogNode),
}

impl NodeHandler {
    fn handle(&mut self, msg: &NodeMessage, children: &[u8]) -> NodeReply {
        match self {
            NodeHandler::Root(n) => n.handle(msg, children),
            NodeHandler::Fpga(n) => n.handle(msg),
            NodeHandler::Security(n) => n.handle(msg),
            NodeHandler::Serial(n) => n.handle(msg),
            NodeHandler::Seg16(n) => n.handle(msg),
            NodeHandler::Watchdog(n) => n.handle(msg),
        }
    }

    /// Reset transient per-session state (bridge reset).
    fn reset(&mut self) {
        match self {
            NodeHandler::Serial(n) => n.reset(),
            NodeHandler::Watchdog(n) => n.reset(),
            NodeHandler::Root(_)
            | NodeHandler::Fpga(_)
            | NodeHandler::Security(_)
            | NodeHandler::Seg16(_) => {}
        }
    }
}

pub struct Node {
    pub id: u8,
    pub name: &'static str,
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
    handler: Mutex<NodeHandler>,
}

impl Node {
    pub fn handler(&self) -> MutexGuard<'_, NodeHandler> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct NodeArena {
    nodes: Vec<Node>,
    by_id: HashMap<u8, NodeIndex>,
}

impl NodeArena {
    pub fn new() -> Self {
        let root = Node {
            id: id::ROOT,
            name: "root",
            parent: None,
            children: Vec::new(),
            handler: Mutex::new(NodeHandler::Root(RootNode)),
        };
        Self {
            nodes: vec![root],
            by_id: HashMap::from([(id::ROOT, NodeIndex(0))]),
        }
    }

    pub fn root(&self) -> NodeIndex {
        NodeIndex(0)
    }

    /// Attach a node below `parent`. Returns `None` if the id is taken.
    pub fn add(
        &mut self,
        parent: NodeIndex,
        id: u8,
        name: &'static str,
        handler: NodeHandler,
    ) -> Option<NodeIndex> {
        if self.by_id.contains_key(&id) || parent.0 >= self.nodes.len() {
            return None;
        }
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(Node {
            id,
            name,
            parent: Some(parent),
            children: Vec::new(),
            handler: Mutex::new(handler),
        });
        self.nodes[parent.0].children.push(index);
        self.by_id.insert(id, index);
        Some(index)
    }

    pub fn get(&self, index: NodeIndex) -> &Node {
        &self.nodes[index.0]
    }

    pub fn find(&self, id: u8) -> Option<NodeIndex> {
        self.by_id.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn child_ids(&self, index: NodeIndex) -> Vec<u8> {
        self.nodes[index.0]
            .children
            .iter()
            .map(|c| self.nodes[c.0].id)
            .collect()
    }

    /// Route `msg` to the node it names.
    pub fn dispatch(&self, msg: &NodeMessage) -> NodeReply {
        let Some(index) = self.find(msg.node) else {
            trace!("node 0x{:02X}: no such node", msg.node);
            return NodeReply::status(msg.node, node_status::UNKNOWN_NODE);
        };

        let children = self.child_ids(index);
        let node = self.get(index);
        let reply = node.handler().handle(msg, &children);
        trace!(
            "node {} cmd 0x{:02X} -> status 0x{:02X}, {} bytes",
            node.name,
            msg.cmd,
            reply.status,
            reply.payload.len()
        );
        reply
    }

    pub fn reset(&self) {
        for node in &self.nodes {
            node.handler().reset();
        }
    }

    /// Whether the serial node has reply bytes the host has not fetched.
    pub fn serial_busy(&self) -> bool {
        self.find(id::SERIAL)
            .map(|index| match &*self.get(index).handler() {
                NodeHandler::Serial(serial) => serial.pending() > 0,
                _ => false,
            })
            .unwrap_or(false)
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_tree_and_routes() {
        let mut arena = NodeArena::new();
        let root = arena.root();
        let fpga = arena
            .add(root, id::FPGA, "fpga", NodeHandler::Fpga(FpgaNode::default()))
            .unwrap();
        arena
            .add(root, id::SEG16, "seg16", NodeHandler::Seg16(Seg16Node::default()))
            .unwrap();

        assert_eq!(arena.len(), 3);
        assert_eq!(arena.get(fpga).parent, Some(root));
        assert_eq!(arena.find(id::SEG16).map(|i| arena.get(i).name), Some("seg16"));

        let reply = arena.dispatch(&NodeMessage::new(id::ROOT, 0x00));
        assert!(reply.is_ok());
        assert_eq!(reply.payload, vec![id::FPGA, id::SEG16]);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut arena = NodeArena::new();
        let root = arena.root();
        assert!(arena.add(root, id::ROOT, "again", NodeHandler::Root(RootNode)).is_none());
    }

    #[test]
    fn unknown_node() {
        let arena = NodeArena::new();
        let reply = arena.dispatch(&NodeMessage::new(0x42, 0x00));
        assert_eq!(reply, NodeReply::status(0x42, node_status::UNKNOWN_NODE));
        assert!(!arena.serial_busy());
    }
}
