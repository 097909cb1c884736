//! Bridge root, FPGA, 16-segment display and watchdog nodes.

use super::msg::{NodeMessage, NodeReply, node_status};
use tracing::{debug, info};

pub const BRIDGE_FIRMWARE_VERSION: [u8; 2] = [0x01, 0x13];

pub struct RootNode;

impl RootNode {
    pub const ENUMERATE: u8 = 0x00;
    pub const VERSION: u8 = 0x01;

    pub fn handle(&mut self, msg: &NodeMessage, children: &[u8]) -> NodeReply {
        match msg.cmd {
            Self::ENUMERATE => NodeReply::ok(msg.node, children),
            Self::VERSION => NodeReply::ok(msg.node, BRIDGE_FIRMWARE_VERSION),
            _ => NodeReply::status(msg.node, node_status::UNKNOWN_COMMAND),
        }
    }
}

/// Accepts a bitstream in chunks; `detail[0] != 0` marks the last one.
#[derive(Debug, Default)]
pub struct FpgaNode {
    received: usize,
    loaded: bool,
}

impl FpgaNode {
    pub const STATUS: u8 = 0x00;
    pub const UPLOAD: u8 = 0x01;
    pub const CHECK: u8 = 0x02;

    pub fn handle(&mut self, msg: &NodeMessage) -> NodeReply {
        match msg.cmd {
            Self::STATUS => NodeReply::ok(msg.node, [self.loaded as u8]),
            Self::UPLOAD => {
                if self.loaded {
                    // A new upload replaces the old image.
                    self.loaded = false;
                    self.received = 0;
                }
                self.received += msg.payload.len();
                if msg.detail[0] != 0 {
                    self.loaded = true;
                    info!("FPGA bitstream received ({} bytes)", self.received);
                }
                NodeReply::ok(msg.node, Vec::new())
            }
            Self::CHECK => {
                let mut payload = vec![self.loaded as u8];
                payload.extend_from_slice(&(self.received as u32).to_le_bytes());
                NodeReply::ok(msg.node, payload)
            }
            _ => NodeReply::status(msg.node, node_status::UNKNOWN_COMMAND),
        }
    }
}

pub const SEG16_CHARS: usize = 9;

#[derive(Debug, Default)]
pub struct Seg16Node {
    text: Vec<u8>,
}

impl Seg16Node {
    pub const WRITE: u8 = 0x00;
    pub const READ: u8 = 0x01;

    pub fn handle(&mut self, msg: &NodeMessage) -> NodeReply {
        match msg.cmd {
            Self::WRITE => {
                if msg.payload.len() > SEG16_CHARS || !msg.payload.is_ascii() {
                    return NodeReply::status(msg.node, node_status::BAD_PAYLOAD);
                }
                if self.text != msg.payload {
                    self.text = msg.payload.clone();
                    debug!("16seg: {:?}", String::from_utf8_lossy(&self.text));
                }
                NodeReply::ok(msg.node, Vec::new())
            }
            Self::READ => NodeReply::ok(msg.node, self.text.clone()),
            _ => NodeReply::status(msg.node, node_status::UNKNOWN_COMMAND),
        }
    }

    pub fn text(&self) -> &[u8] {
        &self.text
    }
}

#[derive(Debug, Default)]
pub struct WatchdogNode {
    armed: bool,
    kicks: u32,
}

impl WatchdogNode {
    pub const KICK: u8 = 0x00;
    pub const STATUS: u8 = 0x01;
    pub const ARM: u8 = 0x02;

    pub fn handle(&mut self, msg: &NodeMessage) -> NodeReply {
        match msg.cmd {
            Self::KICK => {
                self.kicks = self.kicks.wrapping_add(1);
                NodeReply::ok(msg.node, Vec::new())
            }
            Self::STATUS => {
                let mut payload = vec![self.armed as u8];
                payload.extend_from_slice(&self.kicks.to_le_bytes());
                NodeReply::ok(msg.node, payload)
            }
            Self::ARM => {
                self.armed = msg.detail[0] != 0;
                debug!("Watchdog {}", if self.armed { "armed" } else { "disarmed" });
                NodeReply::ok(msg.node, Vec::new())
            }
            _ => NodeReply::status(msg.node, node_status::UNKNOWN_COMMAND),
        }
    }

    pub fn reset(&mut self) {
        self.armed = false;
        self.kicks = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fpga_upload_in_chunks() {
        let mut fpga = FpgaNode::default();
        fpga.handle(&NodeMessage::new(1, FpgaNode::UPLOAD).with_payload(vec![0; 64]));
        assert_eq!(fpga.handle(&NodeMessage::new(1, FpgaNode::STATUS)).payload, vec![0]);

        fpga.handle(
            &NodeMessage::new(1, FpgaNode::UPLOAD)
                .with_detail(1, 0)
                .with_payload(vec![0; 16]),
        );
        let check = fpga.handle(&NodeMessage::new(1, FpgaNode::CHECK));
        assert_eq!(check.payload, vec![1, 80, 0, 0, 0]);
    }

    #[test]
    fn seg16_limits_text() {
        let mut seg = Seg16Node::default();
        let ok = seg.handle(&NodeMessage::new(5, Seg16Node::WRITE).with_payload(*b"WELCOME"));
        assert!(ok.is_ok());
        assert_eq!(seg.text(), b"WELCOME");

        let too_long = seg.handle(&NodeMessage::new(5, Seg16Node::WRITE).with_payload(*b"0123456789"));
        assert_eq!(too_long.status, node_status::BAD_PAYLOAD);
        assert_eq!(seg.handle(&NodeMessage::new(5, Seg16Node::READ)).payload, b"WELCOME");
    }

    #[test]
    fn watchdog_counts_kicks() {
        let mut wd = WatchdogNode::default();
        wd.handle(&NodeMessage::new(6, WatchdogNode::ARM).with_detail(1, 0));
        wd.handle(&NodeMessage::new(6, WatchdogNode::KICK));
        wd.handle(&NodeMessage::new(6, WatchdogNode::KICK));
        assert_eq!(
            wd.handle(&NodeMessage::new(6, WatchdogNode::STATUS)).payload,
            vec![1, 2, 0, 0, 0]
        );
        wd.reset();
        assert_eq!(
            wd.handle(&NodeMessage::new(6, WatchdogNode::STATUS)).payload,
            vec![0, 0, 0, 0, 0]
        );
    }
}
