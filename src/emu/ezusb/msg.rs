//! Wire formats spoken over the EZ-USB bridge.

use crate::iohook::IoError;

/// Reply status codes of a node.
pub mod node_status {
    pub const OK: u8 = 0x00;
    pub const NOT_PRESENT: u8 = 0xFA;
    pub const BAD_PAYLOAD: u8 = 0xFB;
    pub const UNKNOWN_COMMAND: u8 = 0xFC;
    pub const UNKNOWN_NODE: u8 = 0xFD;
    pub const FAULT: u8 = 0xFE;
    pub const NEGATIVE: u8 = 0xFF;
}

pub const NODE_HEADER_LEN: usize = 6;
pub const REPLY_HEADER_LEN: usize = 4;
pub const CONTROL_HEADER_LEN: usize = 10;
pub const INTERRUPT_PACKET_LEN: usize = 16;

/// Request addressed to one node: `[node, cmd, d0, d1, len_lo, len_hi, payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMessage {
    pub node: u8,
    pub cmd: u8,
    pub detail: [u8; 2],
    pub payload: Vec<u8>,
}

impl NodeMessage {
    pub fn new(node: u8, cmd: u8) -> Self {
        Self {
            node,
            cmd,
            detail: [0; 2],
            payload: Vec::new(),
        }
    }

    pub fn with_detail(mut self, d0: u8, d1: u8) -> Self {
        self.detail = [d0, d1];
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Decode one message. A bad length field yields `Err` carrying the
    /// node byte when one was present so the reply can still be addressed.
    pub fn decode(bytes: &[u8]) -> Result<Self, Option<u8>> {
        if bytes.len() < NODE_HEADER_LEN {
            return Err(bytes.first().copied());
        }
        let len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        let payload = bytes
            .get(NODE_HEADER_LEN..NODE_HEADER_LEN + len)
            .ok_or(Some(bytes[0]))?;

        Ok(Self {
            node: bytes[0],
            cmd: bytes[1],
            detail: [bytes[2], bytes[3]],
            payload: payload.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(NODE_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&[self.node, self.cmd, self.detail[0], self.detail[1]]);
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Reply of a node: `[node, status, len_lo, len_hi, payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReply {
    pub node: u8,
    pub status: u8,
    pub payload: Vec<u8>,
}

impl NodeReply {
    pub fn ok(node: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            node,
            status: node_status::OK,
            payload: payload.into(),
        }
    }

    pub fn status(node: u8, status: u8) -> Self {
        Self {
            node,
            status,
            payload: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == node_status::OK
    }

    pub fn encoded_len(&self) -> usize {
        REPLY_HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.node);
        buf.push(self.status);
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..REPLY_HEADER_LEN)?;
        let len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let payload = bytes.get(REPLY_HEADER_LEN..REPLY_HEADER_LEN + len)?;
        Some(Self {
            node: header[0],
            status: header[1],
            payload: payload.to_vec(),
        })
    }
}

/// USB setup stage as passed to the vendor request control codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlHeader {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    /// Non-zero for device-to-host.
    pub direction: u8,
    pub data: u8,
}

impl ControlHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self, IoError> {
        let b = bytes
            .get(..CONTROL_HEADER_LEN)
            .ok_or(IoError::InvalidParameter)?;
        Ok(Self {
            request: b[0],
            value: u16::from_le_bytes([b[2], b[3]]),
            index: u16::from_le_bytes([b[4], b[5]]),
            length: u16::from_le_bytes([b[6], b[7]]),
            direction: b[8],
            data: b[9],
        })
    }

    pub fn encode(&self) -> [u8; CONTROL_HEADER_LEN] {
        let mut b = [0u8; CONTROL_HEADER_LEN];
        b[0] = self.request;
        b[2..4].copy_from_slice(&self.value.to_le_bytes());
        b[4..6].copy_from_slice(&self.index.to_le_bytes());
        b[6..8].copy_from_slice(&self.length.to_le_bytes());
        b[8] = self.direction;
        b[9] = self.data;
        b
    }

    pub fn is_in(&self) -> bool {
        self.direction != 0
    }
}

/// Host-to-device interrupt packet: panel lamps plus an optional short
/// node command without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptOut {
    pub lamps: u32,
    pub node: u8,
    pub cmd: u8,
    pub detail: [u8; 2],
}

/// Node byte meaning "no command in this packet".
pub const NO_NODE: u8 = 0xFF;

impl InterruptOut {
    pub fn decode(bytes: &[u8]) -> Result<Self, IoError> {
        let b = bytes
            .get(..INTERRUPT_PACKET_LEN)
            .ok_or(IoError::InvalidParameter)?;
        Ok(Self {
            lamps: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            node: b[4],
            cmd: b[5],
            detail: [b[6], b[7]],
        })
    }

    pub fn encode(&self) -> [u8; INTERRUPT_PACKET_LEN] {
        let mut b = [0u8; INTERRUPT_PACKET_LEN];
        b[..4].copy_from_slice(&self.lamps.to_le_bytes());
        b[4] = self.node;
        b[5] = self.cmd;
        b[6..8].copy_from_slice(&self.detail);
        b
    }

    pub fn command(&self) -> Option<NodeMessage> {
        (self.node != NO_NODE)
            .then(|| NodeMessage::new(self.node, self.cmd).with_detail(self.detail[0], self.detail[1]))
    }
}

/// Device-to-host interrupt packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptIn {
    /// Pressed buttons; sent inverted, as the panel pulls lines low.
    pub buttons: u32,
    pub status: u8,
    pub node: u8,
    pub seq: u8,
    pub turntables: [u8; 2],
    pub sliders: [u8; 5],
    pub serial_busy: bool,
}

impl InterruptIn {
    pub fn encode(&self) -> [u8; INTERRUPT_PACKET_LEN] {
        let mut b = [0u8; INTERRUPT_PACKET_LEN];
        b[..4].copy_from_slice(&(!self.buttons).to_le_bytes());
        b[4] = self.status;
        b[5] = self.node;
        b[6] = self.seq;
        b[8..10].copy_from_slice(&self.turntables);
        b[10..15].copy_from_slice(&self.sliders);
        b[15] = self.serial_busy as u8;
        b
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let b = bytes.get(..INTERRUPT_PACKET_LEN)?;
        let mut sliders = [0u8; 5];
        sliders.copy_from_slice(&b[10..15]);
        Some(Self {
            buttons: !u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            status: b[4],
            node: b[5],
            seq: b[6],
            turntables: [b[8], b[9]],
            sliders,
            serial_busy: b[15] != 0,
        })
    }
}
