//! EZ-USB bridge board emulator.
//!
//! The host talks to the bridge through the EZ-USB driver's device control
//! codes. Node messages arrive either as vendor/class requests (answered in
//! the same call) or as bulk writes on pipe 2 whose replies are fetched with
//! bulk reads on pipe 3. Interrupt pipes carry lamp output and panel input.

mod iidxio;
mod io;
mod msg;
mod node_misc;
mod node_security;
mod node_serial;
mod nodes;

pub use iidxio::{IidxIoLibrary, LampOutputs, PanelIoError, pack_buttons};
pub use io::{IdleIo, IoBackend, LatchedIo, PanelInput};
pub use msg::{
    CONTROL_HEADER_LEN, ControlHeader, INTERRUPT_PACKET_LEN, InterruptIn, InterruptOut, NO_NODE,
    NodeMessage, NodeReply, node_status,
};
pub use node_misc::{BRIDGE_FIRMWARE_VERSION, FpgaNode, RootNode, Seg16Node, WatchdogNode};
pub use node_security::SecurityNode;
pub use node_serial::SerialNode;
pub use nodes::{Node, NodeArena, NodeHandler, NodeIndex, id};

use crate::emu::serial::CardReader;
use crate::iohook::{
    Capability, DeviceDescriptor, DeviceEmulator, IoError, OpenParams, Opened, OsDevice,
};
use crate::security::SecurityToken;
use crate::setupapi::{DeviceInterface, EZUSB_INTERFACE_CLASS};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace};

/// EZ-USB driver control codes.
pub mod ioctl {
    pub const GET_DEVICE_DESCRIPTOR: u32 = 0x0022_2004;
    pub const VENDOR_REQUEST: u32 = 0x0022_2014;
    pub const ANCHOR_DOWNLOAD: u32 = 0x0022_201C;
    pub const RESET: u32 = 0x0022_2030;
    pub const RESETPIPE: u32 = 0x0022_2034;
    pub const BULK_READ: u32 = 0x0022_204E;
    pub const BULK_WRITE: u32 = 0x0022_2051;
    pub const VENDOR_OR_CLASS_REQUEST: u32 = 0x0022_2055;
    pub const GET_LAST_ERROR: u32 = 0x0022_205C;
}

pub mod pipe {
    pub const INTERRUPT_OUT: u32 = 0;
    pub const INTERRUPT_IN: u32 = 1;
    pub const BULK_OUT: u32 = 2;
    pub const BULK_IN: u32 = 3;
}

/// 8051 "firmware load" vendor request.
pub const ANCHOR_LOAD_INTERNAL: u8 = 0xA0;

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;

/// The interface a host finds when it enumerates the EZ-USB driver class.
pub fn device_interface(vendor_id: u16, product_id: u16) -> DeviceInterface {
    DeviceInterface {
        class: EZUSB_INTERFACE_CLASS,
        description: "Cypress EZ-USB (2235) - EEPROM missing".to_string(),
        path: format!(
            r"\\?\usb#vid_{:04x}&pid_{:04x}#devhook&0&1#{}",
            vendor_id,
            product_id,
            EZUSB_INTERFACE_CLASS.to_string().to_ascii_lowercase()
        ),
    }
}

/// Per-handle bridge state.
#[derive(Debug, Default)]
pub struct EzusbHandle {
    bulk_in: VecDeque<u8>,
    last_error: u32,
    last_status: u8,
    last_node: u8,
    seq: u8,
    firmware_bytes: usize,
    lamps: u32,
}

impl EzusbHandle {
    pub fn firmware_bytes(&self) -> usize {
        self.firmware_bytes
    }

    pub fn lamps(&self) -> u32 {
        self.lamps
    }

    pub fn last_error(&self) -> u32 {
        self.last_error
    }

    fn reset(&mut self) {
        self.bulk_in.clear();
        self.last_status = node_status::OK;
        self.last_node = id::ROOT;
        self.seq = 0;
    }
}

pub struct EzusbEmulator {
    vendor_id: u16,
    product_id: u16,
    alias: String,
    nodes: Arc<NodeArena>,
    io: Arc<dyn IoBackend>,
}

impl EzusbEmulator {
    pub fn new(
        vendor_id: u16,
        product_id: u16,
        alias: impl Into<String>,
        nodes: NodeArena,
        io: Arc<dyn IoBackend>,
    ) -> Self {
        let alias = alias.into();
        info!(
            "EZ-USB bridge {:04x}:{:04x} ({}) with {} nodes",
            vendor_id,
            product_id,
            alias,
            nodes.len()
        );
        Self {
            vendor_id,
            product_id,
            alias,
            nodes: Arc::new(nodes),
            io,
        }
    }

    /// FPGA, security plug, optional card reader, 16seg and watchdog under
    /// the root node.
    pub fn standard_nodes(
        token: Arc<Mutex<SecurityToken>>,
        reader: Option<Arc<Mutex<CardReader>>>,
    ) -> NodeArena {
        let mut arena = NodeArena::new();
        let root = arena.root();

        let mut children = vec![
            (id::FPGA, "fpga", NodeHandler::Fpga(FpgaNode::default())),
            (id::SECURITY, "security", NodeHandler::Security(SecurityNode::new(token))),
        ];
        if let Some(reader) = reader {
            children.push((id::SERIAL, "serial", NodeHandler::Serial(SerialNode::new(reader))));
        }
        children.push((id::SEG16, "seg16", NodeHandler::Seg16(Seg16Node::default())));
        children.push((id::WATCHDOG, "watchdog", NodeHandler::Watchdog(WatchdogNode::default())));

        for (node_id, name, handler) in children {
            // Ids above are distinct.
            let _ = arena.add(root, node_id, name, handler);
        }
        arena
    }

    pub fn nodes(&self) -> &NodeArena {
        &self.nodes
    }

    pub fn device_descriptor(&self) -> [u8; DEVICE_DESCRIPTOR_LEN] {
        let mut d = [0u8; DEVICE_DESCRIPTOR_LEN];
        d[0] = DEVICE_DESCRIPTOR_LEN as u8;
        d[1] = 0x01; // DEVICE
        d[2..4].copy_from_slice(&0x0110u16.to_le_bytes());
        d[4] = 0xFF; // vendor specific
        d[5] = 0xFF;
        d[6] = 0xFF;
        d[7] = 64;
        d[8..10].copy_from_slice(&self.vendor_id.to_le_bytes());
        d[10..12].copy_from_slice(&self.product_id.to_le_bytes());
        d[12..14].copy_from_slice(&0x0001u16.to_le_bytes());
        d[17] = 1;
        d
    }

    /// Decode and route one node message frame.
    fn exchange(&self, state: &mut EzusbHandle, frame: &[u8]) -> NodeReply {
        let reply = match NodeMessage::decode(frame) {
            Ok(msg) => self.nodes.dispatch(&msg),
            Err(node) => {
                debug!("EZ-USB: malformed node message ({} bytes)", frame.len());
                NodeReply::status(node.unwrap_or(id::ROOT), node_status::BAD_PAYLOAD)
            }
        };
        state.last_status = reply.status;
        state.last_node = reply.node;
        reply
    }

    fn interrupt_in(&self, state: &mut EzusbHandle) -> [u8; INTERRUPT_PACKET_LEN] {
        let input = self.io.poll();
        state.seq = state.seq.wrapping_add(1);
        InterruptIn {
            buttons: input.buttons,
            status: state.last_status,
            node: state.last_node,
            seq: state.seq,
            turntables: input.turntables,
            sliders: input.sliders,
            serial_busy: self.nodes.serial_busy(),
        }
        .encode()
    }

    fn interrupt_out(&self, state: &mut EzusbHandle, data: &[u8]) -> Result<(), IoError> {
        let packet = InterruptOut::decode(data)?;
        if packet.lamps != state.lamps {
            trace!("EZ-USB: lamps {:08x}", packet.lamps);
            state.lamps = packet.lamps;
            self.io.set_lamps(packet.lamps);
        }
        if let Some(msg) = packet.command() {
            let reply = self.nodes.dispatch(&msg);
            state.last_status = reply.status;
            state.last_node = reply.node;
            state.bulk_in.extend(reply.encode());
        }
        Ok(())
    }

    fn dispatch_control(
        &self,
        state: &mut EzusbHandle,
        code: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, IoError> {
        match code {
            ioctl::GET_DEVICE_DESCRIPTOR => copy_out(output, &self.device_descriptor()),
            ioctl::VENDOR_REQUEST => {
                let header = ControlHeader::decode(input)?;
                if header.request == ANCHOR_LOAD_INTERNAL && !header.is_in() {
                    state.firmware_bytes += header.length as usize;
                }
                if header.is_in() {
                    let n = output.len().min(header.length as usize);
                    output[..n].fill(0);
                    Ok(n)
                } else {
                    Ok(0)
                }
            }
            ioctl::ANCHOR_DOWNLOAD => {
                // Firmware image arrives in the direct I/O buffer.
                state.firmware_bytes += output.len();
                debug!("EZ-USB: firmware download, {} bytes total", state.firmware_bytes);
                Ok(0)
            }
            ioctl::RESET => {
                debug!("EZ-USB: bridge reset");
                state.reset();
                self.nodes.reset();
                Ok(0)
            }
            ioctl::RESETPIPE => {
                match pipe_number(input)? {
                    pipe::BULK_IN => state.bulk_in.clear(),
                    pipe::INTERRUPT_OUT | pipe::INTERRUPT_IN | pipe::BULK_OUT => {}
                    _ => return Err(IoError::InvalidParameter),
                }
                Ok(0)
            }
            ioctl::BULK_READ => match pipe_number(input)? {
                pipe::INTERRUPT_IN => copy_out(output, &self.interrupt_in(state)),
                pipe::BULK_IN => {
                    let n = output.len().min(state.bulk_in.len());
                    for (dst, src) in output.iter_mut().zip(state.bulk_in.drain(..n)) {
                        *dst = src;
                    }
                    Ok(n)
                }
                _ => Err(IoError::InvalidParameter),
            },
            ioctl::BULK_WRITE => {
                // Payload travels in the direct I/O buffer.
                let data: &[u8] = output;
                match pipe_number(input)? {
                    pipe::INTERRUPT_OUT => self.interrupt_out(state, data)?,
                    pipe::BULK_OUT => {
                        let reply = self.exchange(state, data);
                        state.bulk_in.extend(reply.encode());
                    }
                    _ => return Err(IoError::InvalidParameter),
                }
                Ok(data.len())
            }
            ioctl::VENDOR_OR_CLASS_REQUEST => {
                ControlHeader::decode(input)?;
                let reply = self.exchange(state, &input[CONTROL_HEADER_LEN..]);
                copy_out(output, &reply.encode())
            }
            ioctl::GET_LAST_ERROR => copy_out(output, &state.last_error.to_le_bytes()),
            other => {
                debug!("EZ-USB: unsupported control code 0x{:08X}", other);
                Err(IoError::NotSupported)
            }
        }
    }
}

fn pipe_number(input: &[u8]) -> Result<u32, IoError> {
    input
        .get(..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(IoError::InvalidParameter)
}

fn copy_out(output: &mut [u8], data: &[u8]) -> Result<usize, IoError> {
    let available = output.len();
    let dst = output
        .get_mut(..data.len())
        .ok_or(IoError::BufferTooSmall {
            needed: data.len(),
            available,
        })?;
    dst.copy_from_slice(data);
    Ok(data.len())
}

impl DeviceEmulator for EzusbEmulator {
    type State = EzusbHandle;

    fn name(&self) -> &'static str {
        "ezusb"
    }

    fn claims(&self, desc: &DeviceDescriptor) -> bool {
        (desc.has(Capability::Usb) && desc.matches_usb(self.vendor_id, self.product_id))
            || desc.path_is(&self.alias)
    }

    fn open(
        &self,
        desc: &DeviceDescriptor,
        _params: &OpenParams,
        _os: &dyn OsDevice,
    ) -> Result<Opened<Self::State>, IoError> {
        debug!("EZ-USB: opened {}", desc);
        Ok(Opened::Emulated(EzusbHandle::default()))
    }

    fn control(
        &self,
        state: &mut Self::State,
        _os: &dyn OsDevice,
        code: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, IoError> {
        let result = self.dispatch_control(state, code, input, output);
        state.last_error = match &result {
            Ok(_) => 0,
            Err(e) => e.to_win32(),
        };
        result
    }
}
