//! Virtual serial port with a card reader on the other end.

mod frame;
mod link;
mod reader;

pub use frame::{Frame, FrameDecoder, FrameError, FrameEvent, checksum};
pub use link::CardReaderLink;
pub use reader::{CardReader, FIRMWARE_VERSION, cmd, status};

use crate::iohook::{
    Capability, DeviceDescriptor, DeviceEmulator, IoError, OpenParams, Opened, OsDevice,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Windows serial driver control codes (`FILE_DEVICE_SERIAL_PORT`,
/// buffered).
pub mod ioctl {
    pub const SET_BAUD_RATE: u32 = 0x1B_0004;
    pub const SET_QUEUE_SIZE: u32 = 0x1B_0008;
    pub const SET_LINE_CONTROL: u32 = 0x1B_000C;
    pub const SET_TIMEOUTS: u32 = 0x1B_001C;
    pub const GET_TIMEOUTS: u32 = 0x1B_0020;
    pub const SET_DTR: u32 = 0x1B_0024;
    pub const CLR_DTR: u32 = 0x1B_0028;
    pub const SET_RTS: u32 = 0x1B_0030;
    pub const CLR_RTS: u32 = 0x1B_0034;
    pub const GET_WAIT_MASK: u32 = 0x1B_0040;
    pub const SET_WAIT_MASK: u32 = 0x1B_0044;
    pub const PURGE: u32 = 0x1B_004C;
    pub const GET_BAUD_RATE: u32 = 0x1B_0050;
    pub const GET_LINE_CONTROL: u32 = 0x1B_0054;
    pub const GET_CHARS: u32 = 0x1B_0058;
    pub const SET_CHARS: u32 = 0x1B_005C;
    pub const GET_HANDFLOW: u32 = 0x1B_0060;
    pub const SET_HANDFLOW: u32 = 0x1B_0064;
    pub const GET_COMMSTATUS: u32 = 0x1B_006C;

    pub const PURGE_TXCLEAR: u32 = 0x0000_0004;
    pub const PURGE_RXCLEAR: u32 = 0x0000_0008;
}

/// Linux tty requests, as seen by the `ioctl` interposer.
pub mod tty {
    pub const TCGETS: u32 = 0x5401;
    pub const TCSETS: u32 = 0x5402;
    pub const TCSETSW: u32 = 0x5403;
    pub const TCSETSF: u32 = 0x5404;
    pub const TCFLSH: u32 = 0x540B;
    pub const FIONREAD: u32 = 0x541B;

    pub const TCIFLUSH: u32 = 0;
    pub const TCOFLUSH: u32 = 1;
    pub const TCIOFLUSH: u32 = 2;
}

const LINE_CONTROL_LEN: usize = 3;
const TIMEOUTS_LEN: usize = 20;
const HANDFLOW_LEN: usize = 16;
const CHARS_LEN: usize = 6;
const COMMSTATUS_LEN: usize = 18;

/// Line settings the host configures; stored and echoed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub line_control: [u8; LINE_CONTROL_LEN],
    pub timeouts: [u8; TIMEOUTS_LEN],
    pub handflow: [u8; HANDFLOW_LEN],
    pub chars: [u8; CHARS_LEN],
    pub wait_mask: u32,
    pub dtr: bool,
    pub rts: bool,
    /// Opaque `struct termios` as last set through `TCSETS*`.
    pub termios: Vec<u8>,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: 57600,
            // one stop bit, no parity, 8 data bits
            line_control: [0, 0, 8],
            timeouts: [0; TIMEOUTS_LEN],
            handflow: [0; HANDFLOW_LEN],
            chars: [0; CHARS_LEN],
            wait_mask: 0,
            dtr: false,
            rts: false,
            termios: Vec::new(),
        }
    }
}

pub struct SerialPortHandle {
    link: CardReaderLink,
    settings: LineSettings,
}

impl SerialPortHandle {
    pub fn settings(&self) -> &LineSettings {
        &self.settings
    }
}

/// Claims one configured port (`COM1`, `/dev/ttyS0`, ...).
pub struct SerialPortEmulator {
    port: String,
    reader: Arc<Mutex<CardReader>>,
}

impl SerialPortEmulator {
    pub fn new(port: impl Into<String>, reader: Arc<Mutex<CardReader>>) -> Self {
        Self {
            port: port.into(),
            reader,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

fn copy_out(output: &mut [u8], data: &[u8]) -> Result<usize, IoError> {
    if output.len() < data.len() {
        return Err(IoError::BufferTooSmall {
            needed: data.len(),
            available: output.len(),
        });
    }
    output[..data.len()].copy_from_slice(data);
    Ok(data.len())
}

fn copy_in<const N: usize>(input: &[u8]) -> Result<[u8; N], IoError> {
    input
        .get(..N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(IoError::InvalidParameter)
}

fn read_u32(input: &[u8]) -> Result<u32, IoError> {
    copy_in::<4>(input).map(u32::from_le_bytes)
}

impl DeviceEmulator for SerialPortEmulator {
    type State = SerialPortHandle;

    fn name(&self) -> &'static str {
        "serial-port"
    }

    fn claims(&self, desc: &DeviceDescriptor) -> bool {
        desc.has(Capability::Serial) && desc.path_is(&self.port)
    }

    fn open(
        &self,
        desc: &DeviceDescriptor,
        _params: &OpenParams,
        _os: &dyn OsDevice,
    ) -> Result<Opened<Self::State>, IoError> {
        debug!("Serial port {} opened", desc.path);
        Ok(Opened::Emulated(SerialPortHandle {
            link: CardReaderLink::new(Arc::clone(&self.reader)),
            settings: LineSettings::default(),
        }))
    }

    fn read(
        &self,
        state: &mut Self::State,
        _os: &dyn OsDevice,
        buf: &mut [u8],
    ) -> Result<usize, IoError> {
        let n = state.link.take(buf);
        trace!("Serial read: {} of {} bytes", n, buf.len());
        Ok(n)
    }

    fn write(
        &self,
        state: &mut Self::State,
        _os: &dyn OsDevice,
        buf: &[u8],
    ) -> Result<usize, IoError> {
        trace!("Serial write: {:02x?}", buf);
        state.link.receive(buf);
        Ok(buf.len())
    }

    fn control(
        &self,
        state: &mut Self::State,
        _os: &dyn OsDevice,
        code: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, IoError> {
        let settings = &mut state.settings;
        let link = &mut state.link;

        match code {
            ioctl::SET_BAUD_RATE => {
                settings.baud_rate = read_u32(input)?;
                debug!("Serial: baud rate {}", settings.baud_rate);
                Ok(0)
            }
            ioctl::GET_BAUD_RATE => copy_out(output, &settings.baud_rate.to_le_bytes()),
            ioctl::SET_LINE_CONTROL => {
                settings.line_control = copy_in(input)?;
                Ok(0)
            }
            ioctl::GET_LINE_CONTROL => copy_out(output, &settings.line_control),
            ioctl::SET_TIMEOUTS => {
                settings.timeouts = copy_in(input)?;
                Ok(0)
            }
            ioctl::GET_TIMEOUTS => copy_out(output, &settings.timeouts),
            ioctl::SET_HANDFLOW => {
                settings.handflow = copy_in(input)?;
                Ok(0)
            }
            ioctl::GET_HANDFLOW => copy_out(output, &settings.handflow),
            ioctl::SET_CHARS => {
                settings.chars = copy_in(input)?;
                Ok(0)
            }
            ioctl::GET_CHARS => copy_out(output, &settings.chars),
            ioctl::SET_QUEUE_SIZE => {
                copy_in::<8>(input)?;
                Ok(0)
            }
            ioctl::SET_WAIT_MASK => {
                settings.wait_mask = read_u32(input)?;
                Ok(0)
            }
            ioctl::GET_WAIT_MASK => copy_out(output, &settings.wait_mask.to_le_bytes()),
            ioctl::SET_DTR | ioctl::CLR_DTR => {
                settings.dtr = code == ioctl::SET_DTR;
                Ok(0)
            }
            ioctl::SET_RTS | ioctl::CLR_RTS => {
                settings.rts = code == ioctl::SET_RTS;
                Ok(0)
            }
            ioctl::PURGE => {
                let flags = read_u32(input)?;
                if flags & ioctl::PURGE_RXCLEAR != 0 {
                    link.purge_rx();
                }
                if flags & ioctl::PURGE_TXCLEAR != 0 {
                    link.purge_tx();
                }
                Ok(0)
            }
            ioctl::GET_COMMSTATUS => {
                // Errors, HoldReasons, AmountInInQueue, AmountInOutQueue,
                // EofReceived, WaitForImmediate
                let mut status = [0u8; COMMSTATUS_LEN];
                status[8..12].copy_from_slice(&(link.pending() as u32).to_le_bytes());
                copy_out(output, &status)
            }

            tty::FIONREAD => copy_out(output, &(link.pending() as i32).to_le_bytes()),
            tty::TCFLSH => {
                match read_u32(input)? {
                    tty::TCIFLUSH => link.purge_rx(),
                    tty::TCOFLUSH => link.purge_tx(),
                    tty::TCIOFLUSH => {
                        link.purge_rx();
                        link.purge_tx();
                    }
                    _ => return Err(IoError::InvalidParameter),
                }
                Ok(0)
            }
            tty::TCGETS => {
                let n = output.len().min(settings.termios.len());
                output[..n].copy_from_slice(&settings.termios[..n]);
                output[n..].fill(0);
                Ok(output.len())
            }
            tty::TCSETS | tty::TCSETSW | tty::TCSETSF => {
                if code == tty::TCSETSF {
                    link.purge_rx();
                }
                settings.termios = input.to_vec();
                Ok(0)
            }

            other => {
                debug!("Serial: unsupported control code 0x{:08X}", other);
                Err(IoError::NotSupported)
            }
        }
    }
}
