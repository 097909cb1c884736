use super::{DeviceDescriptor, Handle, IoError, OpenParams, OsDevice};
use crate::emu::chart_patch::{ChartHandle, ChartPatch};
use crate::emu::ezusb::{EzusbEmulator, EzusbHandle};
use crate::emu::serial::{SerialPortEmulator, SerialPortHandle};
use crate::emu::settings::SettingsRedirect;

/// Result of a handler accepting an open.
pub enum Opened<S> {
    /// Purely emulated; the dispatcher backs it with a null-device handle.
    Emulated(S),
    /// The handler opened a real handle itself and keeps state for it.
    Owned(Handle, S),
    /// The handler rewrote the request and opened a real handle; nothing
    /// needs to be tracked, later calls pass through.
    Redirected(Handle),
}

impl<S> Opened<S> {
    pub fn map<T>(self, f: impl FnOnce(S) -> T) -> Opened<T> {
        match self {
            Opened::Emulated(s) => Opened::Emulated(f(s)),
            Opened::Owned(h, s) => Opened::Owned(h, f(s)),
            Opened::Redirected(h) => Opened::Redirected(h),
        }
    }
}

/// Capability interface shared by every emulator kind.
pub trait DeviceEmulator: Send + Sync {
    /// Per-handle protocol state.
    type State: Send;

    fn name(&self) -> &'static str;

    fn claims(&self, desc: &DeviceDescriptor) -> bool;

    fn open(
        &self,
        desc: &DeviceDescriptor,
        params: &OpenParams,
        os: &dyn OsDevice,
    ) -> Result<Opened<Self::State>, IoError>;

    fn read(
        &self,
        _state: &mut Self::State,
        _os: &dyn OsDevice,
        _buf: &mut [u8],
    ) -> Result<usize, IoError> {
        Err(IoError::NotSupported)
    }

    fn write(
        &self,
        _state: &mut Self::State,
        _os: &dyn OsDevice,
        _buf: &[u8],
    ) -> Result<usize, IoError> {
        Err(IoError::NotSupported)
    }

    fn control(
        &self,
        _state: &mut Self::State,
        _os: &dyn OsDevice,
        _code: u32,
        _input: &[u8],
        _output: &mut [u8],
    ) -> Result<usize, IoError> {
        Err(IoError::NotSupported)
    }

    fn close(&self, _state: Self::State, _os: &dyn OsDevice) -> Result<(), IoError> {
        Ok(())
    }
}

/// The closed set of handler kinds composed into the dispatch chain.
pub enum Handler {
    UsbBridge(EzusbEmulator),
    SerialPort(SerialPortEmulator),
    Settings(SettingsRedirect),
    ChartPatch(ChartPatch),
}

/// Per-handle state, tagged like [`Handler`].
pub enum HandleState {
    UsbBridge(EzusbHandle),
    SerialPort(SerialPortHandle),
    Settings(()),
    ChartPatch(ChartHandle),
}

macro_rules! with_state {
    ($handler:expr, $state:expr, |$emu:ident, $s:ident| $body:expr) => {
        match ($handler, $state) {
            (Handler::UsbBridge($emu), HandleState::UsbBridge($s)) => $body,
            (Handler::SerialPort($emu), HandleState::SerialPort($s)) => $body,
            (Handler::Settings($emu), HandleState::Settings($s)) => $body,
            (Handler::ChartPatch($emu), HandleState::ChartPatch($s)) => $body,
            _ => Err(IoError::InvalidHandle),
        }
    };
}

impl Handler {
    pub fn name(&self) -> &'static str {
        match self {
            Handler::UsbBridge(e) => e.name(),
            Handler::SerialPort(e) => e.name(),
            Handler::Settings(e) => e.name(),
            Handler::ChartPatch(e) => e.name(),
        }
    }

    pub fn claims(&self, desc: &DeviceDescriptor) -> bool {
        match self {
            Handler::UsbBridge(e) => e.claims(desc),
            Handler::SerialPort(e) => e.claims(desc),
            Handler::Settings(e) => e.claims(desc),
            Handler::ChartPatch(e) => e.claims(desc),
        }
    }

    pub fn open(
        &self,
        desc: &DeviceDescriptor,
        params: &OpenParams,
        os: &dyn OsDevice,
    ) -> Result<Opened<HandleState>, IoError> {
        Ok(match self {
            Handler::UsbBridge(e) => e.open(desc, params, os)?.map(HandleState::UsbBridge),
            Handler::SerialPort(e) => e.open(desc, params, os)?.map(HandleState::SerialPort),
            Handler::Settings(e) => e.open(desc, params, os)?.map(HandleState::Settings),
            Handler::ChartPatch(e) => e.open(desc, params, os)?.map(HandleState::ChartPatch),
        })
    }

    pub fn read(
        &self,
        state: &mut HandleState,
        os: &dyn OsDevice,
        buf: &mut [u8],
    ) -> Result<usize, IoError> {
        with_state!(self, state, |emu, s| emu.read(s, os, buf))
    }

    pub fn write(
        &self,
        state: &mut HandleState,
        os: &dyn OsDevice,
        buf: &[u8],
    ) -> Result<usize, IoError> {
        with_state!(self, state, |emu, s| emu.write(s, os, buf))
    }

    pub fn control(
        &self,
        state: &mut HandleState,
        os: &dyn OsDevice,
        code: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, IoError> {
        with_state!(self, state, |emu, s| emu.control(s, os, code, input, output))
    }

    pub fn close(&self, state: HandleState, os: &dyn OsDevice) -> Result<(), IoError> {
        with_state!(self, state, |emu, s| emu.close(s, os))
    }
}
