//! Ordered I/O request dispatch.
//!
//! Every intercepted device call becomes an [`Irp`]. Opens are offered to
//! the registered handlers in order and the first one whose claim predicate
//! accepts the [`DeviceDescriptor`] owns the handle from then on. Requests
//! nobody claims are reported back as [`Routed::PassThrough`] so the caller
//! can hand them to the real OS function untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, trace, warn};

mod descriptor;
mod handler;

pub use descriptor::{Capability, DeviceDescriptor, normalize_path};
pub use handler::{DeviceEmulator, HandleState, Handler, Opened};

/// Opaque OS handle value (a `HANDLE` on Windows, a file descriptor elsewhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub usize);

/// Raw open arguments, forwarded untouched on pass-through.
///
/// Windows: desired access, share mode, creation disposition, flags and
/// attributes. POSIX: `access` carries the open flags and `attributes`
/// the mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenParams {
    pub access: u32,
    pub share: u32,
    pub disposition: u32,
    pub attributes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrpOp {
    Open,
    Read,
    Write,
    Control,
    Close,
}

/// One intercepted device operation.
pub struct Irp<'a> {
    pub op: IrpOp,
    /// Target handle; filled in by a successful open.
    pub handle: Handle,
    pub path: Option<&'a str>,
    pub params: OpenParams,
    /// Device control code, zero for other operations.
    pub code: u32,
    pub input: &'a [u8],
    pub output: &'a mut [u8],
    /// Bytes read, written or returned by a successful request.
    pub transferred: usize,
}

impl<'a> Irp<'a> {
    pub fn open(path: &'a str, params: OpenParams) -> Self {
        Self {
            op: IrpOp::Open,
            handle: Handle(0),
            path: Some(path),
            params,
            code: 0,
            input: &[],
            output: &mut [],
            transferred: 0,
        }
    }

    pub fn read(handle: Handle, buf: &'a mut [u8]) -> Self {
        Self {
            op: IrpOp::Read,
            handle,
            path: None,
            params: OpenParams::default(),
            code: 0,
            input: &[],
            output: buf,
            transferred: 0,
        }
    }

    pub fn write(handle: Handle, buf: &'a [u8]) -> Self {
        Self {
            op: IrpOp::Write,
            handle,
            path: None,
            params: OpenParams::default(),
            code: 0,
            input: buf,
            output: &mut [],
            transferred: 0,
        }
    }

    pub fn control(handle: Handle, code: u32, input: &'a [u8], output: &'a mut [u8]) -> Self {
        Self {
            op: IrpOp::Control,
            handle,
            path: None,
            params: OpenParams::default(),
            code,
            input,
            output,
            transferred: 0,
        }
    }

    pub fn close(handle: Handle) -> Self {
        Self {
            op: IrpOp::Close,
            handle,
            path: None,
            params: OpenParams::default(),
            code: 0,
            input: &[],
            output: &mut [],
            transferred: 0,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IoError {
    #[error("invalid handle")]
    InvalidHandle,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("operation not supported by device")]
    NotSupported,

    #[error("buffer too small: need {needed} bytes, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("file not found")]
    NotFound,

    #[error("device failure")]
    Device,

    /// Platform error code from a real OS call, reported as-is.
    #[error("os error {0}")]
    Os(i32),
}

impl IoError {
    /// Win32 error code for `SetLastError`.
    pub fn to_win32(&self) -> u32 {
        match self {
            IoError::InvalidHandle => 6,           // ERROR_INVALID_HANDLE
            IoError::InvalidParameter => 87,       // ERROR_INVALID_PARAMETER
            IoError::NotSupported => 50,           // ERROR_NOT_SUPPORTED
            IoError::BufferTooSmall { .. } => 122, // ERROR_INSUFFICIENT_BUFFER
            IoError::Protocol(_) => 23,            // ERROR_CRC
            IoError::NotFound => 2,                // ERROR_FILE_NOT_FOUND
            IoError::Device => 31,                 // ERROR_GEN_FAILURE
            IoError::Os(code) => *code as u32,
        }
    }

    /// errno value for POSIX callers.
    pub fn to_errno(&self) -> i32 {
        match self {
            IoError::InvalidHandle => libc::EBADF,
            IoError::InvalidParameter => libc::EINVAL,
            IoError::NotSupported => libc::ENOTTY,
            IoError::BufferTooSmall { .. } => libc::EOVERFLOW,
            IoError::Protocol(_) => libc::EPROTO,
            IoError::NotFound => libc::ENOENT,
            IoError::Device => libc::EIO,
            IoError::Os(code) => *code,
        }
    }
}

/// The real OS device API, reached through the originals captured by the
/// redirector.
pub trait OsDevice: Send + Sync {
    fn open(&self, path: &str, params: &OpenParams) -> Result<Handle, IoError>;

    /// Open the platform's null device. Emulated handles are backed by one
    /// so their values can never collide with a real handle.
    fn open_null(&self) -> Result<Handle, IoError>;

    fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, IoError>;

    fn write(&self, handle: Handle, buf: &[u8]) -> Result<usize, IoError>;

    fn control(
        &self,
        handle: Handle,
        code: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, IoError>;

    fn close(&self, handle: Handle) -> Result<(), IoError>;
}

/// Outcome of offering a request to the handler chain.
#[derive(Debug, PartialEq, Eq)]
pub enum Routed<T> {
    /// A handler owns the request; this is its result.
    Emulated(T),
    /// Nobody claimed it; forward to the real OS call unchanged.
    PassThrough,
}

impl<T> Routed<T> {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, Routed::PassThrough)
    }
}

struct Binding {
    handler: usize,
    /// Backed by a null-device handle the dispatcher must close.
    owns_handle: bool,
    /// `None` once the handle is closed.
    state: Mutex<Option<HandleState>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Dispatcher<D: OsDevice> {
    handlers: Vec<Handler>,
    os: D,
    bindings: RwLock<HashMap<Handle, Arc<Binding>>>,
}

impl<D: OsDevice> Dispatcher<D> {
    /// Registration order is priority order.
    pub fn new(os: D, handlers: Vec<Handler>) -> Self {
        for (i, handler) in handlers.iter().enumerate() {
            debug!("IRP handler #{}: {}", i, handler.name());
        }
        Self {
            handlers,
            os,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn os(&self) -> &D {
        &self.os
    }

    pub fn is_claimed(&self, handle: Handle) -> bool {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&handle)
    }

    pub fn claimed_count(&self) -> usize {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Name of the handler owning `handle`, if any.
    pub fn owner(&self, handle: Handle) -> Option<&'static str> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        bindings
            .get(&handle)
            .map(|binding| self.handlers[binding.handler].name())
    }

    fn binding(&self, handle: Handle) -> Option<Arc<Binding>> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
    }

    /// Offer `irp` to the handler chain.
    pub fn route(&self, irp: &mut Irp<'_>) -> Routed<Result<(), IoError>> {
        match irp.op {
            IrpOp::Open => self.route_open(irp),
            _ => self.route_handle(irp),
        }
    }

    /// Route `irp`, performing pass-through via the OS backend when nobody
    /// claims it.
    pub fn submit(&self, irp: &mut Irp<'_>) -> Result<(), IoError> {
        match self.route(irp) {
            Routed::Emulated(result) => result,
            Routed::PassThrough => self.pass_through(irp),
        }
    }

    fn pass_through(&self, irp: &mut Irp<'_>) -> Result<(), IoError> {
        match irp.op {
            IrpOp::Open => {
                let path = irp.path.ok_or(IoError::InvalidParameter)?;
                irp.handle = self.os.open(path, &irp.params)?;
            }
            IrpOp::Read => irp.transferred = self.os.read(irp.handle, irp.output)?,
            IrpOp::Write => irp.transferred = self.os.write(irp.handle, irp.input)?,
            IrpOp::Control => {
                irp.transferred = self.os.control(irp.handle, irp.code, irp.input, irp.output)?
            }
            IrpOp::Close => self.os.close(irp.handle)?,
        }
        Ok(())
    }

    fn route_open(&self, irp: &mut Irp<'_>) -> Routed<Result<(), IoError>> {
        let Some(path) = irp.path else {
            return Routed::Emulated(Err(IoError::InvalidParameter));
        };
        let desc = DeviceDescriptor::from_path(path);

        let Some(index) = self.handlers.iter().position(|h| h.claims(&desc)) else {
            trace!("open {}: unclaimed, passing through", desc);
            return Routed::PassThrough;
        };

        let handler = &self.handlers[index];
        debug!("open {}: claimed by {}", desc, handler.name());

        Routed::Emulated(self.open_claimed(index, &desc, irp))
    }

    fn open_claimed(
        &self,
        index: usize,
        desc: &DeviceDescriptor,
        irp: &mut Irp<'_>,
    ) -> Result<(), IoError> {
        let handler = &self.handlers[index];
        let opened = handler.open(desc, &irp.params, &self.os)?;

        let (handle, owns_handle, state) = match opened {
            Opened::Emulated(state) => match self.os.open_null() {
                Ok(handle) => (handle, true, state),
                Err(e) => {
                    if let Err(close_err) = handler.close(state, &self.os) {
                        warn!("{}: close after failed open: {}", handler.name(), close_err);
                    }
                    return Err(e);
                }
            },
            Opened::Owned(handle, state) => (handle, false, state),
            Opened::Redirected(handle) => {
                irp.handle = handle;
                return Ok(());
            }
        };

        let binding = Arc::new(Binding {
            handler: index,
            owns_handle,
            state: Mutex::new(Some(state)),
        });

        let previous = self
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, binding);
        if previous.is_some() {
            warn!("Handle {:#x} was still bound, replacing stale binding", handle.0);
        }

        debug!("Bound handle {:#x} to {}", handle.0, handler.name());
        irp.handle = handle;
        Ok(())
    }

    fn route_handle(&self, irp: &mut Irp<'_>) -> Routed<Result<(), IoError>> {
        let Some(binding) = self.binding(irp.handle) else {
            return Routed::PassThrough;
        };
        let handler = &self.handlers[binding.handler];
        let os: &dyn OsDevice = &self.os;

        if irp.op == IrpOp::Close {
            return Routed::Emulated(self.close_bound(irp.handle, &binding));
        }

        let mut guard = lock(&binding.state);
        let Some(state) = guard.as_mut() else {
            debug!("{:?} on closed handle {:#x}", irp.op, irp.handle.0);
            return Routed::Emulated(Err(IoError::InvalidHandle));
        };

        let result = match irp.op {
            IrpOp::Read => handler.read(state, os, irp.output),
            IrpOp::Write => handler.write(state, os, irp.input),
            IrpOp::Control => handler.control(state, os, irp.code, irp.input, irp.output),
            IrpOp::Open | IrpOp::Close => unreachable!("handled above"),
        };

        Routed::Emulated(result.map(|n| {
            irp.transferred = n;
        }))
    }

    fn close_bound(&self, handle: Handle, binding: &Arc<Binding>) -> Result<(), IoError> {
        let Some(state) = lock(&binding.state).take() else {
            return Err(IoError::InvalidHandle);
        };

        {
            let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
            if bindings
                .get(&handle)
                .is_some_and(|current| Arc::ptr_eq(current, binding))
            {
                bindings.remove(&handle);
            }
        }

        let handler = &self.handlers[binding.handler];
        let result = handler.close(state, &self.os);
        if binding.owns_handle {
            self.os.close(handle)?;
        }

        debug!("Closed handle {:#x} ({})", handle.0, handler.name());
        result
    }
}
