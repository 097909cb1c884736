//! LD_PRELOAD interposition of the libc file API.

use anyhow::{Context, Result};
use devhook::emu::serial::tty;
use devhook::redirect::NextSymbolTable;
use devhook::{
    Dispatcher, Handle, HookSymbol, IoError, Irp, OpenParams, OriginalSlot, OsDevice, Redirector,
    Routed,
};
use lazy_static::lazy_static;
use libc::{c_char, c_int, c_uint, c_ulong, c_void, size_t, ssize_t};
use std::ffi::{CStr, CString};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

const LIBC: &str = "libc.so.6";

type OpenFn = unsafe extern "C" fn(*const c_char, c_int, c_uint) -> c_int;
type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, *mut c_void) -> c_int;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;

static ORIG_OPEN: OriginalSlot = OriginalSlot::new();
static ORIG_OPEN64: OriginalSlot = OriginalSlot::new();
static ORIG_READ: OriginalSlot = OriginalSlot::new();
static ORIG_WRITE: OriginalSlot = OriginalSlot::new();
static ORIG_IOCTL: OriginalSlot = OriginalSlot::new();
static ORIG_CLOSE: OriginalSlot = OriginalSlot::new();

lazy_static! {
    static ref REDIRECTOR: Mutex<Redirector<NextSymbolTable>> =
        Mutex::new(Redirector::new(NextSymbolTable::new()));
}

fn symbols() -> [HookSymbol; 6] {
    [
        HookSymbol::new("open", open as usize, &ORIG_OPEN),
        HookSymbol::new("open64", open64 as usize, &ORIG_OPEN64),
        HookSymbol::new("read", read as usize, &ORIG_READ),
        HookSymbol::new("write", write as usize, &ORIG_WRITE),
        HookSymbol::new("ioctl", ioctl as usize, &ORIG_IOCTL),
        HookSymbol::new("close", close as usize, &ORIG_CLOSE),
    ]
}

/// Resolve the real libc functions. Bootstrap waits for the first `open`.
pub(crate) fn attach() -> Result<()> {
    let mut redirector = REDIRECTOR.lock().unwrap_or_else(PoisonError::into_inner);
    redirector
        .install(LIBC, &symbols())
        .context("Failed to resolve libc entry points")?;
    Ok(())
}

/// Everything is already interposed by the time bootstrap runs.
pub(crate) fn install_io_redirections() -> Result<()> {
    attach()
}

/// Original function for `slot`, resolved directly if the call arrives
/// before the constructor ran.
unsafe fn original<F: Copy>(slot: &OriginalSlot, name: &CStr) -> Option<F> {
    if let Some(f) = unsafe { slot.function::<F>() } {
        return Some(f);
    }
    let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { std::mem::transmute_copy(&ptr) })
    }
}

fn resolved<F: Copy>(slot: &OriginalSlot, name: &CStr) -> Result<F> {
    unsafe { original(slot, name) }
        .with_context(|| format!("{} is not resolved", name.to_string_lossy()))
}

fn set_errno(code: c_int) {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location() = code;
    }
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    unsafe {
        *libc::__error() = code;
    }
}

fn last_error() -> IoError {
    IoError::Os(
        std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO),
    )
}

fn fail(e: IoError) -> c_int {
    debug!("Emulated call failed: {}", e);
    set_errno(e.to_errno());
    -1
}

unsafe fn buffer<'a>(ptr: *mut c_void, len: usize) -> &'a mut [u8] {
    if ptr.is_null() || len == 0 {
        &mut []
    } else {
        unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), len) }
    }
}

/// The real libc, called through the captured originals.
pub(crate) struct Device {
    open: OpenFn,
    read: ReadFn,
    write: WriteFn,
    ioctl: IoctlFn,
    close: CloseFn,
}

impl Device {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            open: resolved(&ORIG_OPEN, c"open")?,
            read: resolved(&ORIG_READ, c"read")?,
            write: resolved(&ORIG_WRITE, c"write")?,
            ioctl: resolved(&ORIG_IOCTL, c"ioctl")?,
            close: resolved(&ORIG_CLOSE, c"close")?,
        })
    }
}

fn fd(handle: Handle) -> c_int {
    handle.0 as c_int
}

fn check(rc: ssize_t) -> Result<usize, IoError> {
    if rc < 0 { Err(last_error()) } else { Ok(rc as usize) }
}

impl OsDevice for Device {
    fn open(&self, path: &str, params: &OpenParams) -> Result<Handle, IoError> {
        let path = CString::new(path).map_err(|_| IoError::InvalidParameter)?;
        let fd = unsafe {
            (self.open)(
                path.as_ptr(),
                params.access as c_int,
                params.attributes as c_uint,
            )
        };
        check(fd as ssize_t).map(Handle)
    }

    fn open_null(&self) -> Result<Handle, IoError> {
        let fd = unsafe { (self.open)(c"/dev/null".as_ptr(), libc::O_RDWR | libc::O_CLOEXEC, 0) };
        check(fd as ssize_t).map(Handle)
    }

    fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, IoError> {
        check(unsafe { (self.read)(fd(handle), buf.as_mut_ptr().cast(), buf.len()) })
    }

    fn write(&self, handle: Handle, buf: &[u8]) -> Result<usize, IoError> {
        check(unsafe { (self.write)(fd(handle), buf.as_ptr().cast(), buf.len()) })
    }

    fn control(
        &self,
        handle: Handle,
        code: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, IoError> {
        let arg: *mut c_void = if output.is_empty() {
            input.as_ptr().cast_mut().cast()
        } else {
            output.as_mut_ptr().cast()
        };
        check(unsafe { (self.ioctl)(fd(handle), code as c_ulong, arg) } as ssize_t)
    }

    fn close(&self, handle: Handle) -> Result<(), IoError> {
        check(unsafe { (self.close)(fd(handle)) } as ssize_t).map(|_| ())
    }
}

/// The dispatcher, if `fd` is bound to an emulator.
fn claimed(fd: c_int) -> Option<&'static Dispatcher<Device>> {
    if fd < 0 {
        return None;
    }
    crate::dispatcher().filter(|d| d.is_claimed(Handle(fd as usize)))
}

// =============================================================================
// Intercepted functions
// =============================================================================

unsafe fn open_common(
    slot: &OriginalSlot,
    name: &CStr,
    pathname: *const c_char,
    flags: c_int,
    mode: c_uint,
) -> c_int {
    let Some(real) = (unsafe { original::<OpenFn>(slot, name) }) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    if pathname.is_null() {
        return unsafe { real(pathname, flags, mode) };
    }

    crate::bootstrap();

    let Some(dispatcher) = crate::dispatcher() else {
        return unsafe { real(pathname, flags, mode) };
    };
    let Ok(path) = unsafe { CStr::from_ptr(pathname) }.to_str() else {
        // Invalid UTF-8, pass through
        return unsafe { real(pathname, flags, mode) };
    };

    let params = OpenParams {
        access: flags as u32,
        attributes: mode,
        ..OpenParams::default()
    };
    let mut irp = Irp::open(path, params);

    match dispatcher.route(&mut irp) {
        Routed::PassThrough => unsafe { real(pathname, flags, mode) },
        Routed::Emulated(Ok(())) => {
            debug!("{}: {} -> fd {}", name.to_string_lossy(), path, irp.handle.0);
            irp.handle.0 as c_int
        }
        Routed::Emulated(Err(e)) => fail(e),
    }
}

/// Intercept open()
///
/// # Safety
/// Same contract as libc `open`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn open(pathname: *const c_char, flags: c_int, mode: c_uint) -> c_int {
    unsafe { open_common(&ORIG_OPEN, c"open", pathname, flags, mode) }
}

/// Intercept open64()
///
/// # Safety
/// Same contract as libc `open64`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn open64(pathname: *const c_char, flags: c_int, mode: c_uint) -> c_int {
    unsafe { open_common(&ORIG_OPEN64, c"open64", pathname, flags, mode) }
}

/// # Safety
/// Same contract as libc `read`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let Some(real) = (unsafe { original::<ReadFn>(&ORIG_READ, c"read") }) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    let Some(dispatcher) = claimed(fd) else {
        return unsafe { real(fd, buf, count) };
    };

    let mut irp = Irp::read(Handle(fd as usize), unsafe { buffer(buf, count) });
    match dispatcher.route(&mut irp) {
        Routed::PassThrough => unsafe { real(fd, buf, count) },
        Routed::Emulated(Ok(())) => irp.transferred as ssize_t,
        Routed::Emulated(Err(e)) => fail(e) as ssize_t,
    }
}

/// # Safety
/// Same contract as libc `write`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let Some(real) = (unsafe { original::<WriteFn>(&ORIG_WRITE, c"write") }) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    let Some(dispatcher) = claimed(fd) else {
        return unsafe { real(fd, buf, count) };
    };

    let data = unsafe { buffer(buf.cast_mut(), count) };
    let mut irp = Irp::write(Handle(fd as usize), data);
    match dispatcher.route(&mut irp) {
        Routed::PassThrough => unsafe { real(fd, buf, count) },
        Routed::Emulated(Ok(())) => irp.transferred as ssize_t,
        Routed::Emulated(Err(e)) => fail(e) as ssize_t,
    }
}

/// Intercept ioctl(). The third argument is taken as a pointer, which is
/// how every request the emulators understand passes it.
///
/// # Safety
/// Same contract as libc `ioctl`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    let Some(real) = (unsafe { original::<IoctlFn>(&ORIG_IOCTL, c"ioctl") }) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    let Some(dispatcher) = claimed(fd) else {
        return unsafe { real(fd, request, arg) };
    };

    let code = request as u32;
    let termios_len = std::mem::size_of::<libc::termios>();
    let queue_selector;
    let (input, output): (&[u8], &mut [u8]) = match code {
        tty::FIONREAD => (&[], unsafe { buffer(arg, std::mem::size_of::<c_int>()) }),
        // TCFLSH passes the queue selector by value
        tty::TCFLSH => {
            queue_selector = (arg as usize as u32).to_le_bytes();
            (&queue_selector, &mut [])
        }
        tty::TCGETS => (&[], unsafe { buffer(arg, termios_len) }),
        tty::TCSETS | tty::TCSETSW | tty::TCSETSF => (unsafe { buffer(arg, termios_len) }, &mut []),
        _ => (&[], &mut []),
    };

    let mut irp = Irp::control(Handle(fd as usize), code, input, output);
    match dispatcher.route(&mut irp) {
        Routed::PassThrough => unsafe { real(fd, request, arg) },
        Routed::Emulated(Ok(())) => 0,
        Routed::Emulated(Err(e)) => fail(e),
    }
}

/// # Safety
/// Same contract as libc `close`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    let Some(real) = (unsafe { original::<CloseFn>(&ORIG_CLOSE, c"close") }) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    let Some(dispatcher) = claimed(fd) else {
        return unsafe { real(fd) };
    };

    let mut irp = Irp::close(Handle(fd as usize));
    match dispatcher.route(&mut irp) {
        Routed::PassThrough => unsafe { real(fd) },
        Routed::Emulated(Ok(())) => {
            debug!("close: released emulated fd {}", fd);
            0
        }
        Routed::Emulated(Err(e)) => fail(e),
    }
}
