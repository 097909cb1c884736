//! Import table redirection of the Win32 file API in the host executable.

use anyhow::{Context, Result};
use devhook::redirect::PeImage;
use devhook::{
    Dispatcher, Handle, HookSymbol, IoError, Irp, OpenParams, OriginalSlot, OsDevice, Redirector,
    Routed,
};
use std::ffi::{CStr, c_void};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};
use windows::Win32::Foundation::{HANDLE, HMODULE, INVALID_HANDLE_VALUE, SetLastError, WIN32_ERROR};
use windows::Win32::System::IO::OVERLAPPED;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Threading::SetEvent;
use windows::core::{PCSTR, PCWSTR, w};

const KERNEL32: &str = "kernel32.dll";

const GENERIC_READ_WRITE: u32 = 0xC000_0000;
const FILE_SHARE_READ_WRITE: u32 = 0x3;
const OPEN_EXISTING: u32 = 3;
const ERROR_PROC_NOT_FOUND: u32 = 127;

// BOOL is passed as a plain i32 to keep the signatures ABI-exact.
type OpenProcessFn = unsafe extern "system" fn(u32, i32, u32) -> HANDLE;
type CreateFileAFn =
    unsafe extern "system" fn(PCSTR, u32, u32, *const c_void, u32, u32, HANDLE) -> HANDLE;
type CreateFileWFn =
    unsafe extern "system" fn(PCWSTR, u32, u32, *const c_void, u32, u32, HANDLE) -> HANDLE;
type ReadFileFn =
    unsafe extern "system" fn(HANDLE, *mut c_void, u32, *mut u32, *mut OVERLAPPED) -> i32;
type WriteFileFn =
    unsafe extern "system" fn(HANDLE, *const c_void, u32, *mut u32, *mut OVERLAPPED) -> i32;
type DeviceIoControlFn = unsafe extern "system" fn(
    HANDLE,
    u32,
    *const c_void,
    u32,
    *mut c_void,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;
type CloseHandleFn = unsafe extern "system" fn(HANDLE) -> i32;

static ORIG_OPEN_PROCESS: OriginalSlot = OriginalSlot::new();
static ORIG_CREATE_FILE_A: OriginalSlot = OriginalSlot::new();
static ORIG_CREATE_FILE_W: OriginalSlot = OriginalSlot::new();
static ORIG_READ_FILE: OriginalSlot = OriginalSlot::new();
static ORIG_WRITE_FILE: OriginalSlot = OriginalSlot::new();
static ORIG_DEVICE_IO_CONTROL: OriginalSlot = OriginalSlot::new();
static ORIG_CLOSE_HANDLE: OriginalSlot = OriginalSlot::new();

static REDIRECTOR: Mutex<Option<Redirector<PeImage<'static>>>> = Mutex::new(None);

/// Redirect `OpenProcess` only; everything else waits for its first call.
pub(crate) fn attach() -> Result<()> {
    let module = unsafe { GetModuleHandleW(PCWSTR::null()) }
        .context("Cannot locate the host executable")?;
    let image = unsafe { PeImage::from_module_base(module.0.cast()) }
        .context("Host executable is not a valid PE image")?;

    let mut redirector = Redirector::new(image);
    redirector
        .install(
            KERNEL32,
            &[HookSymbol::new(
                "OpenProcess",
                open_process as usize,
                &ORIG_OPEN_PROCESS,
            )],
        )
        .context("Failed to redirect OpenProcess")?;

    *REDIRECTOR.lock().unwrap_or_else(PoisonError::into_inner) = Some(redirector);
    Ok(())
}

pub(crate) fn install_io_redirections() -> Result<()> {
    let symbols = [
        HookSymbol::new("CreateFileA", create_file_a as usize, &ORIG_CREATE_FILE_A),
        HookSymbol::new("CreateFileW", create_file_w as usize, &ORIG_CREATE_FILE_W),
        HookSymbol::new("ReadFile", read_file as usize, &ORIG_READ_FILE),
        HookSymbol::new("WriteFile", write_file as usize, &ORIG_WRITE_FILE),
        HookSymbol::new(
            "DeviceIoControl",
            device_io_control as usize,
            &ORIG_DEVICE_IO_CONTROL,
        ),
        HookSymbol::new("CloseHandle", close_handle as usize, &ORIG_CLOSE_HANDLE),
    ];

    let mut guard = REDIRECTOR.lock().unwrap_or_else(PoisonError::into_inner);
    let redirector = guard.as_mut().context("Shim is not attached")?;
    let installed = redirector
        .install(KERNEL32, &symbols)
        .context("Failed to redirect the file API")?;
    info!("Redirected {} file API entry points", installed);

    let enumeration = crate::setupapi::install(redirector);
    info!("Redirected {} device enumeration entry points", enumeration);
    Ok(())
}

/// Address of a kernel32 export. The dispatcher calls the OS through these
/// rather than through the redirection slots, so it can be built before
/// any import is rewritten.
fn kernel32_export<F: Copy>(kernel32: HMODULE, name: &CStr) -> Result<F> {
    let proc = unsafe { GetProcAddress(kernel32, PCSTR(name.as_ptr().cast())) }
        .with_context(|| format!("kernel32 does not export {}", name.to_string_lossy()))?;
    Ok(unsafe { std::mem::transmute_copy(&proc) })
}

pub(crate) fn set_last_error(code: u32) {
    unsafe { SetLastError(WIN32_ERROR(code)) };
}

fn last_error() -> IoError {
    IoError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(31))
}

fn to_handle(handle: HANDLE) -> Handle {
    Handle(handle.0 as usize)
}

fn from_handle(handle: Handle) -> HANDLE {
    HANDLE(handle.0 as *mut c_void)
}

unsafe fn buffer<'a>(ptr: *mut c_void, len: u32) -> &'a mut [u8] {
    if ptr.is_null() || len == 0 {
        &mut []
    } else {
        unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), len as usize) }
    }
}

/// The real kernel32, called through the captured originals.
pub(crate) struct Device {
    create_file_w: CreateFileWFn,
    read_file: ReadFileFn,
    write_file: WriteFileFn,
    device_io_control: DeviceIoControlFn,
    close_handle: CloseHandleFn,
}

impl Device {
    pub(crate) fn new() -> Result<Self> {
        let kernel32 = unsafe { GetModuleHandleW(w!("kernel32.dll")) }
            .context("kernel32.dll is not loaded")?;
        Ok(Self {
            create_file_w: kernel32_export(kernel32, c"CreateFileW")?,
            read_file: kernel32_export(kernel32, c"ReadFile")?,
            write_file: kernel32_export(kernel32, c"WriteFile")?,
            device_io_control: kernel32_export(kernel32, c"DeviceIoControl")?,
            close_handle: kernel32_export(kernel32, c"CloseHandle")?,
        })
    }

    fn create(
        &self,
        path: &str,
        access: u32,
        share: u32,
        disposition: u32,
        attributes: u32,
    ) -> Result<Handle, IoError> {
        let wide: Vec<u16> = path.encode_utf16().chain(Some(0)).collect();
        let handle = unsafe {
            (self.create_file_w)(
                PCWSTR(wide.as_ptr()),
                access,
                share,
                std::ptr::null(),
                disposition,
                attributes,
                HANDLE::default(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            Err(last_error())
        } else {
            Ok(to_handle(handle))
        }
    }
}

impl OsDevice for Device {
    fn open(&self, path: &str, params: &OpenParams) -> Result<Handle, IoError> {
        self.create(
            path,
            params.access,
            params.share,
            params.disposition,
            params.attributes,
        )
    }

    fn open_null(&self) -> Result<Handle, IoError> {
        self.create("NUL", GENERIC_READ_WRITE, FILE_SHARE_READ_WRITE, OPEN_EXISTING, 0)
    }

    fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, IoError> {
        let mut done = 0u32;
        let ok = unsafe {
            (self.read_file)(
                from_handle(handle),
                buf.as_mut_ptr().cast(),
                buf.len() as u32,
                &mut done,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 { Err(last_error()) } else { Ok(done as usize) }
    }

    fn write(&self, handle: Handle, buf: &[u8]) -> Result<usize, IoError> {
        let mut done = 0u32;
        let ok = unsafe {
            (self.write_file)(
                from_handle(handle),
                buf.as_ptr().cast(),
                buf.len() as u32,
                &mut done,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 { Err(last_error()) } else { Ok(done as usize) }
    }

    fn control(
        &self,
        handle: Handle,
        code: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, IoError> {
        let mut done = 0u32;
        let ok = unsafe {
            (self.device_io_control)(
                from_handle(handle),
                code,
                input.as_ptr().cast(),
                input.len() as u32,
                output.as_mut_ptr().cast(),
                output.len() as u32,
                &mut done,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 { Err(last_error()) } else { Ok(done as usize) }
    }

    fn close(&self, handle: Handle) -> Result<(), IoError> {
        if unsafe { (self.close_handle)(from_handle(handle)) } == 0 {
            Err(last_error())
        } else {
            Ok(())
        }
    }
}

fn claimed(handle: HANDLE) -> Option<&'static Dispatcher<Device>> {
    crate::dispatcher().filter(|d| d.is_claimed(to_handle(handle)))
}

/// Finish an emulated request the way a synchronous driver would: the
/// byte count goes to both the caller's counter and the `OVERLAPPED`
/// block, whose event is signalled.
unsafe fn complete(
    result: Result<(), IoError>,
    transferred: usize,
    count: *mut u32,
    overlapped: *mut OVERLAPPED,
) -> i32 {
    match result {
        Ok(()) => {
            if !count.is_null() {
                unsafe { *count = transferred as u32 };
            }
            if let Some(ov) = unsafe { overlapped.as_mut() } {
                ov.Internal = 0;
                ov.InternalHigh = transferred;
                if !ov.hEvent.0.is_null() {
                    let _ = unsafe { SetEvent(ov.hEvent) };
                }
            }
            1
        }
        Err(e) => {
            debug!("Emulated call failed: {}", e);
            if !count.is_null() {
                unsafe { *count = 0 };
            }
            set_last_error(e.to_win32());
            0
        }
    }
}

fn open_emulated(dispatcher: &Dispatcher<Device>, path: &str, params: OpenParams) -> Option<HANDLE> {
    let mut irp = Irp::open(path, params);
    match dispatcher.route(&mut irp) {
        Routed::PassThrough => None,
        Routed::Emulated(Ok(())) => {
            debug!("CreateFile: {} -> {:#x}", path, irp.handle.0);
            Some(from_handle(irp.handle))
        }
        Routed::Emulated(Err(e)) => {
            debug!("CreateFile: {} failed: {}", path, e);
            set_last_error(e.to_win32());
            Some(INVALID_HANDLE_VALUE)
        }
    }
}

// =============================================================================
// Intercepted functions
// =============================================================================

unsafe extern "system" fn open_process(access: u32, inherit: i32, pid: u32) -> HANDLE {
    crate::bootstrap();

    match unsafe { ORIG_OPEN_PROCESS.function::<OpenProcessFn>() } {
        Some(real) => unsafe { real(access, inherit, pid) },
        None => {
            set_last_error(ERROR_PROC_NOT_FOUND);
            HANDLE::default()
        }
    }
}

unsafe extern "system" fn create_file_a(
    path: PCSTR,
    access: u32,
    share: u32,
    security: *const c_void,
    disposition: u32,
    attributes: u32,
    template: HANDLE,
) -> HANDLE {
    let Some(real) = (unsafe { ORIG_CREATE_FILE_A.function::<CreateFileAFn>() }) else {
        set_last_error(ERROR_PROC_NOT_FOUND);
        return INVALID_HANDLE_VALUE;
    };
    let pass = || unsafe { real(path, access, share, security, disposition, attributes, template) };

    let Some(dispatcher) = crate::dispatcher() else {
        return pass();
    };
    if path.is_null() {
        return pass();
    }
    let Ok(name) = (unsafe { path.to_string() }) else {
        return pass();
    };

    let params = OpenParams {
        access,
        share,
        disposition,
        attributes,
    };
    open_emulated(dispatcher, &name, params).unwrap_or_else(pass)
}

unsafe extern "system" fn create_file_w(
    path: PCWSTR,
    access: u32,
    share: u32,
    security: *const c_void,
    disposition: u32,
    attributes: u32,
    template: HANDLE,
) -> HANDLE {
    let Some(real) = (unsafe { ORIG_CREATE_FILE_W.function::<CreateFileWFn>() }) else {
        set_last_error(ERROR_PROC_NOT_FOUND);
        return INVALID_HANDLE_VALUE;
    };
    let pass = || unsafe { real(path, access, share, security, disposition, attributes, template) };

    let Some(dispatcher) = crate::dispatcher() else {
        return pass();
    };
    if path.is_null() {
        return pass();
    }
    let Ok(name) = (unsafe { path.to_string() }) else {
        return pass();
    };

    let params = OpenParams {
        access,
        share,
        disposition,
        attributes,
    };
    open_emulated(dispatcher, &name, params).unwrap_or_else(pass)
}

unsafe extern "system" fn read_file(
    handle: HANDLE,
    buf: *mut c_void,
    len: u32,
    read: *mut u32,
    overlapped: *mut OVERLAPPED,
) -> i32 {
    let Some(real) = (unsafe { ORIG_READ_FILE.function::<ReadFileFn>() }) else {
        set_last_error(ERROR_PROC_NOT_FOUND);
        return 0;
    };
    let Some(dispatcher) = claimed(handle) else {
        return unsafe { real(handle, buf, len, read, overlapped) };
    };

    let mut irp = Irp::read(to_handle(handle), unsafe { buffer(buf, len) });
    match dispatcher.route(&mut irp) {
        Routed::PassThrough => unsafe { real(handle, buf, len, read, overlapped) },
        Routed::Emulated(result) => unsafe { complete(result, irp.transferred, read, overlapped) },
    }
}

unsafe extern "system" fn write_file(
    handle: HANDLE,
    buf: *const c_void,
    len: u32,
    written: *mut u32,
    overlapped: *mut OVERLAPPED,
) -> i32 {
    let Some(real) = (unsafe { ORIG_WRITE_FILE.function::<WriteFileFn>() }) else {
        set_last_error(ERROR_PROC_NOT_FOUND);
        return 0;
    };
    let Some(dispatcher) = claimed(handle) else {
        return unsafe { real(handle, buf, len, written, overlapped) };
    };

    let data = unsafe { buffer(buf.cast_mut(), len) };
    let mut irp = Irp::write(to_handle(handle), data);
    match dispatcher.route(&mut irp) {
        Routed::PassThrough => unsafe { real(handle, buf, len, written, overlapped) },
        Routed::Emulated(result) => unsafe {
            complete(result, irp.transferred, written, overlapped)
        },
    }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn device_io_control(
    handle: HANDLE,
    code: u32,
    in_buf: *const c_void,
    in_len: u32,
    out_buf: *mut c_void,
    out_len: u32,
    returned: *mut u32,
    overlapped: *mut OVERLAPPED,
) -> i32 {
    let Some(real) = (unsafe { ORIG_DEVICE_IO_CONTROL.function::<DeviceIoControlFn>() }) else {
        set_last_error(ERROR_PROC_NOT_FOUND);
        return 0;
    };
    let Some(dispatcher) = claimed(handle) else {
        return unsafe {
            real(handle, code, in_buf, in_len, out_buf, out_len, returned, overlapped)
        };
    };

    // Buffered requests may pass the same pointer for input and output.
    let input = unsafe { buffer(in_buf.cast_mut(), in_len) }.to_vec();
    let output = unsafe { buffer(out_buf, out_len) };
    let mut irp = Irp::control(to_handle(handle), code, &input, output);
    match dispatcher.route(&mut irp) {
        Routed::PassThrough => unsafe {
            real(handle, code, in_buf, in_len, out_buf, out_len, returned, overlapped)
        },
        Routed::Emulated(result) => unsafe {
            complete(result, irp.transferred, returned, overlapped)
        },
    }
}

unsafe extern "system" fn close_handle(handle: HANDLE) -> i32 {
    let Some(real) = (unsafe { ORIG_CLOSE_HANDLE.function::<CloseHandleFn>() }) else {
        set_last_error(ERROR_PROC_NOT_FOUND);
        return 0;
    };
    let Some(dispatcher) = claimed(handle) else {
        return unsafe { real(handle) };
    };

    let mut irp = Irp::close(to_handle(handle));
    match dispatcher.route(&mut irp) {
        Routed::PassThrough => unsafe { real(handle) },
        Routed::Emulated(Ok(())) => 1,
        Routed::Emulated(Err(e)) => {
            set_last_error(e.to_win32());
            0
        }
    }
}
