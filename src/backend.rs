//! Services handed to dynamically loaded backend libraries (`eamio` card
//! readers, `iidxio` panels): thread primitives and log sinks.

use lazy_static::lazy_static;
use libloading::Library;
use std::collections::HashMap;
use std::ffi::{CStr, c_char, c_void};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

pub(crate) type ThreadProc = unsafe extern "C" fn(*mut c_void) -> i32;
pub(crate) type ThreadCreate = unsafe extern "C" fn(ThreadProc, *mut c_void, u32, u32) -> i32;
pub(crate) type ThreadJoin = unsafe extern "C" fn(i32, *mut i32);
pub(crate) type ThreadDestroy = unsafe extern "C" fn(i32);

/// Log sink as a backend calls it: module name, then a printf format string.
/// The format's arguments are not read.
pub(crate) type LogSink = unsafe extern "C" fn(*const c_char, *const c_char);
type SetLoggers = unsafe extern "C" fn(LogSink, LogSink, LogSink, LogSink);

lazy_static! {
    static ref THREADS: Mutex<HashMap<i32, JoinHandle<i32>>> = Mutex::new(HashMap::new());
}

static NEXT_THREAD_ID: AtomicI32 = AtomicI32::new(1);

struct ThreadContext(*mut c_void);

// The library owns the context and guarantees it outlives the thread.
unsafe impl Send for ThreadContext {}

pub(crate) unsafe extern "C" fn thread_create(
    proc_: ThreadProc,
    ctx: *mut c_void,
    stack_size: u32,
    _priority: u32,
) -> i32 {
    let ctx = ThreadContext(ctx);
    let mut builder = std::thread::Builder::new().name("devhook-backend".into());
    if stack_size > 0 {
        builder = builder.stack_size(stack_size as usize);
    }

    let spawned = builder.spawn(move || {
        let ctx = ctx;
        unsafe { proc_(ctx.0) }
    });

    match spawned {
        Ok(handle) => {
            let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            THREADS
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, handle);
            id
        }
        Err(e) => {
            warn!("backend: failed to spawn thread: {}", e);
            -1
        }
    }
}

pub(crate) unsafe extern "C" fn thread_join(id: i32, result: *mut i32) {
    let handle = THREADS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
    let code = match handle.map(JoinHandle::join) {
        Some(Ok(code)) => code,
        _ => -1,
    };
    if !result.is_null() {
        unsafe { *result = code };
    }
}

pub(crate) unsafe extern "C" fn thread_destroy(id: i32) {
    // Joined threads are already gone; a never-joined one is detached.
    THREADS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
}

unsafe fn text(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_string_lossy()
        .trim_end()
        .to_string()
}

unsafe extern "C" fn log_misc(module: *const c_char, fmt: *const c_char) {
    let (module, message) = unsafe { (text(module), text(fmt)) };
    debug!("{}: {}", module, message);
}

unsafe extern "C" fn log_info(module: *const c_char, fmt: *const c_char) {
    let (module, message) = unsafe { (text(module), text(fmt)) };
    info!("{}: {}", module, message);
}

unsafe extern "C" fn log_warning(module: *const c_char, fmt: *const c_char) {
    let (module, message) = unsafe { (text(module), text(fmt)) };
    warn!("{}: {}", module, message);
}

/// A backend only reports fatal when it cannot continue; neither can we.
unsafe extern "C" fn log_fatal(module: *const c_char, fmt: *const c_char) {
    let (module, message) = unsafe { (text(module), text(fmt)) };
    error!("{}: {}", module, message);
    std::process::exit(1);
}

/// Route the library's logging into `tracing` through its
/// `<prefix>_set_loggers` export. Libraries without one keep their own.
pub(crate) fn set_loggers(library: &Library, symbol: &str) {
    let name = format!("{}\0", symbol);
    match unsafe { library.get::<SetLoggers>(name.as_bytes()) } {
        Ok(set) => unsafe { set(log_misc, log_info, log_warning, log_fatal) },
        Err(e) => debug!("backend: no {} export ({})", symbol, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn answer(ctx: *mut c_void) -> i32 {
        unsafe { *ctx.cast::<i32>() * 2 }
    }

    #[test]
    fn threads_report_their_exit_code() {
        let mut input = 21i32;
        let id = unsafe { thread_create(answer, (&mut input as *mut i32).cast(), 0, 0) };
        assert!(id > 0);

        let mut code = 0;
        unsafe { thread_join(id, &mut code) };
        assert_eq!(code, 42);

        // Joining twice is harmless.
        unsafe { thread_join(id, &mut code) };
        assert_eq!(code, -1);
        unsafe { thread_destroy(id) };
    }

    #[test]
    fn log_text_is_trimmed_and_null_safe() {
        assert_eq!(unsafe { text(std::ptr::null()) }, "");
        assert_eq!(unsafe { text(c"card inserted\n".as_ptr()) }, "card inserted");

        // Sinks accept null and plain strings without reading past the format.
        unsafe {
            log_misc(c"eamio".as_ptr(), c"polling %d".as_ptr());
            log_info(std::ptr::null(), c"ready".as_ptr());
            log_warning(c"iidxio".as_ptr(), std::ptr::null());
        }
    }
}
