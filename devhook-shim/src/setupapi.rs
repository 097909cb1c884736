//! SetupAPI device enumeration, answered for emulated device interfaces.
//!
//! Sets opened over a class with an emulated interface are ours end to end;
//! every other set, and every call on one, goes to the real SetupAPI.

use devhook::redirect::PeImage;
use devhook::setupapi::{SetupError, fill_record};
use devhook::{DeviceInterface, Guid, HookSymbol, OriginalSlot, RedirectError, Redirector};
use std::ffi::c_void;
use tracing::debug;
use windows::core::{PCSTR, PCWSTR};

use crate::win32::set_last_error;

const SETUPAPI: &str = "setupapi.dll";

const INVALID_SET: isize = -1;
const ERROR_INVALID_DATA: u32 = 13;
const ERROR_INVALID_PARAMETER: u32 = 87;
const ERROR_PROC_NOT_FOUND: u32 = 127;

const SPINT_ACTIVE: u32 = 0x1;
const SPDRP_DEVICEDESC: u32 = 0x0;
const REG_SZ: u32 = 1;

/// Size of the `cbSize` field heading the variable-length detail record.
const DETAIL_HEADER: usize = 4;

/// `SP_DEVICE_INTERFACE_DATA`
#[repr(C)]
struct InterfaceData {
    cb_size: u32,
    class: Guid,
    flags: u32,
    reserved: usize,
}

/// `SP_DEVINFO_DATA`
#[repr(C)]
struct DevInfoData {
    cb_size: u32,
    class: Guid,
    dev_inst: u32,
    reserved: usize,
}

type GetClassDevsAFn = unsafe extern "system" fn(*const Guid, PCSTR, *mut c_void, u32) -> isize;
type GetClassDevsWFn = unsafe extern "system" fn(*const Guid, PCWSTR, *mut c_void, u32) -> isize;
type EnumInterfacesFn =
    unsafe extern "system" fn(isize, *const DevInfoData, *const Guid, u32, *mut InterfaceData) -> i32;
type InterfaceDetailFn = unsafe extern "system" fn(
    isize,
    *const InterfaceData,
    *mut c_void,
    u32,
    *mut u32,
    *mut DevInfoData,
) -> i32;
type RegistryPropertyFn =
    unsafe extern "system" fn(isize, *const DevInfoData, u32, *mut u32, *mut u8, u32, *mut u32) -> i32;
type DestroyFn = unsafe extern "system" fn(isize) -> i32;

static ORIG_GET_CLASS_DEVS_A: OriginalSlot = OriginalSlot::new();
static ORIG_GET_CLASS_DEVS_W: OriginalSlot = OriginalSlot::new();
static ORIG_ENUM_INTERFACES: OriginalSlot = OriginalSlot::new();
static ORIG_DETAIL_A: OriginalSlot = OriginalSlot::new();
static ORIG_DETAIL_W: OriginalSlot = OriginalSlot::new();
static ORIG_REGISTRY_PROPERTY_A: OriginalSlot = OriginalSlot::new();
static ORIG_DESTROY: OriginalSlot = OriginalSlot::new();

/// Redirect whichever of the enumeration functions the host imports.
/// Returns how many were redirected.
pub(crate) fn install(redirector: &mut Redirector<PeImage<'static>>) -> usize {
    let symbols = [
        HookSymbol::new("SetupDiGetClassDevsA", get_class_devs_a as usize, &ORIG_GET_CLASS_DEVS_A),
        HookSymbol::new("SetupDiGetClassDevsW", get_class_devs_w as usize, &ORIG_GET_CLASS_DEVS_W),
        HookSymbol::new(
            "SetupDiEnumDeviceInterfaces",
            enum_device_interfaces as usize,
            &ORIG_ENUM_INTERFACES,
        ),
        HookSymbol::new(
            "SetupDiGetDeviceInterfaceDetailA",
            interface_detail_a as usize,
            &ORIG_DETAIL_A,
        ),
        HookSymbol::new(
            "SetupDiGetDeviceInterfaceDetailW",
            interface_detail_w as usize,
            &ORIG_DETAIL_W,
        ),
        HookSymbol::new(
            "SetupDiGetDeviceRegistryPropertyA",
            registry_property_a as usize,
            &ORIG_REGISTRY_PROPERTY_A,
        ),
        HookSymbol::new("SetupDiDestroyDeviceInfoList", destroy_info_list as usize, &ORIG_DESTROY),
    ];

    let mut installed = 0;
    for symbol in symbols {
        match redirector.install(SETUPAPI, &[symbol]) {
            Ok(n) => installed += n,
            Err(RedirectError::ModuleNotImported { .. }) => {
                debug!("Host does not import {}", SETUPAPI);
                break;
            }
            Err(e) => debug!("Not redirecting {}: {}", symbol.name, e),
        }
    }
    installed
}

/// The registry, when `set` is one of its sets.
fn ours(set: isize) -> Option<&'static devhook::InterfaceRegistry> {
    crate::interfaces().filter(|r| r.owns(set as usize))
}

fn fail(e: SetupError) -> i32 {
    debug!("setupapi: {}", e);
    set_last_error(e.to_win32());
    0
}

fn proc_not_found() -> i32 {
    set_last_error(ERROR_PROC_NOT_FOUND);
    0
}

fn open_set(class: *const Guid) -> Option<isize> {
    let registry = crate::interfaces()?;
    let class = unsafe { class.as_ref() };
    registry.open(class).map(|set| set as isize)
}

/// The interface an `SP_DEVICE_INTERFACE_DATA` filled by
/// [`enum_device_interfaces`] refers to.
unsafe fn interface_of(
    registry: &'static devhook::InterfaceRegistry,
    set: isize,
    data: *const InterfaceData,
) -> Result<(&'static DeviceInterface, u32), SetupError> {
    let data = unsafe { data.as_ref() }.ok_or(SetupError::NoMoreItems)?;
    let index = (data.reserved as u32).checked_sub(1).ok_or(SetupError::NoMoreItems)?;
    Ok((registry.member(set as usize, &data.class, index)?, index))
}

unsafe fn fill_info_data(info: *mut DevInfoData, interface: &DeviceInterface, index: u32) {
    if let Some(info) = unsafe { info.as_mut() } {
        info.class = interface.class;
        info.dev_inst = index + 1;
        info.reserved = 0;
    }
}

/// Write `units` into the detail record at `detail`, setting `required` to
/// the record size in bytes either way.
unsafe fn fill_detail<T: Copy + Default>(
    detail: *mut c_void,
    size: u32,
    required: *mut u32,
    units: &[T],
) -> Result<(), SetupError> {
    let unit = std::mem::size_of::<T>();
    let header = DETAIL_HEADER / unit;
    let buf: &mut [T] = if detail.is_null() {
        &mut []
    } else {
        unsafe { std::slice::from_raw_parts_mut(detail.cast::<T>(), size as usize / unit) }
    };

    let result = fill_record(buf, header, units);
    let bytes = match result {
        Ok(len) | Err(SetupError::InsufficientBuffer { required: len }) => len * unit,
        Err(_) => 0,
    };
    if !required.is_null() {
        unsafe { *required = bytes as u32 };
    }
    result.map(|_| ())
}

// =============================================================================
// Intercepted functions
// =============================================================================

unsafe extern "system" fn get_class_devs_a(
    class: *const Guid,
    enumerator: PCSTR,
    parent: *mut c_void,
    flags: u32,
) -> isize {
    if let Some(set) = open_set(class) {
        return set;
    }
    match unsafe { ORIG_GET_CLASS_DEVS_A.function::<GetClassDevsAFn>() } {
        Some(real) => unsafe { real(class, enumerator, parent, flags) },
        None => {
            set_last_error(ERROR_PROC_NOT_FOUND);
            INVALID_SET
        }
    }
}

unsafe extern "system" fn get_class_devs_w(
    class: *const Guid,
    enumerator: PCWSTR,
    parent: *mut c_void,
    flags: u32,
) -> isize {
    if let Some(set) = open_set(class) {
        return set;
    }
    match unsafe { ORIG_GET_CLASS_DEVS_W.function::<GetClassDevsWFn>() } {
        Some(real) => unsafe { real(class, enumerator, parent, flags) },
        None => {
            set_last_error(ERROR_PROC_NOT_FOUND);
            INVALID_SET
        }
    }
}

unsafe extern "system" fn enum_device_interfaces(
    set: isize,
    info: *const DevInfoData,
    class: *const Guid,
    index: u32,
    data: *mut InterfaceData,
) -> i32 {
    let Some(registry) = ours(set) else {
        return match unsafe { ORIG_ENUM_INTERFACES.function::<EnumInterfacesFn>() } {
            Some(real) => unsafe { real(set, info, class, index, data) },
            None => proc_not_found(),
        };
    };

    let (Some(class), Some(data)) = (unsafe { class.as_ref() }, unsafe { data.as_mut() }) else {
        set_last_error(ERROR_INVALID_PARAMETER);
        return 0;
    };
    match registry.member(set as usize, class, index) {
        Ok(interface) => {
            debug!("setupapi: interface {} -> {}", index, interface.path);
            data.class = interface.class;
            data.flags = SPINT_ACTIVE;
            data.reserved = index as usize + 1;
            1
        }
        Err(e) => fail(e),
    }
}

unsafe extern "system" fn interface_detail_a(
    set: isize,
    data: *const InterfaceData,
    detail: *mut c_void,
    size: u32,
    required: *mut u32,
    info: *mut DevInfoData,
) -> i32 {
    let Some(registry) = ours(set) else {
        return match unsafe { ORIG_DETAIL_A.function::<InterfaceDetailFn>() } {
            Some(real) => unsafe { real(set, data, detail, size, required, info) },
            None => proc_not_found(),
        };
    };

    let result = unsafe { interface_of(registry, set, data) }.and_then(|(interface, index)| {
        unsafe { fill_info_data(info, interface, index) };
        // Device paths are plain ASCII.
        let path: Vec<u8> = interface
            .path
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect();
        unsafe { fill_detail(detail, size, required, &path) }
    });
    match result {
        Ok(()) => 1,
        Err(e) => fail(e),
    }
}

unsafe extern "system" fn interface_detail_w(
    set: isize,
    data: *const InterfaceData,
    detail: *mut c_void,
    size: u32,
    required: *mut u32,
    info: *mut DevInfoData,
) -> i32 {
    let Some(registry) = ours(set) else {
        return match unsafe { ORIG_DETAIL_W.function::<InterfaceDetailFn>() } {
            Some(real) => unsafe { real(set, data, detail, size, required, info) },
            None => proc_not_found(),
        };
    };

    let result = unsafe { interface_of(registry, set, data) }.and_then(|(interface, index)| {
        unsafe { fill_info_data(info, interface, index) };
        let path: Vec<u16> = interface.path.encode_utf16().collect();
        unsafe { fill_detail(detail, size, required, &path) }
    });
    match result {
        Ok(()) => 1,
        Err(e) => fail(e),
    }
}

unsafe extern "system" fn registry_property_a(
    set: isize,
    info: *const DevInfoData,
    property: u32,
    reg_type: *mut u32,
    buffer: *mut u8,
    size: u32,
    required: *mut u32,
) -> i32 {
    let Some(registry) = ours(set) else {
        return match unsafe { ORIG_REGISTRY_PROPERTY_A.function::<RegistryPropertyFn>() } {
            Some(real) => unsafe { real(set, info, property, reg_type, buffer, size, required) },
            None => proc_not_found(),
        };
    };

    let Some(info) = (unsafe { info.as_ref() }) else {
        set_last_error(ERROR_INVALID_PARAMETER);
        return 0;
    };
    if property != SPDRP_DEVICEDESC {
        debug!("setupapi: unsupported property {}", property);
        set_last_error(ERROR_INVALID_DATA);
        return 0;
    }

    let Some(index) = info.dev_inst.checked_sub(1) else {
        set_last_error(ERROR_INVALID_PARAMETER);
        return 0;
    };
    let interface = match registry.member(set as usize, &info.class, index) {
        Ok(interface) => interface,
        Err(e) => return fail(e),
    };

    if !reg_type.is_null() {
        unsafe { *reg_type = REG_SZ };
    }
    let buf: &mut [u8] = if buffer.is_null() {
        &mut []
    } else {
        unsafe { std::slice::from_raw_parts_mut(buffer, size as usize) }
    };
    let result = fill_record(buf, 0, interface.description.as_bytes());
    if let (Ok(len) | Err(SetupError::InsufficientBuffer { required: len }), false) =
        (result, required.is_null())
    {
        unsafe { *required = len as u32 };
    }
    match result {
        Ok(_) => 1,
        Err(e) => fail(e),
    }
}

unsafe extern "system" fn destroy_info_list(set: isize) -> i32 {
    if let Some(registry) = ours(set) {
        registry.close(set as usize);
        return 1;
    }
    match unsafe { ORIG_DESTROY.function::<DestroyFn>() } {
        Some(real) => unsafe { real(set) },
        None => proc_not_found(),
    }
}
