//! Device interface enumeration for emulated devices.
//!
//! Hosts locate USB hardware by enumerating the device interfaces of a class
//! GUID and opening the returned path. An [`InterfaceRegistry`] answers those
//! enumerations for the interfaces the emulators expose, so the path a host
//! discovers is one the dispatcher claims.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

const ERROR_INVALID_HANDLE: u32 = 6;
const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
const ERROR_NO_MORE_ITEMS: u32 = 259;

/// A Windows GUID, laid out like the OS structure.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

/// Interface class registered by the EZ-USB driver.
pub const EZUSB_INTERFACE_CLASS: Guid = Guid {
    data1: 0xAE18_AA60,
    data2: 0x7F6A,
    data3: 0x11D4,
    data4: [0x97, 0xDD, 0x00, 0x01, 0x02, 0x29, 0xB9, 0x59],
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid GUID {0:?}")]
pub struct ParseGuidError(String);

impl FromStr for Guid {
    type Err = ParseGuidError;

    /// `AE18AA60-7F6A-11D4-97DD-00010229B959`, braces optional.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseGuidError(s.to_string());
        let inner = s
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(s);

        let groups: Vec<&str> = inner.split('-').collect();
        let lengths = [8, 4, 4, 4, 12];
        if groups.len() != lengths.len()
            || groups
                .iter()
                .zip(lengths)
                .any(|(g, len)| g.len() != len || !g.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            return Err(invalid());
        }

        let hex = |g: &str| u64::from_str_radix(g, 16).map_err(|_| invalid());
        let tail = format!("{}{}", groups[3], groups[4]);
        let mut data4 = [0u8; 8];
        for (i, byte) in data4.iter_mut().enumerate() {
            *byte = hex(&tail[i * 2..i * 2 + 2])? as u8;
        }

        Ok(Self {
            data1: hex(groups[0])? as u32,
            data2: hex(groups[1])? as u16,
            data3: hex(groups[2])? as u16,
            data4,
        })
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}

/// One device interface a host can discover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInterface {
    pub class: Guid,
    pub description: String,
    pub path: String,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SetupError {
    #[error("device information set is not one of ours")]
    InvalidHandle,

    #[error("no more device interfaces")]
    NoMoreItems,

    #[error("buffer too small, {required} bytes required")]
    InsufficientBuffer { required: usize },
}

impl SetupError {
    pub fn to_win32(self) -> u32 {
        match self {
            SetupError::InvalidHandle => ERROR_INVALID_HANDLE,
            SetupError::NoMoreItems => ERROR_NO_MORE_ITEMS,
            SetupError::InsufficientBuffer { .. } => ERROR_INSUFFICIENT_BUFFER,
        }
    }
}

/// Backing allocation of an emulated device information set. Its address
/// is the handle value, so it never collides with a live OS set.
struct InfoSet {
    class: Option<Guid>,
}

/// Emulated device interfaces and the information sets opened over them.
pub struct InterfaceRegistry {
    interfaces: Vec<DeviceInterface>,
    sets: Mutex<HashMap<usize, Box<InfoSet>>>,
}

impl InterfaceRegistry {
    pub fn new(interfaces: Vec<DeviceInterface>) -> Self {
        for interface in &interfaces {
            debug!(
                "setupapi: exposing {} ({}) as {}",
                interface.class, interface.description, interface.path
            );
        }
        Self {
            interfaces,
            sets: Mutex::new(HashMap::new()),
        }
    }

    fn sets(&self) -> MutexGuard<'_, HashMap<usize, Box<InfoSet>>> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn interfaces(&self) -> &[DeviceInterface] {
        &self.interfaces
    }

    /// Open an information set over `class`, or `None` when no emulated
    /// interface belongs to it and the OS should answer instead.
    pub fn open(&self, class: Option<&Guid>) -> Option<usize> {
        let class = class.copied();
        if !self
            .interfaces
            .iter()
            .any(|i| class.is_none_or(|c| c == i.class))
        {
            return None;
        }

        let set = Box::new(InfoSet { class });
        let handle = &*set as *const InfoSet as usize;
        self.sets().insert(handle, set);
        debug!("setupapi: opened set {:#x} for {:?}", handle, class);
        Some(handle)
    }

    pub fn owns(&self, set: usize) -> bool {
        self.sets().contains_key(&set)
    }

    /// The `index`th interface of `class` in `set`.
    pub fn member(&self, set: usize, class: &Guid, index: u32) -> Result<&DeviceInterface, SetupError> {
        let set_class = self
            .sets()
            .get(&set)
            .map(|s| s.class)
            .ok_or(SetupError::InvalidHandle)?;

        self.interfaces
            .iter()
            .filter(|i| i.class == *class && set_class.is_none_or(|c| c == i.class))
            .nth(index as usize)
            .ok_or(SetupError::NoMoreItems)
    }

    pub fn close(&self, set: usize) -> bool {
        let closed = self.sets().remove(&set).is_some();
        if closed {
            debug!("setupapi: closed set {:#x}", set);
        }
        closed
    }
}

/// Copy `units` plus a terminating zero into `buf` after a `header` of
/// `header_len` units, reporting the total size needed when it does not
/// fit. Used for the variable-length detail and property records.
pub fn fill_record<T: Copy + Default>(
    buf: &mut [T],
    header_len: usize,
    units: &[T],
) -> Result<usize, SetupError> {
    let required = header_len + units.len() + 1;
    if buf.len() < required {
        return Err(SetupError::InsufficientBuffer { required });
    }
    buf[header_len..header_len + units.len()].copy_from_slice(units);
    buf[header_len + units.len()] = T::default();
    Ok(required)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> DeviceInterface {
        DeviceInterface {
            class: EZUSB_INTERFACE_CLASS,
            description: "EZ-USB".into(),
            path: r"\\?\usb#vid_0547&pid_2750#devhook#{ae18aa60-7f6a-11d4-97dd-00010229b959}".into(),
        }
    }

    #[test]
    fn guid_text_form() {
        let guid: Guid = "{AE18AA60-7F6A-11D4-97DD-00010229B959}".parse().unwrap();
        assert_eq!(guid, EZUSB_INTERFACE_CLASS);
        assert_eq!(guid.to_string(), "{AE18AA60-7F6A-11D4-97DD-00010229B959}");
        assert_eq!(
            "ae18aa60-7f6a-11d4-97dd-00010229b959".parse::<Guid>(),
            Ok(EZUSB_INTERFACE_CLASS)
        );
        assert!("{AE18AA60-7F6A-11D4-97DD-00010229B95}".parse::<Guid>().is_err());
        assert!("{+E18AA60-7F6A-11D4-97DD-00010229B959}".parse::<Guid>().is_err());
    }

    #[test]
    fn enumerates_only_matching_class() {
        let registry = InterfaceRegistry::new(vec![bridge()]);
        let other: Guid = "{4D36E978-E325-11CE-BFC1-08002BE10318}".parse().unwrap();

        assert_eq!(registry.open(Some(&other)), None);

        let set = registry.open(Some(&EZUSB_INTERFACE_CLASS)).unwrap();
        assert!(registry.owns(set));
        assert_eq!(
            registry.member(set, &EZUSB_INTERFACE_CLASS, 0),
            Ok(&bridge())
        );
        assert_eq!(
            registry.member(set, &EZUSB_INTERFACE_CLASS, 1),
            Err(SetupError::NoMoreItems)
        );
        assert_eq!(
            registry.member(set, &other, 0),
            Err(SetupError::NoMoreItems)
        );
    }

    #[test]
    fn sets_are_distinct_and_close_once() {
        let registry = InterfaceRegistry::new(vec![bridge()]);
        let a = registry.open(None).unwrap();
        let b = registry.open(Some(&EZUSB_INTERFACE_CLASS)).unwrap();
        assert_ne!(a, b);

        assert!(registry.close(a));
        assert!(!registry.close(a));
        assert_eq!(
            registry.member(a, &EZUSB_INTERFACE_CLASS, 0),
            Err(SetupError::InvalidHandle)
        );
        assert!(registry.owns(b));
    }

    #[test]
    fn records_report_required_size() {
        let path: Vec<u16> = "abc".encode_utf16().collect();
        let mut small = [0u16; 4];
        assert_eq!(
            fill_record(&mut small, 2, &path),
            Err(SetupError::InsufficientBuffer { required: 6 })
        );

        let mut buf = [0xFFFFu16; 8];
        assert_eq!(fill_record(&mut buf, 2, &path), Ok(6));
        assert_eq!(&buf[2..6], &[b'a' as u16, b'b' as u16, b'c' as u16, 0]);
        assert_eq!(buf[6], 0xFFFF);
        assert_eq!(SetupError::NoMoreItems.to_win32(), 259);
    }
}
