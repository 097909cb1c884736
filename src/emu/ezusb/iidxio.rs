//! Panel I/O through an `iidxio` shared library.
//!
//! Lamp word layout, as carried by interrupt OUT packets:
//! bits 0-15 deck lights, 16-19 panel lights, 20 top neons, 24-31 top
//! lamps. Inputs are packed into [`PanelInput::buttons`] as keys (bits
//! 0-15), panel buttons (16-23) and system buttons (24-31).

use super::io::{IoBackend, PanelInput};
use crate::backend::{self, ThreadCreate, ThreadDestroy, ThreadJoin};
use libloading::Library;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

type IidxIoInit = unsafe extern "C" fn(ThreadCreate, ThreadJoin, ThreadDestroy) -> bool;
type IidxIoFini = unsafe extern "C" fn();
type SetU16 = unsafe extern "C" fn(u16);
type SetU8 = unsafe extern "C" fn(u8);
type SetBool = unsafe extern "C" fn(bool);
type Transfer = unsafe extern "C" fn() -> bool;
type GetIndexed = unsafe extern "C" fn(u8) -> u8;
type GetU8 = unsafe extern "C" fn() -> u8;
type GetU16 = unsafe extern "C" fn() -> u16;

const TOP_NEONS: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum PanelIoError {
    #[error("failed to load iidxio library: {0}")]
    Load(#[from] libloading::Error),

    #[error("iidx_io_init reported failure")]
    InitFailed,
}

/// Lamp word split into the library's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LampOutputs {
    pub deck: u16,
    pub panel: u8,
    pub top_lamps: u8,
    pub top_neons: bool,
}

impl LampOutputs {
    pub fn from_word(lamps: u32) -> Self {
        Self {
            deck: lamps as u16,
            panel: ((lamps >> 16) & 0x0F) as u8,
            top_lamps: (lamps >> 24) as u8,
            top_neons: lamps & TOP_NEONS != 0,
        }
    }
}

pub fn pack_buttons(keys: u16, panel: u8, sys: u8) -> u32 {
    keys as u32 | (panel as u32) << 16 | (sys as u32) << 24
}

struct Exports {
    fini: IidxIoFini,
    set_deck_lights: SetU16,
    set_panel_lights: SetU8,
    set_top_lamps: SetU8,
    set_top_neons: SetBool,
    send: Transfer,
    recv: Transfer,
    get_turntable: GetIndexed,
    get_slider: GetIndexed,
    get_sys: GetU8,
    get_panel: GetU8,
    get_keys: GetU16,
}

/// Panel backend driven by an `iidxio` library. Calls into the library are
/// serialized.
pub struct IidxIoLibrary {
    exports: Mutex<Exports>,
    // Must outlive the function pointers above.
    _library: Library,
}

impl IidxIoLibrary {
    pub fn load(path: &Path) -> Result<Self, PanelIoError> {
        info!("Loading iidxio library {}", path.display());
        let library = unsafe { Library::new(path)? };

        let init = unsafe { *library.get::<IidxIoInit>(b"iidx_io_init\0")? };
        let exports = unsafe {
            Exports {
                fini: *library.get::<IidxIoFini>(b"iidx_io_fini\0")?,
                set_deck_lights: *library.get::<SetU16>(b"iidx_io_ep1_set_deck_lights\0")?,
                set_panel_lights: *library.get::<SetU8>(b"iidx_io_ep1_set_panel_lights\0")?,
                set_top_lamps: *library.get::<SetU8>(b"iidx_io_ep1_set_top_lamps\0")?,
                set_top_neons: *library.get::<SetBool>(b"iidx_io_ep1_set_top_neons\0")?,
                send: *library.get::<Transfer>(b"iidx_io_ep1_send\0")?,
                recv: *library.get::<Transfer>(b"iidx_io_ep2_recv\0")?,
                get_turntable: *library.get::<GetIndexed>(b"iidx_io_ep2_get_turntable\0")?,
                get_slider: *library.get::<GetIndexed>(b"iidx_io_ep2_get_slider\0")?,
                get_sys: *library.get::<GetU8>(b"iidx_io_ep2_get_sys\0")?,
                get_panel: *library.get::<GetU8>(b"iidx_io_ep2_get_panel\0")?,
                get_keys: *library.get::<GetU16>(b"iidx_io_ep2_get_keys\0")?,
            }
        };

        backend::set_loggers(&library, "iidx_io_set_loggers");
        if !unsafe { init(backend::thread_create, backend::thread_join, backend::thread_destroy) } {
            return Err(PanelIoError::InitFailed);
        }

        Ok(Self {
            exports: Mutex::new(exports),
            _library: library,
        })
    }
}

impl IoBackend for IidxIoLibrary {
    fn poll(&self) -> PanelInput {
        let io = self.exports.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe {
            if !(io.recv)() {
                debug!("iidxio: input transfer failed");
                return PanelInput::default();
            }

            let mut input = PanelInput {
                buttons: pack_buttons((io.get_keys)(), (io.get_panel)(), (io.get_sys)()),
                ..PanelInput::default()
            };
            for (i, tt) in input.turntables.iter_mut().enumerate() {
                *tt = (io.get_turntable)(i as u8);
            }
            for (i, slider) in input.sliders.iter_mut().enumerate() {
                *slider = (io.get_slider)(i as u8);
            }
            input
        }
    }

    fn set_lamps(&self, lamps: u32) {
        let out = LampOutputs::from_word(lamps);
        let io = self.exports.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe {
            (io.set_deck_lights)(out.deck);
            (io.set_panel_lights)(out.panel);
            (io.set_top_lamps)(out.top_lamps);
            (io.set_top_neons)(out.top_neons);
            if !(io.send)() {
                debug!("iidxio: lamp transfer failed");
            }
        }
    }
}

impl Drop for IidxIoLibrary {
    fn drop(&mut self) {
        let io = self.exports.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe { (io.fini)() };
    }
}
