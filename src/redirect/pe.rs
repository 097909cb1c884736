use super::{ImportTable, RedirectError};
use std::marker::PhantomData;
use std::ptr::NonNull;
use tracing::trace;

const DOS_MAGIC: u16 = 0x5A4D;
const NT_SIGNATURE: u32 = 0x0000_4550;
const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;
const IMPORT_DESCRIPTOR_SIZE: usize = 20;

// Walk limits for images without a known length.
const MAX_DESCRIPTORS: usize = 4096;
const MAX_THUNKS: usize = 16384;
const MAX_NAME_LEN: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Layout {
    thunk_width: usize,
    import_rva: usize,
}

/// A mapped PE image whose import address table can be rewritten.
///
/// Either a live module in this process (`from_module_base`) or an image
/// held in a byte buffer (`from_bytes`); the latter is bounds checked.
pub struct PeImage<'a> {
    base: NonNull<u8>,
    limit: Option<usize>,
    _image: PhantomData<&'a mut [u8]>,
}

// The image is only touched while the owning Redirector is borrowed mutably.
unsafe impl Send for PeImage<'_> {}

impl PeImage<'static> {
    /// # Safety
    /// `base` must be the load address of a PE module mapped in this process
    /// that stays loaded for the rest of the process lifetime.
    pub unsafe fn from_module_base(base: *mut u8) -> Result<Self, RedirectError> {
        let base = NonNull::new(base).ok_or(RedirectError::InvalidImage("null module base"))?;
        let image = Self {
            base,
            limit: None,
            _image: PhantomData,
        };
        image.layout()?;
        Ok(image)
    }
}

impl<'a> PeImage<'a> {
    pub fn from_bytes(bytes: &'a mut [u8]) -> Self {
        let limit = bytes.len();
        Self {
            base: NonNull::from(bytes).cast(),
            limit: Some(limit),
            _image: PhantomData,
        }
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), RedirectError> {
        let end = offset
            .checked_add(len)
            .ok_or(RedirectError::InvalidImage("offset overflow"))?;
        match self.limit {
            Some(limit) if end > limit => Err(RedirectError::InvalidImage("read past end of image")),
            _ => Ok(()),
        }
    }

    fn read<T: Copy>(&self, offset: usize) -> Result<T, RedirectError> {
        self.check(offset, std::mem::size_of::<T>())?;
        Ok(unsafe { self.base.as_ptr().add(offset).cast::<T>().read_unaligned() })
    }

    fn read_name(&self, offset: usize) -> Result<Vec<u8>, RedirectError> {
        let mut name = Vec::new();
        for i in 0..MAX_NAME_LEN {
            let byte: u8 = self.read(offset + i)?;
            if byte == 0 {
                return Ok(name);
            }
            name.push(byte);
        }
        Err(RedirectError::InvalidImage("unterminated import name"))
    }

    fn read_thunk(&self, offset: usize, width: usize) -> Result<u64, RedirectError> {
        match width {
            4 => self.read::<u32>(offset).map(u64::from),
            _ => self.read::<u64>(offset),
        }
    }

    fn layout(&self) -> Result<Layout, RedirectError> {
        if self.read::<u16>(0)? != DOS_MAGIC {
            return Err(RedirectError::InvalidImage("missing MZ signature"));
        }

        let e_lfanew = self.read::<u32>(0x3C)? as usize;
        if e_lfanew > 0x1_0000 {
            return Err(RedirectError::InvalidImage("implausible e_lfanew"));
        }
        if self.read::<u32>(e_lfanew)? != NT_SIGNATURE {
            return Err(RedirectError::InvalidImage("missing PE signature"));
        }

        let optional = e_lfanew + 24;
        let (thunk_width, rva_count_offset, import_dir_offset) = match self.read::<u16>(optional)? {
            PE32_MAGIC => (4, optional + 92, optional + 104),
            PE32_PLUS_MAGIC => (8, optional + 108, optional + 120),
            _ => return Err(RedirectError::InvalidImage("unknown optional header magic")),
        };

        if self.read::<u32>(rva_count_offset)? < 2 {
            return Err(RedirectError::InvalidImage("image has no import directory entry"));
        }

        Ok(Layout {
            thunk_width,
            import_rva: self.read::<u32>(import_dir_offset)? as usize,
        })
    }

    /// Locate the IAT slot for `module!symbol`, returned as an image offset.
    pub fn find_import_slot(&self, module: &str, symbol: &str) -> Result<usize, RedirectError> {
        let layout = self.layout()?;
        if layout.import_rva == 0 {
            return Err(RedirectError::ModuleNotImported {
                module: module.to_string(),
            });
        }

        let ordinal_flag = 1u64 << (layout.thunk_width * 8 - 1);
        let mut module_seen = false;

        for index in 0..MAX_DESCRIPTORS {
            let descriptor = layout.import_rva + index * IMPORT_DESCRIPTOR_SIZE;
            let original_first_thunk = self.read::<u32>(descriptor)? as usize;
            let name_rva = self.read::<u32>(descriptor + 12)? as usize;
            let first_thunk = self.read::<u32>(descriptor + 16)? as usize;

            if original_first_thunk == 0 && name_rva == 0 && first_thunk == 0 {
                break;
            }
            if name_rva == 0 {
                continue;
            }

            let dll_name = self.read_name(name_rva)?;
            if !dll_name.eq_ignore_ascii_case(module.as_bytes()) {
                continue;
            }
            module_seen = true;

            // Bound images only keep names in the lookup table.
            let lookup = if original_first_thunk != 0 {
                original_first_thunk
            } else {
                first_thunk
            };

            for thunk in 0..MAX_THUNKS {
                let entry = self.read_thunk(lookup + thunk * layout.thunk_width, layout.thunk_width)?;
                if entry == 0 {
                    break;
                }
                if entry & ordinal_flag != 0 {
                    continue;
                }

                let hint_name = (entry & 0x7FFF_FFFF) as usize;
                if self.read_name(hint_name + 2)? == symbol.as_bytes() {
                    let slot = first_thunk + thunk * layout.thunk_width;
                    trace!("Import slot for {}!{} at offset {:#x}", module, symbol, slot);
                    return Ok(slot);
                }
            }
        }

        if module_seen {
            Err(RedirectError::SymbolNotFound {
                module: module.to_string(),
                symbol: symbol.to_string(),
            })
        } else {
            Err(RedirectError::ModuleNotImported {
                module: module.to_string(),
            })
        }
    }

    /// Current pointer stored in the slot at `offset`.
    pub fn read_slot(&self, offset: usize) -> Result<usize, RedirectError> {
        let width = self.layout()?.thunk_width;
        usize::try_from(self.read_thunk(offset, width)?)
            .map_err(|_| RedirectError::InvalidImage("slot value exceeds pointer width"))
    }

    fn write_slot(&mut self, offset: usize, value: usize, symbol: &str) -> Result<(), RedirectError> {
        let width = self.layout()?.thunk_width;
        self.check(offset, width)?;

        let ptr = unsafe { self.base.as_ptr().add(offset) };
        let write = || unsafe {
            match width {
                4 => ptr.cast::<u32>().write_unaligned(value as u32),
                _ => ptr.cast::<u64>().write_unaligned(value as u64),
            }
        };

        if width == 4 && u32::try_from(value).is_err() {
            return Err(RedirectError::PointerWidth {
                symbol: symbol.to_string(),
            });
        }

        if self.limit.is_none() {
            with_writable(ptr, width, write)
        } else {
            write();
            Ok(())
        }
    }
}

impl ImportTable for PeImage<'_> {
    fn swap(&mut self, module: &str, symbol: &str, replacement: usize) -> Result<usize, RedirectError> {
        let slot = self.find_import_slot(module, symbol)?;
        let original = self.read_slot(slot)?;
        self.write_slot(slot, replacement, symbol)?;
        Ok(original)
    }
}

#[cfg(windows)]
fn with_writable(ptr: *mut u8, len: usize, write: impl FnOnce()) -> Result<(), RedirectError> {
    use windows::Win32::System::Memory::{PAGE_PROTECTION_FLAGS, PAGE_READWRITE, VirtualProtect};

    let mut previous = PAGE_PROTECTION_FLAGS(0);
    unsafe { VirtualProtect(ptr as *const _, len, PAGE_READWRITE, &mut previous) }.map_err(|e| {
        RedirectError::Protect {
            addr: ptr as usize,
            reason: e.to_string(),
        }
    })?;

    write();

    let mut ignored = PAGE_PROTECTION_FLAGS(0);
    let _ = unsafe { VirtualProtect(ptr as *const _, len, previous, &mut ignored) };
    Ok(())
}

#[cfg(not(windows))]
fn with_writable(ptr: *mut u8, len: usize, write: impl FnOnce()) -> Result<(), RedirectError> {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let start = (ptr as usize) & !(page - 1);
    let span = (ptr as usize + len) - start;

    let rc = unsafe {
        libc::mprotect(
            start as *mut libc::c_void,
            span,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        return Err(RedirectError::Protect {
            addr: ptr as usize,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }

    write();
    Ok(())
}
