use super::{ImportTable, RedirectError};
use std::ffi::CString;
use tracing::warn;

/// Symbol table of an ELF process seen from a preloaded library.
///
/// There is no import slot to overwrite: the preloaded library interposes
/// the symbol by exporting it, and the dynamic linker binds every later
/// reference to that export. "Swapping" therefore resolves the next
/// definition in lookup order (the real libc function) and verifies that
/// the interposition actually took effect.
#[derive(Debug, Default)]
pub struct NextSymbolTable;

impl NextSymbolTable {
    pub fn new() -> Self {
        Self
    }

    fn lookup(handle: *mut libc::c_void, symbol: &str) -> Option<usize> {
        let name = CString::new(symbol).ok()?;
        let ptr = unsafe { libc::dlsym(handle, name.as_ptr()) };
        if ptr.is_null() { None } else { Some(ptr as usize) }
    }
}

impl ImportTable for NextSymbolTable {
    fn swap(&mut self, module: &str, symbol: &str, replacement: usize) -> Result<usize, RedirectError> {
        let original =
            Self::lookup(libc::RTLD_NEXT, symbol).ok_or_else(|| RedirectError::SymbolNotFound {
                module: module.to_string(),
                symbol: symbol.to_string(),
            })?;

        // Restoring the original on uninstall is a no-op here.
        if original == replacement {
            return Ok(original);
        }

        match Self::lookup(libc::RTLD_DEFAULT, symbol) {
            Some(bound) if bound == replacement => {}
            Some(bound) => warn!(
                "{} resolves to {:#x}, not our replacement {:#x}; is the library preloaded?",
                symbol, bound, replacement
            ),
            None => {}
        }

        Ok(original)
    }
}
