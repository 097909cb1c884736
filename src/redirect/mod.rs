//! Import redirection.
//!
//! A [`Redirector`] owns the process-wide table of installed redirections.
//! It talks to the loaded image through the [`ImportTable`] trait, so the
//! bookkeeping (idempotence, original pointer capture, uninstall) can be
//! exercised against an in-memory table in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(unix)]
mod dlsym;
mod pe;

#[cfg(unix)]
pub use dlsym::NextSymbolTable;
pub use pe::PeImage;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RedirectError {
    #[error("module {module} is not imported by the target image")]
    ModuleNotImported { module: String },

    #[error("symbol {module}!{symbol} could not be resolved")]
    SymbolNotFound { module: String, symbol: String },

    #[error("{module}!{symbol} is already redirected to a different replacement")]
    Conflict { module: String, symbol: String },

    #[error("{module}!{symbol} is not redirected")]
    NotInstalled { module: String, symbol: String },

    #[error("replacement for {symbol} does not fit the image's pointer width")]
    PointerWidth { symbol: String },

    #[error("malformed image: {0}")]
    InvalidImage(&'static str),

    #[error("failed to change page protection at {addr:#x}: {reason}")]
    Protect { addr: usize, reason: String },
}

/// Storage for the original function pointer of one redirected symbol.
///
/// Populated exactly once, before the import slot is overwritten. Replacement
/// functions read it to call through to the real implementation.
pub struct OriginalSlot {
    ptr: AtomicUsize,
}

impl OriginalSlot {
    pub const fn new() -> Self {
        Self {
            ptr: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> Option<usize> {
        match self.ptr.load(Ordering::Acquire) {
            0 => None,
            ptr => Some(ptr),
        }
    }

    /// Reinterpret the stored pointer as a function pointer of type `F`.
    ///
    /// # Safety
    /// `F` must be a function pointer type whose signature and calling
    /// convention match the symbol this slot was filled from.
    pub unsafe fn function<F: Copy>(&self) -> Option<F> {
        assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
        let ptr = self.get()?;
        Some(unsafe { std::mem::transmute_copy::<usize, F>(&ptr) })
    }

    /// Returns false if the slot already held a different pointer.
    fn publish(&self, original: usize) -> bool {
        match self
            .ptr
            .compare_exchange(0, original, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(existing) => existing == original,
        }
    }
}

impl Default for OriginalSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// One symbol to redirect: the replacement and where to keep the original.
#[derive(Clone, Copy)]
pub struct HookSymbol {
    pub name: &'static str,
    pub patch: usize,
    pub link: Option<&'static OriginalSlot>,
}

impl HookSymbol {
    pub const fn new(name: &'static str, patch: usize, link: &'static OriginalSlot) -> Self {
        Self {
            name,
            patch,
            link: Some(link),
        }
    }
}

/// Access to the import slots of one loaded image.
pub trait ImportTable {
    /// Store `replacement` in the slot for `module!symbol` and return the
    /// pointer it held before.
    fn swap(&mut self, module: &str, symbol: &str, replacement: usize)
    -> Result<usize, RedirectError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirection {
    pub original: usize,
    pub replacement: usize,
}

/// Registry of installed redirections, keyed by (module, symbol).
///
/// Module names compare case-insensitively, the way the Windows loader
/// matches them.
pub struct Redirector<T: ImportTable> {
    table: T,
    entries: HashMap<(String, String), Redirection>,
}

impl<T: ImportTable> Redirector<T> {
    pub fn new(table: T) -> Self {
        Self {
            table,
            entries: HashMap::new(),
        }
    }

    fn key(module: &str, symbol: &str) -> (String, String) {
        (module.to_ascii_lowercase(), symbol.to_string())
    }

    /// Redirect every symbol in `symbols` imported from `module`.
    ///
    /// Re-applying an identical redirection is a no-op. Returns how many
    /// import slots were newly written.
    pub fn install(&mut self, module: &str, symbols: &[HookSymbol]) -> Result<usize, RedirectError> {
        let mut installed = 0;

        for sym in symbols {
            let key = Self::key(module, sym.name);

            if let Some(existing) = self.entries.get(&key) {
                if existing.replacement == sym.patch {
                    debug!("{}!{} already redirected", module, sym.name);
                    continue;
                }
                return Err(RedirectError::Conflict {
                    module: module.to_string(),
                    symbol: sym.name.to_string(),
                });
            }

            let original = self.table.swap(module, sym.name, sym.patch)?;

            if let Some(link) = sym.link {
                if !link.publish(original) {
                    warn!(
                        "{}!{}: original slot already bound to another address, keeping it",
                        module, sym.name
                    );
                }
            }

            debug!(
                "Redirected {}!{}: {:#x} -> {:#x}",
                module, sym.name, original, sym.patch
            );

            self.entries.insert(
                key,
                Redirection {
                    original,
                    replacement: sym.patch,
                },
            );
            installed += 1;
        }

        if installed > 0 {
            info!("Installed {} redirection(s) on {}", installed, module);
        }

        Ok(installed)
    }

    /// Restore the original pointer of one redirected symbol.
    pub fn uninstall(&mut self, module: &str, symbol: &str) -> Result<(), RedirectError> {
        let key = Self::key(module, symbol);
        let Some(entry) = self.entries.get(&key).copied() else {
            return Err(RedirectError::NotInstalled {
                module: module.to_string(),
                symbol: symbol.to_string(),
            });
        };

        self.table.swap(module, symbol, entry.original)?;
        self.entries.remove(&key);
        debug!("Restored {}!{} to {:#x}", module, symbol, entry.original);
        Ok(())
    }

    pub fn get(&self, module: &str, symbol: &str) -> Option<Redirection> {
        self.entries.get(&Self::key(module, symbol)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn table(&self) -> &T {
        &self.table
    }
}
