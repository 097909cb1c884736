//! devhook - import redirection and virtual device emulation
//!
//! This library lets a hook library loaded into a host process take over
//! the process's device I/O: it redirects the OS entry points the host
//! imports, turns every intercepted call into an I/O request, and lets a
//! chain of virtual devices (USB bridge, serial card reader, settings
//! drives, chart files) answer the requests meant for hardware that is not
//! there.

mod backend;
pub mod bootstrap;
pub mod card;
pub mod config;
pub mod eamuse;
pub mod emu;
pub mod iohook;
pub mod redirect;
pub mod runtime;
pub mod security;
pub mod setupapi;

// Re-export commonly used types
pub use bootstrap::{InitGuard, InitOutcome, InitPhase};
pub use config::{Config, ConfigError};
pub use iohook::{
    DeviceDescriptor, Dispatcher, Handle, Handler, IoError, Irp, IrpOp, OpenParams, OsDevice,
    Routed,
};
pub use redirect::{HookSymbol, ImportTable, OriginalSlot, RedirectError, Redirector};
pub use runtime::Runtime;
pub use security::{SecurityToken, TokenError, TokenPhase};
pub use setupapi::{DeviceInterface, Guid, InterfaceRegistry};
