//! Virtual device emulators composed into the dispatch chain.

pub mod chart_patch;
pub mod ezusb;
pub mod serial;
pub mod settings;
