use std::sync::Mutex;
use std::sync::PoisonError;

/// Panel inputs sampled for each interrupt IN packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PanelInput {
    pub buttons: u32,
    pub turntables: [u8; 2],
    pub sliders: [u8; 5],
}

/// Source of panel inputs and sink for lamp output.
pub trait IoBackend: Send + Sync {
    fn poll(&self) -> PanelInput;

    fn set_lamps(&self, _lamps: u32) {}
}

/// Nothing pressed, lamps ignored.
#[derive(Debug, Default)]
pub struct IdleIo;

impl IoBackend for IdleIo {
    fn poll(&self) -> PanelInput {
        PanelInput::default()
    }
}

/// Fixed inputs set from outside; remembers the last lamp state.
#[derive(Debug, Default)]
pub struct LatchedIo {
    input: Mutex<PanelInput>,
    lamps: Mutex<u32>,
}

impl LatchedIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&self, input: PanelInput) {
        *self.input.lock().unwrap_or_else(PoisonError::into_inner) = input;
    }

    pub fn lamps(&self) -> u32 {
        *self.lamps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IoBackend for LatchedIo {
    fn poll(&self) -> PanelInput {
        *self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_lamps(&self, lamps: u32) {
        *self.lamps.lock().unwrap_or_else(PoisonError::into_inner) = lamps;
    }
}
