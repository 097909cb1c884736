//! Where card ids come from: fixed ids from the config file, or a
//! dynamically loaded `eamio` library driving real or virtual readers.

use crate::backend::{self, ThreadCreate, ThreadDestroy, ThreadJoin};
use libloading::Library;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

pub const CARD_ID_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum CardError {
    #[error("invalid card id {0:?}: expected 16 hex digits")]
    InvalidId(String),

    #[error("failed to load eamio library: {0}")]
    Load(#[from] libloading::Error),

    #[error("eam_io_init reported failure")]
    InitFailed,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CardId(pub [u8; CARD_ID_LEN]);

impl FromStr for CardId {
    type Err = CardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CardError::InvalidId(s.to_string());
        if s.len() != CARD_ID_LEN * 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let mut id = [0u8; CARD_ID_LEN];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(id))
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CardId({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardType {
    #[default]
    Iso15693,
    Felica,
}

impl CardType {
    pub fn wire(self) -> u8 {
        match self {
            CardType::Iso15693 => 0x00,
            CardType::Felica => 0x01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Card {
    pub id: CardId,
    pub kind: CardType,
}

/// Something that can tell whether a card sits in a reader slot.
pub trait CardSource: Send {
    fn name(&self) -> &'static str;

    /// The card currently presented to `slot`, if any.
    fn poll(&mut self, slot: u8) -> Option<Card>;

    fn eject(&mut self, _slot: u8) {}
}

/// Fixed card ids, one optional card per slot, always inserted.
pub struct StaticCards {
    cards: Vec<Option<Card>>,
}

impl StaticCards {
    pub fn new(cards: Vec<Option<Card>>) -> Self {
        Self { cards }
    }
}

impl CardSource for StaticCards {
    fn name(&self) -> &'static str {
        "static"
    }

    fn poll(&mut self, slot: u8) -> Option<Card> {
        self.cards.get(slot as usize).copied().flatten()
    }
}

type EamIoInit = unsafe extern "C" fn(ThreadCreate, ThreadJoin, ThreadDestroy) -> bool;
type EamIoPoll = unsafe extern "C" fn(u8) -> bool;
type EamIoSensorState = unsafe extern "C" fn(u8) -> u8;
type EamIoReadCard = unsafe extern "C" fn(u8, *mut u8, u8) -> u8;
type EamIoFini = unsafe extern "C" fn();

const SENSOR_FRONT: u8 = 1 << 0;
const SENSOR_BACK: u8 = 1 << 1;

/// Card source backed by an `eamio` shared library.
pub struct EamIoLibrary {
    poll: EamIoPoll,
    sensor_state: EamIoSensorState,
    read_card: EamIoReadCard,
    fini: EamIoFini,
    // Must outlive the function pointers above.
    _library: Library,
}

impl EamIoLibrary {
    pub fn load(path: &Path) -> Result<Self, CardError> {
        info!("Loading eamio library {}", path.display());
        let library = unsafe { Library::new(path)? };

        let (init, poll, sensor_state, read_card, fini) = unsafe {
            (
                *library.get::<EamIoInit>(b"eam_io_init\0")?,
                *library.get::<EamIoPoll>(b"eam_io_poll\0")?,
                *library.get::<EamIoSensorState>(b"eam_io_get_sensor_state\0")?,
                *library.get::<EamIoReadCard>(b"eam_io_read_card\0")?,
                *library.get::<EamIoFini>(b"eam_io_fini\0")?,
            )
        };

        backend::set_loggers(&library, "eam_io_set_loggers");
        if !unsafe { init(backend::thread_create, backend::thread_join, backend::thread_destroy) } {
            return Err(CardError::InitFailed);
        }

        Ok(Self {
            poll,
            sensor_state,
            read_card,
            fini,
            _library: library,
        })
    }
}

impl CardSource for EamIoLibrary {
    fn name(&self) -> &'static str {
        "eamio"
    }

    fn poll(&mut self, slot: u8) -> Option<Card> {
        if !unsafe { (self.poll)(slot) } {
            debug!("eamio: poll failed for unit {}", slot);
            return None;
        }

        let sensors = unsafe { (self.sensor_state)(slot) };
        if sensors & (SENSOR_FRONT | SENSOR_BACK) == 0 {
            return None;
        }

        let mut id = [0u8; CARD_ID_LEN];
        let kind = unsafe { (self.read_card)(slot, id.as_mut_ptr(), CARD_ID_LEN as u8) };
        let kind = if kind == CardType::Felica.wire() {
            CardType::Felica
        } else {
            CardType::Iso15693
        };

        Some(Card {
            id: CardId(id),
            kind,
        })
    }
}

impl Drop for EamIoLibrary {
    fn drop(&mut self) {
        unsafe { (self.fini)() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_card_ids() {
        let id: CardId = "E004010000000001".parse().unwrap();
        assert_eq!(id.0[0], 0xE0);
        assert_eq!(id.to_string(), "E004010000000001");
        assert!("E00401000000000".parse::<CardId>().is_err());
        assert!("E00401000000000Z".parse::<CardId>().is_err());
        assert!("+004010000000001".parse::<CardId>().is_err());
        assert!("E0+4010000000001".parse::<CardId>().is_err());
    }

    #[test]
    fn static_cards_per_slot() {
        let card = Card {
            id: "0123456789ABCDEF".parse().unwrap(),
            kind: CardType::Felica,
        };
        let mut source = StaticCards::new(vec![None, Some(card)]);
        assert_eq!(source.poll(0), None);
        assert_eq!(source.poll(1), Some(card));
        assert_eq!(source.poll(7), None);
    }

    #[test]
    fn missing_library_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let result = EamIoLibrary::load(&dir.path().join("eamio-missing.so"));
        assert!(matches!(result, Err(CardError::Load(_))));
    }
}
