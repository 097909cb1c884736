use super::frame::Frame;
use crate::card::CardSource;
use tracing::{debug, info};

/// Command byte of a request frame.
pub mod cmd {
    pub const RESET: u8 = 0x00;
    pub const GET_VERSION: u8 = 0x01;
    pub const GET_STATUS: u8 = 0x10;
    pub const READ_CARD: u8 = 0x11;
    pub const EJECT: u8 = 0x12;
}

/// First payload byte of every reply.
pub mod status {
    pub const OK: u8 = 0x00;
    pub const NO_CARD: u8 = 0x02;
    pub const CHECKSUM: u8 = 0xF1;
    pub const UNKNOWN_COMMAND: u8 = 0xF2;
    pub const DISABLED: u8 = 0xF3;
    pub const BAD_SLOT: u8 = 0xF4;
}

pub const FIRMWARE_VERSION: &[u8] = b"ICCA\x01\x00";

/// Reader state shared by every link that talks to it. The frame address
/// selects the slot.
pub struct CardReader {
    enabled: Vec<bool>,
    ejected: Vec<bool>,
    source: Box<dyn CardSource>,
}

impl CardReader {
    pub fn new(enabled: Vec<bool>, source: Box<dyn CardSource>) -> Self {
        info!(
            "Card reader: {} slot(s), card source {}",
            enabled.len(),
            source.name()
        );
        Self {
            ejected: vec![false; enabled.len()],
            enabled,
            source,
        }
    }

    pub fn slots(&self) -> usize {
        self.enabled.len()
    }

    pub fn handle(&mut self, request: &Frame) -> Frame {
        let reply = |payload: Vec<u8>| Frame::new(request.addr, request.cmd, payload);
        let slot = request.addr as usize;

        match self.enabled.get(slot) {
            None => return reply(vec![status::BAD_SLOT]),
            Some(false) => return reply(vec![status::DISABLED]),
            Some(true) => {}
        }

        match request.cmd {
            cmd::RESET => {
                self.ejected[slot] = false;
                reply(vec![status::OK])
            }
            cmd::GET_VERSION => {
                let mut payload = vec![status::OK];
                payload.extend_from_slice(FIRMWARE_VERSION);
                reply(payload)
            }
            cmd::GET_STATUS => {
                let present = self.present(request.addr).is_some();
                reply(vec![status::OK, present as u8])
            }
            cmd::READ_CARD => match self.present(request.addr) {
                Some(card) => {
                    debug!("Card reader: slot {} read {}", slot, card.id);
                    let mut payload = vec![status::OK, card.kind.wire()];
                    payload.extend_from_slice(&card.id.0);
                    reply(payload)
                }
                None => reply(vec![status::NO_CARD]),
            },
            cmd::EJECT => {
                self.ejected[slot] = true;
                self.source.eject(request.addr);
                reply(vec![status::OK])
            }
            other => {
                debug!("Card reader: unknown command 0x{:02X}", other);
                reply(vec![status::UNKNOWN_COMMAND])
            }
        }
    }

    /// Reply to a request that failed frame validation.
    pub fn corrupt(&self, addr: u8, cmd: u8) -> Frame {
        Frame::new(addr, cmd, vec![status::CHECKSUM])
    }

    fn present(&mut self, slot: u8) -> Option<crate::card::Card> {
        if self.ejected[slot as usize] {
            return None;
        }
        self.source.poll(slot)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::card::{Card, CardType, StaticCards};

    pub(crate) fn reader() -> CardReader {
        let card = Card {
            id: "E004010000000001".parse().unwrap(),
            kind: CardType::Iso15693,
        };
        CardReader::new(
            vec![true, false],
            Box::new(StaticCards::new(vec![Some(card), Some(card)])),
        )
    }

    #[test]
    fn reads_card_in_enabled_slot() {
        let mut reader = reader();
        let reply = reader.handle(&Frame::new(0, cmd::READ_CARD, vec![]));
        assert_eq!(reply.payload[0], status::OK);
        assert_eq!(reply.payload[1], CardType::Iso15693.wire());
        assert_eq!(&reply.payload[2..], &[0xE0, 0x04, 0x01, 0, 0, 0, 0, 0x01]);
    }

    #[test]
    fn disabled_and_missing_slots() {
        let mut reader = reader();
        let reply = reader.handle(&Frame::new(1, cmd::READ_CARD, vec![]));
        assert_eq!(reply.payload, vec![status::DISABLED]);
        let reply = reader.handle(&Frame::new(5, cmd::GET_STATUS, vec![]));
        assert_eq!(reply.payload, vec![status::BAD_SLOT]);
    }

    #[test]
    fn eject_hides_card_until_reset() {
        let mut reader = reader();
        reader.handle(&Frame::new(0, cmd::EJECT, vec![]));
        let reply = reader.handle(&Frame::new(0, cmd::GET_STATUS, vec![]));
        assert_eq!(reply.payload, vec![status::OK, 0]);
        assert_eq!(
            reader.handle(&Frame::new(0, cmd::READ_CARD, vec![])).payload,
            vec![status::NO_CARD]
        );

        reader.handle(&Frame::new(0, cmd::RESET, vec![]));
        let reply = reader.handle(&Frame::new(0, cmd::GET_STATUS, vec![]));
        assert_eq!(reply.payload, vec![status::OK, 1]);
    }

    #[test]
    fn unknown_command() {
        let mut reader = reader();
        let reply = reader.handle(&Frame::new(0, 0x7E, vec![]));
        assert_eq!(reply.payload, vec![status::UNKNOWN_COMMAND]);
    }
}
