//! Card reader serial framing.
//!
//! ```text
//! [STX 0x02][addr][cmd][len][payload: len][sum][ETX 0x03]
//! ```
//! `sum` is the low byte of the sum of `addr`, `cmd`, `len` and the payload.

use thiserror::Error;
use tracing::trace;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// STX, addr, cmd, len.
pub const HEADER_LEN: usize = 4;
/// sum, ETX.
pub const TRAILER_LEN: usize = 2;
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds 255 bytes")]
    PayloadTooLong(usize),

    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },

    #[error("missing ETX, found 0x{0:02X}")]
    MissingEtx(u8),

    #[error("frame cut short after {received} of {expected} bytes")]
    Truncated { expected: usize, received: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub addr: u8,
    pub cmd: u8,
    pub payload: Vec<u8>,
}

pub fn checksum(addr: u8, cmd: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(addr.wrapping_add(cmd).wrapping_add(payload.len() as u8), |sum, b| {
            sum.wrapping_add(*b)
        })
}

impl Frame {
    pub fn new(addr: u8, cmd: u8, payload: Vec<u8>) -> Self {
        Self { addr, cmd, payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong(self.payload.len()));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len() + TRAILER_LEN);
        buf.push(STX);
        buf.push(self.addr);
        buf.push(self.cmd);
        buf.push(self.payload.len() as u8);
        buf.extend_from_slice(&self.payload);
        buf.push(checksum(self.addr, self.cmd, &self.payload));
        buf.push(ETX);
        Ok(buf)
    }
}

/// One decoded unit of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Frame(Frame),
    /// A frame-shaped run of bytes that failed validation. The link
    /// survives; the reader answers it with an error status.
    Corrupt { addr: u8, cmd: u8, error: FrameError },
}

/// Incremental decoder; bytes may arrive split at any position.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Append `data` and return every event that is now complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<FrameEvent> {
        self.buf.extend_from_slice(data);

        let mut events = Vec::new();
        while let Some(event) = self.next_event() {
            events.push(event);
        }
        events
    }

    fn next_event(&mut self) -> Option<FrameEvent> {
        // Resync: anything before STX is line noise.
        match self.buf.iter().position(|b| *b == STX) {
            Some(0) => {}
            Some(skip) => {
                trace!("serial: discarding {} bytes before STX", skip);
                self.buf.drain(..skip);
            }
            None => {
                if !self.buf.is_empty() {
                    trace!("serial: discarding {} bytes without STX", self.buf.len());
                }
                self.buf.clear();
                return None;
            }
        }

        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let (addr, cmd, len) = (self.buf[1], self.buf[2], self.buf[3] as usize);
        let total = HEADER_LEN + len + TRAILER_LEN;
        if self.buf.len() < total {
            // A stray STX or a damaged length must not hold back a complete
            // request queued behind it.
            let resync = self.next_valid_frame(1..self.buf.len())?;
            trace!("serial: abandoning partial frame, resyncing at {}", resync);
            self.buf.drain(..resync);
            return Some(FrameEvent::Corrupt {
                addr,
                cmd,
                error: FrameError::Truncated {
                    expected: total,
                    received: resync,
                },
            });
        }

        let etx = self.buf[total - 1];
        if etx != ETX {
            // Not a real frame start; retry from the next byte.
            self.buf.drain(..1);
            return Some(FrameEvent::Corrupt {
                addr,
                cmd,
                error: FrameError::MissingEtx(etx),
            });
        }

        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        let actual = self.buf[total - 2];
        let expected = checksum(addr, cmd, &payload);
        if actual != expected {
            let consumed = self.next_valid_frame(1..total).unwrap_or(total);
            self.buf.drain(..consumed);
            return Some(FrameEvent::Corrupt {
                addr,
                cmd,
                error: FrameError::Checksum { expected, actual },
            });
        }

        self.buf.drain(..total);
        Some(FrameEvent::Frame(Frame { addr, cmd, payload }))
    }

    /// First offset in `range` where a complete frame with a good checksum
    /// and ETX starts.
    fn next_valid_frame(&self, range: std::ops::Range<usize>) -> Option<usize> {
        range
            .filter(|at| self.buf[*at] == STX)
            .find(|at| is_valid_frame(&self.buf[*at..]))
    }
}

fn is_valid_frame(buf: &[u8]) -> bool {
    let Some(&len) = buf.get(HEADER_LEN - 1) else {
        return false;
    };
    let total = HEADER_LEN + len as usize + TRAILER_LEN;
    let Some(frame) = buf.get(..total) else {
        return false;
    };
    frame[0] == STX
        && frame[total - 1] == ETX
        && frame[total - 2] == checksum(frame[1], frame[2], &frame[HEADER_LEN..total - TRAILER_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_frame() {
        let bytes = Frame::new(0x00, 0x11, vec![0x01]).encode().unwrap();
        assert_eq!(bytes, vec![STX, 0x00, 0x11, 0x01, 0x01, 0x13, ETX]);
    }

    #[test]
    fn decodes_split_frame() {
        let bytes = Frame::new(0x01, 0x10, vec![0xAA, 0xBB]).encode().unwrap();
        let mut decoder = FrameDecoder::new();

        assert!(decoder.push(&bytes[..3]).is_empty());
        assert_eq!(decoder.buffered(), 3);
        let events = decoder.push(&bytes[3..]);
        assert_eq!(
            events,
            vec![FrameEvent::Frame(Frame::new(0x01, 0x10, vec![0xAA, 0xBB]))]
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn skips_noise_between_frames() {
        let mut stream = vec![0xFF, 0x00];
        stream.extend(Frame::new(0, 0x01, vec![]).encode().unwrap());
        stream.push(0x55);
        stream.extend(Frame::new(0, 0x10, vec![]).encode().unwrap());

        let events = FrameDecoder::new().push(&stream);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn bad_checksum_is_reported_and_link_continues() {
        let mut bad = Frame::new(0x00, 0x11, vec![0x00]).encode().unwrap();
        bad[5] ^= 0xFF;
        let good = Frame::new(0x00, 0x01, vec![]).encode().unwrap();

        let mut decoder = FrameDecoder::new();
        let mut events = decoder.push(&bad);
        events.extend(decoder.push(&good));

        assert!(matches!(
            events[0],
            FrameEvent::Corrupt {
                addr: 0x00,
                cmd: 0x11,
                error: FrameError::Checksum { .. }
            }
        ));
        assert_eq!(events[1], FrameEvent::Frame(Frame::new(0x00, 0x01, vec![])));
    }

    #[test]
    fn stray_stx_does_not_hold_back_the_next_frame() {
        let good = Frame::new(0x00, 0x10, vec![]).encode().unwrap();

        // Length byte promises 0xF0 payload bytes that never come.
        let mut stream = vec![STX, 0x00, 0x00, 0xF0];
        stream.extend_from_slice(&good);
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(&stream);
        assert_eq!(
            events,
            vec![
                FrameEvent::Corrupt {
                    addr: 0x00,
                    cmd: 0x00,
                    error: FrameError::Truncated {
                        expected: HEADER_LEN + 0xF0 + TRAILER_LEN,
                        received: 4
                    }
                },
                FrameEvent::Frame(Frame::new(0x00, 0x10, vec![])),
            ]
        );
        assert_eq!(decoder.buffered(), 0);

        // A lone STX right before a request, delivered in two writes.
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&[STX]).is_empty());
        let events = decoder.push(&good);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], FrameEvent::Corrupt { .. }));
        assert_eq!(events[1], FrameEvent::Frame(Frame::new(0x00, 0x10, vec![])));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn partial_frame_waits_while_nothing_valid_follows() {
        let bytes = Frame::new(0x00, 0x11, vec![0x02, 0x00, 0x00]).encode().unwrap();
        let mut decoder = FrameDecoder::new();

        // The payload contains STX-led bytes, but no complete frame.
        assert!(decoder.push(&bytes[..6]).is_empty());
        assert_eq!(
            decoder.push(&bytes[6..]),
            vec![FrameEvent::Frame(Frame::new(0x00, 0x11, vec![0x02, 0x00, 0x00]))]
        );
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let frame = Frame::new(0, 0, vec![0; 256]);
        assert_eq!(frame.encode(), Err(FrameError::PayloadTooLong(256)));
    }
}
