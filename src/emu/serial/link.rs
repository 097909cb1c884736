use super::frame::{FrameDecoder, FrameEvent};
use super::reader::CardReader;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Reply bytes kept for a host that writes without reading. Whole unread
/// replies beyond this are dropped, oldest first.
pub const TX_LIMIT: usize = 16 * 1024;

/// One host-side connection to the card reader: reassembles request
/// frames from arbitrary write chunks and queues encoded replies for
/// subsequent reads.
pub struct CardReaderLink {
    decoder: FrameDecoder,
    tx: VecDeque<u8>,
    /// Length of each queued reply, front first.
    replies: VecDeque<usize>,
    /// Bytes of the front reply the host already read.
    front_read: usize,
    reader: Arc<Mutex<CardReader>>,
}

impl CardReaderLink {
    pub fn new(reader: Arc<Mutex<CardReader>>) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            tx: VecDeque::new(),
            replies: VecDeque::new(),
            front_read: 0,
            reader,
        }
    }

    pub fn receive(&mut self, data: &[u8]) {
        let events = self.decoder.push(data);
        if events.is_empty() {
            return;
        }

        let reader = Arc::clone(&self.reader);
        let mut reader = reader.lock().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            let reply = match event {
                FrameEvent::Frame(request) => reader.handle(&request),
                FrameEvent::Corrupt { addr, cmd, error } => {
                    debug!("Card reader: {}", error);
                    reader.corrupt(addr, cmd)
                }
            };

            match reply.encode() {
                Ok(bytes) => self.queue(bytes),
                Err(e) => warn!("Card reader: dropping reply: {}", e),
            }
        }
    }

    fn queue(&mut self, bytes: Vec<u8>) {
        let mut dropped = 0;
        while self.tx.len() + bytes.len() > TX_LIMIT {
            // A reply the host started reading stays whole.
            let victim = usize::from(self.front_read > 0);
            let Some(len) = self.replies.remove(victim) else {
                break;
            };
            let start = if victim == 0 {
                0
            } else {
                self.replies[0] - self.front_read
            };
            self.tx.drain(start..start + len);
            dropped += 1;
        }
        if dropped > 0 {
            warn!(
                "Card reader: host is not reading, dropped {} stale repl{}",
                dropped,
                if dropped == 1 { "y" } else { "ies" }
            );
        }

        self.replies.push_back(bytes.len());
        self.tx.extend(bytes);
    }

    /// Move queued reply bytes into `buf`.
    pub fn take(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.tx.len());
        for (dst, src) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *dst = src;
        }

        let mut left = n;
        while let Some(&front) = self.replies.front() {
            let remaining = front - self.front_read;
            if remaining > left {
                self.front_read += left;
                break;
            }
            left -= remaining;
            self.front_read = 0;
            self.replies.pop_front();
        }
        n
    }

    /// Reply bytes waiting to be read.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    /// Request bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.decoder.buffered()
    }

    pub fn purge_rx(&mut self) {
        self.decoder.clear();
    }

    pub fn purge_tx(&mut self) {
        self.tx.clear();
        self.replies.clear();
        self.front_read = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::super::frame::{Frame, FrameDecoder};
    use super::super::reader::{cmd, status, tests::reader};
    use super::*;
    use proptest::prelude::*;

    fn link() -> CardReaderLink {
        CardReaderLink::new(Arc::new(Mutex::new(reader())))
    }

    fn read_replies(link: &mut CardReaderLink) -> Vec<FrameEvent> {
        let mut buf = vec![0u8; link.pending()];
        let n = link.take(&mut buf);
        FrameDecoder::new().push(&buf[..n])
    }

    #[test]
    fn answers_each_request() {
        let mut link = link();
        link.receive(&Frame::new(0, cmd::GET_VERSION, vec![]).encode().unwrap());
        link.receive(&Frame::new(0, cmd::GET_STATUS, vec![]).encode().unwrap());

        let replies = read_replies(&mut link);
        assert_eq!(replies.len(), 2);
        assert_eq!(link.pending(), 0);
    }

    #[test]
    fn checksum_failure_gets_error_reply() {
        let mut bytes = Frame::new(0, cmd::READ_CARD, vec![]).encode().unwrap();
        bytes[4] = bytes[4].wrapping_add(1);

        let mut link = link();
        link.receive(&bytes);
        let replies = read_replies(&mut link);
        assert_eq!(
            replies,
            vec![FrameEvent::Frame(Frame::new(0, cmd::READ_CARD, vec![status::CHECKSUM]))]
        );

        link.receive(&Frame::new(0, cmd::GET_STATUS, vec![]).encode().unwrap());
        assert_eq!(
            read_replies(&mut link),
            vec![FrameEvent::Frame(Frame::new(0, cmd::GET_STATUS, vec![status::OK, 1]))]
        );
    }

    #[test]
    fn partial_reads_drain_in_order() {
        let mut link = link();
        link.receive(&Frame::new(0, cmd::RESET, vec![]).encode().unwrap());
        let total = link.pending();

        let mut first = [0u8; 3];
        assert_eq!(link.take(&mut first), 3);
        assert_eq!(first[0], super::super::frame::STX);
        assert_eq!(link.pending(), total - 3);
    }

    #[test]
    fn stray_stx_before_request_still_gets_an_answer() {
        let status_request = Frame::new(0, cmd::GET_STATUS, vec![]).encode().unwrap();

        let mut link = link();
        link.receive(&[0x02, 0x00, 0x00, 0xF0]);
        link.receive(&status_request);
        assert_eq!(link.buffered(), 0);
        let replies = read_replies(&mut link);
        assert_eq!(
            replies.last(),
            Some(&FrameEvent::Frame(Frame::new(0, cmd::GET_STATUS, vec![status::OK, 1])))
        );

        let mut link = self::link();
        link.receive(&[0x02]);
        link.receive(&status_request);
        let replies = read_replies(&mut link);
        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies[1],
            FrameEvent::Frame(Frame::new(0, cmd::GET_STATUS, vec![status::OK, 1]))
        );
    }

    #[test]
    fn unread_replies_are_capped_to_whole_frames() {
        let request = Frame::new(0, cmd::GET_VERSION, vec![]).encode().unwrap();
        let mut link = link();
        for _ in 0..2000 {
            link.receive(&request);
        }
        assert!(link.pending() <= TX_LIMIT);

        // Start reading mid-reply, then keep filling: the stream stays
        // aligned on frame boundaries.
        let mut head = [0u8; 5];
        assert_eq!(link.take(&mut head), 5);
        for _ in 0..100 {
            link.receive(&request);
        }
        assert!(link.pending() <= TX_LIMIT);

        let mut rest = vec![0u8; link.pending()];
        let n = link.take(&mut rest);
        let mut stream = head.to_vec();
        stream.extend_from_slice(&rest[..n]);
        let replies = FrameDecoder::new().push(&stream);
        assert!(!replies.is_empty());
        assert!(replies.iter().all(|event| matches!(
            event,
            FrameEvent::Frame(frame) if frame.cmd == cmd::GET_VERSION
        )));
    }

    fn request_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        for command in [cmd::RESET, cmd::GET_VERSION, cmd::GET_STATUS, cmd::READ_CARD] {
            stream.extend(Frame::new(0, command, vec![]).encode().unwrap());
        }
        let mut corrupt = Frame::new(0, cmd::READ_CARD, vec![0x01]).encode().unwrap();
        corrupt[5] ^= 0x5A;
        stream.extend(corrupt);
        stream.extend(Frame::new(1, cmd::READ_CARD, vec![]).encode().unwrap());
        stream
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_replies(cuts in proptest::collection::vec(0usize..64, 0..12)) {
            let stream = request_stream();

            let mut whole = link();
            whole.receive(&stream);
            let expected = read_replies(&mut whole);

            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % (stream.len() + 1)).collect();
            cuts.sort_unstable();

            let mut chunked = link();
            let mut start = 0;
            for cut in cuts {
                chunked.receive(&stream[start..cut]);
                start = cut;
            }
            chunked.receive(&stream[start..]);

            prop_assert_eq!(read_replies(&mut chunked), expected);
            prop_assert_eq!(chunked.buffered(), 0);
        }
    }
}
