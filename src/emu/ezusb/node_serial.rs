use super::msg::{NodeMessage, NodeReply, node_status};
use crate::emu::serial::{CardReader, CardReaderLink};
use std::sync::{Arc, Mutex};

/// Card reader reached through the bridge instead of a COM port. Raw
/// serial bytes are tunnelled in node message payloads.
pub struct SerialNode {
    link: CardReaderLink,
}

impl SerialNode {
    pub const WRITE: u8 = 0x00;
    /// `detail[0]`: maximum bytes to return, 0 for everything pending.
    pub const READ: u8 = 0x01;
    pub const STATUS: u8 = 0x02;

    pub fn new(reader: Arc<Mutex<CardReader>>) -> Self {
        Self {
            link: CardReaderLink::new(reader),
        }
    }

    pub fn handle(&mut self, msg: &NodeMessage) -> NodeReply {
        match msg.cmd {
            Self::WRITE => {
                self.link.receive(&msg.payload);
                NodeReply::ok(msg.node, Vec::new())
            }
            Self::READ => {
                let limit = match msg.detail[0] {
                    0 => self.link.pending(),
                    n => n as usize,
                };
                let mut buf = vec![0u8; limit.min(self.link.pending())];
                let n = self.link.take(&mut buf);
                buf.truncate(n);
                NodeReply::ok(msg.node, buf)
            }
            Self::STATUS => {
                NodeReply::ok(msg.node, (self.link.pending() as u16).to_le_bytes())
            }
            _ => NodeReply::status(msg.node, node_status::UNKNOWN_COMMAND),
        }
    }

    pub fn pending(&self) -> usize {
        self.link.pending()
    }

    pub fn reset(&mut self) {
        self.link.purge_rx();
        self.link.purge_tx();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{Card, CardType, StaticCards};
    use crate::emu::serial::{Frame, FrameDecoder, FrameEvent, cmd, status};

    fn node() -> SerialNode {
        let card = Card {
            id: "E004010000000001".parse().unwrap(),
            kind: CardType::Iso15693,
        };
        let reader = CardReader::new(vec![true], Box::new(StaticCards::new(vec![Some(card)])));
        SerialNode::new(Arc::new(Mutex::new(reader)))
    }

    #[test]
    fn tunnels_card_reader_frames() {
        let mut node = node();
        let request = Frame::new(0, cmd::GET_STATUS, vec![]).encode().unwrap();
        assert!(node.handle(&NodeMessage::new(4, SerialNode::WRITE).with_payload(request)).is_ok());
        assert!(node.pending() > 0);

        let first = node.handle(&NodeMessage::new(4, SerialNode::READ).with_detail(2, 0));
        assert_eq!(first.payload.len(), 2);
        let rest = node.handle(&NodeMessage::new(4, SerialNode::READ));
        assert_eq!(node.pending(), 0);

        let mut bytes = first.payload;
        bytes.extend(rest.payload);
        assert_eq!(
            FrameDecoder::new().push(&bytes),
            vec![FrameEvent::Frame(Frame::new(0, cmd::GET_STATUS, vec![status::OK, 1]))]
        );
    }

    #[test]
    fn status_reports_pending_bytes() {
        let mut node = node();
        let request = Frame::new(0, cmd::RESET, vec![]).encode().unwrap();
        node.handle(&NodeMessage::new(4, SerialNode::WRITE).with_payload(request));
        let reply = node.handle(&NodeMessage::new(4, SerialNode::STATUS));
        assert_eq!(reply.payload, vec![7, 0]);

        node.reset();
        assert_eq!(node.pending(), 0);
    }
}
