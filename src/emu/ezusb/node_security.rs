use super::msg::{NodeMessage, NodeReply, node_status};
use crate::security::{Plug, SecurityToken, TokenError};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Security plug node: a thin command layer over the shared
/// [`SecurityToken`].
pub struct SecurityNode {
    token: Arc<Mutex<SecurityToken>>,
}

impl SecurityNode {
    pub const INIT: u8 = 0x00;
    /// `detail[0]`: 0 black plug, 1 white plug.
    pub const SELECT_PLUG: u8 = 0x01;
    pub const READ_BOOT_VERSION: u8 = 0x02;
    pub const READ_MCODE: u8 = 0x03;
    pub const READ_PCBID: u8 = 0x04;
    pub const READ_EAMID: u8 = 0x05;
    pub const CHALLENGE: u8 = 0x06;
    pub const VERIFY: u8 = 0x07;

    pub fn new(token: Arc<Mutex<SecurityToken>>) -> Self {
        Self { token }
    }

    pub fn handle(&mut self, msg: &NodeMessage) -> NodeReply {
        let mut token = self.token.lock().unwrap_or_else(PoisonError::into_inner);

        let result = match msg.cmd {
            Self::INIT => token.boot_version().map(|_| Vec::new()),
            Self::SELECT_PLUG => {
                let plug = if msg.detail[0] == 0 { Plug::Black } else { Plug::White };
                token.select(plug).map(|_| Vec::new())
            }
            Self::READ_BOOT_VERSION => token.boot_version().map(|m| m.as_bytes().to_vec()),
            Self::READ_MCODE => token.mcode().map(|m| m.as_bytes().to_vec()),
            Self::READ_PCBID => match token.pcbid() {
                Ok(Some(id)) => Ok(id.0.to_vec()),
                Ok(None) => return NodeReply::status(msg.node, node_status::NOT_PRESENT),
                Err(e) => Err(e),
            },
            Self::READ_EAMID => match token.eamid() {
                Ok(Some(id)) => Ok(id.0.to_vec()),
                Ok(None) => return NodeReply::status(msg.node, node_status::NOT_PRESENT),
                Err(e) => Err(e),
            },
            Self::CHALLENGE => token.challenge(&msg.payload).map(|r| r.to_vec()),
            Self::VERIFY => token.verify(&msg.payload).map(|_| Vec::new()),
            _ => return NodeReply::status(msg.node, node_status::UNKNOWN_COMMAND),
        };

        match result {
            Ok(payload) => NodeReply::ok(msg.node, payload),
            Err(e) => {
                debug!("Security node: command 0x{:02X} failed: {}", msg.cmd, e);
                NodeReply::status(msg.node, status_for(&e))
            }
        }
    }
}

fn status_for(error: &TokenError) -> u8 {
    match error {
        TokenError::Mismatch | TokenError::NotChallenged => node_status::NEGATIVE,
        TokenError::BadLength(_) => node_status::BAD_PAYLOAD,
        TokenError::NoWhitePlug => node_status::NOT_PRESENT,
        TokenError::NotSeeded
        | TokenError::AlreadySeeded
        | TokenError::InvalidMcode(_)
        | TokenError::InvalidSecurityId(_) => node_status::FAULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{TokenPhase, TokenSeed};

    fn node() -> (SecurityNode, Arc<Mutex<SecurityToken>>) {
        let token = Arc::new(Mutex::new(SecurityToken::seeded(TokenSeed {
            boot_version: "GEC02JAA".parse().unwrap(),
            boot_seeds: [0, 1, 1],
            black_mcode: "GQC02JAA".parse().unwrap(),
            white_mcode: None,
            pcbid: Some("0101020304050607086F".parse().unwrap()),
            eamid: None,
        })));
        (SecurityNode::new(Arc::clone(&token)), token)
    }

    #[test]
    fn reads_identity() {
        let (mut node, _) = node();
        let reply = node.handle(&NodeMessage::new(3, SecurityNode::READ_BOOT_VERSION));
        assert_eq!(reply, NodeReply::ok(3, b"GEC02JAA".to_vec()));

        let reply = node.handle(&NodeMessage::new(3, SecurityNode::READ_PCBID));
        assert_eq!(reply.payload, vec![0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x6F]);

        let reply = node.handle(&NodeMessage::new(3, SecurityNode::READ_EAMID));
        assert_eq!(reply.status, node_status::NOT_PRESENT);
    }

    #[test]
    fn challenge_then_verify() {
        let (mut node, token) = node();
        let challenge = NodeMessage::new(3, SecurityNode::CHALLENGE).with_payload([1u8; 8]);
        let reply = node.handle(&challenge);
        assert!(reply.is_ok());
        assert_eq!(reply.payload.len(), 8);

        let wrong = node.handle(&NodeMessage::new(3, SecurityNode::VERIFY).with_payload([0u8; 8]));
        assert_eq!(wrong.status, node_status::NEGATIVE);

        let right = node.handle(&NodeMessage::new(3, SecurityNode::VERIFY).with_payload(reply.payload));
        assert!(right.is_ok());
        assert_eq!(token.lock().unwrap().phase(), TokenPhase::Verified);
    }

    #[test]
    fn protocol_errors_map_to_statuses() {
        let (mut node, _) = node();
        let short = node.handle(&NodeMessage::new(3, SecurityNode::CHALLENGE).with_payload([1u8; 3]));
        assert_eq!(short.status, node_status::BAD_PAYLOAD);

        let white = node.handle(&NodeMessage::new(3, SecurityNode::SELECT_PLUG).with_detail(1, 0));
        assert_eq!(white.status, node_status::NOT_PRESENT);

        let unknown = node.handle(&NodeMessage::new(3, 0x55));
        assert_eq!(unknown.status, node_status::UNKNOWN_COMMAND);
    }
}
