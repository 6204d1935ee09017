use crate::peer_address::PeerAddress;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Ping,
    Pong,
    /// The sender is leaving the network.
    Quit,
    Ack,
    /// Application data, e.g. a storage RPC.
    Data,
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Ping => write!(f, "Ping"),
            MessageKind::Pong => write!(f, "Pong"),
            MessageKind::Quit => write!(f, "Quit"),
            MessageKind::Ack => write!(f, "Ack"),
            MessageKind::Data => write!(f, "Data"),
        }
    }
}

/// The typed payload of a request or a response. Encoding it for the wire is the transport's business.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    kind: MessageKind,
    sender: PeerAddress,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, sender: PeerAddress) -> Self {
        Self { kind, sender, payload: Vec::new() }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender(&self) -> &PeerAddress {
        &self.sender
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} from {} ({} bytes)", self.kind, self.sender, self.payload.len())
    }
}
