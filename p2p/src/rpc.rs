//! The two RPCs a node needs for admission and departure: the handshake ping and the quit announcement.
//!
//! Each call takes a [`ChannelCreator`] reserved by the caller and sends a single request on a fresh channel, which is
//! closed as soon as the request completes.

use libkadmesh::connection::{ChannelCreator, ChannelCreatorError, ChannelKind};
use libkadmesh::future::ResponseFuture;
use libkadmesh::{Message, MessageKind, PeerAddress};
use log::*;

macro_rules! single_request {
    ($name:ident, $kind:expr, $message:expr) => {
        pub fn $name(
            &self,
            remote: PeerAddress,
            creator: &ChannelCreator,
        ) -> Result<ResponseFuture, ChannelCreatorError> {
            let message = Message::new($message, self.local);
            trace!("{} {} to {remote} via {}", $message, $kind, creator.id());
            creator.request($kind, remote, message)
        }
    };
}

/// Liveness checks. A successful ping is answered with a [`MessageKind::Pong`].
#[derive(Clone, Copy, Debug)]
pub struct HandshakeRpc {
    local: PeerAddress,
}

impl HandshakeRpc {
    pub fn new(local: PeerAddress) -> Self {
        Self { local }
    }

    single_request!(ping_tcp, ChannelKind::Tcp, MessageKind::Ping);
    single_request!(ping_udp, ChannelKind::Udp, MessageKind::Ping);

    pub fn ping(
        &self,
        kind: ChannelKind,
        remote: PeerAddress,
        creator: &ChannelCreator,
    ) -> Result<ResponseFuture, ChannelCreatorError> {
        match kind {
            ChannelKind::Tcp => self.ping_tcp(remote, creator),
            ChannelKind::Udp => self.ping_udp(remote, creator),
        }
    }

    /// Whether a completed ping got the answer a live peer gives.
    pub fn is_pong(future: &ResponseFuture) -> bool {
        future.response_message().is_some_and(|m| m.kind() == MessageKind::Pong)
    }
}

/// Tells a peer that this node is leaving, so it can drop us from its neighbour set.
#[derive(Clone, Copy, Debug)]
pub struct QuitRpc {
    local: PeerAddress,
}

impl QuitRpc {
    pub fn new(local: PeerAddress) -> Self {
        Self { local }
    }

    single_request!(quit, ChannelKind::Udp, MessageKind::Quit);
}
