use crate::future::BaseFuture;
use crate::peer_address::PeerAddress;

/// What a routing lookup found: the peers closest to the target, nearest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingResult {
    peers: Vec<PeerAddress>,
}

impl RoutingResult {
    pub fn new(peers: Vec<PeerAddress>) -> Self {
        Self { peers }
    }

    pub fn peers(&self) -> &[PeerAddress] {
        &self.peers
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// The future of a routing lookup. The lookup algorithm lives elsewhere; this is only the handle operations use
/// to find out which peers to talk to. A failed lookup carries a human-readable reason.
pub type RoutingFuture = BaseFuture<RoutingResult, String>;
