//! The seam between the connection layer and whatever moves bytes.
//!
//! The connection layer never touches sockets. It asks a [`Transport`] for a link to a peer, hands requests to that
//! link and tells it when to close. The transport in turn reports dead links through the [`ChannelCloser`] it was
//! given and completes every [`ResponseFuture`] it accepted.

use crate::connection::{ChannelCloser, ChannelKind, TransportError};
use crate::future::ResponseFuture;
use crate::peer_address::PeerAddress;
use std::sync::Arc;

pub trait Transport: Send + Sync {
    /// Open a channel to `remote`.
    ///
    /// This must not block: connection establishment happens in the background, and a failure to connect surfaces
    /// as failed requests (or through `closer`). Only immediate, local failures are returned as errors.
    fn open(
        &self,
        kind: ChannelKind,
        remote: &PeerAddress,
        closer: ChannelCloser,
    ) -> Result<Arc<dyn TransportLink>, TransportError>;
}

pub trait TransportLink: Send + Sync {
    /// Send the request carried by `request`.
    ///
    /// The link must eventually complete the future: with the decoded reply, or with a failure such as
    /// [`crate::future::FailureReason::Timeout`]. The future may already be terminal when the reply arrives (e.g.
    /// the caller cancelled it), in which case the reply is dropped.
    fn send(&self, request: ResponseFuture);

    /// Release the underlying connection. Called exactly once per link.
    fn close(&self);
}
