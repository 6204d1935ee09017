use crate::connection::{Transport, TransportError, TransportLink};
use crate::future::{FailureReason, RequestId, ResponseFuture};
use crate::message::Message;
use crate::peer_address::PeerAddress;
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Tcp,
    Udp,
}

impl Display for ChannelKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Tcp => write!(f, "TCP"),
            ChannelKind::Udp => write!(f, "UDP"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ChannelId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel#{}", self.0)
    }
}

type CloseHook = Box<dyn FnOnce(ChannelId) + Send + 'static>;

struct ChannelState {
    open: bool,
    link: Option<Arc<dyn TransportLink>>,
    pending: HashMap<RequestId, ResponseFuture>,
}

struct ChannelInner {
    id: ChannelId,
    kind: ChannelKind,
    remote: PeerAddress,
    state: Mutex<ChannelState>,
    on_close: Mutex<Option<CloseHook>>,
}

/// An open outbound channel, as handed out by a [`crate::connection::ChannelCreator`].
///
/// The channel keeps track of the requests sent over it that have not completed yet. Closing the channel, for
/// whatever reason, fails all of them with [`FailureReason::ChannelClosed`].
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Ask `transport` for a link and wrap it. `on_close` runs once, after the channel has been closed.
    pub(crate) fn open<F>(
        kind: ChannelKind,
        remote: PeerAddress,
        transport: &dyn Transport,
        on_close: F,
    ) -> Result<Self, TransportError>
    where
        F: FnOnce(ChannelId) + Send + 'static,
    {
        let state = ChannelState { open: true, link: None, pending: HashMap::new() };
        let inner = Arc::new(ChannelInner {
            id: ChannelId::next(),
            kind,
            remote,
            state: Mutex::new(state),
            on_close: Mutex::new(Some(Box::new(on_close))),
        });
        let closer = ChannelCloser { id: inner.id, inner: Arc::downgrade(&inner) };
        let link = transport.open(kind, &remote, closer)?;
        let orphaned = {
            let mut state = inner.state.lock();
            if state.open {
                state.link = Some(link);
                None
            } else {
                Some(link)
            }
        };
        if let Some(link) = orphaned {
            // The transport reported the channel dead before `open` returned.
            link.close();
        }
        trace!("Opened {kind} {} to {remote}", inner.id);
        Ok(Self { inner })
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.inner.kind
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.inner.remote
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    /// The number of requests sent over this channel that are still waiting for an outcome.
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Send `message` to the remote peer.
    ///
    /// The returned future is already failed with [`FailureReason::ChannelClosed`] if the channel is closed.
    pub fn send(&self, message: Message) -> ResponseFuture {
        let future = ResponseFuture::new(self.inner.remote, message);
        let link = {
            let mut state = self.inner.state.lock();
            match state.link.clone() {
                Some(link) if state.open => {
                    state.pending.insert(future.id(), future.clone());
                    Some(link)
                }
                _ => None,
            }
        };
        let Some(link) = link else {
            debug!("Cannot send {} over closed {}", future.id(), self.inner.id);
            future.failed(FailureReason::ChannelClosed);
            return future;
        };
        let weak = Arc::downgrade(&self.inner);
        let request_id = future.id();
        future.add_listener(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().pending.remove(&request_id);
            }
        });
        trace!("Sending {} over {}", future.id(), self.inner.id);
        link.send(future.clone());
        future
    }

    /// Close the channel. Only the first call does anything; it returns `true`.
    ///
    /// The transport link is released, every pending request fails with [`FailureReason::ChannelClosed`] and the
    /// owning creator gets its slot back.
    pub fn close(&self) -> bool {
        let (link, pending) = {
            let mut state = self.inner.state.lock();
            if !state.open {
                return false;
            }
            state.open = false;
            (state.link.take(), std::mem::take(&mut state.pending))
        };
        if let Some(link) = link {
            link.close();
        }
        if !pending.is_empty() {
            debug!("Closing {} with {} pending request(s)", self.inner.id, pending.len());
        }
        for future in pending.into_values() {
            future.failed(FailureReason::ChannelClosed);
        }
        let hook = self.inner.on_close.lock().take();
        if let Some(hook) = hook {
            hook(self.inner.id);
        }
        trace!("Closed {} to {}", self.inner.id, self.inner.remote);
        true
    }
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel({} {} to {})", self.inner.kind, self.inner.id, self.inner.remote)
    }
}

/// Handed to the transport so it can report that a channel died. Holding one does not keep the channel alive.
#[derive(Clone)]
pub struct ChannelCloser {
    id: ChannelId,
    inner: Weak<ChannelInner>,
}

impl ChannelCloser {
    pub fn channel_id(&self) -> ChannelId {
        self.id
    }

    /// Close the channel, failing its pending requests. Returns `false` if it was already closed or is gone.
    pub fn close(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => Channel { inner }.close(),
            None => false,
        }
    }
}

impl Debug for ChannelCloser {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelCloser({})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::dummy_transport::DummyTransport;
    use crate::message::MessageKind;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;

    fn peer(port: u16) -> PeerAddress {
        PeerAddress::with_port(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn ping() -> Message {
        Message::new(MessageKind::Ping, peer(1))
    }

    #[test]
    fn send_tracks_pending_until_completion() {
        let transport = DummyTransport::default();
        let channel = Channel::open(ChannelKind::Tcp, peer(2), &transport, |_| {}).unwrap();
        let f1 = channel.send(ping());
        let f2 = channel.send(ping());
        assert_eq!(channel.pending_requests(), 2);
        assert_eq!(transport.sent().len(), 2);
        f1.response(None);
        assert_eq!(channel.pending_requests(), 1);
        let f3 = channel.send(ping());
        assert!(f3.cancel());
        assert_eq!(channel.pending_requests(), 1);
        f2.failed(FailureReason::MalformedResponse);
        assert_eq!(channel.pending_requests(), 0);
        assert!(channel.is_open());
    }

    #[test]
    fn close_fails_pending_requests_once() {
        let transport = DummyTransport::default();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hook_calls);
        let channel = Channel::open(ChannelKind::Udp, peer(2), &transport, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let f1 = channel.send(ping());
        let f2 = channel.send(ping());
        assert!(channel.close());
        assert!(!channel.close());
        assert_eq!(f1.failed_reason(), Some(FailureReason::ChannelClosed));
        assert_eq!(f2.failed_reason(), Some(FailureReason::ChannelClosed));
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.links()[0].close_count(), 1);
    }

    #[test]
    fn send_on_closed_channel_fails_immediately() {
        let transport = DummyTransport::default();
        let channel = Channel::open(ChannelKind::Tcp, peer(2), &transport, |_| {}).unwrap();
        channel.close();
        let f = channel.send(ping());
        assert_eq!(f.failed_reason(), Some(FailureReason::ChannelClosed));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn transport_can_close_the_channel() {
        let transport = DummyTransport::default();
        let channel = Channel::open(ChannelKind::Tcp, peer(2), &transport, |_| {}).unwrap();
        let f = channel.send(ping());
        assert!(transport.links()[0].closer().close());
        assert!(!channel.is_open());
        assert_eq!(f.failed_reason(), Some(FailureReason::ChannelClosed));
    }

    #[test]
    fn open_failure_is_reported() {
        let transport = DummyTransport::refusing();
        let err = Channel::open(ChannelKind::Tcp, peer(2), &transport, |_| {}).unwrap_err();
        assert!(matches!(err, TransportError::OpenFailed { kind: ChannelKind::Tcp, .. }));
    }
}
