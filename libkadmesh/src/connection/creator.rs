use crate::connection::{Channel, ChannelCreatorError, ChannelId, ChannelKind, Transport};
use crate::future::ResponseFuture;
use crate::message::Message;
use crate::peer_address::PeerAddress;
use log::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CreatorId(u64);

impl CreatorId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        CreatorId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for CreatorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "creator#{}", self.0)
    }
}

/// Where a creator stands with respect to the reservation that granted it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseState {
    Live,
    Released,
    /// Released by a reservation shutdown rather than by its owner.
    ForceReleased,
}

impl ReleaseState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ReleaseState::Released,
            2 => ReleaseState::ForceReleased,
            _ => ReleaseState::Live,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ReleaseState::Live => 0,
            ReleaseState::Released => 1,
            ReleaseState::ForceReleased => 2,
        }
    }
}

struct CreatorState {
    channels: HashMap<ChannelId, Channel>,
    // Slots held by `create` calls that are waiting on the transport.
    opening: usize,
    closed: bool,
}

struct CreatorShared {
    id: CreatorId,
    permits: usize,
    transport: Arc<dyn Transport>,
    state: Mutex<CreatorState>,
    release: AtomicU8,
}

/// The right to hold up to `permits` outbound channels at once.
///
/// Creators are handed out by [`crate::connection::ConnectionReservation::reserve`] and must be given back with
/// [`crate::connection::ConnectionReservation::release`], which closes every channel still open.
/// A channel that closes on its own frees its slot for the next `create_*` call; the number of permits never changes.
#[derive(Clone)]
pub struct ChannelCreator {
    shared: Arc<CreatorShared>,
}

impl ChannelCreator {
    pub(crate) fn new(permits: usize, transport: Arc<dyn Transport>) -> Self {
        let state = CreatorState { channels: HashMap::new(), opening: 0, closed: false };
        let shared = CreatorShared {
            id: CreatorId::next(),
            permits,
            transport,
            state: Mutex::new(state),
            release: AtomicU8::new(ReleaseState::Live.as_u8()),
        };
        Self { shared: Arc::new(shared) }
    }

    pub fn id(&self) -> CreatorId {
        self.shared.id
    }

    pub fn permits(&self) -> usize {
        self.shared.permits
    }

    pub fn active_channels(&self) -> usize {
        self.shared.state.lock().channels.len()
    }

    /// How many more channels can be created right now.
    pub fn available(&self) -> usize {
        let state = self.shared.state.lock();
        self.shared.permits.saturating_sub(state.channels.len() + state.opening)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn release_state(&self) -> ReleaseState {
        ReleaseState::from_u8(self.shared.release.load(Ordering::SeqCst))
    }

    pub(crate) fn mark_released(&self, state: ReleaseState) {
        self.shared.release.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn create_tcp(&self, remote: PeerAddress) -> Result<Channel, ChannelCreatorError> {
        self.create(ChannelKind::Tcp, remote)
    }

    pub fn create_udp(&self, remote: PeerAddress) -> Result<Channel, ChannelCreatorError> {
        self.create(ChannelKind::Udp, remote)
    }

    /// Open a new channel of the given kind, using up one permit until the channel closes.
    pub fn create(&self, kind: ChannelKind, remote: PeerAddress) -> Result<Channel, ChannelCreatorError> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(ChannelCreatorError::Closed(self.shared.id));
            }
            if state.channels.len() + state.opening >= self.shared.permits {
                return Err(ChannelCreatorError::CapacityExceeded {
                    creator: self.shared.id,
                    permits: self.shared.permits,
                });
            }
            state.opening += 1;
        }
        let weak = Arc::downgrade(&self.shared);
        let result = Channel::open(kind, remote, self.shared.transport.as_ref(), move |id| forget(&weak, id));
        let mut state = self.shared.state.lock();
        state.opening -= 1;
        let channel = result?;
        if state.closed {
            drop(state);
            channel.close();
            return Err(ChannelCreatorError::Closed(self.shared.id));
        }
        // A channel the transport already killed has run its close hook, so it must not take a slot.
        if channel.is_open() {
            state.channels.insert(channel.id(), channel.clone());
        }
        Ok(channel)
    }

    /// Send a single request on a fresh channel that is closed as soon as the request completes.
    pub fn request(
        &self,
        kind: ChannelKind,
        remote: PeerAddress,
        message: Message,
    ) -> Result<ResponseFuture, ChannelCreatorError> {
        let channel = self.create(kind, remote)?;
        let future = channel.send(message);
        future.add_listener(move |_| {
            channel.close();
        });
        Ok(future)
    }

    /// Close every active channel and refuse new ones. Only the first call does anything; it returns `true`.
    pub fn shutdown(&self) -> bool {
        let channels = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            std::mem::take(&mut state.channels)
        };
        debug!("Shutting down {} with {} active channel(s)", self.shared.id, channels.len());
        for channel in channels.into_values() {
            channel.close();
        }
        true
    }
}

fn forget(creator: &Weak<CreatorShared>, channel: ChannelId) {
    if let Some(shared) = creator.upgrade() {
        if shared.state.lock().channels.remove(&channel).is_some() {
            trace!("{channel} released its slot in {}", shared.id);
        }
    }
}

impl Debug for ChannelCreator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        write!(
            f,
            "ChannelCreator({}, {}/{} in use{})",
            self.shared.id,
            state.channels.len() + state.opening,
            self.shared.permits,
            if state.closed { ", closed" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::dummy_transport::DummyTransport;
    use crate::connection::TransportError;
    use crate::future::FailureReason;
    use crate::message::MessageKind;
    use std::net::{IpAddr, Ipv4Addr};
    use std::thread;

    fn peer(port: u16) -> PeerAddress {
        PeerAddress::with_port(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn creator(permits: usize) -> (ChannelCreator, Arc<DummyTransport>) {
        let transport = Arc::new(DummyTransport::default());
        (ChannelCreator::new(permits, transport.clone()), transport)
    }

    #[test]
    fn fourth_channel_exceeds_three_permits() {
        let (cc, _) = creator(3);
        cc.create_tcp(peer(10)).unwrap();
        cc.create_udp(peer(11)).unwrap();
        let third = cc.create_tcp(peer(12)).unwrap();
        let err = cc.create_tcp(peer(13)).unwrap_err();
        assert_eq!(err, ChannelCreatorError::CapacityExceeded { creator: cc.id(), permits: 3 });
        // A closed channel gives its slot back, but the cap stays at three.
        third.close();
        assert_eq!(cc.active_channels(), 2);
        cc.create_tcp(peer(13)).unwrap();
        assert!(matches!(cc.create_udp(peer(14)), Err(ChannelCreatorError::CapacityExceeded { .. })));
        assert_eq!(cc.permits(), 3);
        assert_eq!(cc.available(), 0);
    }

    #[test]
    fn shutdown_fails_pending_requests() {
        let (cc, transport) = creator(2);
        let c1 = cc.create_tcp(peer(10)).unwrap();
        let c2 = cc.create_udp(peer(11)).unwrap();
        let f1 = c1.send(Message::new(MessageKind::Ping, peer(1)));
        let f2 = c2.send(Message::new(MessageKind::Ping, peer(1)));
        assert!(cc.shutdown());
        assert!(!cc.shutdown());
        assert_eq!(f1.await_timeout(std::time::Duration::from_secs(1)).unwrap().state(), f2.state());
        assert_eq!(f1.failed_reason(), Some(FailureReason::ChannelClosed));
        assert_eq!(f2.failed_reason(), Some(FailureReason::ChannelClosed));
        assert!(transport.links().iter().all(|l| l.close_count() == 1));
        assert_eq!(cc.active_channels(), 0);
        assert_eq!(cc.create_tcp(peer(12)).unwrap_err(), ChannelCreatorError::Closed(cc.id()));
    }

    #[test]
    fn request_closes_its_channel_on_completion() {
        let (cc, transport) = creator(1);
        let f = cc.request(ChannelKind::Udp, peer(10), Message::new(MessageKind::Ping, peer(1))).unwrap();
        assert_eq!(cc.available(), 0);
        assert!(cc.request(ChannelKind::Udp, peer(10), Message::new(MessageKind::Ping, peer(1))).is_err());
        assert_eq!(transport.answer_all(), 1);
        assert!(f.is_success());
        assert_eq!(cc.available(), 1);
        let link = &transport.links()[0];
        assert_eq!((link.kind(), *link.remote()), (ChannelKind::Udp, peer(10)));
        assert_eq!(link.close_count(), 1);
    }

    #[test]
    fn open_failure_returns_the_slot() {
        let transport = Arc::new(DummyTransport::refusing());
        let cc = ChannelCreator::new(1, transport);
        let err = cc.create_tcp(peer(10)).unwrap_err();
        assert!(matches!(err, ChannelCreatorError::Transport(TransportError::OpenFailed { .. })));
        assert_eq!(cc.available(), 1);
    }

    #[test]
    fn concurrent_creates_never_exceed_permits() {
        let (cc, _) = creator(5);
        let handles = (0..20u16)
            .map(|i| {
                let cc = cc.clone();
                thread::spawn(move || cc.create_tcp(peer(100 + i)).is_ok())
            })
            .collect::<Vec<_>>();
        let created = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(created, 5);
        assert_eq!(cc.active_channels(), 5);
    }
}
