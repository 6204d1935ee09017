//! A transport that records everything and answers nothing, for exercising the connection layer in tests.

use crate::connection::{ChannelCloser, ChannelKind, Transport, TransportError, TransportLink};
use crate::future::ResponseFuture;
use crate::peer_address::PeerAddress;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct DummyTransport {
    links: Mutex<Vec<Arc<DummyLink>>>,
    refuse: AtomicBool,
}

impl DummyTransport {
    pub fn refusing() -> Self {
        let transport = Self::default();
        transport.refuse.store(true, Ordering::SeqCst);
        transport
    }

    pub fn links(&self) -> Vec<Arc<DummyLink>> {
        self.links.lock().clone()
    }

    /// Every request sent over any link, in order.
    pub fn sent(&self) -> Vec<ResponseFuture> {
        self.links.lock().iter().flat_map(|l| l.sent.lock().clone()).collect()
    }

    /// Reply to every request that is still pending.
    pub fn answer_all(&self) -> usize {
        self.sent().into_iter().filter(|f| f.response(None)).count()
    }
}

impl Transport for DummyTransport {
    fn open(
        &self,
        kind: ChannelKind,
        remote: &PeerAddress,
        closer: ChannelCloser,
    ) -> Result<Arc<dyn TransportLink>, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::open_failed(kind, *remote, "refused by dummy transport"));
        }
        let link = Arc::new(DummyLink {
            kind,
            remote: *remote,
            closer,
            sent: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        });
        self.links.lock().push(Arc::clone(&link));
        Ok(link as Arc<dyn TransportLink>)
    }
}

pub struct DummyLink {
    kind: ChannelKind,
    remote: PeerAddress,
    closer: ChannelCloser,
    sent: Mutex<Vec<ResponseFuture>>,
    closed: AtomicUsize,
}

impl DummyLink {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    pub fn closer(&self) -> &ChannelCloser {
        &self.closer
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TransportLink for DummyLink {
    fn send(&self, request: ResponseFuture) {
        self.sent.lock().push(request);
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
