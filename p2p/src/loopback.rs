//! An in-process network. Every node registers a [`RequestHandler`] under its address, and channels opened through
//! [`LoopbackNetwork`] deliver requests to those handlers on the tokio runtime, with optional simulated latency.

use libkadmesh::connection::{ChannelCloser, ChannelKind, Transport, TransportError, TransportLink};
use libkadmesh::future::{FailureReason, ResponseFuture};
use libkadmesh::{Message, PeerAddress};
use log::*;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// What a handler does with a request.
#[derive(Clone, Debug)]
pub enum Reply {
    /// Answer with a message.
    Message(Message),
    /// Acknowledge the request without a message body.
    Empty,
    /// Never answer. The caller eventually sees [`FailureReason::Timeout`].
    Silent,
    /// Answer with something the caller cannot decode.
    Malformed,
}

pub trait RequestHandler: Send + Sync {
    fn handle(&self, kind: ChannelKind, request: &Message) -> Reply;
}

impl<F> RequestHandler for F
where
    F: Fn(ChannelKind, &Message) -> Reply + Send + Sync,
{
    fn handle(&self, kind: ChannelKind, request: &Message) -> Reply {
        self(kind, request)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LoopbackOptions {
    /// One-way delay applied to every request and every reply.
    pub latency: Duration,
    /// Up to this much extra delay, chosen at random per message.
    pub jitter: Duration,
    pub request_timeout: Duration,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self { latency: Duration::ZERO, jitter: Duration::ZERO, request_timeout: Duration::from_secs(5) }
    }
}

impl LoopbackOptions {
    pub fn with_timeout(request_timeout: Duration) -> Self {
        Self { request_timeout, ..Self::default() }
    }

    fn delay(&self) -> Duration {
        let jitter = u64::try_from(self.jitter.as_micros()).unwrap_or(u64::MAX);
        if jitter == 0 {
            return self.latency;
        }
        self.latency.saturating_add(Duration::from_micros(rand::rng().random_range(0..=jitter)))
    }
}

struct NetworkShared {
    runtime: Handle,
    options: LoopbackOptions,
    peers: RwLock<HashMap<PeerAddress, Arc<dyn RequestHandler>>>,
    open_links: AtomicUsize,
    shut_down: AtomicBool,
}

impl NetworkShared {
    fn handler(&self, address: &PeerAddress) -> Option<Arc<dyn RequestHandler>> {
        self.peers.read().get(address).cloned()
    }
}

#[derive(Clone)]
pub struct LoopbackNetwork {
    shared: Arc<NetworkShared>,
}

impl LoopbackNetwork {
    pub fn new(runtime: Handle, options: LoopbackOptions) -> Self {
        let shared = NetworkShared {
            runtime,
            options,
            peers: RwLock::new(HashMap::new()),
            open_links: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        };
        Self { shared: Arc::new(shared) }
    }

    /// A network on the current tokio runtime with default options.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn on_current_runtime() -> Self {
        Self::new(Handle::current(), LoopbackOptions::default())
    }

    pub fn options(&self) -> &LoopbackOptions {
        &self.shared.options
    }

    /// Start answering requests addressed to `address`. Returns `false` if someone is already listening there.
    pub fn register(&self, address: PeerAddress, handler: Arc<dyn RequestHandler>) -> bool {
        let mut peers = self.shared.peers.write();
        if peers.contains_key(&address) {
            return false;
        }
        peers.insert(address, handler);
        debug!("{address} joined the loopback network");
        true
    }

    pub fn unregister(&self, address: &PeerAddress) -> bool {
        let removed = self.shared.peers.write().remove(address).is_some();
        if removed {
            debug!("{address} left the loopback network");
        }
        removed
    }

    pub fn is_registered(&self, address: &PeerAddress) -> bool {
        self.shared.peers.read().contains_key(address)
    }

    /// The number of links that have been opened and not yet closed.
    pub fn open_links(&self) -> usize {
        self.shared.open_links.load(Ordering::SeqCst)
    }

    /// Refuse all further channels. Links that are already open keep working until they are closed.
    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
    }
}

impl Transport for LoopbackNetwork {
    fn open(
        &self,
        kind: ChannelKind,
        remote: &PeerAddress,
        closer: ChannelCloser,
    ) -> Result<Arc<dyn TransportLink>, TransportError> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(TransportError::Shutdown);
        }
        self.shared.open_links.fetch_add(1, Ordering::SeqCst);
        trace!("Loopback {kind} link for {} to {remote}", closer.channel_id());
        let link = LoopbackLink {
            kind,
            remote: *remote,
            network: Arc::clone(&self.shared),
            closer,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        Ok(Arc::new(link))
    }
}

struct LoopbackLink {
    kind: ChannelKind,
    remote: PeerAddress,
    network: Arc<NetworkShared>,
    closer: ChannelCloser,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TransportLink for LoopbackLink {
    fn send(&self, request: ResponseFuture) {
        let network = Arc::clone(&self.network);
        let closer = self.closer.clone();
        let kind = self.kind;
        let remote = self.remote;
        let task = self.network.runtime.spawn(async move {
            let timeout = network.options.request_timeout;
            let result = match tokio::time::timeout(timeout, exchange(&network, kind, &remote, &request)).await {
                Ok(result) => result,
                Err(_) => Err(FailureReason::Timeout),
            };
            match result {
                Ok(reply) => {
                    request.response(reply);
                }
                Err(FailureReason::ConnectionRefused) => {
                    request.failed(FailureReason::ConnectionRefused);
                    // Nobody accepted the connection, so the channel is dead.
                    closer.close();
                }
                Err(reason) => {
                    debug!("{} to {remote} failed: {reason}", request.id());
                    request.failed(reason);
                }
            }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.network.open_links.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn exchange(
    network: &NetworkShared,
    kind: ChannelKind,
    remote: &PeerAddress,
    request: &ResponseFuture,
) -> Result<Option<Message>, FailureReason> {
    tokio::time::sleep(network.options.delay()).await;
    let Some(handler) = network.handler(remote) else {
        return match kind {
            ChannelKind::Tcp => Err(FailureReason::ConnectionRefused),
            ChannelKind::Udp => Err(FailureReason::PeerUnreachable),
        };
    };
    match handler.handle(kind, request.request().message()) {
        Reply::Message(message) => {
            tokio::time::sleep(network.options.delay()).await;
            Ok(Some(message))
        }
        Reply::Empty => {
            tokio::time::sleep(network.options.delay()).await;
            Ok(None)
        }
        Reply::Silent => futures::future::pending::<Result<Option<Message>, FailureReason>>().await,
        Reply::Malformed => Err(FailureReason::MalformedResponse),
    }
}
