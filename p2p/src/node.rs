use crate::config::NodeConfig;
use crate::errors::NodeError;
use crate::loopback::{LoopbackNetwork, Reply, RequestHandler};
use crate::rpc::{HandshakeRpc, QuitRpc};
use libkadmesh::connection::{ChannelCreator, ChannelKind, ConnectionReservation, FutureChannelCreator};
use libkadmesh::future::{Outcome, ResponseFuture, RoutingFuture, ShutdownFuture};
use libkadmesh::{Message, MessageKind, PeerAddress};
use log::*;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::Instant;

type Neighbours = Arc<RwLock<HashSet<PeerAddress>>>;

struct NodeInner {
    config: NodeConfig,
    reservation: ConnectionReservation,
    network: LoopbackNetwork,
    neighbours: Neighbours,
    runtime: Handle,
    halted: AtomicBool,
}

/// A running DHT node: its configuration, the connection reservation every outbound request goes through and the set
/// of peers it currently knows about.
///
/// Nodes are cheap to clone; all clones refer to the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Join `network` at the configured address.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn start(config: NodeConfig, network: LoopbackNetwork) -> Result<Self, NodeError> {
        config.validate()?;
        let address = config.address;
        let neighbours = Neighbours::default();
        let handler = NodeHandler { address, neighbours: Arc::clone(&neighbours) };
        if !network.register(address, Arc::new(handler)) {
            return Err(NodeError::AddressInUse(address));
        }
        let reservation = ConnectionReservation::new(config.max_connections, Arc::new(network.clone()));
        info!("Node {address} started with {} connection permit(s)", config.max_connections);
        let inner = NodeInner {
            config,
            reservation,
            network,
            neighbours,
            runtime: Handle::current(),
            halted: AtomicBool::new(false),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn address(&self) -> PeerAddress {
        self.inner.config.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// The admission control shared by everything this node sends.
    pub fn reservation(&self) -> &ConnectionReservation {
        &self.inner.reservation
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    pub fn add_neighbour(&self, peer: PeerAddress) -> bool {
        if peer == self.address() {
            return false;
        }
        self.inner.neighbours.write().insert(peer)
    }

    pub fn remove_neighbour(&self, peer: &PeerAddress) -> bool {
        self.inner.neighbours.write().remove(peer)
    }

    pub fn neighbours(&self) -> Vec<PeerAddress> {
        let mut peers = self.inner.neighbours.read().iter().copied().collect::<Vec<_>>();
        peers.sort_by_key(|p| (p.ip(), p.tcp_port(), p.udp_port()));
        peers
    }

    pub fn handshake(&self) -> HandshakeRpc {
        HandshakeRpc::new(self.address())
    }

    /// Reserve `permits` connections and wait until they are granted.
    ///
    /// The caller owns the returned creator and must release it. Dropping this future before it resolves withdraws
    /// the request, and a grant that arrives too late goes straight back to the pool.
    pub async fn acquire(&self, permits: usize) -> Result<ChannelCreator, NodeError> {
        let held = self.hold(permits)?;
        let creator = held.granted().await?;
        held.disarm();
        Ok(creator)
    }

    fn hold(&self, permits: usize) -> Result<HeldReservation<'_>, NodeError> {
        if self.is_halted() {
            return Err(NodeError::Halted);
        }
        let reservation = &self.inner.reservation;
        Ok(HeldReservation { reservation, future: reservation.reserve(permits), armed: true })
    }

    /// Ping `remote` once and report whether it answered with a pong. A peer that answers is added to the neighbour
    /// set; one that does not is dropped from it.
    pub async fn ping(&self, remote: PeerAddress, kind: ChannelKind) -> Result<bool, NodeError> {
        let held = self.hold(1)?;
        let creator = held.granted().await?;
        let alive = match self.handshake().ping(kind, remote, &creator) {
            Ok(future) => {
                future.completion().await;
                HandshakeRpc::is_pong(&future)
            }
            Err(e) => {
                held.release()?;
                return Err(e.into());
            }
        };
        held.release()?;
        if alive {
            self.add_neighbour(remote);
        } else {
            debug!("{remote} did not answer a {kind} ping from {}", self.address());
            self.remove_neighbour(&remote);
        }
        Ok(alive)
    }

    /// Announce our departure to the network.
    ///
    /// If `routing` is given, the quit message goes to the peers it finds; otherwise (or if it finds nobody) it goes to
    /// the current neighbours. Messages are sent in waves of at most `quit_parallelism`, each bounded by
    /// `quit_timeout_ms`. The returned future completes once every peer has been heard from or given up on, and
    /// records per-peer success. The node keeps running; call [`Node::halt`] afterwards to stop it.
    pub fn shutdown(&self, routing: Option<RoutingFuture>) -> ShutdownFuture {
        let future = ShutdownFuture::new();
        if let Some(routing) = &routing {
            future.set_future_routing(routing.clone());
        }
        let node = self.clone();
        let composite = future.clone();
        self.inner.runtime.spawn(async move {
            node.announce_quit(routing, &composite).await;
            composite.set_done();
        });
        future
    }

    async fn announce_quit(&self, routing: Option<RoutingFuture>, future: &ShutdownFuture) {
        let peers = self.quit_recipients(routing).await;
        if peers.is_empty() {
            debug!("Nobody to notify about the departure of {}", self.address());
            return;
        }
        let wave = peers.len().min(self.inner.config.quit_parallelism).min(self.inner.reservation.budget());
        let acquired = async {
            let held = self.hold(wave)?;
            let creator = held.granted().await?;
            Ok::<_, NodeError>((held, creator))
        };
        let (held, creator) = match acquired.await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!("Could not reserve connections to announce departure of {}: {e}", self.address());
                peers.iter().for_each(|p| future.report(*p, false));
                return;
            }
        };
        info!("{} is leaving; notifying {} peer(s), {wave} at a time", self.address(), peers.len());
        let quit = QuitRpc::new(self.address());
        for batch in peers.chunks(wave) {
            let mut in_flight = Vec::with_capacity(batch.len());
            for peer in batch {
                match quit.quit(*peer, &creator) {
                    Ok(request) => {
                        future.add_requests(request.clone());
                        in_flight.push(request);
                    }
                    Err(e) => {
                        warn!("Could not send quit to {peer}: {e}");
                        future.report(*peer, false);
                    }
                }
            }
            // Every quit in the wave went out together, so they share one deadline.
            let deadline = Instant::now() + self.inner.config.quit_timeout();
            for request in in_flight {
                let delivered = await_quit(&request, deadline).await;
                future.report(*request.recipient(), delivered);
            }
        }
        if let Err(e) = held.release() {
            warn!("Could not release quit connections: {e}");
        }
    }

    async fn quit_recipients(&self, routing: Option<RoutingFuture>) -> Vec<PeerAddress> {
        if let Some(routing) = routing {
            match &*routing.completion().await {
                Outcome::Success(result) if !result.is_empty() => return result.peers().to_vec(),
                Outcome::Success(_) => debug!("Routing found no peers; notifying neighbours instead"),
                Outcome::Failed(reason) => warn!("Routing failed ({reason}); notifying neighbours instead"),
                Outcome::Cancelled => debug!("Routing was cancelled; notifying neighbours instead"),
            }
        }
        self.neighbours()
    }

    /// Stop the node: leave the network, deny queued reservations and close every open channel. Returns the number of
    /// creators that were still held and had to be force-released. Only the first call does anything.
    pub fn halt(&self) -> usize {
        if self.inner.halted.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.inner.network.unregister(&self.address());
        let released = self.inner.reservation.shutdown();
        info!("Node {} halted", self.address());
        released
    }
}

async fn await_quit(request: &ResponseFuture, deadline: Instant) -> bool {
    match tokio::time::timeout_at(deadline, request.completion()).await {
        Ok(outcome) => outcome.is_success(),
        Err(_) => {
            debug!("Giving up on quit to {}", request.recipient());
            request.cancel();
            false
        }
    }
}

/// A reservation held on behalf of an async caller. If the caller goes away, a pending request is cancelled and a
/// granted creator is released.
struct HeldReservation<'a> {
    reservation: &'a ConnectionReservation,
    future: FutureChannelCreator,
    armed: bool,
}

impl HeldReservation<'_> {
    async fn granted(&self) -> Result<ChannelCreator, NodeError> {
        match &*self.future.completion().await {
            Outcome::Success(creator) => Ok(creator.clone()),
            Outcome::Failed(denied) => Err((*denied).into()),
            Outcome::Cancelled => Err(NodeError::ReservationCancelled),
        }
    }

    /// Hand the creator over to the caller.
    fn disarm(mut self) {
        self.armed = false;
    }

    fn release(mut self) -> Result<(), NodeError> {
        self.armed = false;
        if let Some(creator) = self.future.result() {
            self.reservation.release(&creator)?;
        }
        Ok(())
    }
}

impl Drop for HeldReservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // A grant racing with this cancel is reclaimed by the pool.
        if self.future.cancel() {
            debug!("Withdrew an abandoned reservation");
            return;
        }
        if let Some(creator) = self.future.result() {
            debug!("Releasing abandoned {}", creator.id());
            if let Err(e) = self.reservation.release(&creator) {
                warn!("Could not release abandoned {}: {e}", creator.id());
            }
        }
    }
}

/// Answers requests addressed to a node.
struct NodeHandler {
    address: PeerAddress,
    neighbours: Neighbours,
}

impl RequestHandler for NodeHandler {
    fn handle(&self, kind: ChannelKind, request: &Message) -> Reply {
        let sender = *request.sender();
        match request.kind() {
            MessageKind::Ping => {
                trace!("{} answering {kind} ping from {sender}", self.address);
                Reply::Message(Message::new(MessageKind::Pong, self.address))
            }
            MessageKind::Quit => {
                if self.neighbours.write().remove(&sender) {
                    debug!("{sender} left; removed from the neighbours of {}", self.address);
                }
                Reply::Message(Message::new(MessageKind::Ack, self.address))
            }
            MessageKind::Data => Reply::Empty,
            MessageKind::Pong | MessageKind::Ack => {
                warn!("{} got an unsolicited {} from {sender}", self.address, request.kind());
                Reply::Malformed
            }
        }
    }
}
