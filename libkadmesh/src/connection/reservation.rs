//! Admission control for outbound connections.
//!
//! A node has a fixed budget of simultaneously open outbound channels. Operations ask for a share of it with
//! [`ConnectionReservation::reserve`] and get back a future that resolves to a [`ChannelCreator`] once enough permits
//! are free. Requests are served strictly in arrival order: a large request at the head of the queue blocks smaller
//! ones behind it even when those would fit. This keeps large reservations from starving under a steady stream of
//! small ones, at the price of head-of-line blocking.

use crate::connection::{ChannelCreator, CreatorId, ReleaseState, ReservationDenied, ReservationError, Transport};
use crate::future::{BaseFuture, Outcome};
use log::*;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Resolves to a [`ChannelCreator`] once the reservation is granted.
pub type FutureChannelCreator = BaseFuture<ChannelCreator, ReservationDenied>;

type Grant = (FutureChannelCreator, ChannelCreator);

struct PendingReservation {
    id: u64,
    permits: usize,
    future: FutureChannelCreator,
}

#[derive(Default)]
struct ReservationState {
    used: usize,
    queue: VecDeque<PendingReservation>,
    live: HashMap<CreatorId, ChannelCreator>,
    shutting_down: bool,
    next_request: u64,
}

struct ReservationShared {
    budget: usize,
    transport: Arc<dyn Transport>,
    state: Mutex<ReservationState>,
}

/// The node-wide pool of outbound connection permits.
///
/// One instance is created at node start-up and passed to everything that issues RPCs. Cloning it is cheap and
/// shares the pool.
#[derive(Clone)]
pub struct ConnectionReservation {
    shared: Arc<ReservationShared>,
}

impl ConnectionReservation {
    pub fn new(budget: usize, transport: Arc<dyn Transport>) -> Self {
        let shared = ReservationShared { budget, transport, state: Mutex::new(ReservationState::default()) };
        Self { shared: Arc::new(shared) }
    }

    /// Ask for `permits` channels.
    ///
    /// Never blocks. If the queue is empty and the permits are free, the returned future is already granted.
    /// Otherwise the request waits behind earlier ones until releases free enough capacity. Cancelling the returned
    /// future withdraws the request.
    pub fn reserve(&self, permits: usize) -> FutureChannelCreator {
        let budget = self.shared.budget;
        if permits == 0 {
            return FutureChannelCreator::completed(Outcome::Failed(ReservationDenied::InvalidPermits));
        }
        if permits > budget {
            warn!("Reservation of {permits} permits can never be granted with a budget of {budget}");
            return FutureChannelCreator::completed(Outcome::Failed(ReservationDenied::ExceedsBudget {
                requested: permits,
                budget,
            }));
        }
        let future = FutureChannelCreator::new();
        let request_id = {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                drop(state);
                warn!("Reservation of {permits} permits denied: connection pool is shutting down");
                future.fail(ReservationDenied::ShuttingDown);
                return future;
            }
            if state.queue.is_empty() && state.used + permits <= budget {
                let creator = self.shared.grant(&mut state, permits);
                drop(state);
                debug!("Reserved {permits} permit(s) immediately for {}", creator.id());
                future.succeed(creator);
                return future;
            }
            let id = state.next_request;
            state.next_request += 1;
            state.queue.push_back(PendingReservation { id, permits, future: future.clone() });
            debug!("Queued reservation of {permits} permit(s). {} request(s) waiting", state.queue.len());
            id
        };
        let weak = Arc::downgrade(&self.shared);
        future.add_listener(move |outcome| {
            if matches!(outcome, Outcome::Cancelled) {
                if let Some(shared) = weak.upgrade() {
                    shared.withdraw(request_id);
                }
            }
        });
        future
    }

    /// Give a creator's permits back to the pool.
    ///
    /// All of the creator's channels are closed first. Queued requests are then granted from the head of the queue
    /// for as long as they fit. Releasing the same creator twice is a bug in the caller and is reported as
    /// [`ReservationError::AlreadyReleased`]; the permits are only ever credited once. Creators that were
    /// force-released by [`Self::shutdown`] may still be released by their owner.
    pub fn release(&self, creator: &ChannelCreator) -> Result<(), ReservationError> {
        if !self.shared.state.lock().live.contains_key(&creator.id()) {
            return self.not_live(creator);
        }
        creator.shutdown();
        let grants = {
            let mut state = self.shared.state.lock();
            if state.live.remove(&creator.id()).is_none() {
                drop(state);
                return self.not_live(creator);
            }
            state.used -= creator.permits();
            creator.mark_released(ReleaseState::Released);
            debug!("Released {} permit(s) from {}. {} in use", creator.permits(), creator.id(), state.used);
            self.shared.drain_queue(&mut state)
        };
        self.shared.complete_grants(grants);
        Ok(())
    }

    fn not_live(&self, creator: &ChannelCreator) -> Result<(), ReservationError> {
        match creator.release_state() {
            ReleaseState::ForceReleased => {
                trace!("{} was already released by the pool shutdown", creator.id());
                Ok(())
            }
            ReleaseState::Released => {
                error!("{} released twice. This is a bug in the caller", creator.id());
                Err(ReservationError::AlreadyReleased(creator.id()))
            }
            ReleaseState::Live => {
                error!("{} does not belong to this connection pool", creator.id());
                Err(ReservationError::UnknownCreator(creator.id()))
            }
        }
    }

    /// Deny every queued request with [`ReservationDenied::ShuttingDown`] and force-release every live creator.
    /// Later reservations are denied as well. Returns the number of creators that were force-released.
    pub fn shutdown(&self) -> usize {
        let (queued, live) = {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return 0;
            }
            state.shutting_down = true;
            state.used = 0;
            state.live.values().for_each(|creator| creator.mark_released(ReleaseState::ForceReleased));
            (std::mem::take(&mut state.queue), std::mem::take(&mut state.live))
        };
        info!(
            "Connection pool shutting down. Denying {} queued request(s), closing {} creator(s)",
            queued.len(),
            live.len()
        );
        for pending in queued {
            pending.future.fail(ReservationDenied::ShuttingDown);
        }
        for creator in live.values() {
            creator.shutdown();
        }
        live.len()
    }

    pub fn budget(&self) -> usize {
        self.shared.budget
    }

    pub fn used_permits(&self) -> usize {
        self.shared.state.lock().used
    }

    pub fn available_permits(&self) -> usize {
        self.shared.budget - self.shared.state.lock().used
    }

    pub fn pending_reservations(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn live_creators(&self) -> usize {
        self.shared.state.lock().live.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }
}

impl ReservationShared {
    fn grant(&self, state: &mut ReservationState, permits: usize) -> ChannelCreator {
        state.used += permits;
        let creator = ChannelCreator::new(permits, Arc::clone(&self.transport));
        state.live.insert(creator.id(), creator.clone());
        creator
    }

    /// Grant queued requests, head first, until the head no longer fits.
    fn drain_queue(&self, state: &mut ReservationState) -> Vec<Grant> {
        let mut grants = Vec::new();
        while let Some(head) = state.queue.front() {
            if head.future.is_completed() {
                // Cancelled, and its listener has not withdrawn it yet.
                state.queue.pop_front();
                continue;
            }
            let permits = head.permits;
            if state.used + permits > self.budget {
                break;
            }
            if let Some(head) = state.queue.pop_front() {
                let creator = self.grant(state, permits);
                grants.push((head.future, creator));
            }
        }
        grants
    }

    fn complete_grants(&self, grants: Vec<Grant>) {
        for (future, creator) in grants {
            debug!("Granted queued reservation of {} permit(s) to {}", creator.permits(), creator.id());
            if !future.succeed(creator.clone()) {
                debug!("{} was cancelled while being granted. Returning its permits", creator.id());
                self.reclaim(&creator);
            }
        }
    }

    fn reclaim(&self, creator: &ChannelCreator) {
        creator.shutdown();
        let grants = {
            let mut state = self.state.lock();
            if state.live.remove(&creator.id()).is_some() {
                state.used -= creator.permits();
                creator.mark_released(ReleaseState::Released);
            }
            self.drain_queue(&mut state)
        };
        self.complete_grants(grants);
    }

    fn withdraw(&self, request_id: u64) {
        let grants = {
            let mut state = self.state.lock();
            let before = state.queue.len();
            state.queue.retain(|pending| pending.id != request_id);
            if state.queue.len() < before {
                debug!("Withdrew cancelled reservation request {request_id}");
            }
            self.drain_queue(&mut state)
        };
        self.complete_grants(grants);
    }
}

impl Debug for ConnectionReservation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        write!(
            f,
            "ConnectionReservation({}/{} permits in use, {} queued)",
            state.used,
            self.shared.budget,
            state.queue.len()
        )
    }
}
