use crate::delegate_future;
use crate::future::{BaseFuture, ResponseFuture, RoutingFuture};
use crate::peer_address::PeerAddress;
use log::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

#[derive(Default)]
struct ShutdownState {
    // The routing phase that ran before the quit messages went out, if there was one.
    routing: Option<RoutingFuture>,
    status: HashMap<PeerAddress, bool>,
    requests: Vec<ResponseFuture>,
    sealed: bool,
}

/// The join point of a node shutdown.
///
/// Shutting down sends a quit message to potentially many peers, optionally after a routing phase that decides who
/// those peers are. This future collects the quit requests and the per-peer outcome of each one. It does not wait on
/// any of them by itself: the shutdown procedure calls [`ShutdownFuture::set_done`] once it has seen everything it
/// wants to see. Individual failures do not fail the composite; they are recorded in [`ShutdownFuture::status`].
#[derive(Clone, Default)]
pub struct ShutdownFuture {
    inner: BaseFuture<(), Infallible>,
    state: Arc<Mutex<ShutdownState>>,
}

delegate_future!(ShutdownFuture, inner, (), Infallible);

impl ShutdownFuture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn future_routing(&self) -> Option<RoutingFuture> {
        self.state.lock().routing.clone()
    }

    pub fn set_future_routing(&self, routing: RoutingFuture) {
        self.state.lock().routing = Some(routing);
    }

    /// Track a quit request. Requests may already be resolved when they are added.
    pub fn add_requests(&self, request: ResponseFuture) {
        let mut state = self.state.lock();
        if state.sealed || self.inner.is_completed() {
            warn!("Ignoring {request:?}: shutdown has already completed");
            return;
        }
        state.requests.push(request);
    }

    /// Record whether the quit message to `recipient` got through. Reporting the same peer twice keeps the last
    /// value.
    pub fn report(&self, recipient: PeerAddress, success: bool) {
        let mut state = self.state.lock();
        if state.sealed || self.inner.is_completed() {
            warn!("Ignoring report for {recipient}: shutdown has already completed");
            return;
        }
        if let Some(previous) = state.status.insert(recipient, success) {
            debug!("Status for {recipient} reported twice ({previous} -> {success})");
        }
    }

    /// Mark the shutdown as done and notify listeners. Only the first call has an effect.
    pub fn set_done(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.sealed {
                return false;
            }
            state.sealed = true;
        }
        self.inner.succeed(())
    }

    pub fn status(&self) -> HashMap<PeerAddress, bool> {
        self.state.lock().status.clone()
    }

    pub fn requests(&self) -> Vec<ResponseFuture> {
        self.state.lock().requests.clone()
    }

    pub fn success_count(&self) -> usize {
        self.state.lock().status.values().filter(|ok| **ok).count()
    }

    pub fn failure_count(&self) -> usize {
        self.state.lock().status.values().filter(|ok| !**ok).count()
    }
}

impl Debug for ShutdownFuture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "ShutdownFuture({}, {} request(s), {} report(s))",
            self.inner.state(),
            state.requests.len(),
            state.status.len()
        )
    }
}
