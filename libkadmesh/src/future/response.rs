use crate::delegate_future;
use crate::future::BaseFuture;
use crate::message::Message;
use crate::peer_address::PeerAddress;
use log::*;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Why an RPC did not produce a response.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    #[error("The request timed out")]
    Timeout,
    #[error("The peer refused the connection")]
    ConnectionRefused,
    #[error("The peer sent a response that could not be decoded")]
    MalformedResponse,
    #[error("The peer could not be reached")]
    PeerUnreachable,
    #[error("The request was cancelled by the caller")]
    CancelledByCaller,
    #[error("The channel was closed before a response arrived")]
    ChannelClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RequestId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// One outbound request: who it goes to and what it says.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    id: RequestId,
    recipient: PeerAddress,
    message: Message,
}

impl Request {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn recipient(&self) -> &PeerAddress {
        &self.recipient
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}

/// A successful RPC outcome. Some RPCs are answered without a payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    responder: PeerAddress,
    message: Option<Message>,
}

impl Response {
    pub fn new(responder: PeerAddress, message: Option<Message>) -> Self {
        Self { responder, message }
    }

    pub fn responder(&self) -> &PeerAddress {
        &self.responder
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }
}

/// The future of a single outstanding RPC.
///
/// Every request that is handed to a transport must end in exactly one of success, failure or cancellation. The
/// transport completes it through [`ResponseFuture::response`] or [`ResponseFuture::failed`]; the channel fails it
/// with [`FailureReason::ChannelClosed`] if it dies first.
#[derive(Clone)]
pub struct ResponseFuture {
    request: Arc<Request>,
    inner: BaseFuture<Response, FailureReason>,
}

delegate_future!(ResponseFuture, inner, Response, FailureReason);

impl ResponseFuture {
    pub fn new(recipient: PeerAddress, message: Message) -> Self {
        let request = Request { id: RequestId::next(), recipient, message };
        Self { request: Arc::new(request), inner: BaseFuture::new() }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn id(&self) -> RequestId {
        self.request.id
    }

    pub fn recipient(&self) -> &PeerAddress {
        &self.request.recipient
    }

    /// Complete the request with the reply from the recipient.
    ///
    /// Returns `false` if the future was already terminal, e.g. it timed out or the caller cancelled it. The reply
    /// is then dropped.
    pub fn response(&self, message: Option<Message>) -> bool {
        let won = self.inner.succeed(Response::new(self.request.recipient, message));
        if !won {
            debug!("Dropping late response for {} from {}: future is {}", self.id(), self.recipient(), self.state());
        }
        won
    }

    pub fn failed(&self, reason: FailureReason) -> bool {
        let won = self.inner.fail(reason);
        if won {
            trace!("{} to {} failed: {reason}", self.id(), self.recipient());
        }
        won
    }

    /// The failure reason, if the request did not succeed. A cancelled request reports
    /// [`FailureReason::CancelledByCaller`]; a pending or successful one reports `None`.
    pub fn failed_reason(&self) -> Option<FailureReason> {
        let outcome = self.inner.outcome()?;
        match &*outcome {
            crate::future::Outcome::Success(_) => None,
            crate::future::Outcome::Failed(reason) => Some(*reason),
            crate::future::Outcome::Cancelled => Some(FailureReason::CancelledByCaller),
        }
    }

    pub fn response_message(&self) -> Option<Message> {
        self.inner.result().and_then(|r| r.message)
    }

    pub fn same_as(&self, other: &ResponseFuture) -> bool {
        self.inner.same_as(&other.inner)
    }
}

impl Debug for ResponseFuture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResponseFuture({} to {}, {})", self.id(), self.recipient(), self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureState;
    use crate::message::MessageKind;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(port: u16) -> PeerAddress {
        PeerAddress::with_port(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn ping() -> Message {
        Message::new(MessageKind::Ping, peer(1))
    }

    #[test]
    fn request_ids_are_unique() {
        let a = ResponseFuture::new(peer(2), ping());
        let b = ResponseFuture::new(peer(2), ping());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.recipient(), &peer(2));
    }

    #[test]
    fn success_carries_payload() {
        let future = ResponseFuture::new(peer(2), ping());
        let pong = Message::new(MessageKind::Pong, peer(2)).with_payload(b"hi".to_vec());
        assert!(future.response(Some(pong.clone())));
        assert!(future.is_success());
        assert_eq!(future.failed_reason(), None);
        assert_eq!(future.response_message(), Some(pong));
    }

    #[test]
    fn late_response_after_timeout_is_dropped() {
        let future = ResponseFuture::new(peer(2), ping());
        assert!(future.failed(FailureReason::Timeout));
        assert!(!future.response(None));
        assert_eq!(future.state(), FutureState::Failed);
        assert_eq!(future.failed_reason(), Some(FailureReason::Timeout));
    }

    #[test]
    fn cancelled_reports_cancelled_by_caller() {
        let future = ResponseFuture::new(peer(2), ping());
        assert_eq!(future.failed_reason(), None);
        assert!(future.cancel());
        assert!(future.is_cancelled());
        assert_eq!(future.failed_reason(), Some(FailureReason::CancelledByCaller));
        // The reply still arrives, but nobody is interested any more.
        assert!(!future.response(None));
    }
}
