use crate::connection::{ChannelKind, CreatorId};
use crate::peer_address::PeerAddress;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Could not open a {kind} channel to {remote}. {reason}")]
    OpenFailed { kind: ChannelKind, remote: PeerAddress, reason: String },
    #[error("The transport has been shut down.")]
    Shutdown,
}

impl TransportError {
    pub fn open_failed(kind: ChannelKind, remote: PeerAddress, reason: impl Into<String>) -> Self {
        TransportError::OpenFailed { kind, remote, reason: reason.into() }
    }
}

/// Misuse of a [`crate::connection::ChannelCreator`]. These are returned synchronously and never retried.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelCreatorError {
    #[error("All {permits} reserved channel(s) of {creator} are in use.")]
    CapacityExceeded { creator: CreatorId, permits: usize },
    #[error("{0} has been shut down.")]
    Closed(CreatorId),
    #[error("Transport error. {0}")]
    Transport(#[from] TransportError),
}

/// Misuse of [`crate::connection::ConnectionReservation::release`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReservationError {
    #[error("{0} has already been released.")]
    AlreadyReleased(CreatorId),
    #[error("{0} was not reserved from this connection pool.")]
    UnknownCreator(CreatorId),
}

/// Why a reservation request will never be granted. Delivered as the failure of a
/// [`crate::connection::FutureChannelCreator`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationDenied {
    #[error("The connection pool is shutting down.")]
    ShuttingDown,
    #[error("Requested {requested} permits, but the total connection budget is {budget}.")]
    ExceedsBudget { requested: usize, budget: usize },
    #[error("A reservation needs at least one permit.")]
    InvalidPermits,
}
