//! Outbound channels and the permit budget that bounds them.

mod channel;
mod creator;
#[cfg(test)]
pub(crate) mod dummy_transport;
mod error;
mod reservation;
mod transport;

pub use channel::{Channel, ChannelCloser, ChannelId, ChannelKind};
pub use creator::{ChannelCreator, CreatorId, ReleaseState};
pub use error::{ChannelCreatorError, ReservationDenied, ReservationError, TransportError};
pub use reservation::{ConnectionReservation, FutureChannelCreator};
pub use transport::{Transport, TransportLink};
