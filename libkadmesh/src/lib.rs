//! Concurrency and resource-management core of a kadmesh DHT node.
//!
//! * [`future`]: one-shot completion handles ([`future::BaseFuture`]) and the futures built on them: RPC responses,
//!   routing lookups and the shutdown composite.
//! * [`connection`]: the node-wide [`connection::ConnectionReservation`] that bounds outbound connections, the
//!   [`connection::ChannelCreator`]s it hands out and the [`connection::Transport`] seam below them.

pub mod connection;
pub mod future;
pub mod message;
pub mod peer_address;

#[cfg(test)]
mod tests;

pub use message::{Message, MessageKind};
pub use peer_address::PeerAddress;
