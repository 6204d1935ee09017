//! A kadmesh node on an in-process network.
//!
//! [`Node`] ties the connection reservation and futures from `libkadmesh` to a configuration file, the handshake and
//! quit RPCs, and an orderly shutdown. [`LoopbackNetwork`] is the transport: it runs every node of a simulated
//! network inside one tokio runtime.

pub mod config;
pub mod errors;
pub mod loopback;
mod node;
pub mod rpc;

pub use config::NodeConfig;
pub use errors::{ConfigError, NodeError};
pub use loopback::{LoopbackNetwork, LoopbackOptions, Reply, RequestHandler};
pub use node::Node;
pub use rpc::{HandshakeRpc, QuitRpc};
