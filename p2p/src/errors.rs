use libkadmesh::connection::{ChannelCreatorError, ReservationDenied, ReservationError};
use libkadmesh::PeerAddress;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error reading/writing configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error de/encoding configuration: {0}")]
    Serde(#[from] serde_yml::Error),
    #[error("Invalid configuration. {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error. {0}")]
    Config(#[from] ConfigError),
    #[error("Could not reserve connections. {0}")]
    Denied(#[from] ReservationDenied),
    #[error("The reservation was cancelled before it was granted.")]
    ReservationCancelled,
    #[error("Channel creation failed. {0}")]
    Channel(#[from] ChannelCreatorError),
    #[error("Connection pool misuse. {0}")]
    Reservation(#[from] ReservationError),
    #[error("Another node is already listening on {0}.")]
    AddressInUse(PeerAddress),
    #[error("The node has been halted.")]
    Halted,
}
