use crate::errors::ConfigError;
use libkadmesh::PeerAddress;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 7700;

/// Node settings, usually kept in a YAML file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Where this node listens.
    pub address: PeerAddress,
    /// The maximum number of simultaneously open outbound channels. Fixed for the lifetime of the node.
    pub max_connections: usize,
    /// How many quit messages a shutdown sends at once.
    pub quit_parallelism: usize,
    /// How long a shutdown waits for each quit message before giving up on that peer.
    pub quit_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: PeerAddress::with_port(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            max_connections: 64,
            quit_parallelism: 8,
            quit_timeout_ms: 5_000,
        }
    }
}

impl NodeConfig {
    pub fn with_address(address: PeerAddress) -> Self {
        Self { address, ..Self::default() }
    }

    pub fn quit_timeout(&self) -> Duration {
        Duration::from_millis(self.quit_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::invalid("max_connections must be at least 1"));
        }
        if self.quit_parallelism == 0 {
            return Err(ConfigError::invalid("quit_parallelism must be at least 1"));
        }
        Ok(())
    }

    pub fn to_yml(&self) -> Result<String, ConfigError> {
        let s = serde_yml::to_string(self)?;
        Ok(s)
    }

    pub fn from_yml(text: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_yml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let text = self.to_yml()?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yml(&text)
    }
}
