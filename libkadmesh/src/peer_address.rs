use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// The network endpoint of a peer: one IP address with a TCP and a UDP port.
///
/// Addresses are plain values. The connection layer only compares and hashes them; it never looks at their byte
/// layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    ip: IpAddr,
    tcp_port: u16,
    udp_port: u16,
}

impl PeerAddress {
    pub fn new(ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self { ip, tcp_port, udp_port }
    }

    /// An address using the same port number for TCP and UDP.
    pub fn with_port(ip: IpAddr, port: u16) -> Self {
        Self::new(ip, port, port)
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip.is_ipv4()
    }

    pub fn tcp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PSA[{},t:{},u:{}]", self.ip, self.tcp_port, self.udp_port)
    }
}

impl Debug for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Invalid peer address '{input}'. Expected <ip>:<tcp port>:<udp port> or <ip>:<port>")]
pub struct InvalidPeerAddress {
    input: String,
}

/// Parses `<ip>:<tcp>:<udp>` or `<ip>:<port>`. IPv6 addresses must be bracketed, e.g. `[::1]:4000:4001`.
impl FromStr for PeerAddress {
    type Err = InvalidPeerAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidPeerAddress { input: s.to_string() };
        let (ip, ports) = if let Some(rest) = s.strip_prefix('[') {
            let (ip, ports) = rest.split_once("]:").ok_or_else(invalid)?;
            (ip, ports)
        } else {
            s.split_once(':').ok_or_else(invalid)?
        };
        let ip = IpAddr::from_str(ip).map_err(|_| invalid())?;
        let mut parts = ports.split(':');
        let tcp_port = parts.next().and_then(|p| p.parse::<u16>().ok()).ok_or_else(invalid)?;
        let udp_port = match parts.next() {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => tcp_port,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self::new(ip, tcp_port, udp_port))
    }
}
