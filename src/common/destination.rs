//! Destination - an address together with the network it is reached over

use serde::{Deserialize, Serialize};

use super::address::{Address, Host};

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl Default for Network {
    fn default() -> Self {
        Network::Tcp
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Where a flow is headed: network plus host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
}

impl Destination {
    pub fn new(network: Network, address: Address) -> Self {
        Self { network, address }
    }

    pub fn tcp(address: impl Into<Address>) -> Self {
        Self::new(Network::Tcp, address.into())
    }

    pub fn udp(address: impl Into<Address>) -> Self {
        Self::new(Network::Udp, address.into())
    }

    /// Same port and network, different host.
    pub fn with_host(&self, host: Host) -> Self {
        Self::new(self.network, Address::from_host(host, self.address.port()))
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}
