//! DestinationKey - identity of a pooled transport connection

use crate::common::Destination;

use super::sockopt::SocketConfig;
use super::tls::TlsSettings;

/// Cache key for pooled connections.
///
/// Every field participates in equality: the same destination dialed with
/// different socket options or TLS identity is a different pooled resource.
/// Domains are compared as written, never resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    pub destination: Destination,
    pub sockopt: SocketConfig,
    pub tls: Option<TlsSettings>,
}

impl DestinationKey {
    pub fn new(destination: Destination, sockopt: SocketConfig, tls: Option<TlsSettings>) -> Self {
        Self {
            destination,
            sockopt,
            tls,
        }
    }
}

impl std::fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.destination)?;
        if self.tls.is_some() {
            write!(f, " (tls)")?;
        }
        Ok(())
    }
}
