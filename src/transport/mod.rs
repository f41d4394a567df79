//! Transport Layer
//!
//! Responsibilities:
//! - Establish outbound byte streams over tcp, http (h2), grpc and quic
//! - Cache expensive connections in a [`ConnectionPool`] / [`StreamMultiplexer`]
//! - Apply socket options and TLS, NO protocol parsing above the tunnel
//!
//! Dialers implement [`TransportDialer`] and are looked up through a
//! [`DialerRegistry`] keyed by [`TransportProtocol`].

mod grpc;
mod http;
pub mod key;
pub mod mux;
pub mod pool;
mod quic;
pub mod sockopt;
mod tcp;
pub mod tls;
pub mod udp;

pub use grpc::{GrpcDialer, GunStream};
pub use http::{H2Connection, H2Stream, HttpDialer};
pub use key::DestinationKey;
pub use mux::{MuxSession, SessionDialer, StreamMultiplexer};
pub use pool::{ConnectionPool, Evictor, PoolStats, Pooled};
pub use quic::{QuicDialer, QuicStream};
pub use sockopt::SocketConfig;
pub use tcp::{Accepted, TcpDialer, TcpInbound};
pub use tls::TlsSettings;
pub use udp::{PacketConn, UdpHub, UdpSession};

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::{Address, Destination, RequestScope, Result, Stream};
use crate::error::Error;

/// Wire transport carrying an outbound stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Http,
    Grpc,
    Quic,
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Http => "http",
            TransportProtocol::Grpc => "grpc",
            TransportProtocol::Quic => "quic",
        };
        f.write_str(name)
    }
}

/// HTTP/2 tunnel settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpSettings {
    /// Request path, normalized to a leading `/`
    pub path: String,
    /// Candidate `:authority` values, one picked at random per request
    pub host: Vec<String>,
    /// Request method, `PUT` when unset
    pub method: Option<String>,
    /// Extra request headers
    pub headers: BTreeMap<String, Vec<String>>,
}

impl HttpSettings {
    pub fn normalized_path(&self) -> String {
        if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        }
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("PUT")
    }
}

/// gRPC ("gun") tunnel settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
}

/// How an outbound stream is carried
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: TransportProtocol,
    pub tls: Option<TlsSettings>,
    pub sockopt: SocketConfig,
    pub http: HttpSettings,
    pub grpc: GrpcSettings,
}

impl StreamSettings {
    /// Pool key for dialing `dest` with these settings.
    pub fn key_for(&self, dest: &Destination) -> DestinationKey {
        DestinationKey::new(dest.clone(), self.sockopt.clone(), self.tls.clone())
    }
}

/// Dialer for one wire transport
#[async_trait]
pub trait TransportDialer: Send + Sync {
    fn protocol(&self) -> TransportProtocol;

    /// Establish a duplex stream to `dest`.
    async fn dial(&self, scope: &RequestScope, dest: &Destination, settings: &StreamSettings) -> Result<Stream>;

    /// Release cached connections.
    async fn close(&self) {}
}

/// Typed registry of transport dialers
#[derive(Default)]
pub struct DialerRegistry {
    dialers: HashMap<TransportProtocol, Arc<dyn TransportDialer>>,
}

impl DialerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in transport.
    ///
    /// Must be called within a tokio runtime (the quic multiplexer spawns its
    /// sweeper).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TcpDialer::new()));
        registry.register(Arc::new(HttpDialer::new()));
        registry.register(Arc::new(GrpcDialer::new()));
        registry.register(Arc::new(QuicDialer::new()));
        registry
    }

    pub fn register(&mut self, dialer: Arc<dyn TransportDialer>) {
        self.dialers.insert(dialer.protocol(), dialer);
    }

    pub fn get(&self, protocol: TransportProtocol) -> Option<Arc<dyn TransportDialer>> {
        self.dialers.get(&protocol).cloned()
    }

    /// Dial through the transport named by `settings`, bounded by the scope.
    pub async fn dial(&self, scope: &RequestScope, dest: &Destination, settings: &StreamSettings) -> Result<Stream> {
        let dialer = self
            .get(settings.network)
            .ok_or_else(|| Error::Unsupported(format!("transport {} is not registered", settings.network)))?;

        tokio::select! {
            _ = scope.cancel.cancelled() => Err(Error::Cancelled),
            stream = dialer.dial(scope, dest, settings) => stream,
        }
    }

    pub async fn close(&self) {
        for dialer in self.dialers.values() {
            dialer.close().await;
        }
    }
}

/// Resolve an address to one socket address. IPs pass through untouched.
pub async fn resolve(addr: &Address) -> Result<SocketAddr> {
    match addr {
        Address::Socket(s) => Ok(*s),
        Address::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| Error::DialFailed(format!("Failed to resolve {}", domain))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDialer(TransportProtocol);

    #[async_trait]
    impl TransportDialer for FixedDialer {
        fn protocol(&self) -> TransportProtocol {
            self.0
        }

        async fn dial(&self, _: &RequestScope, _: &Destination, _: &StreamSettings) -> Result<Stream> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_stream_settings_from_json() {
        let settings: StreamSettings = serde_json::from_str(
            r#"{
                "network": "grpc",
                "tls": { "serverName": "example.com" },
                "sockopt": { "mark": 255 },
                "grpc": { "serviceName": "tunnel" }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.network, TransportProtocol::Grpc);
        assert_eq!(settings.sockopt.mark, 255);
        assert_eq!(settings.grpc.service_name, "tunnel");
        assert_eq!(settings.tls.unwrap().server_name.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_http_defaults() {
        let http = HttpSettings {
            path: "tunnel".into(),
            ..Default::default()
        };
        assert_eq!(http.normalized_path(), "/tunnel");
        assert_eq!(http.method(), "PUT");
    }

    #[tokio::test]
    async fn test_unregistered_transport() {
        let registry = DialerRegistry::new();
        let settings = StreamSettings {
            network: TransportProtocol::Quic,
            ..Default::default()
        };
        let result = registry
            .dial(&RequestScope::default(), &Destination::tcp(Address::domain("a", 1)), &settings)
            .await;
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_dial_observes_cancellation() {
        let mut registry = DialerRegistry::new();
        registry.register(Arc::new(FixedDialer(TransportProtocol::Tcp)));

        let scope = RequestScope::default();
        scope.cancel.cancel();
        let result = registry
            .dial(&scope, &Destination::tcp(Address::domain("a", 1)), &StreamSettings::default())
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_resolve_ip_passthrough() {
        let addr: SocketAddr = "10.0.0.1:53".parse().unwrap();
        assert_eq!(resolve(&Address::Socket(addr)).await.unwrap(), addr);
    }
}
