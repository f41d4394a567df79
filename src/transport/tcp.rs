//! TCP transport: outbound dialer and inbound listener

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::common::{Address, Destination, IntoStream, RequestScope, Result, Stream};
use crate::error::Error;

use super::sockopt::{self, SocketConfig};
use super::tls::DEFAULT_ALPN;
use super::{resolve, StreamSettings, TransportDialer, TransportProtocol};

/// TCP dialer - raw TCP connections, optionally wrapped in TLS
pub struct TcpDialer;

impl TcpDialer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportDialer for TcpDialer {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }

    async fn dial(&self, _scope: &RequestScope, dest: &Destination, settings: &StreamSettings) -> Result<Stream> {
        let addr = resolve(&dest.address).await?;
        let stream = sockopt::dial_tcp(addr, &settings.sockopt)
            .await
            .map_err(|e| Error::DialFailed(format!("{}: {}", dest, e)))?;
        debug!("[tcp] dialing TCP to {}", dest);

        match &settings.tls {
            Some(tls) => {
                let stream = tls.connect(&dest.address, stream.into_stream(), DEFAULT_ALPN).await?;
                Ok(stream.into_stream())
            }
            None => Ok(stream.into_stream()),
        }
    }
}

/// One accepted inbound TCP connection
pub struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Where the client originally sent the connection, when it was redirected
    pub original_destination: Option<SocketAddr>,
}

/// TCP listener with inbound socket options applied
pub struct TcpInbound {
    listener: TcpListener,
    sockopt: SocketConfig,
}

impl TcpInbound {
    pub async fn bind(addr: &Address, sockopt: SocketConfig) -> Result<Self> {
        let socket_addr = addr
            .as_socket()
            .ok_or_else(|| Error::Config("Cannot bind to domain address".into()))?;

        let listener = sockopt::bind_tcp_listener(socket_addr, &sockopt)?;
        Ok(Self { listener, sockopt })
    }

    pub async fn accept(&self) -> Result<Accepted> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;

        let original_destination = match sockopt::lookup_original_destination(&stream, &self.sockopt) {
            Ok(addr) => addr,
            Err(e) => {
                debug!("[tcp] original destination lookup failed for {}: {}", peer, e);
                None
            }
        };

        Ok(Accepted {
            stream,
            peer,
            original_destination,
        })
    }

    pub fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(self.listener.local_addr()?))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_dial_through_inbound() {
        let inbound = TcpInbound::bind(&Address::from(("127.0.0.1", 0)), SocketConfig::default())
            .await
            .unwrap();
        let local = inbound.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut accepted = inbound.accept().await.unwrap();
            assert_eq!(accepted.original_destination, None);
            let mut buf = [0u8; 4];
            accepted.stream.read_exact(&mut buf).await.unwrap();
            accepted.stream.write_all(&buf).await.unwrap();
        });

        let mut stream = TcpDialer::new()
            .dial(&RequestScope::default(), &Destination::tcp(local), &StreamSettings::default())
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpDialer::new()
            .dial(&RequestScope::default(), &Destination::tcp(addr), &StreamSettings::default())
            .await;
        assert!(matches!(result, Err(Error::DialFailed(_))));
    }

    #[tokio::test]
    async fn test_bind_domain_rejected() {
        let result = TcpInbound::bind(&Address::domain("localhost", 0), SocketConfig::default()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
