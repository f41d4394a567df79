//! QUIC transport
//!
//! Outbound streams are bidirectional QUIC streams on sessions managed by a
//! [`StreamMultiplexer`]. Each session owns its endpoint and UDP socket.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tracing::debug;

use crate::common::{Destination, Host, IntoStream, RequestScope, Result, Stream};
use crate::error::Error;

use super::key::DestinationKey;
use super::mux::{MuxSession, SessionDialer, StreamMultiplexer};
use super::pool::Pooled;
use super::sockopt;
use super::tls::{TlsSettings, DEFAULT_ALPN};
use super::{resolve, StreamSettings, TransportDialer, TransportProtocol};

const HANDSHAKE_IDLE_TIMEOUT: Duration = Duration::from_secs(8);
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(15);

/// Server name presented when no TLS settings are configured
const INTERNAL_DOMAIN: &str = "localhost";

pub struct QuicStream {
    send_stream: SendStream,
    recv_stream: RecvStream,
}

impl QuicStream {
    pub fn new(send_stream: SendStream, recv_stream: RecvStream) -> Self {
        Self {
            send_stream,
            recv_stream,
        }
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.recv_stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.send_stream)
            .poll_write(cx, buf)
            .map_err(|err| err.into())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // this is a no-op, so return ready directly
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.send_stream).poll_shutdown(cx)
    }
}

/// One QUIC connection together with the endpoint that owns its socket
pub struct QuicSession {
    connection: quinn::Connection,
    endpoint: quinn::Endpoint,
}

impl Pooled for QuicSession {
    fn is_alive(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    fn close(&self) {
        self.connection.close(0u32.into(), b"");
        self.endpoint.close(0u32.into(), b"");
    }
}

#[async_trait]
impl MuxSession for QuicSession {
    async fn open_stream(&self) -> Result<Stream> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| Error::Protocol(format!("failed to open quic stream: {}", e)))?;
        Ok(QuicStream::new(send, recv).into_stream())
    }
}

fn client_config(tls: &TlsSettings) -> Result<quinn::ClientConfig> {
    let crypto = QuicClientConfig::try_from(tls.client_config(DEFAULT_ALPN)?)
        .map_err(|e| Error::Config(format!("TLS configuration unusable for quic: {}", e)))?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_PERIOD));
    if let Ok(idle) = MAX_IDLE_TIMEOUT.try_into() {
        transport.max_idle_timeout(Some(idle));
    }
    config.transport_config(Arc::new(transport));
    Ok(config)
}

/// Dials QUIC sessions for the multiplexer
struct QuicSessionDialer;

#[async_trait]
impl SessionDialer<QuicSession> for QuicSessionDialer {
    async fn dial_session(&self, key: &DestinationKey) -> Result<QuicSession> {
        let dest = &key.destination;
        let remote = resolve(&dest.address).await?;
        let tls = key.tls.clone().unwrap_or_else(|| TlsSettings::insecure(INTERNAL_DOMAIN));
        let server_name = match (&tls.server_name, dest.address.host()) {
            (Some(name), _) => name.clone(),
            (None, Host::Domain(domain)) => domain,
            (None, Host::Ip(ip)) => ip.to_string(),
        };

        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = sockopt::bind_udp(local, &key.sockopt, false)?.into_std()?;

        let endpoint = quinn::Endpoint::new(
            quinn::EndpointConfig::default(),
            None,
            socket,
            Arc::new(quinn::TokioRuntime),
        )?;

        debug!("[quic] dialing QUIC to {}", dest);
        let connecting = endpoint
            .connect_with(client_config(&tls)?, remote, &server_name)
            .map_err(|e| Error::DialFailed(format!("{}: {}", dest, e)))?;

        let connection = match timeout(HANDSHAKE_IDLE_TIMEOUT, connecting).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                endpoint.close(0u32.into(), b"");
                return Err(Error::DialFailed(format!("{}: {}", dest, e)));
            }
            Err(_) => {
                endpoint.close(0u32.into(), b"");
                return Err(Error::DialFailed(format!("{}: handshake timed out", dest)));
            }
        };

        Ok(QuicSession { connection, endpoint })
    }
}

/// QUIC dialer
pub struct QuicDialer {
    mux: StreamMultiplexer<QuicSession>,
}

impl QuicDialer {
    /// Must be called within a tokio runtime.
    pub fn new() -> Self {
        Self {
            mux: StreamMultiplexer::new("quic", Arc::new(QuicSessionDialer)),
        }
    }
}

impl Default for QuicDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportDialer for QuicDialer {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Quic
    }

    async fn dial(&self, _scope: &RequestScope, dest: &Destination, settings: &StreamSettings) -> Result<Stream> {
        let key = settings.key_for(dest);
        self.mux.open_stream(&key).await
    }

    async fn close(&self) {
        self.mux.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_accepts_default_identity() {
        assert!(client_config(&TlsSettings::insecure(INTERNAL_DOMAIN)).is_ok());
    }

    #[test]
    fn test_streams_are_unpin() {
        fn assert_unpin<T: Unpin + Send>() {}
        assert_unpin::<QuicStream>();
    }
}
