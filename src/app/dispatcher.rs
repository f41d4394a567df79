//! Dispatcher - hands a destination to an outbound and returns its Link
//!
//! ```text
//! Door.process()
//!      ↓
//! Dispatcher.dispatch(scope, destination) → Link
//!      ↓
//! DialerRegistry.dial()  (tcp / http / grpc / quic)
//!      ↓
//! bridge task: Link ⇄ outbound stream / UDP socket
//! ```
//!
//! The bridge runs on its own task and stops when the request scope is
//! cancelled or either side fails.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::buffer::chunk;
use crate::common::{Destination, Link, Network, Packet, RequestScope, Result, Stream};
use crate::error::Error;
use crate::transport::{resolve, sockopt, DialerRegistry, StreamSettings};

const MAX_DATAGRAM: usize = 64 * 1024;

/// Turns a destination into a Link to it
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, scope: &RequestScope, destination: Destination) -> Result<Link>;
}

/// Freedom-style outbound: dials the destination itself, or a fixed tunnel
/// server through the configured transport.
pub struct DirectDispatcher {
    tag: String,
    registry: Arc<DialerRegistry>,
    stream_settings: StreamSettings,
    tunnel: Option<Destination>,
}

impl DirectDispatcher {
    pub fn new(tag: impl Into<String>, registry: Arc<DialerRegistry>, stream_settings: StreamSettings) -> Self {
        Self {
            tag: tag.into(),
            registry,
            stream_settings,
            tunnel: None,
        }
    }

    /// Carry every TCP flow to `server` instead of its own destination.
    pub fn with_tunnel(mut self, server: Destination) -> Self {
        self.tunnel = Some(server);
        self
    }

    async fn dispatch_stream(&self, scope: &RequestScope, destination: Destination) -> Result<Link> {
        let target = self.tunnel.clone().unwrap_or_else(|| destination.clone());
        let stream = self.registry.dial(scope, &target, &self.stream_settings).await?;

        info!(
            "[{}] {} -> {} via [{}] ({})",
            scope.inbound_tag,
            source_of(scope),
            destination,
            self.tag,
            self.stream_settings.network
        );

        let (inbound, outbound) = Link::pair();
        let context = BridgeContext::new(scope, destination);
        tokio::spawn(async move {
            let (up, down, result) = bridge_stream(&context.cancel, &outbound, stream, context.buffer_size).await;
            context.finish(&outbound, up, down, result);
        });
        Ok(inbound)
    }

    async fn dispatch_packets(&self, scope: &RequestScope, destination: Destination) -> Result<Link> {
        if self.tunnel.is_some() {
            return Err(Error::Unsupported("udp through a stream tunnel".into()));
        }

        let remote = resolve(&destination.address).await?;
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = sockopt::bind_udp(local, &self.stream_settings.sockopt, false)?;

        info!(
            "[{}] {} -> {} via [{}] (udp)",
            scope.inbound_tag,
            source_of(scope),
            destination,
            self.tag
        );

        let (inbound, outbound) = Link::pair();
        let context = BridgeContext::new(scope, destination);
        tokio::spawn(async move {
            let (up, down, result) = bridge_packets(&context.cancel, &outbound, socket, remote).await;
            context.finish(&outbound, up, down, result);
        });
        Ok(inbound)
    }
}

#[async_trait]
impl Dispatcher for DirectDispatcher {
    async fn dispatch(&self, scope: &RequestScope, destination: Destination) -> Result<Link> {
        match destination.network {
            Network::Tcp => self.dispatch_stream(scope, destination).await,
            Network::Udp => self.dispatch_packets(scope, destination).await,
        }
    }
}

fn source_of(scope: &RequestScope) -> String {
    scope
        .source
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string())
}

struct BridgeContext {
    cancel: CancellationToken,
    tag: String,
    destination: Destination,
    buffer_size: usize,
    start: Instant,
}

impl BridgeContext {
    fn new(scope: &RequestScope, destination: Destination) -> Self {
        Self {
            cancel: scope.cancel.clone(),
            tag: scope.inbound_tag.clone(),
            destination,
            buffer_size: scope.buffer_size.max(1),
            start: Instant::now(),
        }
    }

    fn finish(&self, link: &Link, up: u64, down: u64, result: Result<()>) {
        if let Err(e) = result {
            if !e.is_closed() {
                debug!("[{}] outbound to {} failed: {}", self.tag, self.destination, e);
            }
            link.interrupt();
        }
        debug!(
            "[{}] Closed: {} (↑{} ↓{} {:?})",
            self.tag,
            self.destination,
            format_bytes(up),
            format_bytes(down),
            self.start.elapsed()
        );
    }
}

// ============================================================================
// Bridges
// ============================================================================

/// Copy between the outbound side of a Link and a byte stream.
async fn bridge_stream(cancel: &CancellationToken, link: &Link, stream: Stream, buffer_size: usize) -> (u64, u64, Result<()>) {
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let mut up: u64 = 0;
    let mut down: u64 = 0;

    let uplink = async {
        while let Some(mb) = link.reader.read_multi_buffer().await? {
            for packet in mb {
                write_half.write_all(&packet.payload).await?;
                up += packet.payload.len() as u64;
            }
            write_half.flush().await?;
        }
        // client finished sending
        write_half.shutdown().await?;
        Ok::<_, Error>(())
    };

    let downlink = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = read_half.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            down += n as u64;
            link.writer.write_multi_buffer(chunk(&buf[..n])).await?;
        }
        link.writer.close();
        Ok::<_, Error>(())
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        r = async { tokio::try_join!(uplink, downlink) } => r.map(|_| ()),
    };
    (up, down, result)
}

/// Copy between the outbound side of a Link and one UDP socket.
///
/// Packets without an endpoint go to `remote`; replies carry their source.
/// Runs until cancelled or an error; the end of the uplink does not stop
/// replies.
async fn bridge_packets(
    cancel: &CancellationToken,
    link: &Link,
    socket: UdpSocket,
    remote: SocketAddr,
) -> (u64, u64, Result<()>) {
    let mut up: u64 = 0;
    let mut down: u64 = 0;
    let socket = &socket;

    let uplink = async {
        while let Some(mb) = link.reader.read_multi_buffer().await? {
            for packet in mb {
                let target = match &packet.endpoint {
                    Some(endpoint) => resolve(&endpoint.address).await?,
                    None => remote,
                };
                socket.send_to(&packet.payload, target).await?;
                up += packet.payload.len() as u64;
            }
        }
        Ok::<_, Error>(())
    };

    let downlink = receive_replies(socket, link, &mut down);

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        r = async { tokio::try_join!(uplink, downlink) } => r.map(|_| ()),
    };
    (up, down, result)
}

async fn receive_replies(socket: &UdpSocket, link: &Link, down: &mut u64) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        *down += n as u64;
        let packet = Packet::with_endpoint(Bytes::copy_from_slice(&buf[..n]), Destination::udp(from));
        link.writer.write_multi_buffer(vec![packet]).await?;
    }
}

// ============================================================================
// Utilities
// ============================================================================

/// Format bytes in human-readable form
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use crate::transport::TcpDialer;
    use tokio::net::TcpListener;

    fn dispatcher() -> DirectDispatcher {
        let mut registry = DialerRegistry::new();
        registry.register(Arc::new(TcpDialer::new()));
        DirectDispatcher::new("direct", Arc::new(registry), StreamSettings::default())
    }

    #[tokio::test]
    async fn test_tcp_bridge_echo_and_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            conn.read_to_end(&mut data).await.unwrap();
            conn.write_all(&data).await.unwrap();
        });

        let scope = RequestScope::default().with_inbound_tag("test");
        let link = dispatcher().dispatch(&scope, Destination::tcp(addr)).await.unwrap();

        link.writer.write_multi_buffer(chunk(b"hello")).await.unwrap();
        link.writer.close();

        let mut reply = Vec::new();
        while let Some(mb) = link.reader.read_multi_buffer().await.unwrap() {
            for packet in mb {
                reply.extend_from_slice(&packet.payload);
            }
        }
        assert_eq!(reply, b"hello");
    }

    #[tokio::test]
    async fn test_tcp_dial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = dispatcher().dispatch(&RequestScope::default(), Destination::tcp(addr)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_udp_replies_carry_source() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], from).await.unwrap();
        });

        let scope = RequestScope::default();
        let link = dispatcher().dispatch(&scope, Destination::udp(addr)).await.unwrap();
        link.writer.write_multi_buffer(vec![Packet::new(&b"ping"[..])]).await.unwrap();

        let mb = link.reader.read_multi_buffer().await.unwrap().unwrap();
        assert_eq!(&mb[0].payload[..], b"ping");
        assert_eq!(mb[0].endpoint, Some(Destination::udp(addr)));

        scope.cancel.cancel();
    }

    #[tokio::test]
    async fn test_udp_rejected_through_tunnel() {
        let dispatcher = dispatcher().with_tunnel(Destination::tcp(Address::domain("relay.example", 443)));
        let result = dispatcher
            .dispatch(&RequestScope::default(), Destination::udp(Address::domain("dns.example", 53)))
            .await;
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00MB");
    }
}
