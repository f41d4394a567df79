//! Shadowsocks inbound for the `none` method
//!
//! Without a cipher a shadowsocks stream is the target address in SOCKS5
//! form followed by raw payload, and every datagram carries the same header
//! in front of its payload. Streams reach the dispatcher through
//! [`LinkStream`], datagrams through [`LinkPacketConn`].
//!
//! Encrypted methods need a cipher implementation this crate does not ship;
//! [`check_server`] rejects them before anything is started.

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::app::{ActivityTimer, ConnectionIo, Dispatcher, InboundConnection, InboundHandler, Policy, PolicyManager};
use crate::common::{Address, Destination, Link, Network, RequestScope, Result, Stream};
use crate::config::{CipherType, ShadowsocksServer};
use crate::error::Error;
use crate::transport::PacketConn;

use super::adapter::{return_error, LinkPacketConn, LinkStream};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

fn needs_cipher(method: &str) -> Error {
    Error::Unsupported(format!("shadowsocks method {} needs an external cipher implementation", method))
}

/// Ok when this crate can serve `server` on its own.
pub fn check_server(server: &ShadowsocksServer) -> Result<()> {
    match server {
        ShadowsocksServer::Classic {
            cipher: CipherType::None,
            ..
        } => Ok(()),
        ShadowsocksServer::Classic { cipher, .. } => Err(needs_cipher(&format!("{:?}", cipher))),
        ShadowsocksServer::Aead2022 { method, .. } => Err(needs_cipher(method)),
    }
}

// ============================================================================
// Address header
// ============================================================================

/// Read a SOCKS5 style address from the head of a stream.
pub async fn read_address<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Address> {
    let atyp = reader.read_u8().await?;

    let address = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            reader.read_exact(&mut ip).await?;
            let port = reader.read_u16().await?;
            Address::Socket(SocketAddr::new(Ipv4Addr::from(ip).into(), port))
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await?;
            let mut domain = vec![0u8; usize::from(len)];
            reader.read_exact(&mut domain).await?;
            let port = reader.read_u16().await?;
            Address::Domain(String::from_utf8_lossy(&domain).into_owned(), port)
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            reader.read_exact(&mut ip).await?;
            let port = reader.read_u16().await?;
            Address::Socket(SocketAddr::new(Ipv6Addr::from(ip).into(), port))
        }
        other => return Err(Error::Protocol(format!("unknown address type: {:#04x}", other))),
    };
    Ok(address)
}

fn truncated() -> Error {
    Error::Protocol("truncated address header".into())
}

/// Split the address header off a datagram.
pub fn decode_packet(mut datagram: Bytes) -> Result<(Address, Bytes)> {
    if !datagram.has_remaining() {
        return Err(truncated());
    }

    let address = match datagram.get_u8() {
        ATYP_IPV4 => {
            if datagram.remaining() < 6 {
                return Err(truncated());
            }
            let mut ip = [0u8; 4];
            datagram.copy_to_slice(&mut ip);
            Address::Socket(SocketAddr::new(Ipv4Addr::from(ip).into(), datagram.get_u16()))
        }
        ATYP_DOMAIN => {
            if !datagram.has_remaining() {
                return Err(truncated());
            }
            let len = usize::from(datagram.get_u8());
            if datagram.remaining() < len + 2 {
                return Err(truncated());
            }
            let domain = datagram.split_to(len);
            Address::Domain(String::from_utf8_lossy(&domain).into_owned(), datagram.get_u16())
        }
        ATYP_IPV6 => {
            if datagram.remaining() < 18 {
                return Err(truncated());
            }
            let mut ip = [0u8; 16];
            datagram.copy_to_slice(&mut ip);
            Address::Socket(SocketAddr::new(Ipv6Addr::from(ip).into(), datagram.get_u16()))
        }
        other => return Err(Error::Protocol(format!("unknown address type: {:#04x}", other))),
    };
    Ok((address, datagram))
}

/// Append the address header for `address` to `out`.
pub fn write_address(address: &Address, out: &mut BytesMut) -> Result<()> {
    match address {
        Address::Socket(SocketAddr::V4(v4)) => {
            out.put_u8(ATYP_IPV4);
            out.put_slice(&v4.ip().octets());
            out.put_u16(v4.port());
        }
        Address::Socket(SocketAddr::V6(v6)) => {
            out.put_u8(ATYP_IPV6);
            out.put_slice(&v6.ip().octets());
            out.put_u16(v6.port());
        }
        Address::Domain(domain, port) => {
            let len = u8::try_from(domain.len())
                .map_err(|_| Error::Protocol(format!("domain too long: {}", domain)))?;
            out.put_u8(ATYP_DOMAIN);
            out.put_u8(len);
            out.put_slice(domain.as_bytes());
            out.put_u16(*port);
        }
    }
    Ok(())
}

// ============================================================================
// Inbound
// ============================================================================

pub struct ShadowsocksInbound {
    networks: Vec<Network>,
    level: u32,
    policy_manager: Arc<dyn PolicyManager>,
}

impl ShadowsocksInbound {
    /// Without explicit networks the inbound serves TCP, plus UDP when `udp`
    /// is set.
    pub fn new(server: ShadowsocksServer, policy_manager: Arc<dyn PolicyManager>) -> Result<Self> {
        check_server(&server)?;

        match server {
            ShadowsocksServer::Classic {
                udp,
                level,
                mut networks,
                ..
            } => {
                if networks.is_empty() {
                    networks.push(Network::Tcp);
                }
                if udp && !networks.contains(&Network::Udp) {
                    networks.push(Network::Udp);
                }
                Ok(Self {
                    networks,
                    level,
                    policy_manager,
                })
            }
            ShadowsocksServer::Aead2022 { method, .. } => Err(needs_cipher(&method)),
        }
    }

    async fn process_stream(
        &self,
        scope: &RequestScope,
        policy: &Policy,
        remote: SocketAddr,
        stream: Stream,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<()> {
        let (mut client_reader, mut client_writer) = tokio::io::split(stream);

        let handshake = policy.timeouts.handshake;
        let address = within(handshake, read_address(&mut client_reader)).await?;
        let dest = Destination::tcp(address);

        let link = within(handshake, dispatcher.dispatch(scope, dest.clone()))
            .await
            .map_err(Error::dispatch)?;
        info!("[{}] {} -> {} accepted", scope.inbound_tag, remote, dest);

        let timer = ActivityTimer::new(scope.cancel.clone(), policy.timeouts.connection_idle);
        let (mut link_reader, mut link_writer) = tokio::io::split(LinkStream::new(link.clone()));

        let request = async {
            let result = relay(&mut client_reader, &mut link_writer, &timer, policy.buffer_size).await;
            timer.set_timeout(policy.timeouts.downlink_only);
            link.writer.close();
            result
        };

        let response = async {
            relay(&mut link_reader, &mut client_writer, &timer, policy.buffer_size).await?;
            client_writer.shutdown().await?;
            timer.set_timeout(policy.timeouts.uplink_only);
            Ok::<(), Error>(())
        };

        let outcome = tokio::select! {
            _ = scope.cancel.cancelled() => Err(Error::Cancelled),
            r = async { tokio::try_join!(request, response) } => r.map(|_| ()),
        };
        conclude(scope, remote, &link, outcome)
    }

    async fn process_packets(
        &self,
        scope: &RequestScope,
        policy: &Policy,
        remote: SocketAddr,
        conn: Arc<dyn PacketConn>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<()> {
        let handshake = policy.timeouts.handshake;

        // the first datagram picks the destination the session is dispatched to
        let Some(first) = within(handshake, conn.read_packet()).await? else {
            return Ok(());
        };
        let (address, payload) = decode_packet(first.payload)?;
        let dest = Destination::udp(address.clone());

        let link = within(handshake, dispatcher.dispatch(scope, dest.clone()))
            .await
            .map_err(Error::dispatch)?;
        info!("[{}] {} -> {} accepted", scope.inbound_tag, remote, dest);

        let timer = ActivityTimer::new(scope.cancel.clone(), policy.timeouts.connection_idle);
        let packets = LinkPacketConn::new(link.clone(), dest);

        let request = async {
            let result: Result<()> = async {
                packets.write_packet(payload, address).await?;
                while let Some(packet) = conn.read_packet().await? {
                    timer.touch();
                    match decode_packet(packet.payload) {
                        Ok((address, payload)) => packets.write_packet(payload, address).await?,
                        Err(e) => debug!("[{}] dropping datagram from {}: {}", scope.inbound_tag, remote, e),
                    }
                }
                Ok(())
            }
            .await;
            timer.set_timeout(policy.timeouts.downlink_only);
            link.writer.close();
            result
        };

        let response = async {
            while let Some((payload, address)) = packets.read_packet().await? {
                timer.touch();
                let mut datagram = BytesMut::with_capacity(payload.len() + 32);
                write_address(&address, &mut datagram)?;
                datagram.put_slice(&payload);
                conn.write_packet(&datagram).await?;
            }
            timer.set_timeout(policy.timeouts.uplink_only);
            Ok::<(), Error>(())
        };

        let outcome = tokio::select! {
            _ = scope.cancel.cancelled() => Err(Error::Cancelled),
            r = async { tokio::try_join!(request, response) } => r.map(|_| ()),
        };

        packets.close().await;
        conn.close();
        conclude(scope, remote, &link, outcome)
    }
}

#[async_trait]
impl InboundHandler for ShadowsocksInbound {
    fn network(&self) -> &[Network] {
        &self.networks
    }

    async fn process(
        &self,
        scope: &RequestScope,
        _network: Network,
        conn: InboundConnection,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<()> {
        let remote = conn.remote_addr;
        debug!("[{}] processing connection from: {}", scope.inbound_tag, remote);

        let policy = self.policy_manager.for_level(self.level);
        let mut scope = scope.child();
        scope.user_level = self.level;
        scope.buffer_size = policy.buffer_size;
        scope.source.get_or_insert(remote);

        match conn.io {
            ConnectionIo::Stream(stream) => self.process_stream(&scope, &policy, remote, stream, dispatcher).await,
            ConnectionIo::Packet(packet_conn) => {
                self.process_packets(&scope, &policy, remote, packet_conn, dispatcher)
                    .await
            }
        }
    }
}

/// Run `fut` bounded by `limit`; zero means unbounded.
async fn within<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    if limit.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(limit, fut).await.unwrap_or(Err(Error::Timeout))
}

async fn relay<R, W>(reader: &mut R, writer: &mut W, timer: &ActivityTimer, buffer_size: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        timer.touch();
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }
}

fn conclude(scope: &RequestScope, remote: SocketAddr, link: &Link, outcome: Result<()>) -> Result<()> {
    scope.cancel.cancel();

    match outcome {
        Ok(()) => {
            debug!("[{}] connection from {} finished", scope.inbound_tag, remote);
            Ok(())
        }
        Err(Error::Cancelled) => {
            debug!("[{}] connection from {} idle, closing", scope.inbound_tag, remote);
            link.interrupt();
            Ok(())
        }
        Err(e) => {
            link.interrupt();
            return_error(Err(Error::transport(e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::StaticPolicyManager;
    use crate::common::{IntoStream, Packet};
    use parking_lot::Mutex;
    use tokio::io::duplex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct LoopDispatcher {
        dispatched: Mutex<Vec<Destination>>,
        outbound: Mutex<Option<Link>>,
    }

    #[async_trait]
    impl Dispatcher for LoopDispatcher {
        async fn dispatch(&self, _scope: &RequestScope, destination: Destination) -> Result<Link> {
            self.dispatched.lock().push(destination);
            let (inbound, outbound) = Link::pair();
            *self.outbound.lock() = Some(outbound);
            Ok(inbound)
        }
    }

    struct ChannelConn {
        incoming: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl PacketConn for ChannelConn {
        async fn read_packet(&self) -> Result<Option<Packet>> {
            Ok(self.incoming.lock().await.recv().await)
        }

        async fn write_packet(&self, payload: &[u8]) -> Result<()> {
            self.outgoing.send(payload.to_vec()).map_err(|_| Error::ConnectionClosed)
        }

        fn peer_addr(&self) -> SocketAddr {
            client_addr()
        }

        fn local_addr(&self) -> Result<SocketAddr> {
            Ok("0.0.0.0:8388".parse().unwrap())
        }

        fn close(&self) {}
    }

    fn client_addr() -> SocketAddr {
        "192.168.1.2:40000".parse().unwrap()
    }

    fn plain_server(udp: bool, networks: Vec<Network>) -> ShadowsocksServer {
        ShadowsocksServer::Classic {
            cipher: CipherType::None,
            password: "secret".into(),
            udp,
            level: 0,
            email: String::new(),
            networks,
            iv_check: false,
        }
    }

    fn inbound(udp: bool) -> ShadowsocksInbound {
        ShadowsocksInbound::new(plain_server(udp, Vec::new()), Arc::new(StaticPolicyManager::new())).unwrap()
    }

    fn header(address: &Address) -> BytesMut {
        let mut out = BytesMut::new();
        write_address(address, &mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_address_header_forms() {
        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let mut datagram = header(&Address::Socket(v6));
        datagram.put_slice(b"data");
        let (address, payload) = decode_packet(datagram.freeze()).unwrap();
        assert_eq!(address, Address::Socket(v6));
        assert_eq!(&payload[..], b"data");

        let raw = [&[ATYP_DOMAIN, 11][..], &b"example.com"[..], &[0x01, 0xBB][..]].concat();
        let mut reader = &raw[..];
        assert_eq!(read_address(&mut reader).await.unwrap(), Address::domain("example.com", 443));

        assert!(decode_packet(Bytes::from_static(&[ATYP_IPV4, 10, 0, 0])).is_err());
        assert!(decode_packet(Bytes::from_static(&[0x05, 0, 0])).is_err());
        assert!(write_address(&Address::domain("a".repeat(256), 80), &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_encrypted_methods_are_rejected() {
        let aead = ShadowsocksServer::Classic {
            cipher: CipherType::Aes128Gcm,
            password: "secret".into(),
            udp: false,
            level: 0,
            email: String::new(),
            networks: Vec::new(),
            iv_check: false,
        };
        let ss2022 = ShadowsocksServer::Aead2022 {
            method: "2022-blake3-aes-128-gcm".into(),
            key: "key".into(),
            level: 0,
            email: String::new(),
            networks: Vec::new(),
        };

        for server in [aead, ss2022] {
            assert!(matches!(check_server(&server), Err(Error::Unsupported(_))));
            let built = ShadowsocksInbound::new(server, Arc::new(StaticPolicyManager::new()));
            assert!(matches!(built, Err(Error::Unsupported(_))));
        }
    }

    #[test]
    fn test_default_networks() {
        assert_eq!(inbound(false).network(), &[Network::Tcp]);
        assert_eq!(inbound(true).network(), &[Network::Tcp, Network::Udp]);

        let udp_only = ShadowsocksInbound::new(
            plain_server(false, vec![Network::Udp]),
            Arc::new(StaticPolicyManager::new()),
        )
        .unwrap();
        assert_eq!(udp_only.network(), &[Network::Udp]);
    }

    #[tokio::test]
    async fn test_stream_header_selects_destination() {
        let dispatcher = Arc::new(LoopDispatcher::default());
        let (mut client, server) = duplex(1024);

        let mut request = header(&Address::domain("example.com", 443));
        request.put_slice(b"GET");
        client.write_all(&request).await.unwrap();
        client.shutdown().await.unwrap();

        let remote = {
            let dispatcher = dispatcher.clone();
            async move {
                let outbound = loop {
                    if let Some(link) = dispatcher.outbound.lock().take() {
                        break link;
                    }
                    tokio::task::yield_now().await;
                };
                let mut received = Vec::new();
                while let Some(mb) = outbound.reader.read_multi_buffer().await.unwrap() {
                    received.extend(mb.iter().flat_map(|p| p.payload.to_vec()));
                }
                outbound.writer.write_multi_buffer(vec![Packet::new(&b"OK"[..])]).await.unwrap();
                outbound.writer.close();
                received
            }
        };

        let handler = inbound(false);
        let scope = RequestScope::default();
        let conn = InboundConnection::stream(client_addr(), server.into_stream());
        let (result, received) = tokio::join!(handler.process(&scope, Network::Tcp, conn, dispatcher.clone()), remote);
        result.unwrap();

        assert_eq!(received, b"GET");
        assert_eq!(
            dispatcher.dispatched.lock().clone(),
            vec![Destination::tcp(Address::domain("example.com", 443))]
        );

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"OK");
    }

    #[tokio::test]
    async fn test_bad_header_is_a_protocol_error() {
        let dispatcher = Arc::new(LoopDispatcher::default());
        let (mut client, server) = duplex(64);
        client.write_all(&[0x09, 1, 2, 3]).await.unwrap();

        let scope = RequestScope::default();
        let conn = InboundConnection::stream(client_addr(), server.into_stream());
        let result = inbound(false).process(&scope, Network::Tcp, conn, dispatcher.clone()).await;

        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(dispatcher.dispatched.lock().is_empty());
    }

    #[tokio::test]
    async fn test_datagrams_carry_their_addresses() {
        let dispatcher = Arc::new(LoopDispatcher::default());
        let (incoming, rx) = mpsc::channel(8);
        let (tx, mut outgoing) = mpsc::unbounded_channel();
        let conn = Arc::new(ChannelConn {
            incoming: tokio::sync::Mutex::new(rx),
            outgoing: tx,
        });

        let resolver: SocketAddr = "1.2.3.4:53".parse().unwrap();
        let other: SocketAddr = "9.9.9.9:53".parse().unwrap();

        let mut first = header(&Address::Socket(resolver));
        first.put_slice(b"q1");
        incoming.send(Packet::new(first.freeze())).await.unwrap();
        incoming.send(Packet::new(&b"\x07junk"[..])).await.unwrap();
        let mut second = header(&Address::Socket(other));
        second.put_slice(b"q2");
        incoming.send(Packet::new(second.freeze())).await.unwrap();

        let scope = RequestScope::default();
        let handler = inbound(true);
        let process = handler.process(&scope, Network::Udp, InboundConnection::packet(conn), dispatcher.clone());

        let remote = async {
            let outbound = loop {
                if let Some(link) = dispatcher.outbound.lock().take() {
                    break link;
                }
                tokio::task::yield_now().await;
            };

            let mut seen = Vec::new();
            while seen.len() < 2 {
                let mb = outbound.reader.read_multi_buffer().await.unwrap().unwrap();
                seen.extend(mb.into_iter().map(|p| (p.endpoint, p.payload)));
            }

            outbound
                .writer
                .write_multi_buffer(vec![Packet::with_endpoint(&b"r2"[..], Destination::udp(other))])
                .await
                .unwrap();
            let reply = outgoing.recv().await.unwrap();

            drop(incoming);
            outbound.writer.close();
            (seen, reply)
        };

        let (result, (seen, reply)) = tokio::join!(process, remote);
        result.unwrap();

        assert_eq!(
            dispatcher.dispatched.lock().clone(),
            vec![Destination::udp(Address::Socket(resolver))]
        );
        assert_eq!(
            seen,
            vec![
                (Some(Destination::udp(Address::Socket(resolver))), Bytes::from_static(b"q1")),
                (Some(Destination::udp(Address::Socket(other))), Bytes::from_static(b"q2")),
            ]
        );

        let (address, payload) = decode_packet(Bytes::from(reply)).unwrap();
        assert_eq!(address, Address::Socket(other));
        assert_eq!(&payload[..], b"r2");
    }
}
