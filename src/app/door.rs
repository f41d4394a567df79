//! Door - transparent "any door" inbound
//!
//! Accepts a TCP stream or UDP session and forwards it to a destination that
//! is either configured statically or recovered from the connection
//! (TPROXY / REDIRECT original destination, handshake address).
//!
//! ```text
//! client ──request──▶ Link.writer ──▶ dispatcher / outbound
//! client ◀─response── Link.reader ◀──
//! ```
//!
//! Both directions touch one [`ActivityTimer`]. When a direction finishes
//! the other one gets the short one-sided budget from the policy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, info};

use crate::common::buffer::chunk;
use crate::common::{Address, Destination, Host, Link, MultiBuffer, Network, RequestScope, Result, Stream};
use crate::error::Error;
use crate::transport::{PacketConn, SocketConfig};

use super::activity::ActivityTimer;
use super::dispatcher::Dispatcher;
use super::policy::{Policy, PolicyManager};
use super::udp_fanout::{TransparentForger, UdpFanoutWriter, UdpForger};

/// Door inbound settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DoorConfig {
    /// Static destination host
    pub address: Option<String>,
    /// Static destination port, also used with a handshake address
    pub port: u16,
    pub networks: Vec<Network>,
    /// Prefer the original destination recovered by the listener
    pub follow_redirect: bool,
    pub user_level: u32,
    /// Idle timeout override in seconds, only honoured for user level 0
    pub timeout: u32,
}

/// What the client side of a connection is
pub enum ConnectionIo {
    Stream(Stream),
    Packet(Arc<dyn PacketConn>),
}

/// One accepted client connection
pub struct InboundConnection {
    pub remote_addr: SocketAddr,
    /// Address the client asked for during a handshake, if the listener saw one
    pub handshake_address: Option<Host>,
    pub io: ConnectionIo,
}

impl InboundConnection {
    pub fn stream(remote_addr: SocketAddr, stream: Stream) -> Self {
        Self {
            remote_addr,
            handshake_address: None,
            io: ConnectionIo::Stream(stream),
        }
    }

    pub fn packet(conn: Arc<dyn PacketConn>) -> Self {
        Self {
            remote_addr: conn.peer_addr(),
            handshake_address: None,
            io: ConnectionIo::Packet(conn),
        }
    }

    pub fn with_handshake_address(mut self, host: Host) -> Self {
        self.handshake_address = Some(host);
        self
    }
}

/// Inbound protocol invoked by a listener once per accepted connection
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Networks this inbound accepts
    fn network(&self) -> &[Network];

    async fn process(
        &self,
        scope: &RequestScope,
        network: Network,
        conn: InboundConnection,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<()>;
}

pub struct Door {
    config: DoorConfig,
    address: Option<Host>,
    policy_manager: Arc<dyn PolicyManager>,
    forger: Arc<dyn UdpForger>,
}

impl Door {
    pub fn new(config: DoorConfig, policy_manager: Arc<dyn PolicyManager>, sockopt: Option<SocketConfig>) -> Result<Self> {
        if config.networks.is_empty() {
            return Err(Error::NoNetworkConfigured);
        }

        let address = config.address.as_deref().filter(|a| !a.is_empty()).map(Host::parse);
        let forger = Arc::new(TransparentForger::new(sockopt.unwrap_or_default()));

        Ok(Self {
            config,
            address,
            policy_manager,
            forger,
        })
    }

    /// Replace how reply sockets for redirected UDP are opened.
    pub fn with_forger(mut self, forger: Arc<dyn UdpForger>) -> Self {
        self.forger = forger;
        self
    }

    fn policy(&self) -> Policy {
        let mut policy = self.policy_manager.for_level(self.config.user_level);
        if self.config.timeout > 0 && self.config.user_level == 0 {
            policy.timeouts.connection_idle = Duration::from_secs(u64::from(self.config.timeout));
        }
        policy
    }

    /// Destination for a connection, and whether it came from the connection
    /// rather than the static settings.
    fn destination(&self, scope: &RequestScope, network: Network, conn: &InboundConnection) -> Result<(Destination, bool)> {
        if self.config.follow_redirect {
            if let Some(target) = &scope.redirect_target {
                return Ok((target.clone(), true));
            }
            if let Some(host) = &conn.handshake_address {
                let address = Address::from_host(host.clone(), self.config.port);
                return Ok((Destination::new(network, address), true));
            }
        }

        match &self.address {
            Some(host) => Ok((
                Destination::new(network, Address::from_host(host.clone(), self.config.port)),
                false,
            )),
            None => Err(Error::NoDestination),
        }
    }
}

#[async_trait]
impl InboundHandler for Door {
    fn network(&self) -> &[Network] {
        &self.config.networks
    }

    async fn process(
        &self,
        scope: &RequestScope,
        network: Network,
        conn: InboundConnection,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<()> {
        let remote = conn.remote_addr;
        debug!("[{}] processing connection from: {}", scope.inbound_tag, remote);

        let (mut dest, overridden) = self.destination(scope, network, &conn)?;

        let policy = self.policy();
        let mut scope = scope.child();
        scope.user_level = self.config.user_level;
        scope.buffer_size = policy.buffer_size;
        scope.source.get_or_insert(remote);

        let timer = ActivityTimer::new(scope.cancel.clone(), policy.timeouts.connection_idle);

        let handshake = policy.timeouts.handshake;
        let dispatching = dispatcher.dispatch(&scope, dest.clone());
        let link = if handshake.is_zero() {
            dispatching.await
        } else {
            tokio::time::timeout(handshake, dispatching)
                .await
                .unwrap_or(Err(Error::Timeout))
        }
        .map_err(Error::dispatch)?;
        info!("[{}] {} -> {} accepted", scope.inbound_tag, remote, dest);

        let (mut source, mut sink) = match conn.io {
            ConnectionIo::Stream(stream) => {
                let (read_half, write_half) = tokio::io::split(stream);
                (RequestSource::Stream(read_half), ResponseSink::Stream(write_half))
            }
            ConnectionIo::Packet(packet_conn) if network == Network::Udp && overridden => {
                if dest.address.is_domain() {
                    dest.address = Address::Socket(dest.address.or_any_ip(&remote));
                }
                let fanout = UdpFanoutWriter::new(self.forger.clone(), &dest, remote).await;
                let fanout = match fanout {
                    Ok(fanout) => fanout,
                    Err(e) => {
                        link.interrupt();
                        return Err(Error::transport(e));
                    }
                };
                (RequestSource::Packet(packet_conn.clone(), true), ResponseSink::Fanout(fanout))
            }
            ConnectionIo::Packet(packet_conn) => (
                RequestSource::Packet(packet_conn.clone(), false),
                ResponseSink::Packet(packet_conn),
            ),
        };

        let request_count = AtomicUsize::new(1);
        let request = async {
            let result = copy_request(&mut source, &link, &timer, policy.buffer_size).await;
            if request_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                timer.set_timeout(policy.timeouts.downlink_only);
            }
            link.writer.close();
            result
        };

        let response = async {
            let result = copy_response(&link, &mut sink, &timer).await;
            timer.set_timeout(policy.timeouts.uplink_only);
            result
        };

        let outcome = tokio::select! {
            _ = scope.cancel.cancelled() => Err(Error::Cancelled),
            r = async { tokio::try_join!(request, response) } => r.map(|_| ()),
        };

        sink.close().await;
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
                Err(Error::transport(e))
            }
        }
    }
}

// ============================================================================
// Client side
// ============================================================================

enum RequestSource {
    Stream(ReadHalf<Stream>),
    /// The flag keeps per-datagram original destinations
    Packet(Arc<dyn PacketConn>, bool),
}

impl RequestSource {
    async fn read(&mut self, buf: &mut [u8]) -> Result<Option<MultiBuffer>> {
        match self {
            RequestSource::Stream(reader) => {
                let n = reader.read(buf).await?;
                Ok((n > 0).then(|| chunk(&buf[..n])))
            }
            RequestSource::Packet(conn, keep_endpoint) => {
                let packet = conn.read_packet().await?;
                Ok(packet.map(|mut packet| {
                    if !*keep_endpoint {
                        packet.endpoint = None;
                    }
                    vec![packet]
                }))
            }
        }
    }
}

enum ResponseSink {
    Stream(WriteHalf<Stream>),
    Packet(Arc<dyn PacketConn>),
    Fanout(UdpFanoutWriter),
}

impl ResponseSink {
    async fn write(&mut self, mb: MultiBuffer) -> Result<()> {
        match self {
            ResponseSink::Stream(writer) => {
                for packet in &mb {
                    writer.write_all(&packet.payload).await?;
                }
                writer.flush().await?;
                Ok(())
            }
            ResponseSink::Packet(conn) => {
                for packet in &mb {
                    conn.write_packet(&packet.payload).await?;
                }
                Ok(())
            }
            ResponseSink::Fanout(fanout) => fanout.write_multi_buffer(mb).await,
        }
    }

    /// Signal end of the response to the client.
    async fn finish(&mut self) -> Result<()> {
        if let ResponseSink::Stream(writer) = self {
            writer.shutdown().await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        match self {
            ResponseSink::Stream(_) => {}
            ResponseSink::Packet(conn) => conn.close(),
            ResponseSink::Fanout(fanout) => fanout.close(),
        }
    }
}

async fn copy_request(source: &mut RequestSource, link: &Link, timer: &ActivityTimer, buffer_size: usize) -> Result<()> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    while let Some(mb) = source.read(&mut buf).await? {
        timer.touch();
        link.writer.write_multi_buffer(mb).await?;
    }
    Ok(())
}

async fn copy_response(link: &Link, sink: &mut ResponseSink, timer: &ActivityTimer) -> Result<()> {
    while let Some(mb) = link.reader.read_multi_buffer().await? {
        timer.touch();
        sink.write(mb).await?;
    }
    sink.finish().await
}
