//! UDP inbound: one listening socket demultiplexed into per-client sessions
//!
//! UDP is connectionless, so the hub reads every datagram itself and routes
//! it to the session of its source address. [`UdpHub::accept`] returns when
//! a datagram arrives from a source without a live session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::common::{Address, Destination, Packet, Result};
use crate::error::Error;

use super::sockopt::{self, SocketConfig};

/// Datagrams a session buffers before new ones are dropped
const SESSION_QUEUE: usize = 64;

const MAX_DATAGRAM: usize = 64 * 1024;

/// Datagram-oriented client connection
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Next datagram from the client. `Ok(None)` once the connection closed.
    ///
    /// The packet endpoint is the datagram's original destination when the
    /// listener could recover one.
    async fn read_packet(&self) -> Result<Option<Packet>>;

    /// Send a datagram to the client from the listening address.
    async fn write_packet(&self, payload: &[u8]) -> Result<()>;

    fn peer_addr(&self) -> SocketAddr;

    fn local_addr(&self) -> Result<SocketAddr>;

    fn close(&self);
}

type SessionMap = Mutex<HashMap<SocketAddr, mpsc::Sender<Packet>>>;

/// Listening UDP socket shared by all sessions
pub struct UdpHub {
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionMap>,
    /// Report per-datagram original destinations (TPROXY)
    redirect: bool,
}

impl UdpHub {
    pub fn bind(addr: &Address, sockopt: &SocketConfig) -> Result<Self> {
        let socket_addr = addr
            .as_socket()
            .ok_or_else(|| Error::Config("Cannot bind to domain address".into()))?;

        let socket = sockopt::bind_udp(socket_addr, sockopt, sockopt.tproxy)?;
        if sockopt.tproxy {
            sockopt::enable_udp_original_destination(&socket)?;
        }

        Ok(Self {
            socket: Arc::new(socket),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            redirect: sockopt.tproxy,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Route datagrams to their sessions until one opens a new session.
    pub async fn accept(&self) -> Result<Arc<UdpSession>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let local = self.socket.local_addr()?;

        loop {
            let (n, source, original) = sockopt::recv_with_original_destination(&self.socket, &mut buf).await?;
            let payload = Bytes::copy_from_slice(&buf[..n]);
            let packet = match original {
                Some(dst) if self.redirect && dst != local => Packet::with_endpoint(payload, Destination::udp(dst)),
                _ => Packet::new(payload),
            };

            let existing = self.sessions.lock().get(&source).cloned();
            if let Some(tx) = existing {
                match tx.try_send(packet) {
                    Ok(()) => continue,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!("[udp] session queue for {} is full, dropping datagram", source);
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(packet)) => {
                        self.sessions.lock().remove(&source);
                        return Ok(self.open_session(source, packet));
                    }
                }
            }
            return Ok(self.open_session(source, packet));
        }
    }

    fn open_session(&self, peer: SocketAddr, first: Packet) -> Arc<UdpSession> {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        let original_destination = first.endpoint.clone();
        let _ = tx.try_send(first);
        self.sessions.lock().insert(peer, tx);
        debug!("[udp] new session from {}", peer);

        Arc::new(UdpSession {
            peer,
            original_destination,
            socket: self.socket.clone(),
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            sessions: Arc::downgrade(&self.sessions),
        })
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Datagrams of one client address
pub struct UdpSession {
    peer: SocketAddr,
    /// Original destination of the datagram that opened the session
    original_destination: Option<Destination>,
    socket: Arc<UdpSocket>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    closed: CancellationToken,
    sessions: Weak<SessionMap>,
}

impl UdpSession {
    pub fn original_destination(&self) -> Option<&Destination> {
        self.original_destination.as_ref()
    }
}

#[async_trait]
impl PacketConn for UdpSession {
    async fn read_packet(&self) -> Result<Option<Packet>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            packet = rx.recv() => Ok(packet),
        }
    }

    async fn write_packet(&self, payload: &[u8]) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        self.socket.send_to(payload, self.peer).await?;
        Ok(())
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Some(sessions) = self.sessions.upgrade() {
            sessions.lock().remove(&self.peer);
        }
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.close();
    }
}
