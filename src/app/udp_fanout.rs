//! UDP fan-out writer for transparently redirected UDP
//!
//! Replies to a TPROXY client must look like they come from the remote peer
//! the client addressed. For every remote endpoint seen in the response
//! stream a socket bound to that endpoint is opened ("forged") and the reply
//! is sent from it to the client address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::common::{Address, Destination, MultiBuffer, Result};
use crate::error::Error;
use crate::transport::sockopt::{self, SocketConfig};

/// Socket bound to a foreign source address
#[async_trait]
pub trait ForgedSocket: Send + Sync {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()>;

    /// Idempotent.
    fn close(&self);
}

/// Opens sockets bound to arbitrary (possibly non-local) addresses
#[async_trait]
pub trait UdpForger: Send + Sync {
    async fn open(&self, source: SocketAddr) -> Result<Arc<dyn ForgedSocket>>;
}

/// Forger using `IP_TRANSPARENT` sockets
#[derive(Debug, Clone, Default)]
pub struct TransparentForger {
    sockopt: SocketConfig,
}

impl TransparentForger {
    pub fn new(sockopt: SocketConfig) -> Self {
        Self { sockopt }
    }
}

#[async_trait]
impl UdpForger for TransparentForger {
    async fn open(&self, source: SocketAddr) -> Result<Arc<dyn ForgedSocket>> {
        let socket = sockopt::bind_udp(source, &self.sockopt, true)?;
        Ok(Arc::new(ForgedUdpSocket::new(socket)))
    }
}

/// The socket is released on close, even while the handle is still shared.
struct ForgedUdpSocket {
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl ForgedUdpSocket {
    fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Mutex::new(Some(Arc::new(socket))),
        }
    }
}

#[async_trait]
impl ForgedSocket for ForgedUdpSocket {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()> {
        let socket = self.socket.lock().clone().ok_or(Error::ConnectionClosed)?;
        socket.send_to(payload, target).await?;
        Ok(())
    }

    fn close(&self) {
        self.socket.lock().take();
    }
}

/// Response writer fanning replies out through per-endpoint forged sockets
pub struct UdpFanoutWriter {
    forger: Arc<dyn UdpForger>,
    /// Client address every reply is sent to
    back: SocketAddr,
    primary: Arc<dyn ForgedSocket>,
    conns: Mutex<HashMap<Destination, Arc<dyn ForgedSocket>>>,
}

impl UdpFanoutWriter {
    /// Open the primary socket at `dest`. A domain destination binds the
    /// unspecified address of the client's family.
    pub async fn new(forger: Arc<dyn UdpForger>, dest: &Destination, back: SocketAddr) -> Result<Self> {
        let bind = dest.address.or_any_ip(&back);
        let primary = forger.open(bind).await?;

        let mut conns = HashMap::new();
        conns.insert(Destination::udp(Address::Socket(bind)), primary.clone());

        Ok(Self {
            forger,
            back,
            primary,
            conns: Mutex::new(conns),
        })
    }

    pub async fn write_multi_buffer(&self, mb: MultiBuffer) -> Result<()> {
        for packet in mb {
            let endpoint = packet
                .endpoint
                .as_ref()
                .and_then(|ep| ep.address.as_socket().map(|addr| (ep, addr)));

            let Some((endpoint, addr)) = endpoint else {
                self.primary.send_to(&packet.payload, self.back).await?;
                continue;
            };

            let existing = self.conns.lock().get(endpoint).cloned();
            let conn = match existing {
                Some(conn) => conn,
                None => match self.forger.open(addr).await {
                    Ok(conn) => {
                        debug!("[udp] forging replies from {} to {}", addr, self.back);
                        self.conns.lock().insert(endpoint.clone(), conn.clone());
                        conn
                    }
                    Err(e) => {
                        warn!("[udp] failed to open socket at {}: {}", addr, e);
                        continue;
                    }
                },
            };

            if let Err(e) = conn.send_to(&packet.payload, self.back).await {
                debug!("[udp] reply from {} failed: {}", addr, e);
                let removed = {
                    let mut conns = self.conns.lock();
                    match conns.get(endpoint) {
                        Some(current) if Arc::ptr_eq(current, &conn) => conns.remove(endpoint),
                        _ => None,
                    }
                };
                if let Some(conn) = removed {
                    conn.close();
                }
            }
        }
        Ok(())
    }

    /// Close every tracked socket. Safe to call twice.
    pub fn close(&self) {
        let drained: Vec<_> = self.conns.lock().drain().map(|(_, conn)| conn).collect();
        for conn in drained {
            conn.close();
        }
        self.primary.close();
    }

    /// Number of open per-endpoint sockets, the primary included
    pub fn socket_count(&self) -> usize {
        self.conns.lock().len()
    }
}

impl Drop for UdpFanoutWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Packet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Record {
        opened: Mutex<Vec<SocketAddr>>,
        sent: Mutex<Vec<(SocketAddr, SocketAddr, Vec<u8>)>>,
        closes: AtomicUsize,
    }

    struct MockForger {
        record: Arc<Record>,
        fail_sends_from: Option<SocketAddr>,
    }

    struct MockSocket {
        source: SocketAddr,
        record: Arc<Record>,
        fail: bool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl ForgedSocket for MockSocket {
        async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()> {
            if self.fail {
                return Err(Error::ConnectionClosed);
            }
            self.record.sent.lock().push((self.source, target, payload.to_vec()));
            Ok(())
        }

        fn close(&self) {
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.record.closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl UdpForger for MockForger {
        async fn open(&self, source: SocketAddr) -> Result<Arc<dyn ForgedSocket>> {
            self.record.opened.lock().push(source);
            Ok(Arc::new(MockSocket {
                source,
                record: self.record.clone(),
                fail: self.fail_sends_from == Some(source),
                closed: AtomicBool::new(false),
            }))
        }
    }

    fn forger(fail_sends_from: Option<SocketAddr>) -> (Arc<MockForger>, Arc<Record>) {
        let record = Arc::new(Record::default());
        let forger = Arc::new(MockForger {
            record: record.clone(),
            fail_sends_from,
        });
        (forger, record)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn from(endpoint: &str, payload: &'static [u8]) -> Packet {
        Packet::with_endpoint(payload, Destination::udp(addr(endpoint)))
    }

    #[tokio::test]
    async fn test_close_releases_the_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        let forged: Arc<dyn ForgedSocket> = Arc::new(ForgedUdpSocket::new(socket));
        let shared = forged.clone();

        shared.send_to(b"ping", local).await.unwrap();
        forged.close();

        // the port is free again although `shared` is still alive
        UdpSocket::bind(local).await.unwrap();
        assert!(matches!(shared.send_to(b"ping", local).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_one_socket_per_endpoint() {
        let (forger, record) = forger(None);
        let client = addr("192.168.1.10:5000");
        let dest = Destination::udp(addr("8.8.8.8:53"));
        let writer = UdpFanoutWriter::new(forger, &dest, client).await.unwrap();

        writer
            .write_multi_buffer(vec![
                from("1.1.1.1:53", b"d1"),
                from("9.9.9.9:53", b"d2"),
                from("1.1.1.1:53", b"d1-again"),
            ])
            .await
            .unwrap();

        let opened = record.opened.lock().clone();
        assert_eq!(opened, vec![addr("8.8.8.8:53"), addr("1.1.1.1:53"), addr("9.9.9.9:53")]);

        let sent = record.sent.lock().clone();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(_, target, _)| *target == client));
        assert_eq!(sent[2].0, addr("1.1.1.1:53"));
        assert_eq!(writer.socket_count(), 3);
    }

    #[tokio::test]
    async fn test_endpointless_packets_use_primary() {
        let (forger, record) = forger(None);
        let client = addr("[fd00::2]:6000");
        let dest = Destination::udp(Address::domain("dns.example", 53));
        let writer = UdpFanoutWriter::new(forger, &dest, client).await.unwrap();

        writer.write_multi_buffer(vec![Packet::new(&b"plain"[..])]).await.unwrap();

        let sent = record.sent.lock().clone();
        assert_eq!(sent, vec![(addr("[::]:53"), client, b"plain".to_vec())]);
    }

    #[tokio::test]
    async fn test_failed_endpoint_is_dropped_and_reopened() {
        let bad = addr("10.0.0.9:443");
        let (forger, record) = forger(Some(bad));
        let writer = UdpFanoutWriter::new(forger, &Destination::udp(addr("10.0.0.1:443")), addr("10.0.0.2:1"))
            .await
            .unwrap();

        writer
            .write_multi_buffer(vec![from("10.0.0.9:443", b"x"), from("10.0.0.8:443", b"y")])
            .await
            .unwrap();
        assert_eq!(record.closes.load(Ordering::SeqCst), 1);
        assert_eq!(writer.socket_count(), 2);

        writer.write_multi_buffer(vec![from("10.0.0.9:443", b"z")]).await.unwrap();
        let reopened = record.opened.lock().iter().filter(|a| **a == bad).count();
        assert_eq!(reopened, 2);
    }

    #[tokio::test]
    async fn test_primary_failure_aborts_batch() {
        let primary = addr("10.0.0.1:443");
        let (forger, record) = forger(Some(primary));
        let writer = UdpFanoutWriter::new(forger, &Destination::udp(primary), addr("10.0.0.2:1"))
            .await
            .unwrap();

        let result = writer
            .write_multi_buffer(vec![Packet::new(&b"a"[..]), from("10.0.0.7:1", b"b")])
            .await;
        assert!(result.is_err());
        assert!(record.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (forger, record) = forger(None);
        let writer = UdpFanoutWriter::new(forger, &Destination::udp(addr("10.0.0.1:53")), addr("10.0.0.2:1"))
            .await
            .unwrap();
        writer.write_multi_buffer(vec![from("10.0.0.3:53", b"a")]).await.unwrap();

        writer.close();
        writer.close();
        drop(writer);
        assert_eq!(record.closes.load(Ordering::SeqCst), 2);
    }
}
