//! Adapters presenting a [`Link`] to endpoint protocol libraries
//!
//! Endpoint protocol handlers want a byte stream or a packet connection,
//! not a Link. [`LinkStream`] and [`LinkPacketConn`] provide
//! those views.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::buffer::chunk;
use crate::common::{Address, Destination, Link, LinkReader, LinkWriter, MultiBuffer, Network, Packet, Result};
use crate::error::Error;

type ReadFuture = Pin<Box<dyn Future<Output = Result<Option<MultiBuffer>>> + Send>>;
type WriteFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

/// Destination of `address` over `network`.
pub fn to_destination(address: Address, network: Network) -> Destination {
    Destination::new(network, address)
}

/// Address part of a destination.
pub fn to_address(destination: &Destination) -> Address {
    destination.address.clone()
}

/// Treat "the other side went away" as success.
pub fn return_error(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_closed() => Ok(()),
        other => other,
    }
}

/// Byte-stream view of a Link
///
/// Writes are split into buffers of at most 2048 bytes. Shutdown does not
/// close the Link; its owner does.
pub struct LinkStream {
    reader: Arc<dyn LinkReader>,
    writer: Arc<dyn LinkWriter>,
    pending_read: Option<ReadFuture>,
    pending_write: Option<(WriteFuture, usize)>,
    leftover: VecDeque<Bytes>,
    eof: bool,
}

impl LinkStream {
    pub fn new(link: Link) -> Self {
        Self {
            reader: link.reader,
            writer: link.writer,
            pending_read: None,
            pending_write: None,
            leftover: VecDeque::new(),
            eof: false,
        }
    }

    fn drain_leftover(&mut self, buf: &mut ReadBuf<'_>) {
        while buf.remaining() > 0 {
            let Some(front) = self.leftover.front_mut() else {
                break;
            };
            let n = front.len().min(buf.remaining());
            buf.put_slice(&front[..n]);
            front.advance(n);
            if front.is_empty() {
                self.leftover.pop_front();
            }
        }
    }
}

impl AsyncRead for LinkStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.leftover.is_empty() {
                this.drain_leftover(buf);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let reader = this.reader.clone();
            let pending = this
                .pending_read
                .get_or_insert_with(|| Box::pin(async move { reader.read_multi_buffer().await }));
            let result = ready!(pending.as_mut().poll(cx));
            this.pending_read = None;

            match result.map_err(into_io)? {
                Some(mb) => this
                    .leftover
                    .extend(mb.into_iter().map(|p| p.payload).filter(|p| !p.is_empty())),
                None => this.eof = true,
            }
        }
    }
}

impl AsyncWrite for LinkStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.pending_write.is_none() {
            let writer = this.writer.clone();
            let mb = chunk(buf);
            this.pending_write = Some((Box::pin(async move { writer.write_multi_buffer(mb).await }), buf.len()));
        }

        let Some((pending, len)) = this.pending_write.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let len = *len;
        let result = ready!(pending.as_mut().poll(cx));
        this.pending_write = None;
        result.map_err(into_io)?;
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Packet view of a Link
///
/// Reads hand out one datagram at a time; the rest of a batch waits for the
/// next read. Datagrams without an endpoint are reported as coming from the
/// connection's destination.
pub struct LinkPacketConn {
    link: Link,
    destination: Destination,
    cached: tokio::sync::Mutex<VecDeque<Packet>>,
}

impl LinkPacketConn {
    pub fn new(link: Link, destination: Destination) -> Self {
        Self {
            link,
            destination,
            cached: tokio::sync::Mutex::new(VecDeque::new()),
        }
    }

    /// Next datagram and the address it belongs to. `Ok(None)` at end of data.
    pub async fn read_packet(&self) -> Result<Option<(Bytes, Address)>> {
        let mut cached = self.cached.lock().await;
        if cached.is_empty() {
            match self.link.reader.read_multi_buffer().await? {
                Some(mb) => cached.extend(mb),
                None => return Ok(None),
            }
        }

        Ok(cached.pop_front().map(|packet| {
            let address = match &packet.endpoint {
                Some(endpoint) => to_address(endpoint),
                None => to_address(&self.destination),
            };
            (packet.payload, address)
        }))
    }

    pub async fn write_packet(&self, payload: Bytes, address: Address) -> Result<()> {
        let packet = Packet::with_endpoint(payload, to_destination(address, Network::Udp));
        self.link.writer.write_multi_buffer(vec![packet]).await
    }

    /// Drops cached datagrams. The Link stays open.
    pub async fn close(&self) {
        self.cached.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::buffer::BUFFER_SIZE;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_stream_writes_are_chunked() {
        let (inbound, outbound) = Link::pair();
        let mut stream = LinkStream::new(inbound);

        let data = vec![7u8; BUFFER_SIZE * 2 + 10];
        stream.write_all(&data).await.unwrap();

        let mb = outbound.reader.read_multi_buffer().await.unwrap().unwrap();
        let sizes: Vec<_> = mb.iter().map(|p| p.len()).collect();
        assert_eq!(sizes, vec![BUFFER_SIZE, BUFFER_SIZE, 10]);
    }

    #[tokio::test]
    async fn test_stream_reads_across_buffers() {
        let (inbound, outbound) = Link::pair();
        let mut stream = LinkStream::new(inbound);

        outbound
            .writer
            .write_multi_buffer(vec![Packet::new(&b"hello "[..]), Packet::new(&b"world"[..])])
            .await
            .unwrap();
        outbound.writer.close();

        let mut small = [0u8; 4];
        stream.read_exact(&mut small).await.unwrap();
        assert_eq!(&small, b"hell");

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"o world");
    }

    #[tokio::test]
    async fn test_stream_shutdown_keeps_link_open() {
        let (inbound, outbound) = Link::pair();
        let mut stream = LinkStream::new(inbound);
        stream.shutdown().await.unwrap();

        stream.write_all(b"still open").await.unwrap();
        let mb = outbound.reader.read_multi_buffer().await.unwrap().unwrap();
        assert_eq!(&mb[0].payload[..], b"still open");
    }

    #[tokio::test]
    async fn test_packet_conn_caches_batch_and_defaults_endpoint() {
        let (inbound, outbound) = Link::pair();
        let dest = Destination::udp(Address::from(("10.0.0.1", 53)));
        let conn = LinkPacketConn::new(inbound, dest);

        let other = Destination::udp(Address::domain("dns.example", 853));
        outbound
            .writer
            .write_multi_buffer(vec![Packet::new(&b"one"[..]), Packet::with_endpoint(&b"two"[..], other)])
            .await
            .unwrap();
        outbound.writer.close();

        let (payload, address) = conn.read_packet().await.unwrap().unwrap();
        assert_eq!(&payload[..], b"one");
        assert_eq!(address, Address::from(("10.0.0.1", 53)));

        let (payload, address) = conn.read_packet().await.unwrap().unwrap();
        assert_eq!(&payload[..], b"two");
        assert_eq!(address, Address::domain("dns.example", 853));

        assert!(conn.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_packet_conn_write_sets_udp_endpoint() {
        let (inbound, outbound) = Link::pair();
        let conn = LinkPacketConn::new(inbound, Destination::udp(Address::from(("10.0.0.1", 53))));

        conn.write_packet(Bytes::from_static(b"reply"), Address::from(("1.1.1.1", 53)))
            .await
            .unwrap();

        let mb = outbound.reader.read_multi_buffer().await.unwrap().unwrap();
        assert_eq!(mb[0].endpoint, Some(Destination::udp(Address::from(("1.1.1.1", 53)))));
    }

    #[test]
    fn test_return_error_swallows_closed() {
        assert!(return_error(Err(Error::ConnectionClosed)).is_ok());
        assert!(return_error(Err(Error::NoDestination)).is_err());
        assert!(return_error(Ok(())).is_ok());
    }
}
