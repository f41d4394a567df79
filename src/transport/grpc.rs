//! gRPC ("gun") tunnel transport
//!
//! A tunnel is one bidirectional-streaming call to `/{service}/Tun` on a
//! pooled h2 connection. Each message is a gRPC length-prefixed frame holding
//! a protobuf message with a single `bytes` field (tag 1).

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{HeaderValue, CONTENT_TYPE, TE};
use http::{Method, Request};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::common::{Destination, IntoStream, RequestScope, Result, Stream};
use crate::error::Error;

use super::http::{H2Connection, H2Stream};
use super::pool::ConnectionPool;
use super::{GrpcSettings, StreamSettings, TransportDialer, TransportProtocol};

/// Service used when none is configured
const DEFAULT_SERVICE_NAME: &str = "GunService";

/// Largest payload packed into one frame
const MAX_FRAME_PAYLOAD: usize = 32 * 1024;

/// gRPC header: compressed flag + u32 length
const GRPC_HEADER_LEN: usize = 5;

/// Largest message accepted from a peer, the gRPC default receive limit
const MAX_MESSAGE_LEN: usize = 4 * 1024 * 1024;

/// protobuf field 1, wire type 2
const HUNK_TAG: u8 = 0x0A;

fn put_varint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn get_varint(src: &mut Bytes) -> io::Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if !src.has_remaining() {
            break;
        }
        let byte = src.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "malformed varint in gun frame"))
}

/// Append one gun frame carrying `payload` to `dst`.
pub(crate) fn encode_frame(payload: &[u8], dst: &mut BytesMut) {
    let message_len = 1 + varint_len(payload.len() as u64) + payload.len();
    dst.reserve(GRPC_HEADER_LEN + message_len);
    dst.put_u8(0);
    dst.put_u32(message_len as u32);
    dst.put_u8(HUNK_TAG);
    put_varint(dst, payload.len() as u64);
    dst.put_slice(payload);
}

/// Split one complete frame off `src`, returning its payload.
pub(crate) fn decode_frame(src: &mut BytesMut) -> io::Result<Option<Bytes>> {
    if src.len() < GRPC_HEADER_LEN {
        return Ok(None);
    }
    let message_len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
    if message_len > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("gun frame of {} bytes exceeds the limit", message_len),
        ));
    }
    if src.len() < GRPC_HEADER_LEN + message_len {
        return Ok(None);
    }

    src.advance(GRPC_HEADER_LEN);
    let mut message = src.split_to(message_len).freeze();
    if message.is_empty() {
        return Ok(Some(Bytes::new()));
    }
    if message.get_u8() != HUNK_TAG {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected field in gun frame"));
    }
    let len = get_varint(&mut message)? as usize;
    if len > message.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated gun frame"));
    }
    Ok(Some(message.split_to(len)))
}

/// Gun framing over a byte stream
pub struct GunStream<S> {
    inner: S,
    /// Raw bytes not yet parsed into frames
    raw: BytesMut,
    /// Payload of the current frame not yet returned
    pending: Bytes,
    /// Encoded frame not yet written to `inner`
    write_buf: BytesMut,
    /// Payload length of the frame in `write_buf`, reported once it is written
    unacked: Option<usize>,
    scratch: Box<[u8]>,
}

impl<S> GunStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            raw: BytesMut::new(),
            pending: Bytes::new(),
            write_buf: BytesMut::new(),
            unacked: None,
            scratch: vec![0u8; 16 * 1024].into_boxed_slice(),
        }
    }
}

impl<S: AsyncWrite + Unpin> GunStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for GunStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let to_copy = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..to_copy]);
                this.pending.advance(to_copy);
                return Poll::Ready(Ok(()));
            }

            if let Some(payload) = decode_frame(&mut this.raw)? {
                this.pending = payload;
                continue;
            }

            let mut read_buf = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            if filled.is_empty() {
                if this.raw.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a gun frame",
                )));
            }
            this.raw.extend_from_slice(filled);
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for GunStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // a frame left by a pending write belongs to the same caller data
        if this.unacked.is_none() {
            let n = buf.len().min(MAX_FRAME_PAYLOAD);
            encode_frame(&buf[..n], &mut this.write_buf);
            this.unacked = Some(n);
        }

        ready!(this.poll_drain(cx))?;
        Poll::Ready(Ok(this.unacked.take().unwrap_or(0)))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

pub(crate) fn build_request(dest: &Destination, settings: &GrpcSettings, secure: bool) -> Result<Request<()>> {
    let service = if settings.service_name.is_empty() {
        DEFAULT_SERVICE_NAME
    } else {
        settings.service_name.as_str()
    };
    let scheme = if secure { "https" } else { "http" };

    let mut request = Request::builder()
        .method(Method::POST)
        .uri(format!("{}://{}/{}/Tun", scheme, dest.address, service))
        .body(())
        .map_err(|e| Error::Config(format!("invalid grpc request to {}: {}", dest, e)))?;
    let headers = request.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert(TE, HeaderValue::from_static("trailers"));
    Ok(request)
}

/// gRPC tunnel dialer
pub struct GrpcDialer {
    pool: ConnectionPool<H2Connection>,
}

impl GrpcDialer {
    pub fn new() -> Self {
        Self {
            pool: ConnectionPool::new("grpc"),
        }
    }
}

impl Default for GrpcDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportDialer for GrpcDialer {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Grpc
    }

    async fn dial(&self, _scope: &RequestScope, dest: &Destination, settings: &StreamSettings) -> Result<Stream> {
        debug!("[grpc] creating connection to {}", dest);
        let key = settings.key_for(dest);
        let request = build_request(dest, &settings.grpc, settings.tls.is_some())?;

        let (conn, evictor) = self
            .pool
            .acquire_or_dial(&key, || H2Connection::connect(&key, false))
            .await?;

        match conn.send_request(request).await {
            // the server may hold its headers until it has data to send
            Ok((response, send)) => Ok(GunStream::new(H2Stream::pending(send, response)).into_stream()),
            Err(e) => {
                evictor.evict().await;
                Err(Error::DialFailed(format!("Cannot dial grpc {}: {}", dest, e)))
            }
        }
    }

    async fn close(&self) {
        self.pool.close_all().await;
    }
}
