//! HTTP/2 tunnel transport
//!
//! Every outbound stream is one h2 request whose request body carries the
//! uplink and whose response body carries the downlink. One h2 connection per
//! [`DestinationKey`] is cached in a [`ConnectionPool`] and shared by all
//! requests; the grpc transport reuses [`H2Connection`] the same way.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use h2::client::{ResponseFuture, SendRequest};
use h2::{RecvStream, SendStream};
use http::header::{HeaderName, HeaderValue, ACCEPT_ENCODING};
use http::{Method, Request, StatusCode};
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{Destination, IntoStream, RequestScope, Result, Stream};
use crate::error::Error;

use super::key::DestinationKey;
use super::pool::{ConnectionPool, Pooled};
use super::sockopt;
use super::tls::negotiated_alpn;
use super::{resolve, HttpSettings, StreamSettings, TransportDialer, TransportProtocol};

/// Host used when no host is configured
const DEFAULT_HOST: &str = "www.example.com";

pub(crate) fn h2_error(e: h2::Error) -> Error {
    if e.is_io() {
        e.into_io().map(Error::Io).unwrap_or(Error::ConnectionClosed)
    } else {
        Error::Protocol(format!("h2: {}", e))
    }
}

/// A client h2 connection whose driver runs on its own task
pub struct H2Connection {
    send: SendRequest<Bytes>,
    done: CancellationToken,
    driver: JoinHandle<()>,
}

impl H2Connection {
    /// Run the client handshake over an established byte stream.
    pub async fn handshake<T>(io: T) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (send, connection) = h2::client::handshake(io).await.map_err(h2_error)?;

        let done = CancellationToken::new();
        let finished = done.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("[h2] connection ended: {}", e);
            }
            finished.cancel();
        });

        Ok(Self { send, done, driver })
    }

    /// Dial `key` and run the h2 handshake, over TLS when the key carries it.
    ///
    /// With `require_tls` the peer must also negotiate ALPN `h2`.
    pub async fn connect(key: &DestinationKey, require_tls: bool) -> Result<Self> {
        let dest = &key.destination;
        let addr = resolve(&dest.address).await?;
        let tcp = sockopt::dial_tcp(addr, &key.sockopt)
            .await
            .map_err(|e| Error::DialFailed(format!("{}: {}", dest, e)))?;

        match &key.tls {
            Some(tls) => {
                let stream = tls.connect(&dest.address, tcp.into_stream(), &["h2"]).await?;
                let alpn = negotiated_alpn(&stream);
                if require_tls && alpn.as_deref() != Some(&b"h2"[..]) {
                    return Err(Error::Protocol(format!(
                        "unexpected ALPN protocol {:?}; want h2",
                        alpn.map(|p| String::from_utf8_lossy(&p).into_owned())
                    )));
                }
                Self::handshake(stream).await
            }
            None if require_tls => Err(Error::Config("TLS must be enabled for http transport".into())),
            None => Self::handshake(tcp).await,
        }
    }

    /// Start a request with a streaming body.
    pub async fn send_request(&self, request: Request<()>) -> Result<(ResponseFuture, SendStream<Bytes>)> {
        let mut send = self.send.clone().ready().await.map_err(h2_error)?;
        send.send_request(request, false).map_err(h2_error)
    }
}

impl Pooled for H2Connection {
    fn is_alive(&self) -> bool {
        !self.done.is_cancelled()
    }

    fn close(&self) {
        self.driver.abort();
        self.done.cancel();
    }
}

enum Downlink {
    /// Response headers not seen yet
    Pending(Pin<Box<ResponseFuture>>),
    Body(RecvStream),
}

/// One h2 request/response pair as a duplex byte stream
pub struct H2Stream {
    send: SendStream<Bytes>,
    recv: Downlink,
    /// Buffered received data
    recv_buf: Bytes,
    /// Whether we've sent END_STREAM
    shutdown_sent: bool,
}

impl H2Stream {
    /// Stream over a request whose response was already accepted.
    pub fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        Self {
            send,
            recv: Downlink::Body(recv),
            recv_buf: Bytes::new(),
            shutdown_sent: false,
        }
    }

    /// Stream whose response headers are awaited on first read.
    pub fn pending(send: SendStream<Bytes>, response: ResponseFuture) -> Self {
        Self {
            send,
            recv: Downlink::Pending(Box::pin(response)),
            recv_buf: Bytes::new(),
            shutdown_sent: false,
        }
    }
}

fn unexpected_status(status: StatusCode) -> io::Error {
    io::Error::other(format!("unexpected status {}", status.as_u16()))
}

fn h2_io(e: h2::Error) -> io::Error {
    if e.is_io() {
        e.into_io().unwrap_or_else(|| io::ErrorKind::ConnectionAborted.into())
    } else {
        io::Error::other(e)
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.recv_buf.is_empty() {
            let to_copy = self.recv_buf.len().min(buf.remaining());
            buf.put_slice(&self.recv_buf[..to_copy]);
            self.recv_buf = self.recv_buf.slice(to_copy..);
            return Poll::Ready(Ok(()));
        }

        let this = &mut *self;
        loop {
            match &mut this.recv {
                Downlink::Pending(response) => {
                    let response = ready!(response.as_mut().poll(cx)).map_err(h2_io)?;
                    if response.status() != StatusCode::OK {
                        return Poll::Ready(Err(unexpected_status(response.status())));
                    }
                    this.recv = Downlink::Body(response.into_body());
                }
                Downlink::Body(recv) => {
                    return match ready!(recv.poll_data(cx)) {
                        Some(Ok(data)) => {
                            // Release capacity so sender can continue
                            let _ = recv.flow_control().release_capacity(data.len());

                            let to_copy = data.len().min(buf.remaining());
                            buf.put_slice(&data[..to_copy]);
                            if to_copy < data.len() {
                                this.recv_buf = data.slice(to_copy..);
                            }
                            Poll::Ready(Ok(()))
                        }
                        Some(Err(e)) => Poll::Ready(Err(h2_io(e))),
                        None => Poll::Ready(Ok(())),
                    };
                }
            }
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        // Only reserve capacity when needed to avoid resetting h2's internal state on re-polls
        if self.send.capacity() == 0 {
            self.send.reserve_capacity(buf.len());
        }

        match ready!(self.send.poll_capacity(cx)) {
            Some(Ok(capacity)) => {
                let to_send = buf.len().min(capacity);
                self.send
                    .send_data(Bytes::copy_from_slice(&buf[..to_send]), false)
                    .map_err(h2_io)?;
                Poll::Ready(Ok(to_send))
            }
            Some(Err(e)) => Poll::Ready(Err(h2_io(e))),
            None => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "h2 stream closed"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // the connection driver handles transmission
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.shutdown_sent {
            self.send.send_data(Bytes::new(), true).map_err(h2_io)?;
            self.shutdown_sent = true;
        }
        Poll::Ready(Ok(()))
    }
}

/// Build the tunnel request for `dest`.
pub(crate) fn build_request(dest: &Destination, settings: &HttpSettings) -> Result<Request<()>> {
    let method = Method::from_bytes(settings.method().as_bytes())
        .map_err(|_| Error::Config(format!("invalid http method {}", settings.method())))?;
    let host = settings
        .host
        .choose(&mut rand::thread_rng())
        .map(String::as_str)
        .unwrap_or(DEFAULT_HOST);

    let mut request = Request::builder()
        .method(method)
        .uri(format!("https://{}{}", host, settings.normalized_path()))
        .body(())
        .map_err(|e| Error::Config(format!("invalid http request to {}: {}", dest, e)))?;

    let headers = request.headers_mut();
    for (name, values) in &settings.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::Config(format!("invalid header name {}", name)))?;
        for value in values {
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::Config(format!("invalid value for header {}", name)))?;
            headers.append(name.clone(), value);
        }
    }
    // Disable any compression method from server
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    Ok(request)
}

/// Send `request` and wait for a 200 response.
pub(crate) async fn open_tunnel(conn: &H2Connection, request: Request<()>) -> Result<H2Stream> {
    let (response, send) = conn.send_request(request).await?;
    let response = response.await.map_err(h2_error)?;
    if response.status() != StatusCode::OK {
        return Err(Error::DialFailed(format!("unexpected status {}", response.status().as_u16())));
    }
    Ok(H2Stream::new(send, response.into_body()))
}

/// HTTP/2 tunnel dialer
pub struct HttpDialer {
    pool: ConnectionPool<H2Connection>,
}

impl HttpDialer {
    pub fn new() -> Self {
        Self {
            pool: ConnectionPool::new("http"),
        }
    }
}

impl Default for HttpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportDialer for HttpDialer {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Http
    }

    async fn dial(&self, _scope: &RequestScope, dest: &Destination, settings: &StreamSettings) -> Result<Stream> {
        if settings.tls.is_none() {
            return Err(Error::Config("TLS must be enabled for http transport".into()));
        }
        let key = settings.key_for(dest);
        let request = build_request(dest, &settings.http)?;

        let (conn, evictor) = self
            .pool
            .acquire_or_dial(&key, || H2Connection::connect(&key, true))
            .await?;

        match open_tunnel(&conn, request).await {
            Ok(stream) => Ok(stream.into_stream()),
            Err(e @ Error::DialFailed(_)) => Err(e),
            Err(e) => {
                warn!("[http] failed to dial to {}: {}", dest, e);
                evictor.evict().await;
                Err(Error::DialFailed(format!("{}: {}", dest, e)))
            }
        }
    }

    async fn close(&self) {
        self.pool.close_all().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::common::Address;

    /// In-process h2 server echoing each request body back with `status`.
    pub(crate) fn echo_server(io: DuplexStream, status: u16) -> JoinHandle<Vec<Request<()>>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut conn = h2::server::handshake(io).await.unwrap();
            while let Some(Ok((request, mut respond))) = conn.accept().await {
                let (parts, mut body) = request.into_parts();
                seen.push(Request::from_parts(parts, ()));

                let response = http::Response::builder().status(status).body(()).unwrap();
                let mut send = respond.send_response(response, false).unwrap();
                tokio::spawn(async move {
                    while let Some(Ok(chunk)) = body.data().await {
                        let _ = body.flow_control().release_capacity(chunk.len());
                        if send.send_data(chunk, false).is_err() {
                            return;
                        }
                    }
                    let _ = send.send_data(Bytes::new(), true);
                });
            }
            seen
        })
    }

    #[test]
    fn test_request_shape() {
        let mut settings = HttpSettings {
            path: "tunnel".into(),
            host: vec!["cdn.example.com".into()],
            ..Default::default()
        };
        settings.headers.insert("X-Token".into(), vec!["a".into(), "b".into()]);

        let dest = Destination::tcp(Address::domain("server.example.com", 443));
        let request = build_request(&dest, &settings).unwrap();

        assert_eq!(request.method(), Method::PUT);
        assert_eq!(request.uri().path(), "/tunnel");
        assert_eq!(request.uri().host(), Some("cdn.example.com"));
        assert_eq!(request.headers()[ACCEPT_ENCODING], "identity");
        let tokens: Vec<_> = request.headers().get_all("x-token").iter().collect();
        assert_eq!(tokens, ["a", "b"]);
    }

    #[test]
    fn test_default_host_and_custom_method() {
        let settings = HttpSettings {
            method: Some("POST".into()),
            ..Default::default()
        };
        let request = build_request(&Destination::tcp(Address::domain("a", 1)), &settings).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().host(), Some(DEFAULT_HOST));
        assert_eq!(request.uri().path(), "/");
    }

    #[tokio::test]
    async fn test_tunnel_echo() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = echo_server(server_io, 200);

        let conn = H2Connection::handshake(client_io).await.unwrap();
        assert!(conn.is_alive());

        let dest = Destination::tcp(Address::domain("a", 443));
        let request = build_request(&dest, &HttpSettings::default()).unwrap();
        let mut stream = open_tunnel(&conn, request).await.unwrap();

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        stream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        conn.close();
        assert!(!conn.is_alive());
        let seen = server.await.unwrap();
        assert_eq!(seen[0].method(), Method::PUT);
    }

    #[tokio::test]
    async fn test_non_200_is_dial_error() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let _server = echo_server(server_io, 404);

        let conn = H2Connection::handshake(client_io).await.unwrap();
        let request = build_request(&Destination::tcp(Address::domain("a", 443)), &HttpSettings::default()).unwrap();

        let result = open_tunnel(&conn, request).await;
        assert!(matches!(result, Err(Error::DialFailed(_))));
    }

    #[tokio::test]
    async fn test_pending_response_checked_on_first_read() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let _server = echo_server(server_io, 404);

        let conn = H2Connection::handshake(client_io).await.unwrap();
        let request = build_request(&Destination::tcp(Address::domain("a", 443)), &HttpSettings::default()).unwrap();
        let (response, send) = conn.send_request(request).await.unwrap();
        let mut stream = H2Stream::pending(send, response);

        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_tls_required() {
        let result = HttpDialer::new()
            .dial(
                &RequestScope::default(),
                &Destination::tcp(Address::domain("a", 443)),
                &StreamSettings::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
