//! Link - packet-oriented duplex channel with interrupt support
//!
//! A Link is the dispatcher-side end of a proxied flow: a reader yielding
//! batches of packets from the destination and a writer accepting batches
//! headed to it. Either half can be closed gracefully (end of data) or
//! interrupted (abandon buffered data, fail pending and future calls).
//!
//! The in-memory [`pipe`] is the default implementation; the dispatcher
//! builds two crossed pipes per flow.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::buffer::MultiBuffer;
use crate::error::{Error, Result};

/// Default number of batches a pipe buffers before writers wait
const DEFAULT_PIPE_CAPACITY: usize = 16;

/// Reading half of a Link
#[async_trait]
pub trait LinkReader: Send + Sync {
    /// Read the next batch. `Ok(None)` once the writer closed and everything was drained.
    async fn read_multi_buffer(&self) -> Result<Option<MultiBuffer>>;

    /// Abandon buffered data; pending and future reads fail.
    fn interrupt(&self);
}

/// Writing half of a Link
#[async_trait]
pub trait LinkWriter: Send + Sync {
    async fn write_multi_buffer(&self, mb: MultiBuffer) -> Result<()>;

    /// Signal end of data. Buffered batches are still delivered.
    fn close(&self);

    /// Abandon buffered data; pending and future writes fail.
    fn interrupt(&self);
}

/// Reader + writer pair for one proxied flow
#[derive(Clone)]
pub struct Link {
    pub reader: Arc<dyn LinkReader>,
    pub writer: Arc<dyn LinkWriter>,
}

impl Link {
    pub fn new(reader: Arc<dyn LinkReader>, writer: Arc<dyn LinkWriter>) -> Self {
        Self { reader, writer }
    }

    /// Two crossed pipes: what one link writes the other reads.
    pub fn pair() -> (Link, Link) {
        let (up_reader, up_writer) = pipe(DEFAULT_PIPE_CAPACITY);
        let (down_reader, down_writer) = pipe(DEFAULT_PIPE_CAPACITY);

        let inbound = Link::new(Arc::new(down_reader), Arc::new(up_writer));
        let outbound = Link::new(Arc::new(up_reader), Arc::new(down_writer));
        (inbound, outbound)
    }

    /// Interrupt both halves.
    pub fn interrupt(&self) {
        self.reader.interrupt();
        self.writer.interrupt();
    }
}

fn interrupted() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::ConnectionAborted, "pipe interrupted"))
}

/// Create an in-memory pipe buffering up to `capacity` batches.
pub fn pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let interrupted = CancellationToken::new();

    (
        PipeReader {
            rx: tokio::sync::Mutex::new(rx),
            interrupted: interrupted.clone(),
        },
        PipeWriter {
            tx: Mutex::new(Some(tx)),
            interrupted,
        },
    )
}

/// Read half of an in-memory pipe
pub struct PipeReader {
    rx: tokio::sync::Mutex<mpsc::Receiver<MultiBuffer>>,
    interrupted: CancellationToken,
}

/// Write half of an in-memory pipe
pub struct PipeWriter {
    tx: Mutex<Option<mpsc::Sender<MultiBuffer>>>,
    interrupted: CancellationToken,
}

impl PipeReader {
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.is_cancelled()
    }
}

impl PipeWriter {
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

#[async_trait]
impl LinkReader for PipeReader {
    async fn read_multi_buffer(&self) -> Result<Option<MultiBuffer>> {
        if self.interrupted.is_cancelled() {
            return Err(interrupted());
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.interrupted.cancelled() => Err(interrupted()),
            mb = rx.recv() => Ok(mb),
        }
    }

    fn interrupt(&self) {
        self.interrupted.cancel();
    }
}

#[async_trait]
impl LinkWriter for PipeWriter {
    async fn write_multi_buffer(&self, mb: MultiBuffer) -> Result<()> {
        if self.interrupted.is_cancelled() {
            return Err(interrupted());
        }
        if mb.is_empty() {
            return Ok(());
        }

        let tx = self.tx.lock().clone().ok_or(Error::ConnectionClosed)?;
        tokio::select! {
            biased;
            _ = self.interrupted.cancelled() => Err(interrupted()),
            sent = tx.send(mb) => sent.map_err(|_| Error::ConnectionClosed),
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }

    fn interrupt(&self) {
        self.tx.lock().take();
        self.interrupted.cancel();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::buffer::{chunk, Packet};

    #[tokio::test]
    async fn test_pipe_delivers_then_eof() {
        let (reader, writer) = pipe(4);

        writer.write_multi_buffer(chunk(b"hello")).await.unwrap();
        writer.close();

        let mb = reader.read_multi_buffer().await.unwrap().unwrap();
        assert_eq!(mb, vec![Packet::new(&b"hello"[..])]);
        assert!(reader.read_multi_buffer().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (_reader, writer) = pipe(4);
        writer.close();
        assert!(writer.is_closed());

        let result = writer.write_multi_buffer(chunk(b"late")).await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_interrupt_unblocks_pending_read() {
        let (reader, _writer) = pipe(4);
        let reader = Arc::new(reader);

        let pending = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.read_multi_buffer().await })
        };
        tokio::task::yield_now().await;

        reader.interrupt();
        let result = pending.await.unwrap();
        assert!(result.is_err());
        assert!(reader.is_interrupted());
    }

    #[tokio::test]
    async fn test_link_pair_is_crossed() {
        let (inbound, outbound) = Link::pair();

        inbound.writer.write_multi_buffer(chunk(b"up")).await.unwrap();
        let mb = outbound.reader.read_multi_buffer().await.unwrap().unwrap();
        assert_eq!(&mb[0].payload[..], b"up");

        outbound.writer.write_multi_buffer(chunk(b"down")).await.unwrap();
        let mb = inbound.reader.read_multi_buffer().await.unwrap().unwrap();
        assert_eq!(&mb[0].payload[..], b"down");
    }
}
