//! Stream Multiplexer
//!
//! Opens logical streams on pooled sessions (one QUIC connection carries many
//! bidirectional streams). Sessions for a key are tried in insertion order;
//! a new session is dialed only when none of them yields a stream.
//!
//! A background task sweeps dead sessions out of the pool every
//! [`DEFAULT_SWEEP_INTERVAL`]. It stops when the multiplexer is dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::common::{Result, Stream};
use crate::error::Error;

use super::key::DestinationKey;
use super::pool::{ConnectionPool, PoolStats, Pooled};

/// How often dead sessions are swept out of the pool
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A session able to host several logical streams.
///
/// Liveness is "the session has not terminated". A session with no open
/// streams is still alive. `open_stream` may wait for stream credit; the
/// multiplexer never waits for it.
#[async_trait]
pub trait MuxSession: Pooled {
    async fn open_stream(&self) -> Result<Stream>;
}

/// Establishes new sessions for a key
#[async_trait]
pub trait SessionDialer<S>: Send + Sync {
    async fn dial_session(&self, key: &DestinationKey) -> Result<S>;
}

pub struct StreamMultiplexer<S: MuxSession> {
    name: &'static str,
    pool: Arc<ConnectionPool<S>>,
    dialer: Arc<dyn SessionDialer<S>>,
    sweeper: CancellationToken,
}

impl<S: MuxSession> StreamMultiplexer<S> {
    /// Create a multiplexer sweeping every [`DEFAULT_SWEEP_INTERVAL`].
    ///
    /// Must be called within a tokio runtime.
    pub fn new(name: &'static str, dialer: Arc<dyn SessionDialer<S>>) -> Self {
        Self::with_sweep_interval(name, dialer, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(
        name: &'static str,
        dialer: Arc<dyn SessionDialer<S>>,
        period: Duration,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(name));
        let sweeper = CancellationToken::new();

        tokio::spawn(sweep_loop(name, pool.clone(), period, sweeper.clone()));

        Self {
            name,
            pool,
            dialer,
            sweeper,
        }
    }

    /// Open a stream to `key`, reusing a live session when possible.
    ///
    /// Existing sessions are tried without holding the pool lock, and a
    /// session that cannot open a stream at once is skipped. Only pruning and
    /// dialing a new session happen under the lock.
    ///
    /// Fails with [`Error::DialFailed`] when no session could be established
    /// and [`Error::ConnectionClosed`] when a freshly dialed session refused
    /// its first stream. The fresh session gets exactly one attempt.
    pub async fn open_stream(&self, key: &DestinationKey) -> Result<Stream> {
        let snapshot = self.pool.lock().await.sessions(key);
        if let Some(stream) = self.try_sessions(key, &snapshot).await {
            return Ok(stream);
        }

        let mut map = self.pool.lock().await;

        // sessions a concurrent caller dialed after the snapshot
        let newer: Vec<_> = map
            .sessions(key)
            .into_iter()
            .filter(|(id, _)| !snapshot.iter().any(|(seen, _)| seen == id))
            .collect();
        if let Some(stream) = self.try_sessions(key, &newer).await {
            return Ok(stream);
        }

        let pruned = map.prune(key);
        if pruned > 0 {
            debug!("[{}] pruned {} dead session(s) to {}", self.name, pruned, key);
        }

        debug!("[{}] dialing new session to {}", self.name, key);
        let session = match self.dialer.dial_session(key).await {
            Ok(session) => Arc::new(session),
            Err(e @ Error::DialFailed(_)) => return Err(e),
            Err(e) => return Err(Error::DialFailed(format!("{}: {}", key, e))),
        };
        let id = map.insert(key.clone(), session.clone());

        match try_open(session.as_ref()).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                debug!("[{}] new session to {} refused its first stream: {}", self.name, key, e);
                map.remove(key, id);
                Err(Error::ConnectionClosed)
            }
        }
    }

    async fn try_sessions(&self, key: &DestinationKey, sessions: &[(u64, Arc<S>)]) -> Option<Stream> {
        for (id, session) in sessions {
            if !session.is_alive() {
                continue;
            }
            match try_open(session.as_ref()).await {
                Ok(stream) => {
                    trace!("[{}] opened stream on session #{} to {}", self.name, id, key);
                    return Some(stream);
                }
                Err(e) => {
                    debug!("[{}] session #{} to {} refused a stream: {}", self.name, id, key, e);
                }
            }
        }
        None
    }

    /// Remove and close dead sessions now.
    pub async fn sweep(&self) -> usize {
        self.pool.sweep().await
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Close every session and stop the sweeper.
    pub async fn close(&self) {
        self.sweeper.cancel();
        self.pool.close_all().await;
    }
}

impl<S: MuxSession> Drop for StreamMultiplexer<S> {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

/// Open a stream only if the session can do so without waiting for credit.
async fn try_open<S: MuxSession>(session: &S) -> Result<Stream> {
    timeout(Duration::ZERO, session.open_stream())
        .await
        .map_err(|_| Error::Protocol("no stream credit available".into()))?
}

async fn sweep_loop<S: MuxSession>(
    name: &'static str,
    pool: Arc<ConnectionPool<S>>,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let removed = pool.sweep().await;
                trace!("[{}] periodic sweep removed {} session(s)", name, removed);
            }
        }
    }
    trace!("[{}] sweeper stopped", name);
}
