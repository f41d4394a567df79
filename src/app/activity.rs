//! Activity timer: cancels a pipeline scope after a period without traffic
//!
//! Both copy directions call [`ActivityTimer::touch`] on every transfer. The
//! idle budget can be swapped at runtime (a one-sided flow gets a short
//! budget once the other side finished).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

struct State {
    last_activity: Instant,
    timeout: Duration,
}

struct Inner {
    state: Mutex<State>,
    changed: Notify,
    /// Cancelled on expiry
    scope: CancellationToken,
    /// Stops the watcher task without touching the scope
    stop: CancellationToken,
}

impl Inner {
    fn deadline(&self) -> Instant {
        let state = self.state.lock();
        state.last_activity + state.timeout
    }
}

/// Idle-timeout driver for one pipeline
pub struct ActivityTimer {
    inner: Arc<Inner>,
}

impl ActivityTimer {
    /// Start watching. A zero `timeout` cancels `scope` right away.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(scope: CancellationToken, timeout: Duration) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                last_activity: Instant::now(),
                timeout,
            }),
            changed: Notify::new(),
            scope,
            stop: CancellationToken::new(),
        });

        if timeout.is_zero() {
            inner.scope.cancel();
        } else {
            tokio::spawn(watch(inner.clone()));
        }

        Self { inner }
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.inner.state.lock().last_activity = Instant::now();
    }

    /// Replace the idle budget and restart the clock. Zero cancels immediately.
    pub fn set_timeout(&self, timeout: Duration) {
        if timeout.is_zero() {
            self.inner.scope.cancel();
            return;
        }

        {
            let mut state = self.inner.state.lock();
            state.timeout = timeout;
            state.last_activity = Instant::now();
        }
        self.inner.changed.notify_one();
    }

    pub fn timeout(&self) -> Duration {
        self.inner.state.lock().timeout
    }
}

impl Drop for ActivityTimer {
    fn drop(&mut self) {
        self.inner.stop.cancel();
    }
}

async fn watch(inner: Arc<Inner>) {
    loop {
        let deadline = inner.deadline();
        tokio::select! {
            _ = inner.stop.cancelled() => return,
            _ = inner.scope.cancelled() => return,
            _ = inner.changed.notified() => continue,
            _ = tokio::time::sleep_until(deadline) => {
                // touched while asleep
                if Instant::now() < inner.deadline() {
                    continue;
                }
                trace!("[timer] idle for {:?}, cancelling", inner.state.lock().timeout);
                inner.scope.cancel();
                return;
            }
        }
    }
}
