//! Connection Pool keyed by destination, socket options and TLS identity
//!
//! Caches expensive outbound connections (h2 clients, QUIC sessions) so that
//! later dials to the same [`DestinationKey`] reuse them.
//!
//! - One mutex guards the whole map. It is held across dial-and-insert, so
//!   concurrent callers for a key never dial twice.
//! - Health is checked lazily on every acquisition and eagerly only by
//!   [`ConnectionPool::sweep`].
//! - An entry is closed exactly once, at the moment it leaves the map.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::common::Result;

use super::key::DestinationKey;

/// A connection or session that can live in a pool
pub trait Pooled: Send + Sync + 'static {
    /// False once the underlying connection has terminated.
    fn is_alive(&self) -> bool;

    /// Release the underlying resources. Called once, on eviction.
    fn close(&self);
}

/// A pooled connection with metadata
struct PoolEntry<C> {
    id: u64,
    conn: Arc<C>,
    created_at: Instant,
}

/// The map behind the pool mutex.
pub struct PoolMap<C: Pooled> {
    entries: HashMap<DestinationKey, Vec<PoolEntry<C>>>,
    next_id: u64,
}

impl<C: Pooled> PoolMap<C> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    /// Entries for `key` in insertion order, with their ids.
    pub fn sessions(&self, key: &DestinationKey) -> Vec<(u64, Arc<C>)> {
        self.entries
            .get(key)
            .map(|list| list.iter().map(|e| (e.id, e.conn.clone())).collect())
            .unwrap_or_default()
    }

    fn first_alive(&self, key: &DestinationKey) -> Option<(u64, Arc<C>)> {
        self.entries
            .get(key)?
            .iter()
            .find(|e| e.conn.is_alive())
            .map(|e| (e.id, e.conn.clone()))
    }

    /// Record a new connection for `key`, returning its entry id.
    pub fn insert(&mut self, key: DestinationKey, conn: Arc<C>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.entry(key).or_default().push(PoolEntry {
            id,
            conn,
            created_at: Instant::now(),
        });
        id
    }

    /// Remove and close entry `id` of `key`. False if it was already gone.
    pub fn remove(&mut self, key: &DestinationKey, id: u64) -> bool {
        let Some(list) = self.entries.get_mut(key) else {
            return false;
        };
        let Some(pos) = list.iter().position(|e| e.id == id) else {
            return false;
        };

        let entry = list.remove(pos);
        if list.is_empty() {
            self.entries.remove(key);
        }
        debug!(
            "Pool: evicting connection to {} (age: {:?})",
            key,
            entry.created_at.elapsed()
        );
        entry.conn.close();
        true
    }

    /// Remove and close every dead entry of `key`.
    pub fn prune(&mut self, key: &DestinationKey) -> usize {
        let Some(list) = self.entries.get_mut(key) else {
            return 0;
        };
        let removed = retain_alive(list);
        if list.is_empty() {
            self.entries.remove(key);
        }
        removed
    }

    /// Remove and close every dead entry.
    pub fn sweep(&mut self) -> usize {
        let mut removed = 0;
        for list in self.entries.values_mut() {
            removed += retain_alive(list);
        }
        self.entries.retain(|_, list| !list.is_empty());
        removed
    }

    /// Number of entries across all keys
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct keys
    pub fn keys(&self) -> usize {
        self.entries.len()
    }

    fn close_all(&mut self) {
        for (_, list) in self.entries.drain() {
            for entry in list {
                entry.conn.close();
            }
        }
    }
}

impl<C: Pooled> Drop for PoolMap<C> {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn retain_alive<C: Pooled>(list: &mut Vec<PoolEntry<C>>) -> usize {
    let before = list.len();
    list.retain(|e| {
        if e.conn.is_alive() {
            true
        } else {
            e.conn.close();
            false
        }
    });
    before - list.len()
}

/// Connection pool for reusing connections
pub struct ConnectionPool<C: Pooled> {
    name: &'static str,
    inner: Arc<Mutex<PoolMap<C>>>,
}

impl<C: Pooled> ConnectionPool<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(PoolMap::new())),
        }
    }

    /// Return the live connection for `key`, dialing one if there is none.
    ///
    /// The pool lock is held while `dial` runs. A failed dial inserts nothing
    /// and its error is returned unchanged; retrying is up to the caller.
    pub async fn acquire_or_dial<F, Fut>(
        &self,
        key: &DestinationKey,
        dial: F,
    ) -> Result<(Arc<C>, Evictor<C>)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let mut map = self.inner.lock().await;

        if let Some((id, conn)) = map.first_alive(key) {
            trace!("[{}] reusing connection to {}", self.name, key);
            return Ok((conn, self.evictor(key.clone(), id)));
        }

        let stale = map.prune(key);
        if stale > 0 {
            debug!("[{}] dropped {} dead connection(s) to {}", self.name, stale, key);
        }

        debug!("[{}] dialing new connection to {}", self.name, key);
        let conn = Arc::new(dial().await?);
        let id = map.insert(key.clone(), conn.clone());

        Ok((conn, self.evictor(key.clone(), id)))
    }

    /// Lock the map for multi-step operations (stream multiplexing).
    pub async fn lock(&self) -> MutexGuard<'_, PoolMap<C>> {
        self.inner.lock().await
    }

    /// Handle removing entry `id` of `key`.
    pub fn evictor(&self, key: DestinationKey, id: u64) -> Evictor<C> {
        Evictor {
            pool: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    /// Remove and close every dead connection.
    pub async fn sweep(&self) -> usize {
        let removed = self.inner.lock().await.sweep();
        if removed > 0 {
            debug!("[{}] swept {} dead connection(s)", self.name, removed);
        }
        removed
    }

    /// Close everything; used on shutdown.
    pub async fn close_all(&self) {
        self.inner.lock().await.close_all();
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let map = self.inner.lock().await;
        PoolStats {
            total_connections: map.len(),
            keys: map.keys(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Removes exactly one pool entry. Safe to call any number of times.
pub struct Evictor<C: Pooled> {
    pool: Weak<Mutex<PoolMap<C>>>,
    key: DestinationKey,
    id: u64,
}

impl<C: Pooled> Evictor<C> {
    /// Remove and close the entry. False if it was already gone.
    pub async fn evict(&self) -> bool {
        let Some(pool) = self.pool.upgrade() else {
            return false;
        };
        let mut map = pool.lock().await;
        map.remove(&self.key, self.id)
    }

    pub fn key(&self) -> &DestinationKey {
        &self.key
    }
}

impl<C: Pooled> Clone for Evictor<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            key: self.key.clone(),
            id: self.id,
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub keys: usize,
}
