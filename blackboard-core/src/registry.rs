//! The authoritative set of open connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::{Connection, ConnectionId};

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Arc<dyn Connection>>,
    /// Set by `close_all`; no registrations are accepted afterwards.
    closed: bool,
}

/// Shared, thread-safe registry of open connections.
///
/// Cloning is shallow: every clone sees the same set. All access goes through
/// one mutex, and iteration happens on snapshots so the lock is never held
/// while frames are being written.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned guard is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a connection. Returns `false` (and leaves the set unchanged) if a
    /// connection with the same id is already registered, or if the registry
    /// has been closed.
    pub fn register(&self, connection: Arc<dyn Connection>) -> bool {
        let mut inner = self.lock();
        let id = connection.id();
        if inner.closed || inner.connections.contains_key(&id) {
            return false;
        }
        inner.connections.insert(id, connection);
        true
    }

    /// Removes a connection if present. Only the first of several concurrent
    /// calls for the same id gets the handle back.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        self.lock().connections.remove(&id)
    }

    /// Copies out the current set for iteration.
    pub fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        self.lock().connections.values().cloned().collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().connections.is_empty()
    }

    /// Stops accepting registrations and empties the registry, returning
    /// everything that was registered. Used on shutdown.
    pub fn close_all(&self) -> Vec<Arc<dyn Connection>> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.connections.drain().map(|(_, connection)| connection).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
