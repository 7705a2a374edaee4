//! Process-wide registries of TCP sockets.
//!
//! The [`ConnectionTable`] demultiplexes inbound segments by tuple. It holds
//! weak references: a socket stays registered until it reaches `Closed` or
//! its last strong reference goes away. The [`ClosingSet`] keeps sockets that
//! were closed by their owner alive until their teardown handshake finishes.
//!
//! The table lock is a leaf: nothing else is locked while it is held, and
//! strong references taken under it are released after it is dropped.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard, Weak};

use tracing::debug;

use crate::protocol::SocketTuple;
use crate::{Error, Result};

/// Registry mapping socket tuples to sockets.
#[derive(Debug)]
pub struct ConnectionTable<S> {
    sockets: RwLock<HashMap<SocketTuple, Weak<S>>>,
}

impl<S> Default for ConnectionTable<S> {
    fn default() -> Self {
        Self {
            sockets: RwLock::new(HashMap::new()),
        }
    }
}

impl<S> ConnectionTable<S> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `socket` under `tuple`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressInUse`] if a live socket is already registered
    /// under `tuple`.
    pub fn insert(&self, tuple: SocketTuple, socket: Weak<S>) -> Result<()> {
        self.lock_exclusive().insert(tuple, socket)
    }

    /// Unregisters whatever socket is registered under `tuple`.
    pub fn remove(&self, tuple: &SocketTuple) -> bool {
        self.lock_exclusive().sockets.remove(tuple).is_some()
    }

    /// Unregisters `tuple` only if it is registered to the socket at `socket`.
    ///
    /// Used by teardown paths, which must not evict a newer socket that took
    /// over the tuple.
    pub fn remove_socket(&self, tuple: &SocketTuple, socket: *const S) -> bool {
        let mut guard = self.lock_exclusive();

        match guard.sockets.entry(*tuple) {
            Entry::Occupied(entry) if Weak::as_ptr(entry.get()) == socket => {
                entry.remove();
                true
            }
            _ => false,
        }
    }

    /// Finds the socket an inbound segment for `tuple` belongs to.
    ///
    /// Tries, in order: the exact tuple, the tuple with the remote half
    /// zeroed, and the tuple with everything but the local port zeroed. The
    /// first live match wins.
    pub fn lookup(&self, tuple: &SocketTuple) -> Option<Arc<S>> {
        let sockets = self.sockets.read().unwrap_or_else(PoisonError::into_inner);

        tuple
            .lookup_keys()
            .iter()
            .find_map(|key| sockets.get(key).and_then(Weak::upgrade))
    }

    /// Returns `true` if a live socket is registered under exactly `tuple`.
    pub fn contains(&self, tuple: &SocketTuple) -> bool {
        let sockets = self.sockets.read().unwrap_or_else(PoisonError::into_inner);
        sockets.get(tuple).is_some_and(|socket| socket.strong_count() > 0)
    }

    /// Returns the number of registered tuples.
    pub fn len(&self) -> usize {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no tuple is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns strong references to every live registered socket, collected
    /// while holding the shared lock for the whole iteration.
    pub fn snapshot(&self) -> Vec<Arc<S>> {
        let sockets = self.sockets.read().unwrap_or_else(PoisonError::into_inner);
        sockets.values().filter_map(Weak::upgrade).collect()
    }

    /// Takes the exclusive lock, for operations that must look up and insert
    /// atomically.
    pub(crate) fn lock_exclusive(&self) -> TableGuard<'_, S> {
        TableGuard {
            sockets: self.sockets.write().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Exclusive access to a [`ConnectionTable`].
#[derive(Debug)]
pub(crate) struct TableGuard<'a, S> {
    sockets: RwLockWriteGuard<'a, HashMap<SocketTuple, Weak<S>>>,
}

impl<S> TableGuard<'_, S> {
    /// Returns `true` if a live socket is registered under exactly `tuple`.
    pub(crate) fn contains(&self, tuple: &SocketTuple) -> bool {
        self.sockets
            .get(tuple)
            .is_some_and(|socket| socket.strong_count() > 0)
    }

    pub(crate) fn insert(&mut self, tuple: SocketTuple, socket: Weak<S>) -> Result<()> {
        match self.sockets.entry(tuple) {
            Entry::Occupied(mut entry) => {
                if entry.get().strong_count() > 0 {
                    return Err(Error::AddressInUse);
                }

                // The previous owner is being destroyed; its teardown only
                // removes entries still pointing at itself.
                debug!("[{tuple}] replacing registration of a dropped socket");
                entry.insert(socket);
            }
            Entry::Vacant(entry) => {
                entry.insert(socket);
            }
        }

        Ok(())
    }
}

/// Sockets closed by their owner whose teardown handshake is still running.
#[derive(Debug)]
pub struct ClosingSet<S> {
    sockets: Mutex<HashMap<SocketTuple, Arc<S>>>,
}

impl<S> Default for ClosingSet<S> {
    fn default() -> Self {
        Self {
            sockets: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> ClosingSet<S> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps `socket` alive under `tuple` until [`remove`](Self::remove).
    pub fn insert(&self, tuple: SocketTuple, socket: Arc<S>) {
        self.lock().insert(tuple, socket);
    }

    /// Releases the socket kept under `tuple`. The reference is returned so
    /// it is dropped after the lock.
    pub fn remove(&self, tuple: &SocketTuple) -> Option<Arc<S>> {
        self.lock().remove(tuple)
    }

    /// Returns `true` if a socket is kept under `tuple`.
    pub fn contains(&self, tuple: &SocketTuple) -> bool {
        self.lock().contains_key(tuple)
    }

    /// Returns the number of closing sockets.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no socket is closing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the closing sockets.
    pub fn snapshot(&self) -> Vec<Arc<S>> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SocketTuple, Arc<S>>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
