//! Linkage between a listening socket and the connections it spawns.
//!
//! An inbound `SYN` on a listener creates a child socket that holds a weak
//! reference back to the listener (its originator) and sits in the
//! listener's pending set. Once the child finishes its handshake it moves
//! itself from the pending set to the accept queue, exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::fsm::{ConnectionState, DEFAULT_TCP_MSS, Direction, SocketInner, TcpSocket};
use super::headers::Flags;
use super::segment::Segment;
use super::SocketTuple;
use crate::Result;

/// Children of a listening socket that have not been accepted yet.
#[derive(Debug)]
pub(crate) struct PendingAccept {
    /// Spawned children still completing their handshake.
    pending: HashMap<SocketTuple, Arc<TcpSocket>>,
    /// Children handed over and waiting for `accept`.
    ready: VecDeque<Arc<TcpSocket>>,
    backlog: usize,
}

impl PendingAccept {
    pub(crate) fn new(backlog: usize) -> Self {
        Self {
            pending: HashMap::new(),
            ready: VecDeque::new(),
            backlog: backlog.max(1),
        }
    }

    pub(crate) fn set_backlog(&mut self, backlog: usize) {
        self.backlog = backlog.max(1);
    }

    /// Empties both collections, returning the children so they are released
    /// outside of the lock.
    pub(crate) fn take_all(&mut self) -> Vec<Arc<TcpSocket>> {
        self.pending
            .drain()
            .map(|(_, child)| child)
            .chain(self.ready.drain(..))
            .collect()
    }
}

impl TcpSocket {
    /// Pops the oldest connection handed over by a finished handshake.
    pub fn accept(&self) -> Option<Arc<TcpSocket>> {
        self.lock_passive().ready.pop_front()
    }

    /// Returns the number of spawned children still in their handshake.
    pub fn pending_count(&self) -> usize {
        self.lock_passive().pending.len()
    }

    /// Returns the number of connections waiting for `accept`.
    pub fn accept_queue_len(&self) -> usize {
        self.lock_passive().ready.len()
    }

    /// Handles a segment arriving on a listening socket.
    pub(super) fn on_listen_segment(
        &self,
        tuple: SocketTuple,
        segment: &Segment<'_>,
    ) -> Result<()> {
        let header = &segment.header;

        // An incoming RST should be ignored.
        if header.rst() {
            debug!("[{tuple}] (LISTEN) received RST: ignoring");
            return Ok(());
        }

        if header.ack() {
            debug!("[{tuple}] (LISTEN) received ACK: ignoring");
            return Ok(());
        }

        if !header.syn() {
            debug!("[{tuple}] (LISTEN) did not receive SYN: ignoring");
            return Ok(());
        }

        self.spawn_child(tuple, segment)
    }

    /// Creates the child socket for an inbound `SYN` and answers with
    /// `SYN/ACK`. A `SYN` whose tuple is already registered is dropped.
    fn spawn_child(&self, tuple: SocketTuple, segment: &Segment<'_>) -> Result<()> {
        let header = &segment.header;
        let child = TcpSocket::new(Arc::clone(&self.stack));

        {
            let mut inner = child.lock_inner();

            inner.tuple = tuple;
            inner.direction = Direction::Incoming;
            inner.originator = Some(self.weak_self.clone());

            if self
                .stack
                .table()
                .insert(tuple, Arc::downgrade(&child))
                .is_err()
            {
                debug!("[{tuple}] (LISTEN) connection already pending: dropping SYN");
                return Ok(());
            }

            inner.registered = true;
        }

        self.lock_passive()
            .pending
            .insert(tuple, Arc::clone(&child));

        let mut inner = child.lock_inner();

        inner.seq = self.stack.random().next_u32();
        inner.ack = header.seq_number().wrapping_add(1);
        inner.peer_mss = header.options().mss().unwrap_or(DEFAULT_TCP_MSS);

        if let Err(err) = child.send_segment(&mut inner, Flags::SYN | Flags::ACK, &[]) {
            warn!("[{tuple}] (LISTEN) failed to answer SYN: {err}");

            inner.originator = None;
            child.unregister(&mut inner);
            drop(inner);

            let abandoned = self.lock_passive().pending.remove(&tuple);
            drop(abandoned);

            return Err(err);
        }

        child.set_state(&mut inner, ConnectionState::SynReceived, "received SYN");

        Ok(())
    }

    /// Hands the socket over to its originator, if it still has one. Runs at
    /// most once: the reference is cleared on the first call.
    pub(super) fn release_to_originator(&self, inner: &mut SocketInner) {
        let Some(originator) = inner.originator.take() else {
            return;
        };

        let Some(parent) = originator.upgrade() else {
            error!(
                "[{}] ({}) originator released before handoff",
                inner.tuple, inner.state
            );
            return;
        };

        if parent.release_for_accept(&inner.tuple) {
            debug!("[{}] ({}) handed over to listener", inner.tuple, inner.state);
        }
    }

    /// Moves the child spawned for `tuple` from the pending set to the accept
    /// queue. Returns `false` if it was not pending or the queue is full.
    fn release_for_accept(&self, tuple: &SocketTuple) -> bool {
        let mut passive = self.lock_passive();

        let Some(child) = passive.pending.remove(tuple) else {
            return false;
        };

        if passive.ready.len() >= passive.backlog {
            let backlog = passive.backlog;
            drop(passive);

            warn!("[{tuple}] accept backlog of {backlog} reached: dropping connection");
            drop(child);

            return false;
        }

        passive.ready.push_back(child);
        drop(passive);

        self.wait.notify_all();

        true
    }
}
