//! TCP finite state machine (FSM), as described in [RFC 793], and the socket
//! object it drives.
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::headers::{Flags, TcpHeader};
use super::passive::PendingAccept;
use super::retransmit::{OutstandingSegment, RetransmissionQueue};
use super::segment::{self, Segment};
use super::wait::WaitQueue;
use super::{SocketAddr, SocketTuple, TransportProtocol, wrapping_le, wrapping_lt};
use crate::net::RoutingDecision;
use crate::stack::Stack;
use crate::{Error, Result};

/// RFC 1122 (4.2.2.6)
///
/// If an MSS option is not received at connection setup, TCP MUST assume a
/// default send MSS of 536 (576-40).
pub const DEFAULT_TCP_MSS: u16 = 536;

/// Length of an IPv4 header without options.
const IPV4_HEADER_LEN: u16 = 20;

/// Different TCP connection states.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    /// Represents no connection state at all.
    #[default]
    Closed,
    /// Represents waiting for a connection request from any remote TCP and
    /// port.
    Listen,
    /// Represents waiting for a matching connection request after having sent a
    /// connection request.
    SynSent,
    /// Represents waiting for a confirming connection request acknowledgment
    /// after having both received and sent a connection request.
    SynReceived,
    /// Represents an open connection, data received can be delivered to the
    /// user. The normal state for the data transfer phase of the connection.
    Established,
    /// Represents waiting for a connection termination request from the remote
    /// TCP, or an acknowledgment of the connection termination request
    /// previously sent.
    FinWait1,
    /// Represents waiting for a connection termination request from the remote
    /// TCP.
    FinWait2,
    /// Represents waiting for a connection termination request from the local
    /// user.
    CloseWait,
    /// Represents waiting for a connection termination request acknowledgment
    /// from the remote TCP.
    Closing,
    /// Represents waiting for an acknowledgment of the connection termination
    /// request previously sent to the remote TCP (which includes an
    /// acknowledgment of its connection termination request).
    LastAck,
    /// Represents waiting for enough time to pass to be sure the remote TCP
    /// received the acknowledgment of its connection termination request.
    TimeWait,
}

impl ConnectionState {
    /// Returns `true` if the connection can no longer carry data in both
    /// directions.
    pub fn is_disconnected(self) -> bool {
        matches!(
            self,
            ConnectionState::Closed
                | ConnectionState::CloseWait
                | ConnectionState::LastAck
                | ConnectionState::FinWait1
                | ConnectionState::FinWait2
                | ConnectionState::Closing
                | ConnectionState::TimeWait
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Listen => "LISTEN",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynReceived => "SYN_RECEIVED",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinWait1 => "FIN_WAIT_1",
            ConnectionState::FinWait2 => "FIN_WAIT_2",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::LastAck => "LAST_ACK",
            ConnectionState::TimeWait => "TIME_WAIT",
        };

        f.write_str(name)
    }
}

/// Progress of an active open, as seen by the byte-stream layer.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    /// No connection attempt in progress.
    #[default]
    None,
    /// `SYN` sent, waiting for the peer.
    Connecting,
    /// Actively opened connection reached `Established`.
    Connected,
}

/// How the connection was opened.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    /// Spawned by a listening socket for an inbound `SYN`.
    Incoming,
    /// Opened by `connect`.
    #[default]
    Outgoing,
    /// Listening for inbound connections.
    Passive,
}

/// Whether `connect` waits for the handshake to finish.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ShouldBlock {
    /// Wait until the connection is established or fails.
    Yes,
    /// Return as soon as the `SYN` is sent.
    No,
}

/// Result of a successful `connect` call.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectOutcome {
    /// Handshake completed.
    Connected,
    /// Handshake started; completion is signalled through the socket's
    /// readiness.
    Pending,
}

/// Per-socket traffic counters.
#[derive(Debug, Default)]
pub struct SocketStats {
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
}

impl SocketStats {
    fn record_in(&self, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_out(&self, bytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Point-in-time description of a socket, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    /// Local and remote addresses.
    pub tuple: SocketTuple,
    /// Protocol state.
    pub state: ConnectionState,
    /// Active-open progress.
    pub role: Role,
    /// How the connection was opened.
    pub direction: Direction,
    /// Segments received.
    pub packets_in: u64,
    /// Segment bytes received, headers included.
    pub bytes_in: u64,
    /// Segments transmitted, retransmissions included.
    pub packets_out: u64,
    /// Segment bytes transmitted, headers included.
    pub bytes_out: u64,
    /// Segments awaiting acknowledgment.
    pub unacked: usize,
}

/// Mutable protocol state of a socket, guarded by the socket lock.
#[derive(Debug, Default)]
pub(super) struct SocketInner {
    pub(super) tuple: SocketTuple,
    pub(super) state: ConnectionState,
    pub(super) role: Role,
    pub(super) direction: Direction,
    /// Whether `tuple` is registered in the connection table for this socket.
    pub(super) registered: bool,
    /// Next sequence number to send.
    pub(super) seq: u32,
    /// Next sequence number expected from the peer.
    pub(super) ack: u32,
    pub(super) last_ack_sent: u32,
    pub(super) last_ack_time: Option<Instant>,
    /// Received data left unacknowledged by the delayed-ACK rule.
    pub(super) ack_pending: bool,
    /// Sequence number our `FIN` was sent with.
    pub(super) fin_seq: Option<u32>,
    pub(super) time_wait_since: Option<Instant>,
    /// The handshake failed; reported to a blocked `connect`.
    pub(super) refused: bool,
    pub(super) peer_mss: u16,
    /// Listening socket that spawned this one, until it is handed over.
    pub(super) originator: Option<Weak<TcpSocket>>,
    /// In-order payloads not yet consumed by the byte-stream layer.
    pub(super) received: VecDeque<Vec<u8>>,
}

impl SocketInner {
    /// Returns `true` if an acknowledgment for freshly received data may be
    /// postponed at `now`.
    ///
    /// RFC 1122 (4.2.3.2)
    ///
    /// An ACK should be sent for at least every second full-sized segment,
    /// and an ACK must not be delayed for more than 0.5 seconds.
    pub(super) fn should_delay_next_ack_at(
        &self,
        now: Instant,
        mss: u32,
        timeout: Duration,
    ) -> bool {
        if wrapping_le(self.last_ack_sent.wrapping_add(mss.saturating_mul(2)), self.ack) {
            return false;
        }

        match self.last_ack_time {
            Some(sent) => now.saturating_duration_since(sent) < timeout,
            None => false,
        }
    }

    /// Returns `true` if `ack` covers the `FIN` we sent and nothing else is
    /// outstanding. The peer counts the `FIN` as one sequence number.
    fn fin_acknowledged(&self, ack: u32, queue_empty: bool) -> bool {
        queue_empty && self.fin_seq.is_some_and(|fin| wrapping_lt(fin, ack))
    }
}

/// TCP socket: a connection's protocol state plus its retransmission queue.
///
/// Always handled through an [`Arc`]; inbound segments, timer sweeps and the
/// owning byte-stream layer all share it.
///
/// Lock order: `inner` first, then any of `unacked` and `passive` or the
/// stack's registries. Nothing takes `inner` while holding one of those.
#[derive(Debug)]
pub struct TcpSocket {
    pub(super) stack: Arc<Stack>,
    pub(super) weak_self: Weak<TcpSocket>,
    pub(super) inner: Mutex<SocketInner>,
    unacked: RwLock<RetransmissionQueue>,
    pub(super) passive: Mutex<PendingAccept>,
    pub(super) wait: WaitQueue,
    interrupted: AtomicBool,
    stats: SocketStats,
}

impl TcpSocket {
    /// Creates a socket in `Closed` state, bound to nothing.
    pub fn new(stack: Arc<Stack>) -> Arc<Self> {
        let backlog = stack.config().default_backlog;

        Arc::new_cyclic(|weak_self| TcpSocket {
            stack,
            weak_self: weak_self.clone(),
            inner: Mutex::new(SocketInner {
                peer_mss: DEFAULT_TCP_MSS,
                ..Default::default()
            }),
            unacked: RwLock::new(RetransmissionQueue::new()),
            passive: Mutex::new(PendingAccept::new(backlog)),
            wait: WaitQueue::new(),
            interrupted: AtomicBool::new(false),
            stats: SocketStats::default(),
        })
    }

    /// Returns the socket's tuple.
    pub fn tuple(&self) -> SocketTuple {
        self.lock_inner().tuple
    }

    /// Returns the current protocol state.
    pub fn state(&self) -> ConnectionState {
        self.lock_inner().state
    }

    /// Returns the active-open progress.
    pub fn role(&self) -> Role {
        self.lock_inner().role
    }

    /// Returns how the connection was opened.
    pub fn direction(&self) -> Direction {
        self.lock_inner().direction
    }

    /// Returns `true` if the connection can no longer carry data in both
    /// directions. Gates read/write readiness in the byte-stream layer.
    pub fn is_disconnected(&self) -> bool {
        self.protocol_is_disconnected()
    }

    /// Returns the readiness wait queue of the socket.
    pub fn wait_queue(&self) -> &WaitQueue {
        &self.wait
    }

    /// Returns a snapshot of the socket for diagnostics.
    pub fn info(&self) -> SocketInfo {
        let inner = self.lock_inner();

        SocketInfo {
            tuple: inner.tuple,
            state: inner.state,
            role: inner.role,
            direction: inner.direction,
            packets_in: self.stats.packets_in.load(Ordering::Relaxed),
            bytes_in: self.stats.bytes_in.load(Ordering::Relaxed),
            packets_out: self.stats.packets_out.load(Ordering::Relaxed),
            bytes_out: self.stats.bytes_out.load(Ordering::Relaxed),
            unacked: self.unacked_read().len(),
        }
    }

    /// Returns the `(ack threshold, transmit count)` of every segment awaiting
    /// acknowledgment, in sequence order.
    pub fn unacked_segments(&self) -> Vec<(u32, u32)> {
        self.unacked_read()
            .iter()
            .map(|segment| (segment.ack_threshold(), segment.transmit_count()))
            .collect()
    }

    /// Assigns the local address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the socket is `Closed` and
    /// unregistered, or [`Error::AddressNotAvailable`] if no adapter owns a
    /// specific `local` address.
    pub fn bind(&self, local: SocketAddr) -> Result<()> {
        {
            let mut inner = self.lock_inner();
            if inner.state != ConnectionState::Closed || inner.registered {
                return Err(Error::InvalidState { state: inner.state });
            }
            inner.tuple.local = local;
        }

        self.protocol_bind().inspect_err(|_| {
            self.lock_inner().tuple.local = SocketAddr::UNSPECIFIED;
        })
    }

    /// Starts accepting connections, queueing at most `backlog` handed-off
    /// children. An unbound port is replaced with an ephemeral one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressInUse`] if the tuple is taken, or
    /// [`Error::InvalidState`] unless the socket is `Closed`.
    pub fn listen(&self, backlog: usize) -> Result<()> {
        let port = {
            let inner = self.lock_inner();
            if inner.state != ConnectionState::Closed {
                return Err(Error::InvalidState { state: inner.state });
            }
            inner.tuple.local.port
        };

        self.lock_passive().set_backlog(backlog);

        if port == 0 {
            self.protocol_allocate_local_port()?;
        }

        self.protocol_listen()
    }

    /// Actively opens a connection to `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HostUnreachable`] if there is no route to `remote`,
    /// [`Error::AddressInUse`] if no local port is free, and when blocking,
    /// [`Error::ConnectionRefused`] or [`Error::Interrupted`] if the handshake
    /// does not complete.
    pub fn connect(&self, remote: SocketAddr, should_block: ShouldBlock) -> Result<ConnectOutcome> {
        {
            let mut inner = self.lock_inner();
            if inner.state != ConnectionState::Closed {
                return Err(Error::InvalidState { state: inner.state });
            }
            inner.tuple.remote = remote;
        }

        self.interrupted.store(false, Ordering::SeqCst);

        self.protocol_connect(should_block)
    }

    /// Cancels a blocked `connect`, as a signal delivered to the waiting
    /// thread would.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.wait.notify_all();
    }

    /// Sends `payload` to the peer in segments no larger than the peer's MSS,
    /// returning the number of bytes queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the connection is `Established`
    /// or `CloseWait`.
    pub fn send(&self, payload: &[u8]) -> Result<usize> {
        let mut inner = self.lock_inner();

        if !matches!(
            inner.state,
            ConnectionState::Established | ConnectionState::CloseWait
        ) {
            return Err(Error::InvalidState { state: inner.state });
        }

        let mss = inner.peer_mss.max(1) as usize;
        for chunk in payload.chunks(mss) {
            self.send_segment(&mut inner, Flags::PSH | Flags::ACK, chunk)?;
        }

        Ok(payload.len())
    }

    /// Removes and returns all in-order data received so far.
    pub fn take_received(&self) -> Vec<u8> {
        let mut inner = self.lock_inner();
        let chunks: Vec<Vec<u8>> = inner.received.drain(..).collect();

        chunks.concat()
    }

    /// Sends `FIN` after the data already sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the connection is
    /// `Established`, or [`Error::OutOfMemory`] if the `FIN` cannot be
    /// allocated.
    pub fn shutdown_write(&self) -> Result<()> {
        let mut inner = self.lock_inner();

        if inner.state != ConnectionState::Established {
            return Err(Error::InvalidState { state: inner.state });
        }

        self.send_fin(&mut inner)?;
        self.set_state(&mut inner, ConnectionState::FinWait1, "shutdown");

        Ok(())
    }

    /// Releases the socket on behalf of its owner.
    ///
    /// A connection still tearing down afterwards is kept alive by the stack
    /// until it reaches `Closed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the closing `FIN` cannot be
    /// allocated.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock_inner();

        match inner.state {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Listen => {
                self.set_state(&mut inner, ConnectionState::Closed, "close");
                drop(inner);

                // Unaccepted children are released outside of the lock.
                let abandoned = self.lock_passive().take_all();
                debug!("listener closed, dropping {} unaccepted connections", abandoned.len());

                return Ok(());
            }
            ConnectionState::SynSent => {
                self.set_state(&mut inner, ConnectionState::Closed, "close");
                return Ok(());
            }
            ConnectionState::Established | ConnectionState::SynReceived => {
                self.send_fin(&mut inner)?;
                self.set_state(&mut inner, ConnectionState::FinWait1, "close");
            }
            ConnectionState::CloseWait => {
                self.send_fin(&mut inner)?;
                self.set_state(&mut inner, ConnectionState::LastAck, "close");
            }
            ConnectionState::FinWait1
            | ConnectionState::FinWait2
            | ConnectionState::Closing
            | ConnectionState::LastAck
            | ConnectionState::TimeWait => {}
        }

        if let Some(this) = self.weak_self.upgrade() {
            self.stack.closing().insert(inner.tuple, this);
        }

        Ok(())
    }

    /// Processes a segment demultiplexed to this socket. `tuple` is the
    /// segment's own tuple, which differs from the socket's for listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if a response segment cannot be built.
    pub fn receive(&self, tuple: SocketTuple, segment: &Segment<'_>) -> Result<()> {
        self.receive_at(tuple, segment, Instant::now())
    }

    fn receive_at(&self, tuple: SocketTuple, segment: &Segment<'_>, now: Instant) -> Result<()> {
        let header = &segment.header;

        self.stats
            .record_in(header.header_len() + segment.payload.len());

        let mut inner = self.lock_inner();

        debug!(
            "[{}] ({}) received {} seq={} ack={} len={}",
            inner.tuple,
            inner.state,
            header.flags(),
            header.seq_number(),
            header.ack_number(),
            segment.payload.len()
        );

        match inner.state {
            ConnectionState::Closed => {
                debug!("[{}] (CLOSED) dropping segment", inner.tuple);
                return Ok(());
            }
            ConnectionState::Listen => {
                drop(inner);
                return self.on_listen_segment(tuple, segment);
            }
            _ => {}
        }

        if header.rst() {
            if inner.state == ConnectionState::SynSent {
                inner.refused = true;
            }
            self.set_state(&mut inner, ConnectionState::Closed, "received RST");
            return Ok(());
        }

        let queue_empty = if header.ack() {
            let mut unacked = self.unacked_write();
            let retired = unacked.acknowledge(header.ack_number());
            if retired > 0 {
                debug!(
                    "[{}] ({}) retired {retired} segments, {} outstanding",
                    inner.tuple,
                    inner.state,
                    unacked.len()
                );
            }
            unacked.is_empty()
        } else {
            self.unacked_read().is_empty()
        };

        match inner.state {
            ConnectionState::SynSent => {
                if !header.syn() {
                    debug!("[{}] (SYN_SENT) did not receive SYN: ignoring", inner.tuple);
                    return Ok(());
                }

                if !header.ack() || header.ack_number() != inner.seq {
                    warn!(
                        "[{}] (SYN_SENT) unacceptable ACK {} (expected {}): sending RST",
                        inner.tuple,
                        header.ack_number(),
                        inner.seq
                    );
                    self.send_segment(&mut inner, Flags::RST, &[])?;
                    inner.refused = true;
                    self.set_state(&mut inner, ConnectionState::Closed, "received bad SYN/ACK");
                    return Ok(());
                }

                inner.ack = header.seq_number().wrapping_add(1);
                inner.peer_mss = header.options().mss().unwrap_or(DEFAULT_TCP_MSS);

                self.send_segment(&mut inner, Flags::ACK, &[])?;
                self.set_state(&mut inner, ConnectionState::Established, "received SYN/ACK");
            }
            ConnectionState::SynReceived => {
                if header.syn() {
                    debug!("[{}] (SYN_RECEIVED) duplicate SYN: ignoring", inner.tuple);
                    return Ok(());
                }

                if !header.ack() || header.ack_number() != inner.seq {
                    debug!("[{}] (SYN_RECEIVED) unacceptable ACK: ignoring", inner.tuple);
                    return Ok(());
                }

                self.set_state(&mut inner, ConnectionState::Established, "received ACK");

                if self.on_data(&mut inner, segment, now)? {
                    self.set_state(&mut inner, ConnectionState::CloseWait, "received FIN");
                }
            }
            ConnectionState::Established => {
                if header.syn() {
                    // Our handshake ACK was lost.
                    self.send_segment(&mut inner, Flags::ACK, &[])?;
                    return Ok(());
                }

                if self.on_data(&mut inner, segment, now)? {
                    self.set_state(&mut inner, ConnectionState::CloseWait, "received FIN");
                }
            }
            ConnectionState::FinWait1 => {
                let fin_received = self.on_data(&mut inner, segment, now)?;
                let fin_acked =
                    header.ack() && inner.fin_acknowledged(header.ack_number(), queue_empty);

                match (fin_received, fin_acked) {
                    (true, true) => {
                        self.set_state(&mut inner, ConnectionState::TimeWait, "received FIN/ACK")
                    }
                    (true, false) => {
                        self.set_state(&mut inner, ConnectionState::Closing, "received FIN")
                    }
                    (false, true) => {
                        self.set_state(&mut inner, ConnectionState::FinWait2, "received ACK")
                    }
                    (false, false) => {}
                }
            }
            ConnectionState::FinWait2 => {
                if self.on_data(&mut inner, segment, now)? {
                    self.set_state(&mut inner, ConnectionState::TimeWait, "received FIN");
                }
            }
            ConnectionState::Closing => {
                if header.ack() && inner.fin_acknowledged(header.ack_number(), queue_empty) {
                    self.set_state(&mut inner, ConnectionState::TimeWait, "received ACK");
                }
            }
            ConnectionState::LastAck => {
                if header.ack() && inner.fin_acknowledged(header.ack_number(), queue_empty) {
                    self.set_state(&mut inner, ConnectionState::Closed, "received ACK");
                }
            }
            ConnectionState::TimeWait => {
                if header.fin() {
                    // The peer did not see our last ACK.
                    self.send_segment(&mut inner, Flags::ACK, &[])?;
                    inner.time_wait_since = Some(now);
                    debug!("[{}] (TIME_WAIT) received FIN: resetting timer", inner.tuple);
                }
            }
            ConnectionState::CloseWait | ConnectionState::Closed | ConnectionState::Listen => {}
        }

        Ok(())
    }

    /// Accepts in-order payload and `FIN`, acknowledging as the delayed-ACK
    /// rule allows. Returns `true` if the peer's `FIN` was consumed.
    fn on_data(
        &self,
        inner: &mut SocketInner,
        segment: &Segment<'_>,
        now: Instant,
    ) -> Result<bool> {
        let header = &segment.header;
        let payload = segment.payload;

        if payload.is_empty() && !header.fin() {
            return Ok(false);
        }

        if header.seq_number() != inner.ack {
            debug!(
                "[{}] ({}) out-of-order segment seq={} (expected {}): sending duplicate ACK",
                inner.tuple,
                inner.state,
                header.seq_number(),
                inner.ack
            );
            self.send_segment(inner, Flags::ACK, &[])?;
            return Ok(false);
        }

        if !payload.is_empty() {
            inner.ack = inner.ack.wrapping_add(payload.len() as u32);
            inner.received.push_back(payload.to_vec());
        }

        if header.fin() {
            inner.ack = inner.ack.wrapping_add(1);
            self.send_segment(inner, Flags::ACK, &[])?;
            return Ok(true);
        }

        let config = self.stack.config();
        let mss = config.assumed_mss as u32;
        if inner.should_delay_next_ack_at(now, mss, config.delayed_ack_timeout) {
            inner.ack_pending = true;
        } else {
            self.send_segment(inner, Flags::ACK, &[])?;
        }

        Ok(false)
    }

    /// Builds a segment from the socket's current sequence state and sends
    /// it. Segments carrying `SYN` or payload are kept for retransmission.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HostUnreachable`] without a route to the peer, or
    /// [`Error::OutOfMemory`] if the segment buffer cannot be allocated. A
    /// failed transmission is not an error.
    pub(super) fn send_segment(
        &self,
        inner: &mut SocketInner,
        flags: Flags,
        payload: &[u8],
    ) -> Result<()> {
        debug_assert!(
            !(flags.contains(Flags::SYN) && !payload.is_empty()),
            "SYN segments carry no payload"
        );

        let now = Instant::now();
        let tuple = inner.tuple;
        let route = self.route(&tuple)?;

        let mut header = TcpHeader::new(tuple.local.port, tuple.remote.port, inner.seq, u16::MAX);
        header.set_flags(flags);

        if flags.contains(Flags::ACK) {
            header.set_ack_number(inner.ack);
        }

        if flags.contains(Flags::SYN) {
            let mss = route
                .adapter
                .mtu()
                .saturating_sub(IPV4_HEADER_LEN + TcpHeader::MIN_HEADER_LEN);
            header.set_option_mss(mss)?;
        }

        let bytes = segment::encode(&header, payload, tuple.local.addr, tuple.remote.addr)?;

        if flags.contains(Flags::ACK) {
            inner.last_ack_sent = inner.ack;
            inner.last_ack_time = Some(now);
            inner.ack_pending = false;
        }

        inner.seq = if flags.contains(Flags::SYN) {
            inner.seq.wrapping_add(1)
        } else {
            inner.seq.wrapping_add(payload.len() as u32)
        };

        debug!(
            "[{tuple}] ({}) sending {flags} seq={} ack={} len={}",
            inner.state,
            header.seq_number(),
            header.ack_number(),
            payload.len()
        );

        if flags.contains(Flags::SYN) || !payload.is_empty() {
            self.unacked_write()
                .push(OutstandingSegment::new(inner.seq, bytes));
            self.transmit_due_at(&tuple, now);
        } else {
            self.transmit(&tuple, &bytes);
        }

        Ok(())
    }

    /// Sends `FIN` and records its sequence number. A `FIN` that cannot be
    /// routed is logged and the teardown goes on; only a failed allocation
    /// aborts it.
    fn send_fin(&self, inner: &mut SocketInner) -> Result<()> {
        match self.send_segment(inner, Flags::FIN | Flags::ACK, &[]) {
            Ok(()) => {}
            Err(err @ Error::OutOfMemory) => return Err(err),
            Err(err) => {
                warn!("[{}] ({}) failed to send FIN: {err}", inner.tuple, inner.state);
            }
        }

        inner.fin_seq = Some(inner.seq);

        Ok(())
    }

    /// Runs periodic work at `now`: resends due segments, flushes a deferred
    /// ACK, and expires `TimeWait`.
    pub fn sweep_at(&self, now: Instant) {
        let tuple = {
            let mut inner = self.lock_inner();
            let config = self.stack.config();

            if inner.state == ConnectionState::TimeWait
                && inner
                    .time_wait_since
                    .is_none_or(|since| {
                        now.saturating_duration_since(since) >= config.time_wait_timeout
                    })
            {
                self.set_state(&mut inner, ConnectionState::Closed, "TIME_WAIT expired");
            }

            if inner.state == ConnectionState::Closed {
                return;
            }

            if inner.ack_pending
                && !inner.should_delay_next_ack_at(
                    now,
                    config.assumed_mss as u32,
                    config.delayed_ack_timeout,
                )
            {
                if inner.ack == inner.last_ack_sent {
                    inner.ack_pending = false;
                } else if let Err(err) = self.send_segment(&mut inner, Flags::ACK, &[]) {
                    warn!("[{}] ({}) failed to send delayed ACK: {err}", inner.tuple, inner.state);
                }
            }

            inner.tuple
        };

        self.transmit_due_at(&tuple, now);
    }

    /// Transmits every queued segment due at `now`, in sequence order.
    fn transmit_due_at(&self, tuple: &SocketTuple, now: Instant) {
        let timeout = self.stack.config().retransmit_timeout;

        if !self.unacked_read().has_due(now, timeout) {
            return;
        }

        let mut unacked = self.unacked_write();

        for segment in unacked.due_mut(now, timeout) {
            let resend = segment.transmit_count() > 0;

            if self.transmit(tuple, segment.bytes()) {
                segment.mark_transmitted(now);

                if resend {
                    debug!(
                        "[{tuple}] segment retransmitted, updated transmit count: {}",
                        segment.transmit_count()
                    );
                }
            }
        }
    }

    /// Hands `bytes` to the adapter routing to the peer. Returns `false` if
    /// the transmission failed.
    fn transmit(&self, tuple: &SocketTuple, bytes: &[u8]) -> bool {
        let route = match self.route(tuple) {
            Ok(route) => route,
            Err(err) => {
                warn!("[{tuple}] failed to transmit segment: {err}");
                return false;
            }
        };

        match route.adapter.send_ipv4(
            tuple.local.addr,
            route.next_hop,
            tuple.remote.addr,
            bytes,
            self.stack.config().ttl,
        ) {
            Ok(()) => {
                self.stats.record_out(bytes.len());
                true
            }
            Err(err) => {
                warn!("[{tuple}] failed to transmit segment: {err}");
                false
            }
        }
    }

    fn route(&self, tuple: &SocketTuple) -> Result<RoutingDecision> {
        self.stack
            .router()
            .route_to(tuple.remote.addr, tuple.local.addr)
            .ok_or(Error::HostUnreachable)
    }

    /// Moves to `state`, waking waiters if the disconnected predicate flips.
    pub(super) fn set_state(&self, inner: &mut SocketInner, state: ConnectionState, event: &str) {
        let old = inner.state;
        if old == state {
            return;
        }

        inner.state = state;

        debug!("[{}] ({old}) {event}: {old} -> {state}", inner.tuple);

        match state {
            ConnectionState::Established => {
                if inner.direction == Direction::Outgoing {
                    self.set_role(inner, Role::Connected);
                }
                self.release_to_originator(inner);
            }
            ConnectionState::TimeWait => {
                inner.time_wait_since = Some(Instant::now());
            }
            ConnectionState::Closed => {
                inner.ack_pending = false;
                self.unacked_write().clear();

                let parked = self.stack.closing().remove(&inner.tuple);

                if inner.registered {
                    self.stack.table().remove_socket(&inner.tuple, self);
                    inner.registered = false;
                }

                self.release_to_originator(inner);
                drop(parked);
            }
            _ => {}
        }

        if old.is_disconnected() != state.is_disconnected() {
            self.wait.notify_all();
        }
    }

    fn set_role(&self, inner: &mut SocketInner, role: Role) {
        if inner.role == role {
            return;
        }

        debug!("[{}] ({}) role: {:?} -> {role:?}", inner.tuple, inner.state, inner.role);

        inner.role = role;
        self.wait.notify_all();
    }

    /// Picks an ephemeral port for the socket's tuple and registers it.
    fn allocate_local_port(&self, inner: &mut SocketInner) -> Result<u16> {
        let port = self.stack.ports().allocate(
            self.stack.table(),
            inner.tuple,
            self.weak_self.clone(),
            self.stack.random(),
        )?;

        inner.tuple.local.port = port;
        inner.registered = true;

        Ok(port)
    }

    fn register(&self, inner: &mut SocketInner) -> Result<()> {
        if !inner.registered {
            self.stack.table().insert(inner.tuple, self.weak_self.clone())?;
            inner.registered = true;
        }

        Ok(())
    }

    pub(super) fn unregister(&self, inner: &mut SocketInner) {
        if inner.registered {
            self.stack.table().remove_socket(&inner.tuple, self);
            inner.registered = false;
        }
    }

    /// Sends the `SYN` for an active open and, if asked, waits for the
    /// outcome.
    fn start_connect(&self, should_block: ShouldBlock) -> Result<ConnectOutcome> {
        {
            let mut inner = self.lock_inner();
            let route = self.route(&inner.tuple)?;

            if inner.tuple.local.addr.is_unspecified() {
                inner.tuple.local.addr = route.adapter.ipv4_address();
            }

            if inner.tuple.local.port == 0 {
                self.allocate_local_port(&mut inner)?;
            } else {
                self.register(&mut inner)?;
            }

            inner.seq = self.stack.random().next_u32();
            inner.ack = 0;
            inner.refused = false;
            inner.direction = Direction::Outgoing;

            if let Err(err) = self.send_segment(&mut inner, Flags::SYN, &[]) {
                self.unregister(&mut inner);
                return Err(err);
            }

            self.set_state(&mut inner, ConnectionState::SynSent, "connect");
            self.set_role(&mut inner, Role::Connecting);
        }

        if should_block == ShouldBlock::No {
            return Ok(ConnectOutcome::Pending);
        }

        loop {
            let seen = self.wait.generation();

            {
                let mut inner = self.lock_inner();

                if inner.role == Role::Connected {
                    return Ok(ConnectOutcome::Connected);
                }

                if inner.refused || inner.state == ConnectionState::Closed {
                    self.set_role(&mut inner, Role::None);
                    return Err(Error::ConnectionRefused);
                }

                if self.interrupted.swap(false, Ordering::SeqCst) {
                    self.set_role(&mut inner, Role::None);
                    return Err(Error::Interrupted);
                }
            }

            self.wait.wait(seen);
        }
    }

    pub(super) fn lock_inner(&self) -> MutexGuard<'_, SocketInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn lock_passive(&self) -> MutexGuard<'_, PendingAccept> {
        self.passive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unacked_read(&self) -> RwLockReadGuard<'_, RetransmissionQueue> {
        self.unacked.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn unacked_write(&self) -> RwLockWriteGuard<'_, RetransmissionQueue> {
        self.unacked.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransportProtocol for TcpSocket {
    fn protocol_bind(&self) -> Result<()> {
        let local = self.lock_inner().tuple.local.addr;

        if !local.is_unspecified() && self.stack.router().adapter_for(local).is_none() {
            return Err(Error::AddressNotAvailable);
        }

        Ok(())
    }

    fn protocol_listen(&self) -> Result<()> {
        let mut inner = self.lock_inner();

        self.register(&mut inner)?;

        inner.direction = Direction::Passive;
        self.set_state(&mut inner, ConnectionState::Listen, "listen");

        Ok(())
    }

    fn protocol_connect(&self, should_block: ShouldBlock) -> Result<ConnectOutcome> {
        self.start_connect(should_block)
    }

    fn protocol_allocate_local_port(&self) -> Result<u16> {
        let mut inner = self.lock_inner();
        self.allocate_local_port(&mut inner)
    }

    fn protocol_is_disconnected(&self) -> bool {
        self.lock_inner().state.is_disconnected()
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        let this: *const TcpSocket = self;
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);

        if inner.registered {
            debug!("[{}] ({}) socket dropped", inner.tuple, inner.state);
            self.stack.table().remove_socket(&inner.tuple, this);
        }
    }
}
