//! TCP protocol engine: wire format, demultiplexing, and connection state.

pub mod checksum;
pub mod fsm;
pub mod headers;
mod passive;
pub mod port;
pub mod retransmit;
pub mod segment;
pub mod table;
pub mod wait;

mod socket;
pub use socket::{SocketAddr, SocketTuple};

pub use fsm::{
    ConnectOutcome, ConnectionState, Direction, Role, ShouldBlock, SocketInfo, TcpSocket,
};
pub use port::PortAllocator;
pub use retransmit::{OutstandingSegment, RetransmissionQueue};
pub use segment::Segment;
pub use table::{ClosingSet, ConnectionTable};
pub use wait::WaitQueue;

use crate::Result;

/// Operations an IPv4 socket delegates to its transport protocol.
///
/// The generic `bind`/`listen`/`connect` entry points check the socket's
/// state and fill in its addresses, then hand over to these hooks.
pub trait TransportProtocol {
    /// Validates the local address just assigned to the socket.
    fn protocol_bind(&self) -> Result<()>;

    /// Registers the socket and starts accepting connections.
    fn protocol_listen(&self) -> Result<()>;

    /// Starts an active open towards the socket's remote address.
    fn protocol_connect(&self, should_block: ShouldBlock) -> Result<ConnectOutcome>;

    /// Picks and reserves an ephemeral local port.
    fn protocol_allocate_local_port(&self) -> Result<u16>;

    /// Returns `true` if the connection can no longer carry data in both
    /// directions.
    fn protocol_is_disconnected(&self) -> bool;
}

#[inline]
pub(crate) fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    // RFC 1323 (2.3)
    //
    // TCP determines if a data segment is "old" or "new" by testing whether
    // its sequence number is within 2**31 bytes of the left edge of the window,
    // and if it is not, discarding the data as "old".
    lhs.wrapping_sub(rhs) > (1 << 31)
}

/// Returns `true` if `lhs` precedes or equals `rhs` in sequence space.
#[inline]
pub(crate) fn wrapping_le(lhs: u32, rhs: u32) -> bool {
    lhs == rhs || wrapping_lt(lhs, rhs)
}
