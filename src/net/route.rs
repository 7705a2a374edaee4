//! Routing decisions and the network adapters segments leave through.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// A network interface able to transmit IPv4 datagrams.
pub trait NetworkAdapter: fmt::Debug + Send + Sync {
    /// Address assigned to the interface.
    fn ipv4_address(&self) -> Ipv4Addr;

    /// Link MTU in bytes, including the IPv4 header.
    fn mtu(&self) -> u16;

    /// Wraps `segment` in an IPv4 datagram carrying TCP and transmits it
    /// towards `next_hop`.
    ///
    /// Called with the sending socket's lock held. Implementations must not
    /// call back into the stack from here, e.g. by looping a datagram into
    /// [`Stack::deliver_segment`](crate::Stack::deliver_segment) on the same
    /// thread; queue it and deliver it after returning instead.
    fn send_ipv4(
        &self,
        source: Ipv4Addr,
        next_hop: Ipv4Addr,
        destination: Ipv4Addr,
        segment: &[u8],
        ttl: u8,
    ) -> io::Result<()>;
}

/// Outcome of a successful route lookup.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Interface the segment leaves through.
    pub adapter: Arc<dyn NetworkAdapter>,
    /// Gateway (or the destination itself when directly attached).
    pub next_hop: Ipv4Addr,
}

/// The routing table consulted for every outbound segment.
pub trait Router: Send + Sync {
    /// Resolves the route towards `peer`. A specific `local` address restricts
    /// the lookup to the interface owning it. Returns `None` when no route
    /// exists.
    fn route_to(&self, peer: Ipv4Addr, local: Ipv4Addr) -> Option<RoutingDecision>;

    /// Returns the interface owning `address`, if any.
    fn adapter_for(&self, address: Ipv4Addr) -> Option<Arc<dyn NetworkAdapter>>;
}
