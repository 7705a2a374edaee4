//! Identifying TCP connections through their address/port 4-tuple.

use std::fmt;
use std::net::Ipv4Addr;

/// An IPv4 address and a port number.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct SocketAddr {
    /// IPv4 address.
    pub addr: Ipv4Addr,
    /// Port number.
    pub port: u16,
}

impl SocketAddr {
    /// The unspecified address with port 0.
    pub const UNSPECIFIED: SocketAddr = SocketAddr::new(Ipv4Addr::UNSPECIFIED, 0);

    /// Creates a new socket address.
    pub const fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl Default for SocketAddr {
    fn default() -> Self {
        Self::UNSPECIFIED
    }
}

impl fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Unique TCP connection, identified by the local and remote socket
/// addresses.
///
/// A passive socket is registered with the remote half zeroed, and with the
/// local address zeroed too when it accepts on every interface. [`lookup_keys`]
/// yields the three shapes tried when demultiplexing an inbound segment.
///
/// [`lookup_keys`]: SocketTuple::lookup_keys
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub struct SocketTuple {
    /// The local socket address.
    pub local: SocketAddr,
    /// The remote socket address.
    pub remote: SocketAddr,
}

impl SocketTuple {
    /// Creates a tuple from its four components.
    pub const fn new(
        local_addr: Ipv4Addr,
        local_port: u16,
        remote_addr: Ipv4Addr,
        remote_port: u16,
    ) -> Self {
        Self {
            local: SocketAddr::new(local_addr, local_port),
            remote: SocketAddr::new(remote_addr, remote_port),
        }
    }

    /// Returns the tuple with the remote half zeroed, matching a socket
    /// listening on a specific local address.
    pub fn address_wildcard(&self) -> Self {
        Self {
            local: self.local,
            remote: SocketAddr::UNSPECIFIED,
        }
    }

    /// Returns the tuple with everything but the local port zeroed, matching a
    /// socket listening on every local address.
    pub fn full_wildcard(&self) -> Self {
        Self {
            local: SocketAddr::new(Ipv4Addr::UNSPECIFIED, self.local.port),
            remote: SocketAddr::UNSPECIFIED,
        }
    }

    /// Lookup shapes in precedence order: exact, address-only wildcard, full
    /// wildcard.
    pub fn lookup_keys(&self) -> [Self; 3] {
        [*self, self.address_wildcard(), self.full_wildcard()]
    }
}

impl fmt::Display for SocketTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}
