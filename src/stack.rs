//! Process-wide TCP context: the socket registries and the collaborators the
//! engine consumes.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::TcpConfig;
use crate::net::{RandomSource, Router, ThreadRandom};
use crate::protocol::{ClosingSet, ConnectionTable, PortAllocator, Segment, SocketTuple, TcpSocket};
use crate::{Error, ParseError, Result};

static GLOBAL: OnceLock<Arc<Stack>> = OnceLock::new();

/// Installs `stack` as the process-wide instance.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if a stack was already installed.
pub fn init(stack: Arc<Stack>) -> Result<()> {
    GLOBAL.set(stack).map_err(|_| Error::InvalidConfig {
        reason: "TCP stack already initialized",
    })?;

    info!("TCP stack initialized");

    Ok(())
}

/// Returns the process-wide instance, if [`init`] was called.
pub fn global() -> Option<&'static Arc<Stack>> {
    GLOBAL.get()
}

/// Owner of the connection table, the closing set and the external
/// collaborators shared by every socket.
pub struct Stack {
    config: TcpConfig,
    table: ConnectionTable<TcpSocket>,
    closing: ClosingSet<TcpSocket>,
    ports: PortAllocator,
    router: Arc<dyn Router>,
    random: Arc<dyn RandomSource>,
}

impl Stack {
    /// Creates a stack routing through `router` and drawing sequence numbers
    /// and port offsets from `random`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` is invalid.
    pub fn new(
        config: TcpConfig,
        router: Arc<dyn Router>,
        random: Arc<dyn RandomSource>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        Ok(Arc::new(Self {
            ports: PortAllocator::new(config.ephemeral_ports.clone()),
            config,
            table: ConnectionTable::new(),
            closing: ClosingSet::new(),
            router,
            random,
        }))
    }

    /// Creates a stack with the default configuration and random source.
    ///
    /// # Errors
    ///
    /// Does not fail with the default configuration.
    pub fn with_router(router: Arc<dyn Router>) -> Result<Arc<Self>> {
        Self::new(TcpConfig::default(), router, Arc::new(ThreadRandom))
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Returns the connection table.
    pub fn table(&self) -> &ConnectionTable<TcpSocket> {
        &self.table
    }

    /// Returns the set of sockets closed by their owner and still tearing
    /// down.
    pub fn closing(&self) -> &ClosingSet<TcpSocket> {
        &self.closing
    }

    /// Returns the ephemeral port allocator.
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Returns the router.
    pub fn router(&self) -> &dyn Router {
        self.router.as_ref()
    }

    /// Returns the random source.
    pub fn random(&self) -> &dyn RandomSource {
        self.random.as_ref()
    }

    /// Creates an unbound socket on this stack.
    pub fn socket(self: &Arc<Self>) -> Arc<TcpSocket> {
        TcpSocket::new(Arc::clone(self))
    }

    /// Returns every registered socket.
    pub fn sockets(&self) -> Vec<Arc<TcpSocket>> {
        self.table.snapshot()
    }

    /// Pushes a segment received by the IP layer from `source` to
    /// `destination` into the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is malformed or its checksum is wrong,
    /// or if the matched socket could not build its response.
    pub fn deliver_segment(
        &self,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        bytes: &[u8],
    ) -> Result<()> {
        let segment = Segment::parse(bytes)?;
        let header = &segment.header;

        if !header.is_valid_checksum(source, destination, segment.payload) {
            warn!(
                "dropping segment {source}:{} -> {destination}:{} with invalid checksum 0x{:04x}",
                header.src_port(),
                header.dst_port(),
                header.checksum()
            );

            return Err(ParseError::InvalidChecksum {
                provided: header.checksum(),
            }
            .into());
        }

        let tuple = SocketTuple::new(destination, header.dst_port(), source, header.src_port());

        match self.table.lookup(&tuple) {
            Some(socket) => socket.receive(tuple, &segment),
            None => {
                debug!("[{tuple}] no socket for {} segment: dropping", header.flags());
                Ok(())
            }
        }
    }

    /// Runs the periodic sweep on every socket.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    /// Runs the periodic sweep on every socket as if the clock read `now`:
    /// due segments are resent, deferred ACKs flushed and `TimeWait`
    /// connections expired.
    pub fn sweep_at(&self, now: Instant) {
        let mut sockets = self.table.snapshot();
        sockets.extend(self.closing.snapshot());

        sockets.sort_by_key(|socket| Arc::as_ptr(socket));
        sockets.dedup_by(|a, b| Arc::ptr_eq(a, b));

        for socket in &sockets {
            socket.sweep_at(now);
        }
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("config", &self.config)
            .field("sockets", &self.table.len())
            .field("closing", &self.closing.len())
            .finish_non_exhaustive()
    }
}
