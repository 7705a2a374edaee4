//! Ephemeral local port selection.

use std::ops::RangeInclusive;
use std::sync::Weak;

use tracing::debug;

use crate::net::RandomSource;
use crate::protocol::{ConnectionTable, SocketTuple};
use crate::{Error, Result};

/// Chooses unused local ports from a bounded ephemeral range.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
}

impl PortAllocator {
    /// Creates an allocator drawing from `range`.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self { range }
    }

    /// Returns the number of ports in the range.
    pub fn len(&self) -> usize {
        if self.range.is_empty() {
            0
        } else {
            (*self.range.end() - *self.range.start()) as usize + 1
        }
    }

    /// Returns `true` if the range holds no port.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks a free local port for `tuple` and registers `socket` under the
    /// resulting tuple, returning the port.
    ///
    /// The search starts at a random offset in the range and walks forward,
    /// wrapping at the end. Selection and registration happen under one
    /// exclusive hold of the table lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressInUse`] if every port in the range is taken
    /// for this local address and peer.
    pub fn allocate<S>(
        &self,
        table: &ConnectionTable<S>,
        tuple: SocketTuple,
        socket: Weak<S>,
        random: &dyn RandomSource,
    ) -> Result<u16> {
        let len = self.len();
        if len == 0 {
            return Err(Error::AddressInUse);
        }

        let start = random.next_u16() as usize % len;
        let mut table = table.lock_exclusive();

        let found = self.scan(start, |port| {
            let mut candidate = tuple;
            candidate.local.port = port;
            table.contains(&candidate)
        });

        let Some((port, tested)) = found else {
            debug!("[{tuple}] ephemeral range exhausted after {len} attempts");
            return Err(Error::AddressInUse);
        };

        let mut candidate = tuple;
        candidate.local.port = port;
        table.insert(candidate, socket)?;

        debug!("[{candidate}] allocated ephemeral port after {tested} attempts");

        Ok(port)
    }

    /// Walks the range from offset `start`, wrapping at the end, and returns
    /// the first port `taken` rejects along with the number of ports tested.
    /// Every port is tested at most once.
    fn scan(&self, start: usize, mut taken: impl FnMut(u16) -> bool) -> Option<(u16, usize)> {
        let len = self.len();
        let first = *self.range.start();

        (0..len).find_map(|step| {
            let port = first + ((start + step) % len) as u16;
            (!taken(port)).then_some((port, step + 1))
        })
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(crate::config::FIRST_EPHEMERAL_PORT..=crate::config::LAST_EPHEMERAL_PORT)
    }
}
