//! Tunables of the TCP engine.

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::{Error, Result};

/// Maximum Segment Lifetime (`MSL`) in seconds.
///
/// Represents the maximum time a segment can exist within the network before
/// being discarded.
pub const MSL: u64 = 60;

/// First port of the default ephemeral range.
pub const FIRST_EPHEMERAL_PORT: u16 = 32768;

/// Last port of the default ephemeral range.
pub const LAST_EPHEMERAL_PORT: u16 = 60999;

/// Configuration shared by every socket of a [`Stack`].
///
/// [`Stack`]: crate::Stack
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Ports handed out to sockets connecting without an explicit bind.
    pub ephemeral_ports: RangeInclusive<u16>,
    /// Time after which an unacknowledged segment is transmitted again.
    pub retransmit_timeout: Duration,
    /// Longest an ACK may be deferred after the last one was sent.
    pub delayed_ack_timeout: Duration,
    /// Segment size assumed by the delayed ACK rule: an ACK is forced once
    /// the ack point moved by two of these.
    pub assumed_mss: usize,
    /// How long a socket lingers in `TimeWait` before it is closed.
    pub time_wait_timeout: Duration,
    /// Cadence of the retransmission sweep driven by [`RetransmitTimer`].
    ///
    /// [`RetransmitTimer`]: crate::RetransmitTimer
    pub sweep_interval: Duration,
    /// Time to live of emitted IPv4 datagrams.
    pub ttl: u8,
    /// Accept queue length used by `listen` when none is given.
    pub default_backlog: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            ephemeral_ports: FIRST_EPHEMERAL_PORT..=LAST_EPHEMERAL_PORT,
            retransmit_timeout: Duration::from_millis(500),
            delayed_ack_timeout: Duration::from_millis(500),
            assumed_mss: 1500,
            time_wait_timeout: Duration::from_secs(2 * MSL),
            sweep_interval: Duration::from_millis(100),
            ttl: 64,
            default_backlog: 128,
        }
    }
}

impl TcpConfig {
    /// Checks the configuration for values the engine cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the ephemeral range is empty or
    /// includes port 0, or if any timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.ephemeral_ports.is_empty() {
            return Err(Error::InvalidConfig {
                reason: "ephemeral port range is empty",
            });
        }

        if *self.ephemeral_ports.start() == 0 {
            return Err(Error::InvalidConfig {
                reason: "ephemeral port range must not include port 0",
            });
        }

        if self.retransmit_timeout.is_zero()
            || self.delayed_ack_timeout.is_zero()
            || self.sweep_interval.is_zero()
        {
            return Err(Error::InvalidConfig {
                reason: "timeouts must be non-zero",
            });
        }

        if self.assumed_mss == 0 {
            return Err(Error::InvalidConfig {
                reason: "assumed MSS must be non-zero",
            });
        }

        Ok(())
    }
}
