//! Error types for the TCP engine, covering categorical protocol outcomes as
//! well as wire-format failures of TCP segments.

use std::{io, result};

use thiserror::Error;

use crate::protocol::ConnectionState;

/// A convenience wrapper around `Result` for `ktcp::Error`.
pub type Result<T> = result::Result<T, Error>;

/// Set of errors that can occur in the TCP engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The socket tuple is already registered, or no ephemeral port is free.
    #[error("address already in use")]
    AddressInUse,
    /// No local interface owns the requested address.
    #[error("address not available: no local interface matches")]
    AddressNotAvailable,
    /// No route to the destination.
    #[error("no route to host")]
    HostUnreachable,
    /// A segment buffer could not be allocated.
    #[error("out of memory allocating segment buffer")]
    OutOfMemory,
    /// The handshake failed while a blocking connect was waiting.
    #[error("connection refused")]
    ConnectionRefused,
    /// A blocking wait was cancelled externally.
    #[error("interrupted")]
    Interrupted,
    /// The operation is incompatible with the current protocol state.
    #[error("operation invalid in state {state}")]
    InvalidState {
        /// State the socket was in when the operation was attempted.
        state: ConnectionState,
    },
    /// The configuration was rejected by [`TcpConfig::validate`].
    ///
    /// [`TcpConfig::validate`]: crate::TcpConfig::validate
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong with it.
        reason: &'static str,
    },
    /// Error while transmitting a segment.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Error parsing an inbound TCP segment.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Error creating or manipulating a TCP header.
    #[error(transparent)]
    Header(#[from] HeaderError),
}

impl Error {
    /// Returns the POSIX `errno` value reported to the syscall layer for this
    /// error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::AddressInUse => libc::EADDRINUSE,
            Error::AddressNotAvailable => libc::EADDRNOTAVAIL,
            Error::HostUnreachable => libc::EHOSTUNREACH,
            Error::OutOfMemory => libc::ENOMEM,
            Error::ConnectionRefused => libc::ECONNREFUSED,
            Error::Interrupted => libc::EINTR,
            Error::InvalidState { .. } | Error::InvalidConfig { .. } => libc::EINVAL,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::Parse(_) | Error::Header(_) => libc::EINVAL,
        }
    }
}

/// Error occurred while trying to parse an inbound TCP segment.
#[derive(Debug, Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum ParseError {
    /// Input buffer not within the valid range for a TCP header.
    #[error(
        "invalid header length: {provided} bytes (not within the valid range: {min}..={max} bytes)"
    )]
    InvalidBufferLength { provided: usize, min: u16, max: u16 },
    /// Invalid TCP data offset.
    #[error("invalid TCP data offset: {provided} (not within the valid range: {min}..={max})")]
    InvalidDataOffset { provided: u16, min: u16, max: u16 },
    /// Mismatch between the provided and expected TCP header length.
    ///
    /// Value provided is less than `data_offset << 2`.
    #[error("invalid TCP header length: {provided} bytes (data offset indicates {expected})")]
    HeaderLengthMismatch { provided: usize, expected: u16 },
    /// Invalid TCP options length.
    #[error("invalid TCP options length: {provided} bytes (exceeds maximum allowed {max} bytes)")]
    InvalidOptionsLength { provided: usize, max: usize },
    /// The folded sum over the pseudo-header and segment was not zero.
    #[error("invalid TCP checksum: 0x{provided:04x}")]
    InvalidChecksum { provided: u16 },
}

/// Error occurred while trying to create or manipulate a TCP header.
#[derive(Debug, Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum HeaderError {
    /// Segment length does not fit the pseudo-header's 16-bit length field.
    #[error("segment too large: {provided} bytes (exceeds maximum allowed {max} bytes)")]
    SegmentTooLarge { provided: usize, max: usize },
    /// Insufficient space to append TCP option.
    #[error("failed to append TCP option: {current_len} -> {attempted_len} bytes (max {max_len})")]
    InsufficientOptionSpace {
        attempted_len: usize,
        current_len: usize,
        max_len: usize,
    },
    /// Invalid TCP `MSS` option value.
    #[error("invalid TCP MSS option: value must be greater than 0")]
    InvalidMssOption,
}
