//! Construction and parsing of raw TCP segments.

use std::net::Ipv4Addr;

use crate::protocol::headers::TcpHeader;
use crate::{Error, Result};

/// Inbound TCP segment, borrowed from the buffer handed over by the IP layer.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    /// TCP header of the segment.
    pub header: TcpHeader,
    /// Payload of the segment.
    pub payload: &'a [u8],
}

impl<'a> Segment<'a> {
    /// Splits `bytes` into header and payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is malformed.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let header = TcpHeader::try_from(bytes)?;
        let payload = &bytes[header.header_len()..];

        Ok(Self { header, payload })
    }
}

/// Serializes `header` followed by `payload` into a new buffer in network
/// byte order, filling in the checksum for the given addresses.
///
/// # Errors
///
/// Returns [`Error::OutOfMemory`] if the buffer cannot be allocated, or an
/// error if the segment is too large for the pseudo-header.
pub fn encode(
    header: &TcpHeader,
    payload: &[u8],
    source: Ipv4Addr,
    destination: Ipv4Addr,
) -> Result<Vec<u8>> {
    let mut header = *header;
    header.set_checksum(source, destination, payload)?;

    let (raw_header, header_len) = header.to_be_bytes();

    let mut buf = Vec::new();
    buf.try_reserve_exact(header_len + payload.len())
        .map_err(|_| Error::OutOfMemory)?;

    buf.extend_from_slice(&raw_header[..header_len]);
    buf.extend_from_slice(payload);

    Ok(buf)
}
