//! Internet checksum over the TCP pseudo-header, header and payload.
//!
//! RFC 793 (3.1)
//!
//! The checksum field is the 16 bit one's complement of the one's complement
//! sum of all 16 bit words in the header and text. The checksum also covers a
//! 96 bit pseudo header conceptually prefixed to the TCP header:
//!
//! ```text
//!        +--------+--------+--------+--------+
//!        |           Source Address          |
//!        +--------+--------+--------+--------+
//!        |         Destination Address       |
//!        +--------+--------+--------+--------+
//!        |  zero  |  PTCL  |    TCP Length   |
//!        +--------+--------+--------+--------+
//! ```

use std::net::Ipv4Addr;

use crate::{HeaderError, Result};

/// IPv4 protocol number of TCP.
pub const PROTOCOL_TCP: u8 = 6;

/// Builds the pseudo-header for a segment of `segment_len` bytes (header,
/// options and payload).
///
/// # Errors
///
/// Returns an error if `segment_len` does not fit the 16-bit length field.
pub fn pseudo_header(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    segment_len: usize,
) -> Result<[u8; 12]> {
    let tcp_len = u16::try_from(segment_len).map_err(|_| HeaderError::SegmentTooLarge {
        provided: segment_len,
        max: u16::MAX as usize,
    })?;

    let mut pseudo_header = [0u8; 12];

    pseudo_header[0..4].copy_from_slice(&source.octets());
    pseudo_header[4..8].copy_from_slice(&destination.octets());
    pseudo_header[8] = 0;
    pseudo_header[9] = PROTOCOL_TCP;
    pseudo_header[10..12].copy_from_slice(&tcp_len.to_be_bytes());

    Ok(pseudo_header)
}

/// Computes the TCP checksum of a segment.
///
/// `header` is the full TCP header including options. When its checksum field
/// is zero the result is the value to store in that field; when it already
/// holds a correct checksum the result is `0`.
///
/// # Errors
///
/// Returns an error if the segment is too large for the pseudo-header.
pub fn tcp_checksum(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    header: &[u8],
    payload: &[u8],
) -> Result<u16> {
    debug_assert!(header.len() % 2 == 0, "TCP header length is a multiple of 4");

    let pseudo_header = pseudo_header(source, destination, header.len() + payload.len())?;

    Ok(!ones_complement_sum([&pseudo_header[..], header, payload]))
}

/// Returns `true` if the checksum stored in `header` is correct for the
/// segment.
pub fn is_valid(source: Ipv4Addr, destination: Ipv4Addr, header: &[u8], payload: &[u8]) -> bool {
    matches!(tcp_checksum(source, destination, header, payload), Ok(0))
}

/// One's complement sum of the concatenation of `parts`, as big-endian 16-bit
/// words.
///
/// All parts but the last must have even length; a trailing odd octet of the
/// last part is padded on the right with zeros.
fn ones_complement_sum<const N: usize>(parts: [&[u8]; N]) -> u16 {
    // Chain together byte slices so each can be processed together.
    let mut checksum_iter = parts.into_iter().flatten();

    let mut sum = 0u32;

    loop {
        let word = match (checksum_iter.next(), checksum_iter.next()) {
            (Some(h), Some(l)) => u16::from_be_bytes([*h, *l]),
            // If a segment contains an odd number of header and text octets
            // to be checksummed, the last octet is padded on the right with
            // zeros to form a 16 bit word for checksum purposes.
            (Some(h), None) => u16::from_be_bytes([*h, 0x00]),
            _ => break,
        };

        sum += word as u32;

        // Adds the higher 16-bits to the lower 16-bits.
        if sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }

    sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 44);

    /// A SYN segment header with MSS, window scale, timestamps, and SACK
    /// permitted options, checksum zeroed.
    const SYN_HEADER: [u8; 40] = [
        0xa0, 0x16, 0x01, 0xbb, 0xbc, 0xbb, 0x54, 0xa8, 0x00, 0x00, 0x00, 0x00, 0xa0, 0x02, 0xfa,
        0xf0, 0x00, 0x00, 0x00, 0x00, 0x02, 0x04, 0x05, 0xb4, 0x04, 0x02, 0x08, 0x0a, 0x78, 0x27,
        0xe4, 0xe7, 0x00, 0x00, 0x00, 0x00, 0x01, 0x03, 0x03, 0x07,
    ];

    #[test]
    fn checksum_known_segment_valid() {
        let checksum = tcp_checksum(SRC, DST, &SYN_HEADER, &[]).unwrap();
        assert_eq!(checksum, 0xBB4C);
    }

    #[test]
    fn checksum_filled_folds_to_zero_valid() {
        let mut header = SYN_HEADER;
        let checksum = tcp_checksum(SRC, DST, &header, b"hello").unwrap();
        header[16..18].copy_from_slice(&checksum.to_be_bytes());

        assert_eq!(tcp_checksum(SRC, DST, &header, b"hello").unwrap(), 0);
        assert!(is_valid(SRC, DST, &header, b"hello"));
        assert!(!is_valid(SRC, DST, &header, b"hellO"));
    }

    #[test]
    fn checksum_odd_payload_padding_valid() {
        // A trailing odd octet counts as the high byte of a zero-padded word.
        let odd = tcp_checksum(SRC, DST, &SYN_HEADER, &[0xAB]).unwrap();
        let padded = ones_complement_sum([
            &pseudo_header(SRC, DST, SYN_HEADER.len() + 1).unwrap()[..],
            &SYN_HEADER[..],
            &[0xAB, 0x00][..],
        ]);

        assert_eq!(odd, !padded);
    }

    #[test]
    fn checksum_oversized_segment_invalid() {
        let payload = vec![0u8; u16::MAX as usize];
        assert!(tcp_checksum(SRC, DST, &SYN_HEADER, &payload).is_err());
    }

    proptest! {
        #[test]
        fn checksum_self_consistency(
            src in any::<[u8; 4]>(),
            dst in any::<[u8; 4]>(),
            mut header in any::<[u8; 20]>(),
            payload in prop::collection::vec(any::<u8>(), 0..1500),
        ) {
            let (src, dst) = (Ipv4Addr::from(src), Ipv4Addr::from(dst));

            header[16] = 0;
            header[17] = 0;

            let checksum = tcp_checksum(src, dst, &header, &payload).unwrap();
            header[16..18].copy_from_slice(&checksum.to_be_bytes());

            prop_assert_eq!(tcp_checksum(src, dst, &header, &payload).unwrap(), 0);
        }
    }
}
