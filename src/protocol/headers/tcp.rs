use std::fmt;
use std::net::Ipv4Addr;
use std::ops::{BitOr, BitOrAssign};

use crate::protocol::checksum;
use crate::{Error, HeaderError, ParseError};

/// Control bits of a TCP header.
///
/// ```text
///    URG:  Urgent Pointer field significant
///    ACK:  Acknowledgment field significant
///    PSH:  Push Function
///    RST:  Reset the connection
///    SYN:  Synchronize sequence numbers
///    FIN:  No more data from sender
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    /// No more data from sender.
    pub const FIN: Flags = Flags(1);
    /// Synchronize sequence numbers.
    pub const SYN: Flags = Flags(1 << 1);
    /// Reset the connection.
    pub const RST: Flags = Flags(1 << 2);
    /// Push function.
    pub const PSH: Flags = Flags(1 << 3);
    /// Acknowledgment field significant.
    pub const ACK: Flags = Flags(1 << 4);
    /// Urgent pointer field significant.
    pub const URG: Flags = Flags(1 << 5);

    /// Builds flags from the low 6 bits of `bits`.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Flags(bits & 0b0011_1111)
    }

    /// Returns the raw control bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 6] = [
            (Flags::SYN, "SYN"),
            (Flags::ACK, "ACK"),
            (Flags::PSH, "PSH"),
            (Flags::FIN, "FIN"),
            (Flags::RST, "RST"),
            (Flags::URG, "URG"),
        ];

        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }

        if first {
            f.write_str("-")?;
        }

        Ok(())
    }
}

/// TCP Segment Header.
///
/// RFC 793 (3.1)
///
/// ```text
///   0                   1                   2                   3
///     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |          Source Port          |       Destination Port        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                        Sequence Number                        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                    Acknowledgment Number                      |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |  Data |           |U|A|P|R|S|F|                               |
///    | Offset| Reserved  |R|C|S|S|Y|I|            Window             |
///    |       |           |G|K|H|T|N|N|                               |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |           Checksum            |         Urgent Pointer        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                    Options                    |    Padding    |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                             data                              |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// The source port number.
    src_port: u16,
    /// The destination port number.
    dst_port: u16,
    /// The sequence number of the first data octet in this segment
    /// (except when SYN is present). If SYN is present the sequence number is
    /// the initial sequence number (ISN) and the first data octet is ISN+1.
    seq_number: u32,
    /// If the ACK control bit is set this field contains the value of the next
    /// sequence number the sender of the segment is expecting to receive.
    ack_number: u32,
    /// The data offset (4-bits), 6 reserved bits, and the 6 control bits.
    offset_and_control_bits: u16,
    /// The number of data octets beginning with the one indicated in the
    /// acknowledgment field which the sender of this segment is willing to
    /// accept.
    window: u16,
    /// See [`checksum`](crate::protocol::checksum).
    checksum: u16,
    /// This field communicates the current value of the urgent pointer as a
    /// positive offset from the sequence number in this segment.
    urgent_pointer: u16,
    /// Options that may occupy space at the end of the TCP header and are a
    /// multiple of 8 bits in length.
    options: TcpOptions,
}

impl TcpHeader {
    /// Minimum length of an TCP header in bytes.
    pub const MIN_HEADER_LEN: u16 = 20;

    /// Maximum length of an TCP header in bytes (data offset of 15).
    pub const MAX_HEADER_LEN: u16 = 60;

    /// Minimum data offset of a TCP header.
    pub const MIN_DATA_OFFSET: u16 = 5;

    /// Maximum data offset of a TCP header.
    pub const MAX_DATA_OFFSET: u16 = 15;

    /// Creates a new TCP header with the specified source and destination
    /// ports, sequence number, and window size, while setting default values
    /// for other fields.
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, window: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq_number,
            window,
            ..Default::default()
        }
    }

    /// Returns the `source port` field of the TCP header.
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    /// Returns the `destination port` field of the TCP header.
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// Returns the `sequence number` field of the TCP header.
    pub fn seq_number(&self) -> u32 {
        self.seq_number
    }

    /// Returns the `acknowledgment number` field of the TCP header.
    pub fn ack_number(&self) -> u32 {
        self.ack_number
    }

    /// Sets the `acknowledgment number` field of the TCP header with the
    /// provided value.
    pub fn set_ack_number(&mut self, ack: u32) {
        self.ack_number = ack;
    }

    /// Returns the `data offset` field of the TCP header.
    ///
    /// To get the header length (including options) in bytes, use
    /// [TcpHeader::header_len].
    pub fn data_offset(&self) -> u8 {
        // Stored in the higher 4 bits.
        (self.offset_and_control_bits >> 12) as u8
    }

    /// Returns the control bits of the TCP header.
    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.offset_and_control_bits as u8)
    }

    /// Sets the given control bits, keeping those already set.
    pub fn set_flags(&mut self, flags: Flags) {
        self.offset_and_control_bits |= flags.bits() as u16;
    }

    /// Returns `true` if the ACK control bit is set.
    pub fn ack(&self) -> bool {
        self.flags().contains(Flags::ACK)
    }

    /// Returns `true` if the RST control bit is set.
    pub fn rst(&self) -> bool {
        self.flags().contains(Flags::RST)
    }

    /// Returns `true` if the SYN control bit is set.
    pub fn syn(&self) -> bool {
        self.flags().contains(Flags::SYN)
    }

    /// Returns `true` if the FIN control bit is set.
    pub fn fin(&self) -> bool {
        self.flags().contains(Flags::FIN)
    }

    /// Returns the `window` field of the TCP header.
    pub fn window(&self) -> u16 {
        self.window
    }

    /// Returns the `checksum` field of the TCP header.
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Computes and updates the `checksum` field for the TCP header.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is too large for the pseudo-header.
    pub fn set_checksum(
        &mut self,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        payload: &[u8],
    ) -> crate::Result<()> {
        self.checksum = 0;
        let (raw_header, nbytes) = self.to_be_bytes();
        self.checksum =
            checksum::tcp_checksum(source, destination, &raw_header[..nbytes], payload)?;

        Ok(())
    }

    /// Returns `true` if the TCP header checksum is valid.
    pub fn is_valid_checksum(
        &self,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        payload: &[u8],
    ) -> bool {
        let (raw_header, nbytes) = self.to_be_bytes();
        checksum::is_valid(source, destination, &raw_header[..nbytes], payload)
    }

    /// Returns the `urgent pointer` field of the TCP header.
    pub fn urgent_pointer(&self) -> u16 {
        self.urgent_pointer
    }

    /// Returns the `options` field of the TCP header.
    pub fn options(&self) -> TcpOptions {
        self.options
    }

    /// Sets the `Maximum Segment Size` (MSS) option for the TCP header with the
    /// provided value.
    ///
    /// # Errors
    ///
    /// Returns an error if the options buffer lacks sufficient space to append
    /// the MSS, or if the provided MSS value is invalid.
    pub fn set_option_mss(&mut self, mss: u16) -> crate::Result<()> {
        if self.options.mss().is_some() {
            return Ok(());
        }

        self.options.set_mss(mss)?;

        // Represent appended MSS bytes as number of 32-bit words (1) and add
        // to the current data offset.
        let new_data_offset = ((TcpOptions::MSS_LEN >> 2) as u8 + self.data_offset()) as u16;

        // Clear previous data offset value, keeping the values of the reserved
        // and control bits.
        self.offset_and_control_bits &= 0x0FFF;
        self.offset_and_control_bits |= new_data_offset << 12;

        Ok(())
    }

    /// Returns the length of the TCP header in bytes, including options.
    pub fn header_len(&self) -> usize {
        Self::MIN_HEADER_LEN as usize + self.options.len()
    }

    /// Returns the memory representation of the TCP header as a byte array in
    /// big-endian (network) byte order.
    ///
    /// A buffer of size `TcpHeader::MAX_HEADER_LEN` is used as the byte array,
    /// so the number of bytes written is also returned.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_be_bytes(&self) -> ([u8; Self::MAX_HEADER_LEN as usize], usize) {
        let mut raw_header = [0u8; Self::MAX_HEADER_LEN as usize];
        let size = self.header_len();

        raw_header[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        raw_header[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        raw_header[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        raw_header[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        raw_header[12..14].copy_from_slice(&self.offset_and_control_bits.to_be_bytes());
        raw_header[14..16].copy_from_slice(&self.window.to_be_bytes());
        raw_header[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        raw_header[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());

        raw_header[20..size].copy_from_slice(self.options.as_slice());

        (raw_header, size)
    }
}

impl TryFrom<&[u8]> for TcpHeader {
    type Error = Error;

    /// Parses the header at the start of `header_raw`. Bytes past the length
    /// indicated by the data offset are left for the payload.
    fn try_from(header_raw: &[u8]) -> Result<Self, Self::Error> {
        if header_raw.len() < Self::MIN_HEADER_LEN as usize {
            return Err(Error::Parse(ParseError::InvalidBufferLength {
                provided: header_raw.len(),
                min: Self::MIN_HEADER_LEN,
                max: Self::MAX_HEADER_LEN,
            }));
        }

        let offset_and_control_bits = u16::from_be_bytes([header_raw[12], header_raw[13]]);
        let data_offset = offset_and_control_bits >> 12;

        if data_offset < Self::MIN_DATA_OFFSET {
            return Err(Error::Parse(ParseError::InvalidDataOffset {
                provided: data_offset,
                min: Self::MIN_DATA_OFFSET,
                max: Self::MAX_DATA_OFFSET,
            }));
        }

        // There are less bytes in the buffer than advertised by data offset.
        if (data_offset << 2) as usize > header_raw.len() {
            return Err(Error::Parse(ParseError::HeaderLengthMismatch {
                provided: header_raw.len(),
                expected: data_offset << 2,
            }));
        }

        Ok(Self {
            src_port: u16::from_be_bytes([header_raw[0], header_raw[1]]),
            dst_port: u16::from_be_bytes([header_raw[2], header_raw[3]]),
            seq_number: u32::from_be_bytes([
                header_raw[4],
                header_raw[5],
                header_raw[6],
                header_raw[7],
            ]),
            ack_number: u32::from_be_bytes([
                header_raw[8],
                header_raw[9],
                header_raw[10],
                header_raw[11],
            ]),
            offset_and_control_bits,
            window: u16::from_be_bytes([header_raw[14], header_raw[15]]),
            checksum: u16::from_be_bytes([header_raw[16], header_raw[17]]),
            urgent_pointer: u16::from_be_bytes([header_raw[18], header_raw[19]]),
            // Limit range to data offset so payload bytes are not
            // accidentally read as options.
            options: TcpOptions::try_from(&header_raw[20..(data_offset << 2) as usize])?,
        })
    }
}

impl Default for TcpHeader {
    fn default() -> Self {
        Self {
            src_port: 0,
            dst_port: 0,
            seq_number: 0,
            ack_number: 0,
            // Bits 0..4 (Data Offset) = 5, everything else clear.
            offset_and_control_bits: 0b0101_000000_000000,
            window: 0,
            checksum: 0,
            urgent_pointer: 0,
            options: Default::default(),
        }
    }
}

/// Options within a TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    /// The total number of bytes occupying the buffer.
    len: usize,
    /// Fixed-size array of raw options bytes.
    buf: [u8; Self::MAX_OPTIONS_LEN],
}

impl TcpOptions {
    /// Maximum length of TCP options in bytes.
    pub const MAX_OPTIONS_LEN: usize = 40;

    /// Length of MSS option in bytes.
    pub const MSS_LEN: usize = 4;

    /// Creates a new empty TCP options.
    pub fn new() -> Self {
        Self {
            len: 0,
            buf: [0u8; Self::MAX_OPTIONS_LEN],
        }
    }

    /// Returns the Maximum Segment Size (MSS) value from the TCP options, if
    /// present.
    pub fn mss(&self) -> Option<u16> {
        let opts = self.as_slice();
        let mut i = 0;

        while i < opts.len() {
            match OptionKind::from(opts[i]) {
                OptionKind::EOL => return None,
                OptionKind::NOP => i += 1,
                OptionKind::MSS => {
                    // RFC 793 (3.1)
                    //
                    // ```text
                    //        +--------+--------+---------+--------+
                    //        |00000010|00000100|   max seg size   |
                    //        +--------+--------+---------+--------+
                    // ```
                    if opts.get(i + 1) != Some(&0x04) || i + 4 > opts.len() {
                        return None;
                    }

                    return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                }
                OptionKind::Other(_) => {
                    // Skip over kind/length-encoded options we don't know.
                    match opts.get(i + 1) {
                        Some(&len) if len >= 2 => i += len as usize,
                        _ => return None,
                    }
                }
            }
        }

        None
    }

    /// Appends the Maximum Segment Size (MSS) option in the TCP options using
    /// the provided value.
    ///
    /// # Errors
    ///
    /// Returns an error if the options buffer lacks sufficient space to append
    /// the MSS, or if the provided MSS value is invalid.
    pub fn set_mss(&mut self, mss: u16) -> crate::Result<()> {
        if mss == 0 {
            return Err(Error::Header(HeaderError::InvalidMssOption));
        }

        let opts_len = self.len();

        if opts_len + Self::MSS_LEN > Self::MAX_OPTIONS_LEN {
            return Err(Error::Header(HeaderError::InsufficientOptionSpace {
                attempted_len: (opts_len + Self::MSS_LEN),
                current_len: opts_len,
                max_len: Self::MAX_OPTIONS_LEN,
            }));
        }

        self.buf[opts_len] = OptionKind::MSS.into();
        self.buf[opts_len + 1] = 0x04;
        self.buf[opts_len + 2..opts_len + 4].copy_from_slice(&mss.to_be_bytes());
        self.len += Self::MSS_LEN;

        Ok(())
    }

    /// Returns the length of the TCP options in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the TCP options contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns an immutable slice containing the TCP options.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl TryFrom<&[u8]> for TcpOptions {
    type Error = Error;

    fn try_from(opts_slice: &[u8]) -> Result<Self, Self::Error> {
        if opts_slice.len() > Self::MAX_OPTIONS_LEN {
            return Err(Error::Parse(ParseError::InvalidOptionsLength {
                provided: opts_slice.len(),
                max: Self::MAX_OPTIONS_LEN,
            }));
        }

        let mut buf = [0; Self::MAX_OPTIONS_LEN];
        buf[..opts_slice.len()].copy_from_slice(opts_slice);

        Ok(Self {
            len: opts_slice.len(),
            buf,
        })
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Kinds of TCP options (RFC 793 3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum OptionKind {
    /// End of Option List
    EOL,
    /// No-Operation
    NOP,
    /// Maximum Segment Size
    ///
    /// This field must only be sent in the initial connection request (i.e.,
    /// in segments with the SYN control bit set).
    MSS,
    /// Any other option, carrying its own length octet.
    Other(u8),
}

impl From<u8> for OptionKind {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::EOL,
            1 => Self::NOP,
            2 => Self::MSS,
            kind => Self::Other(kind),
        }
    }
}

impl From<OptionKind> for u8 {
    fn from(kind: OptionKind) -> u8 {
        match kind {
            OptionKind::EOL => 0,
            OptionKind::NOP => 1,
            OptionKind::MSS => 2,
            OptionKind::Other(kind) => kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYN_SEGMENT: [u8; 40] = [
        0xa0, 0x16, 0x01, 0xbb, 0xbc, 0xbb, 0x54, 0xa8, 0x00, 0x00, 0x00, 0x00, 0xa0, 0x02, 0xfa,
        0xf0, 0xbb, 0x4c, 0x00, 0x00, 0x02, 0x04, 0x05, 0xb4, 0x04, 0x02, 0x08, 0x0a, 0x78, 0x27,
        0xe4, 0xe7, 0x00, 0x00, 0x00, 0x00, 0x01, 0x03, 0x03, 0x07,
    ];

    #[test]
    fn tcp_header_basic_valid() {
        let header = TcpHeader::try_from(&SYN_SEGMENT[..]).unwrap();

        assert_eq!(header.src_port(), 40982);
        assert_eq!(header.dst_port(), 443);
        assert_eq!(header.seq_number(), 3166393512);
        assert_eq!(header.ack_number(), 0);
        assert_eq!(header.data_offset(), 10);
        assert_eq!(header.flags(), Flags::SYN);
        assert_eq!(header.window(), 64240);
        assert_eq!(header.checksum(), 0xBB4C);
        assert_eq!(header.urgent_pointer(), 0);
        assert_eq!(header.options().len(), 20);
        assert_eq!(header.options().mss(), Some(1460));
    }

    #[test]
    fn tcp_header_checksum_validation_valid() {
        let mut header = TcpHeader::try_from(&SYN_SEGMENT[..]).unwrap();

        let src = Ipv4Addr::new(192, 168, 0, 1);
        let dst = Ipv4Addr::new(192, 168, 0, 44);

        assert!(header.is_valid_checksum(src, dst, &[]));

        // Invalidate checksum.
        header.set_ack_number(22);
        assert!(!header.is_valid_checksum(src, dst, &[]));

        header.set_checksum(src, dst, &[]).unwrap();
        assert!(header.is_valid_checksum(src, dst, &[]));
    }

    #[test]
    fn tcp_header_flags_bit_isolation_valid() {
        for bits in 0u8..=0b0011_1111 {
            let mut segment = SYN_SEGMENT;
            segment[13] = bits;

            let header = TcpHeader::try_from(&segment[..]).unwrap();
            assert_eq!(header.flags().bits(), bits, "flags failed for {bits:06b}");
            assert_eq!(header.syn(), bits & 0b10 != 0);
            assert_eq!(header.fin(), bits & 0b01 != 0);
        }
    }

    #[test]
    fn tcp_header_set_mss_valid() {
        let mut header = TcpHeader::new(1000, 80, 7, u16::MAX);
        header.set_flags(Flags::SYN | Flags::ACK);

        assert_eq!(header.data_offset(), 5);
        assert_eq!(header.options().mss(), None);

        header.set_option_mss(1460).unwrap();

        assert_eq!(header.flags(), Flags::SYN | Flags::ACK);
        assert_eq!(header.data_offset(), 6);
        assert_eq!(header.header_len(), 24);
        assert_eq!(header.options().mss(), Some(1460));

        let (buf, nbytes) = header.to_be_bytes();
        assert_eq!(&buf[20..24], &[0x02, 0x04, 0x05, 0xb4]);
        assert_eq!(TcpHeader::try_from(&buf[..nbytes]).unwrap(), header);
    }

    #[test]
    fn tcp_header_trailing_payload_valid() {
        let mut segment = SYN_SEGMENT.to_vec();
        segment.extend_from_slice(b"data");

        let header = TcpHeader::try_from(&segment[..]).unwrap();
        assert_eq!(header.header_len(), 40);
    }

    #[test]
    fn tcp_header_data_offset_invalid() {
        let mut segment = SYN_SEGMENT;
        segment[12] = 0x40;

        assert!(matches!(
            TcpHeader::try_from(&segment[..]),
            Err(Error::Parse(ParseError::InvalidDataOffset { provided: 4, .. }))
        ));
    }

    #[test]
    fn tcp_header_truncated_invalid() {
        assert!(TcpHeader::try_from(&SYN_SEGMENT[..12]).is_err());
        assert!(matches!(
            TcpHeader::try_from(&SYN_SEGMENT[..30]),
            Err(Error::Parse(ParseError::HeaderLengthMismatch { expected: 40, .. }))
        ));
    }

    #[test]
    fn flags_display_valid() {
        assert_eq!((Flags::SYN | Flags::ACK).to_string(), "SYN|ACK");
        assert_eq!(Flags::from_bits_truncate(0).to_string(), "-");
    }
}
