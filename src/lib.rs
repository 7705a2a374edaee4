//! Kernel-resident implementation of the Transmission Control Protocol (TCP),
//! based on [RFC 793].
//!
//! The engine covers the connection state machine, demultiplexing of inbound
//! segments to sockets, retransmission, checksumming, ephemeral port
//! allocation and the listen/accept linkage. The IP layer, routing and
//! network adapters are external collaborators reached through the traits in
//! [`net`].
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod config;
pub use config::TcpConfig;

pub mod net;

pub mod protocol;

pub mod stack;
pub use stack::Stack;

pub mod timer;
pub use timer::RetransmitTimer;

pub mod error;
pub use error::{Error, HeaderError, ParseError, Result};
