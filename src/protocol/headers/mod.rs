//! Parsing, serialization, and construction of TCP headers.

mod tcp;
pub use tcp::{Flags, OptionKind, TcpHeader, TcpOptions};
