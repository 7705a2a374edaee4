//! Seams to the collaborators surrounding the TCP engine: the routing layer,
//! the network adapters it selects, and the random number source.

pub mod random;
pub use random::{RandomSource, ThreadRandom};

pub mod route;
pub use route::{NetworkAdapter, Router, RoutingDecision};
