//! Source of initial sequence numbers and ephemeral port offsets.

/// Random number source consumed by the engine.
pub trait RandomSource: Send + Sync {
    /// Returns a uniformly distributed `u32`.
    fn next_u32(&self) -> u32;

    /// Returns a uniformly distributed `u16`.
    fn next_u16(&self) -> u16 {
        (self.next_u32() >> 16) as u16
    }
}

/// [`RandomSource`] backed by the thread-local generator of `rand`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_u32(&self) -> u32 {
        rand::random()
    }

    fn next_u16(&self) -> u16 {
        rand::random()
    }
}
