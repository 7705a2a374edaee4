//! Wake-up primitive for threads blocked on a socket.

use std::sync::{Condvar, Mutex, PoisonError};

/// Generation-counted condition used to wait for socket readiness changes.
///
/// A waiter reads [`generation`](Self::generation), checks its condition,
/// and only then waits for the generation to move on. A notification that
/// lands between the check and the wait is therefore never missed.
#[derive(Debug, Default)]
pub struct WaitQueue {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl WaitQueue {
    /// Creates a queue with no waiters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current generation.
    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Blocks until the generation differs from `seen`.
    pub fn wait(&self, seen: u64) {
        let generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .changed
            .wait_while(generation, |generation| *generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
    }
}
