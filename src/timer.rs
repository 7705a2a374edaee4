//! Background driver of the periodic resend sweep.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::Result;
use crate::stack::Stack;

/// Handle to the thread sweeping a [`Stack`] every `sweep_interval`.
///
/// Dropping the handle stops the thread and waits for it to exit.
#[derive(Debug)]
pub struct RetransmitTimer {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RetransmitTimer {
    /// Starts sweeping `stack`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread could not be spawned.
    pub fn spawn(stack: Arc<Stack>) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let interval = stack.config().sweep_interval;

        let handle = thread::Builder::new()
            .name("tcp-retransmit".into())
            .spawn(move || {
                debug!("retransmit timer started, interval {interval:?}");

                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => stack.sweep(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                debug!("retransmit timer stopped");
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for RetransmitTimer {
    fn drop(&mut self) {
        drop(self.stop.take());

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("retransmit timer thread panicked");
            }
        }
    }
}
