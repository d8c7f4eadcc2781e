//! Transmit path
//!
//! Frames are encoded on the caller's thread, then written under the
//! transport lock so at most one write is in flight. Callers waiting for
//! their turn block on the lock rather than spinning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::trace;

use crate::connection::{lock, Port};
use crate::error::{CanError, Result};
use crate::frame::{encode, BusMode, EncodedFrame, Frame};
use crate::transport::Transport;

/// Serializes outbound frames onto the transport
#[derive(Debug, Default)]
pub struct TransmitGate {
    /// Senders inside `send`, waiting or writing
    pending: AtomicUsize,
    /// Pause after each write, taken while still holding the transmit turn
    backoff: Option<Duration>,
}

/// Decrements the pending count however `send` exits
struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TransmitGate {
    /// Create a gate with an optional post-write backoff
    pub fn new(backoff: Option<Duration>) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            backoff,
        }
    }

    /// Check if any send is waiting or writing
    pub fn is_transmitting(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    /// Encode and write one frame
    ///
    /// Encoding errors are reported before the transport lock is taken. The
    /// connection state is checked under the lock, so a send either completes
    /// before a concurrent disconnect releases the channel or fails with
    /// `CanError::NotConnected`.
    pub(crate) fn send<T: Transport>(
        &self,
        port: &Mutex<Port<T>>,
        frame: &Frame,
        mode: BusMode,
    ) -> Result<()> {
        let encoded = encode(frame, mode)?;
        let _pending = PendingGuard::enter(&self.pending);

        let mut port = lock(port);
        let (channel, active) = port.state.link().ok_or(CanError::NotConnected)?;
        if active != mode {
            return Err(CanError::ModeMismatch {
                requested: mode,
                active,
            });
        }

        match &encoded {
            EncodedFrame::Classic(wire) => port.transport.write(channel, wire)?,
            EncodedFrame::Fd(wire) => port.transport.write_fd(channel, wire)?,
        }
        trace!("TX  {}", frame);

        if let Some(backoff) = self.backoff {
            thread::sleep(backoff);
        }
        Ok(())
    }
}
