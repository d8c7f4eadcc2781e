//! Background receive loop
//!
//! One dedicated thread polls the transport while the connection is up and
//! hands every decoded frame to the subscriber registry. The loop checks its
//! stop flag before every read, so a stop request issued during a burst is
//! honored after the frame currently being dispatched, not after the burst.

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::connection::{lock, Port};
use crate::error::{CanError, Result};
use crate::frame::{BusMode, Frame, Timestamp};
use crate::registry::SubscriberRegistry;
use crate::transport::Transport;

thread_local! {
    static ON_RECEIVE_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Check if the caller runs on a receive loop thread (inside a subscriber)
pub(crate) fn on_receive_thread() -> bool {
    ON_RECEIVE_THREAD.with(Cell::get)
}

/// Receive loop lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReceiveState {
    /// Created, not started
    Idle = 0,
    /// Polling the transport
    Running = 1,
    /// Stop requested, finishing the current dispatch
    StopRequested = 2,
    /// Thread has exited
    Stopped = 3,
}

impl ReceiveState {
    /// Read a state shared with a loop thread
    pub(crate) fn load(state: &AtomicU8) -> Self {
        Self::from_u8(state.load(Ordering::Acquire))
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReceiveState::Idle,
            1 => ReceiveState::Running,
            2 => ReceiveState::StopRequested,
            _ => ReceiveState::Stopped,
        }
    }
}

/// Outcome of one poll of the transport
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    /// Data frame for subscribers
    Data(Frame, Timestamp),
    /// Driver status frame, not delivered
    Status,
    /// Receive queue empty
    Empty,
}

/// Read one frame in the connection's mode
///
/// The transport lock is held for the read only; decoding happens after it
/// is released.
pub(crate) fn poll<T: Transport>(port: &Mutex<Port<T>>) -> Result<Inbound> {
    let (frame, timestamp) = {
        let mut port = lock(port);
        let (channel, mode) = port.state.link().ok_or(CanError::NotConnected)?;
        match mode {
            BusMode::Classic => match port.transport.read(channel)? {
                None => return Ok(Inbound::Empty),
                Some(rx) if rx.frame.is_status() => return Ok(Inbound::Status),
                Some(rx) => (rx.frame.decode(), rx.timestamp),
            },
            BusMode::Fd => match port.transport.read_fd(channel)? {
                None => return Ok(Inbound::Empty),
                Some(rx) if rx.frame.is_status() => return Ok(Inbound::Status),
                Some(rx) => (rx.frame.decode(), rx.timestamp),
            },
        }
    };
    Ok(Inbound::Data(frame?, timestamp))
}

/// Handle to the background receive thread
#[derive(Debug)]
pub struct ReceiveLoop {
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl Default for ReceiveLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveLoop {
    /// Create an idle loop
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ReceiveState::Idle as u8)),
            handle: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ReceiveState {
        ReceiveState::load(&self.state)
    }

    /// Shared view of the lifecycle state, readable without the loop handle
    pub(crate) fn shared_state(&self) -> Arc<AtomicU8> {
        Arc::clone(&self.state)
    }

    /// Check if the thread is polling
    pub fn is_running(&self) -> bool {
        self.state() == ReceiveState::Running
    }

    /// Spawn the polling thread (Idle -> Running)
    ///
    /// Starting a loop that is not idle is a no-op.
    pub(crate) fn start<T: Transport + 'static>(
        &mut self,
        port: Arc<Mutex<Port<T>>>,
        registry: Arc<SubscriberRegistry>,
        idle_backoff: Duration,
    ) -> Result<()> {
        if self
            .state
            .compare_exchange(
                ReceiveState::Idle as u8,
                ReceiveState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }

        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("can-rx".into())
            .spawn(move || run(&port, &registry, &state, idle_backoff));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state
                    .store(ReceiveState::Stopped as u8, Ordering::Release);
                Err(CanError::ReceiveThread(e.to_string()))
            }
        }
    }

    /// Ask the thread to stop (Running -> StopRequested) without waiting
    pub fn request_stop(&self) {
        let _ = self.state.compare_exchange(
            ReceiveState::Running as u8,
            ReceiveState::StopRequested as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Stop the thread and wait until it has exited
    ///
    /// When this returns no subscriber is being invoked and the registry has
    /// been cleared.
    pub fn stop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                // Dropped from a subscriber: the loop exits after this dispatch
                return;
            }
            if handle.join().is_err() {
                error!("Receive thread panicked");
            }
        }
        self.state
            .store(ReceiveState::Stopped as u8, Ordering::Release);
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<T: Transport>(
    port: &Mutex<Port<T>>,
    registry: &SubscriberRegistry,
    state: &AtomicU8,
    idle_backoff: Duration,
) {
    ON_RECEIVE_THREAD.with(|flag| flag.set(true));
    info!("Receive loop started");

    let running = || state.load(Ordering::Acquire) == ReceiveState::Running as u8;

    'outer: while running() {
        let mut received = false;

        // Drain everything queued, checking the stop flag before every read
        while running() {
            match poll(port) {
                Ok(Inbound::Data(frame, timestamp)) => {
                    received = true;
                    trace!("RX  {}", frame);
                    registry.dispatch(&frame, timestamp);
                }
                Ok(Inbound::Status) => {
                    received = true;
                    debug!("Dropped driver status frame");
                }
                Ok(Inbound::Empty) => break,
                Err(CanError::Malformed(dlc)) => {
                    received = true;
                    warn!("Dropped frame with invalid length code {}", dlc);
                }
                Err(CanError::Transport(e)) if e.is_disconnected() => {
                    error!("Connection lost: {}", e);
                    break 'outer;
                }
                Err(CanError::NotConnected) => break 'outer,
                Err(e) => {
                    debug!("Receive failed: {}", e);
                    break;
                }
            }
        }

        if !received {
            thread::sleep(idle_backoff);
        }
    }

    registry.clear();
    state.store(ReceiveState::Stopped as u8, Ordering::Release);
    info!("Receive loop stopped");
}
