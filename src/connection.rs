//! Connection state and the transport port
//!
//! The `Port` pairs the transport with the connection state it is in. It
//! lives behind the transport lock, so everything that touches the
//! physical handle (init, filter, read, write, uninit) sees a consistent
//! state. Connection events go out to observers over channels.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::constants::{FILTER_ACCEPT_ALL_HIGH, FILTER_ACCEPT_ALL_LOW};
use crate::error::{CanError, Result};
use crate::frame::BusMode;
use crate::timing::BitTimingConfig;
use crate::transport::{ChannelHandle, Transport, TransportResult};

/// Lifecycle state of a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel is active
    Disconnected,
    /// A channel is initialized in the given mode
    Connected {
        channel: ChannelHandle,
        mode: BusMode,
    },
}

impl ConnectionState {
    /// Active channel and mode, if connected
    pub fn link(&self) -> Option<(ChannelHandle, BusMode)> {
        match *self {
            ConnectionState::Connected { channel, mode } => Some((channel, mode)),
            ConnectionState::Disconnected => None,
        }
    }

    /// Check if a channel is active
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// Inclusive range of accepted arbitration IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptanceFilter {
    pub low: u32,
    pub high: u32,
}

impl AcceptanceFilter {
    /// Accept IDs in `low..=high`
    pub fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }

    /// Accept every standard and extended ID
    pub fn accept_all() -> Self {
        Self::new(FILTER_ACCEPT_ALL_LOW, FILTER_ACCEPT_ALL_HIGH)
    }

    /// Check if an ID passes the filter
    pub fn accepts(&self, id: u32) -> bool {
        (self.low..=self.high).contains(&id)
    }
}

impl Default for AcceptanceFilter {
    fn default() -> Self {
        Self::accept_all()
    }
}

/// Edge notification emitted once per connection transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        channel: ChannelHandle,
        mode: BusMode,
    },
    Disconnected {
        channel: ChannelHandle,
    },
}

impl ConnectionEvent {
    /// `true` for `Connected`, `false` for `Disconnected`
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionEvent::Connected { .. })
    }

    /// Channel the transition applies to
    pub fn channel(&self) -> ChannelHandle {
        match *self {
            ConnectionEvent::Connected { channel, .. } => channel,
            ConnectionEvent::Disconnected { channel } => channel,
        }
    }
}

/// Connection event observers
#[derive(Debug, Default)]
pub(crate) struct Observers {
    senders: Mutex<Vec<Sender<ConnectionEvent>>>,
}

impl Observers {
    pub(crate) fn subscribe(&self) -> Receiver<ConnectionEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.senders).push(tx);
        rx
    }

    /// Send to every live observer; never blocks
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        lock(&self.senders).retain(|tx| tx.send(event).is_ok());
    }
}

/// Transport plus the connection state it is in
pub(crate) struct Port<T> {
    pub(crate) transport: T,
    pub(crate) state: ConnectionState,
}

impl<T: Transport> Port<T> {
    pub(crate) fn new(transport: T) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
        }
    }

    /// Bring up a classic CAN channel
    pub(crate) fn open(
        &mut self,
        channel: ChannelHandle,
        nominal_bitrate: u32,
        filter: AcceptanceFilter,
    ) -> Result<()> {
        self.ensure_disconnected()?;
        self.transport.init(channel, nominal_bitrate)?;
        self.finish_open(channel, BusMode::Classic, filter)
    }

    /// Bring up a CAN FD channel; the capability check runs before any init
    pub(crate) fn open_fd(
        &mut self,
        channel: ChannelHandle,
        timing: &BitTimingConfig,
        filter: AcceptanceFilter,
    ) -> Result<()> {
        self.ensure_disconnected()?;
        if !self.transport.is_fd_capable(channel)? {
            return Err(CanError::FdNotSupported(channel));
        }
        self.transport.init_fd(channel, timing)?;
        self.finish_open(channel, BusMode::Fd, filter)
    }

    fn ensure_disconnected(&self) -> Result<()> {
        match self.state {
            ConnectionState::Connected { channel, .. } => Err(CanError::AlreadyConnected(channel)),
            ConnectionState::Disconnected => Ok(()),
        }
    }

    fn finish_open(
        &mut self,
        channel: ChannelHandle,
        mode: BusMode,
        filter: AcceptanceFilter,
    ) -> Result<()> {
        debug!(
            "Setting acceptance filter 0x{:08X}..=0x{:08X} on channel {}",
            filter.low, filter.high, channel
        );
        if let Err(e) = self.transport.set_filter(channel, filter.low, filter.high) {
            // Never keep a half-configured channel
            if let Err(release) = self.transport.uninit(channel) {
                warn!("Failed to release channel {} after filter error: {}", channel, release);
            }
            return Err(e.into());
        }

        self.state = ConnectionState::Connected { channel, mode };
        Ok(())
    }

    /// Release the active channel, returning it with the release outcome
    ///
    /// The state is `Disconnected` afterwards even if the transport fails.
    pub(crate) fn close(&mut self) -> Option<(ChannelHandle, TransportResult<()>)> {
        let (channel, _) = self.state.link()?;
        self.state = ConnectionState::Disconnected;
        Some((channel, self.transport.uninit(channel)))
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
