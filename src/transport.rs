//! Transport abstraction
//!
//! A `Transport` is the driver-level collaborator that owns physical
//! channels and performs the actual bus I/O. The manager assumes transports
//! are not thread-safe and serializes every call behind one lock, so
//! implementations only need to be `Send`.
//!
//! Calls are expected to return in bounded time. A backend that can hang
//! (USB, sockets) must apply its own I/O timeouts.

use crate::error::TransportError;
use crate::frame::{ClassicWireFrame, FdWireFrame, Timestamp};
use crate::timing::BitTimingConfig;

/// Result type alias for transport calls
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Opaque identifier of a physical bus channel, assigned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(pub u16);

impl std::fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// A frame read from the transport together with its receive timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received<F> {
    pub frame: F,
    pub timestamp: Timestamp,
}

impl<F> Received<F> {
    pub fn new(frame: F, timestamp: Timestamp) -> Self {
        Self { frame, timestamp }
    }
}

/// Driver capability consumed by the manager
pub trait Transport: Send {
    /// Channels currently available
    fn enumerate(&mut self) -> TransportResult<Vec<ChannelHandle>>;

    /// Check if the channel can run CAN FD
    fn is_fd_capable(&mut self, channel: ChannelHandle) -> TransportResult<bool>;

    /// Initialize the channel for classic CAN
    fn init(&mut self, channel: ChannelHandle, nominal_bitrate: u32) -> TransportResult<()>;

    /// Initialize the channel for CAN FD
    fn init_fd(&mut self, channel: ChannelHandle, timing: &BitTimingConfig)
        -> TransportResult<()>;

    /// Restrict reception to identifiers in `low..=high`
    fn set_filter(&mut self, channel: ChannelHandle, low: u32, high: u32) -> TransportResult<()>;

    /// Release the channel
    fn uninit(&mut self, channel: ChannelHandle) -> TransportResult<()>;

    /// Write one classic CAN frame
    fn write(&mut self, channel: ChannelHandle, frame: &ClassicWireFrame) -> TransportResult<()>;

    /// Write one CAN FD frame
    fn write_fd(&mut self, channel: ChannelHandle, frame: &FdWireFrame) -> TransportResult<()>;

    /// Read one classic CAN frame; `Ok(None)` when the receive queue is empty
    fn read(
        &mut self,
        channel: ChannelHandle,
    ) -> TransportResult<Option<Received<ClassicWireFrame>>>;

    /// Read one CAN FD frame; `Ok(None)` when the receive queue is empty
    fn read_fd(&mut self, channel: ChannelHandle)
        -> TransportResult<Option<Received<FdWireFrame>>>;
}
