//! Error types for the CAN manager
//!
//! `CanError` is what every manager operation returns; `TransportError` is
//! what a [`Transport`](crate::transport::Transport) backend reports and is
//! carried inside `CanError::Transport`.

use thiserror::Error;

use crate::frame::BusMode;
use crate::transport::ChannelHandle;

/// Result type alias for manager operations
pub type Result<T> = std::result::Result<T, CanError>;

/// Error types for manager operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CanError {
    /// Payload does not fit the bus mode
    #[error("Payload of {length} bytes exceeds the {mode} capacity of {max} bytes")]
    InvalidLength {
        length: usize,
        max: usize,
        mode: BusMode,
    },

    /// Arbitration ID does not fit the identifier format
    #[error("Invalid arbitration ID: 0x{0:08X}")]
    InvalidId(u32),

    /// No bit-timing entry for the requested rate pair
    #[error("Unsupported bit timing: nominal {nominal} bit/s, data {data} bit/s")]
    UnsupportedBitTiming { nominal: u32, data: u32 },

    /// Channel cannot run CAN FD
    #[error("Channel {0} does not support CAN FD")]
    FdNotSupported(ChannelHandle),

    /// Frame was encoded for a different bus mode than the connection uses
    #[error("Cannot send a {requested} frame on a {active} connection")]
    ModeMismatch { requested: BusMode, active: BusMode },

    /// Operation requires a connection
    #[error("Not connected")]
    NotConnected,

    /// Connect attempted while a channel is active
    #[error("Already connected on channel {0}")]
    AlreadyConnected(ChannelHandle),

    /// Underlying driver call failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Received frame carries an unknown length code
    #[error("Malformed frame: invalid length code {0}")]
    Malformed(u8),

    /// Connect, disconnect or receive control was called from a receive callback
    #[error("Connection lifecycle cannot be changed from inside a receive callback")]
    CalledFromReceiveThread,

    /// Background receive thread could not be created
    #[error("Failed to spawn receive thread: {0}")]
    ReceiveThread(String),
}

impl CanError {
    /// Check if this error means the request cannot be served by this channel or configuration
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            CanError::UnsupportedBitTiming { .. }
                | CanError::FdNotSupported(_)
                | CanError::ModeMismatch { .. }
        )
    }

    /// Check if this error came from the transport
    pub fn is_transport_error(&self) -> bool {
        matches!(self, CanError::Transport(_))
    }
}

/// Errors reported by a transport backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// USB error from the rusb library
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Channel is not present on the system
    #[error("Channel {0} is not available")]
    ChannelUnavailable(ChannelHandle),

    /// Channel has not been initialized
    #[error("Channel {0} is not open")]
    ChannelNotOpen(ChannelHandle),

    /// Unsupported bitrate for the device clock
    #[error("Unsupported bitrate {bitrate} for clock {clock_hz} Hz")]
    UnsupportedBitrate { bitrate: u32, clock_hz: u32 },

    /// Timing configuration was computed for another clock
    #[error("Timing configuration expects a {expected} Hz clock, device runs at {actual} Hz")]
    ClockMismatch { expected: u32, actual: u32 },

    /// Invalid response from device
    #[error("Invalid response from device: expected {expected} bytes, got {actual}")]
    InvalidResponse { expected: usize, actual: usize },

    /// Driver-specific failure
    #[error("Driver error: {0}")]
    Driver(String),
}

impl TransportError {
    /// Check if the link to the adapter is gone
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            TransportError::Usb(rusb::Error::NoDevice)
                | TransportError::Usb(rusb::Error::Io)
                | TransportError::Usb(rusb::Error::Pipe)
        )
    }
}
