//! Thread-safe CAN / CAN FD connection manager
//!
//! This crate manages one CAN bus channel on top of a driver-level
//! [`Transport`]: it connects in classic or FD mode, serializes outbound
//! frames from any number of threads, and runs a background receive loop
//! that fans every inbound frame out to registered callbacks.
//!
//! # Features
//!
//! - Classic CAN (up to 8 data bytes) and CAN FD (up to 64 data bytes)
//! - Fixed CAN FD bit-timing table for an 80 MHz controller clock
//! - Subscriber callbacks that can unsubscribe themselves
//! - Connection events delivered over channels
//! - GS-USB backend for candleLight, CANable and similar adapters
//!
//! # Example
//!
//! ```no_run
//! use can_manager::{CanManager, Continuation, Frame, GsUsbTransport};
//!
//! fn main() -> can_manager::Result<()> {
//!     let manager = CanManager::new(GsUsbTransport::new());
//!
//!     // Pick the first adapter
//!     let channels = manager.available_channels()?;
//!     let Some(&channel) = channels.first() else {
//!         println!("No GS-USB device found");
//!         return Ok(());
//!     };
//!
//!     // 500 kbit/s arbitration, 2 Mbit/s data phase
//!     manager.connect_fd(channel, 500_000, 2_000_000)?;
//!
//!     manager.add_receive_callback(|frame, timestamp| {
//!         println!("{:>12.6}  RX  {}", timestamp.as_secs_f64(), frame);
//!         Continuation::Continue
//!     });
//!
//!     let frame = Frame::new_extended(0x18DA_F110, &[0x02, 0x10, 0x03])?;
//!     manager.send_fd(&frame)?;
//!
//!     manager.disconnect()
//! }
//! ```
//!
//! # Supported Devices
//!
//! - GS-USB devices (VID: 0x1D50, PID: 0x606F)
//! - candleLight (VID: 0x1209, PID: 0x2323)
//! - CES CANext FD (VID: 0x1CD2, PID: 0x606F)
//! - ABE CANdebugger FD (VID: 0x16D0, PID: 0x10B8)

pub mod connection;
pub mod constants;
pub mod error;
pub mod frame;
pub mod gs_usb;
pub mod manager;
pub mod receiver;
pub mod registry;
pub mod structures;
pub mod timing;
pub mod transmit;
pub mod transport;

#[cfg(test)]
mod mock;

// Re-export main types at crate root
pub use connection::{AcceptanceFilter, ConnectionEvent, ConnectionState};
pub use constants::{
    CANFD_DLC_TO_LEN, CANFD_MAX_DLEN, CAN_EFF_MASK, CAN_MAX_DLEN, CAN_SFF_MASK,
    FD_TIMING_CLOCK_HZ,
};
pub use error::{CanError, Result, TransportError};
pub use frame::{
    decode, dlc_to_len, encode, encode_classic, encode_fd, len_to_dlc, BusMode, ClassicWireFrame,
    EncodedFrame, FdWireFrame, Frame, Timestamp, WireFrame,
};
pub use gs_usb::GsUsbTransport;
pub use manager::{CanManager, ManagerConfig};
pub use receiver::{ReceiveLoop, ReceiveState};
pub use registry::{Continuation, SubscriberId, SubscriberRegistry};
pub use timing::{BitTimingConfig, PhaseTiming};
pub use transmit::TransmitGate;
pub use transport::{ChannelHandle, Received, Transport, TransportResult};
