//! CAN and GS-USB constants
//!
//! Identifier masks, payload limits, the CAN FD length-code table and the
//! subset of the GS-USB protocol constants used by the USB transport.

use std::time::Duration;

// ============================================================================
// CAN ID Masks
// ============================================================================

/// Standard frame format mask (11-bit ID)
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Extended frame format mask (29-bit ID)
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

// ============================================================================
// CAN Payload Definitions
// ============================================================================

/// Maximum data length for classic CAN
pub const CAN_MAX_DLEN: usize = 8;
/// Maximum DLC for CAN FD
pub const CANFD_MAX_DLC: u8 = 15;
/// Maximum data length for CAN FD
pub const CANFD_MAX_DLEN: usize = 64;

/// DLC to data length conversion table for CAN FD
pub const CANFD_DLC_TO_LEN: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

// ============================================================================
// Wire frame flags (WireFrame.flags)
// ============================================================================

/// 29-bit identifier
pub const FRAME_FLAG_EXTENDED: u8 = 1 << 0;
/// CAN FD frame
pub const FRAME_FLAG_FD: u8 = 1 << 1;
/// Bit rate switch (FD payload sent at the data bitrate)
pub const FRAME_FLAG_BRS: u8 = 1 << 2;
/// Driver status/error frame, never delivered as data
pub const FRAME_FLAG_STATUS: u8 = 1 << 7;

// ============================================================================
// Manager defaults
// ============================================================================

/// Lowest identifier accepted by the default filter
pub const FILTER_ACCEPT_ALL_LOW: u32 = 0x000;
/// Highest identifier accepted by the default filter
pub const FILTER_ACCEPT_ALL_HIGH: u32 = CAN_EFF_MASK;

/// Sleep applied by the receive loop when the driver queue is empty
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(2);

/// Clock shared by every entry of the CAN FD bit-timing table
pub const FD_TIMING_CLOCK_HZ: u32 = 80_000_000;

// ============================================================================
// GS-USB protocol (USB transport)
// ============================================================================

/// CAN ID flags as carried in the GS-USB host frame
pub const GS_CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Remote transmission request flag
pub const GS_CAN_RTR_FLAG: u32 = 0x4000_0000;
/// Error message frame flag
pub const GS_CAN_ERR_FLAG: u32 = 0x2000_0000;

/// Hardware timestamp mode
pub const GS_CAN_MODE_HW_TIMESTAMP: u32 = 1 << 4;
/// CAN FD mode
pub const GS_CAN_MODE_FD: u32 = 1 << 8;

/// Device supports hardware timestamps
pub const GS_CAN_FEATURE_HW_TIMESTAMP: u32 = 1 << 4;
/// Device supports CAN FD
pub const GS_CAN_FEATURE_FD: u32 = 1 << 8;

/// CAN FD frame
pub const GS_CAN_FLAG_FD: u8 = 1 << 1;
/// Bit rate switch
pub const GS_CAN_FLAG_BRS: u8 = 1 << 2;

/// Echo ID for transmitted frames
pub const GS_USB_ECHO_ID: u32 = 0;
/// Echo ID value for received frames (from CAN bus)
pub const GS_USB_RX_ECHO_ID: u32 = 0xFFFF_FFFF;

/// Host frame header: echo_id (4) + can_id (4) + dlc (1) + channel (1) + flags (1) + reserved (1)
pub const GS_USB_HEADER_SIZE: usize = 12;
/// Classic CAN frame size (without timestamp)
pub const GS_USB_FRAME_SIZE: usize = 20;
/// Classic CAN frame size (with hardware timestamp)
pub const GS_USB_FRAME_SIZE_HW_TIMESTAMP: usize = 24;
/// CAN FD frame size (without timestamp)
pub const GS_USB_FRAME_SIZE_FD: usize = 76;
/// CAN FD frame size (with hardware timestamp)
pub const GS_USB_FRAME_SIZE_FD_HW_TIMESTAMP: usize = 80;

/// Set bit timing
pub const GS_USB_BREQ_BITTIMING: u8 = 1;
/// Set/start mode
pub const GS_USB_BREQ_MODE: u8 = 2;
/// Get bit timing constants
pub const GS_USB_BREQ_BT_CONST: u8 = 4;
/// Set data phase bit timing (CAN FD)
pub const GS_USB_BREQ_DATA_BITTIMING: u8 = 10;

/// Reset/stop mode
pub const GS_CAN_MODE_RESET: u32 = 0;
/// Start mode
pub const GS_CAN_MODE_START: u32 = 1;

/// Timeout for control transfers and bulk writes
pub const GS_USB_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);
/// Default bulk IN timeout; an expired read means the queue is empty
pub const GS_USB_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Bulk OUT endpoint (host to device)
pub const GS_USB_ENDPOINT_OUT: u8 = 0x02;
/// Bulk IN endpoint (device to host)
pub const GS_USB_ENDPOINT_IN: u8 = 0x81;

/// Known GS-USB (vendor, product) pairs: gs_usb, candleLight, CES CANext FD, ABE CANdebugger FD
pub const GS_USB_DEVICE_IDS: [(u16, u16); 4] = [
    (0x1D50, 0x606F),
    (0x1209, 0x2323),
    (0x1CD2, 0x606F),
    (0x16D0, 0x10B8),
];
