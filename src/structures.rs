//! GS-USB protocol structures
//!
//! Control request payloads and the host frame exchanged over the bulk
//! endpoints, with conversions to and from the transport wire frames.

use crate::constants::{
    CANFD_MAX_DLEN, CAN_EFF_MASK, CAN_MAX_DLEN, CAN_SFF_MASK, FRAME_FLAG_BRS, FRAME_FLAG_EXTENDED,
    FRAME_FLAG_FD, GS_CAN_EFF_FLAG, GS_CAN_ERR_FLAG, GS_CAN_FEATURE_FD,
    GS_CAN_FEATURE_HW_TIMESTAMP, GS_CAN_FLAG_BRS, GS_CAN_FLAG_FD, GS_CAN_RTR_FLAG,
    GS_USB_FRAME_SIZE, GS_USB_FRAME_SIZE_FD, GS_USB_FRAME_SIZE_FD_HW_TIMESTAMP,
    GS_USB_FRAME_SIZE_HW_TIMESTAMP, GS_USB_HEADER_SIZE, GS_USB_RX_ECHO_ID,
};
use crate::frame::WireFrame;
use crate::timing::PhaseTiming;

/// Device mode configuration
///
/// Used to start or stop the CAN channel with specific mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMode {
    /// Mode value (0 = reset/stop, 1 = start)
    pub mode: u32,
    /// Mode flags (combination of GS_CAN_MODE_* constants)
    pub flags: u32,
}

impl DeviceMode {
    pub fn new(mode: u32, flags: u32) -> Self {
        Self { mode, flags }
    }

    /// Pack into bytes for USB transfer
    pub fn pack(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.mode.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }
}

/// CAN bit timing as the device expects it
///
/// Used for both the nominal (arbitration) phase and the CAN FD data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBitTiming {
    /// Propagation segment (typically 1)
    pub prop_seg: u32,
    /// Phase segment 1
    pub phase_seg1: u32,
    /// Phase segment 2
    pub phase_seg2: u32,
    /// Synchronization jump width
    pub sjw: u32,
    /// Baud rate prescaler
    pub brp: u32,
}

impl DeviceBitTiming {
    pub fn new(prop_seg: u32, phase_seg1: u32, phase_seg2: u32, sjw: u32, brp: u32) -> Self {
        Self {
            prop_seg,
            phase_seg1,
            phase_seg2,
            sjw,
            brp,
        }
    }

    /// Pack into bytes for USB transfer
    pub fn pack(&self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        buf[0..4].copy_from_slice(&self.prop_seg.to_le_bytes());
        buf[4..8].copy_from_slice(&self.phase_seg1.to_le_bytes());
        buf[8..12].copy_from_slice(&self.phase_seg2.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sjw.to_le_bytes());
        buf[16..20].copy_from_slice(&self.brp.to_le_bytes());
        buf
    }

    /// Bitrate produced on the given clock
    pub fn bitrate(&self, clock_hz: u32) -> u32 {
        let quanta = 1 + self.prop_seg + self.phase_seg1 + self.phase_seg2;
        clock_hz / (self.brp * quanta)
    }
}

impl From<PhaseTiming> for DeviceBitTiming {
    /// Split `tseg1` into a one-quantum propagation segment and phase segment 1
    fn from(timing: PhaseTiming) -> Self {
        Self::new(
            1,
            timing.tseg1.saturating_sub(1),
            timing.tseg2,
            timing.sjw,
            timing.brp,
        )
    }
}

impl std::fmt::Display for DeviceBitTiming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "prop_seg = {}, phase_seg1 = {}, phase_seg2 = {}, sjw = {}, brp = {}",
            self.prop_seg, self.phase_seg1, self.phase_seg2, self.sjw, self.brp
        )
    }
}

/// Device capability from the BT_CONST request (40 bytes, 10 x uint32)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapability {
    /// Feature bitfield (combination of GS_CAN_FEATURE_* constants)
    pub feature: u32,
    /// CAN clock frequency in Hz
    pub fclk_can: u32,
    pub tseg1_min: u32,
    pub tseg1_max: u32,
    pub tseg2_min: u32,
    pub tseg2_max: u32,
    pub sjw_max: u32,
    pub brp_min: u32,
    pub brp_max: u32,
    pub brp_inc: u32,
}

impl DeviceCapability {
    /// Size of the BT_CONST response
    pub const SIZE: usize = 40;

    /// Unpack from the BT_CONST response; `None` if it is too short
    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Some(Self {
            feature: word(0),
            fclk_can: word(4),
            tseg1_min: word(8),
            tseg1_max: word(12),
            tseg2_min: word(16),
            tseg2_max: word(20),
            sjw_max: word(24),
            brp_min: word(28),
            brp_max: word(32),
            brp_inc: word(36),
        })
    }

    /// Check if the device supports CAN FD
    pub fn supports_fd(&self) -> bool {
        (self.feature & GS_CAN_FEATURE_FD) != 0
    }

    /// Check if the device supports hardware timestamps
    pub fn supports_hw_timestamp(&self) -> bool {
        (self.feature & GS_CAN_FEATURE_HW_TIMESTAMP) != 0
    }
}

/// Frame exchanged with the device over the bulk endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFrame {
    /// `GS_USB_RX_ECHO_ID` for bus traffic, anything else for TX echoes
    pub echo_id: u32,
    /// CAN ID with `GS_CAN_*_FLAG` bits
    pub can_id: u32,
    pub can_dlc: u8,
    pub channel: u8,
    /// `GS_CAN_FLAG_*` bits
    pub flags: u8,
    pub data: [u8; CANFD_MAX_DLEN],
    /// Hardware timestamp in microseconds, 0 when not present
    pub timestamp_us: u32,
}

impl Default for HostFrame {
    fn default() -> Self {
        Self {
            echo_id: 0,
            can_id: 0,
            can_dlc: 0,
            channel: 0,
            flags: 0,
            data: [0u8; CANFD_MAX_DLEN],
            timestamp_us: 0,
        }
    }
}

impl HostFrame {
    /// Frame size in bytes
    pub fn size(fd: bool, hw_timestamp: bool) -> usize {
        match (fd, hw_timestamp) {
            (true, true) => GS_USB_FRAME_SIZE_FD_HW_TIMESTAMP,
            (true, false) => GS_USB_FRAME_SIZE_FD,
            (false, true) => GS_USB_FRAME_SIZE_HW_TIMESTAMP,
            (false, false) => GS_USB_FRAME_SIZE,
        }
    }

    /// Build an outbound frame from a wire frame
    pub fn from_wire<const N: usize>(wire: &WireFrame<N>, echo_id: u32) -> Self {
        let mut frame = Self {
            echo_id,
            can_id: wire.id,
            can_dlc: wire.dlc,
            ..Self::default()
        };
        if wire.is_extended() {
            frame.can_id |= GS_CAN_EFF_FLAG;
        }
        if wire.is_fd() {
            frame.flags |= GS_CAN_FLAG_FD;
        }
        if wire.is_brs() {
            frame.flags |= GS_CAN_FLAG_BRS;
        }
        frame.data[..N].copy_from_slice(&wire.data);
        frame
    }

    /// Pack into bytes for USB transfer
    pub fn pack(&self, fd: bool, hw_timestamp: bool) -> Vec<u8> {
        let payload = if fd { CANFD_MAX_DLEN } else { CAN_MAX_DLEN };
        let mut buf = Vec::with_capacity(Self::size(fd, hw_timestamp));

        buf.extend_from_slice(&self.echo_id.to_le_bytes());
        buf.extend_from_slice(&self.can_id.to_le_bytes());
        buf.push(self.can_dlc);
        buf.push(self.channel);
        buf.push(self.flags);
        buf.push(0); // reserved
        buf.extend_from_slice(&self.data[..payload]);
        if hw_timestamp {
            buf.extend_from_slice(&self.timestamp_us.to_le_bytes());
        }
        buf
    }

    /// Unpack received bytes; `None` if shorter than the header
    ///
    /// The payload size follows the frame's own FD flag, so classic frames
    /// received on an FD channel unpack correctly.
    pub fn unpack(data: &[u8], hw_timestamp: bool) -> Option<Self> {
        if data.len() < GS_USB_HEADER_SIZE {
            return None;
        }

        let mut frame = Self {
            echo_id: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            can_id: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            can_dlc: data[8],
            channel: data[9],
            flags: data[10],
            ..Self::default()
        };

        let payload = if frame.is_fd() { CANFD_MAX_DLEN } else { CAN_MAX_DLEN };
        let body = &data[GS_USB_HEADER_SIZE..];
        let copy_len = payload.min(body.len());
        frame.data[..copy_len].copy_from_slice(&body[..copy_len]);

        if hw_timestamp && body.len() >= payload + 4 {
            let ts = &body[payload..payload + 4];
            frame.timestamp_us = u32::from_le_bytes([ts[0], ts[1], ts[2], ts[3]]);
        }
        Some(frame)
    }

    /// Check if this frame came from the bus rather than echoing a transmit
    pub fn is_rx(&self) -> bool {
        self.echo_id == GS_USB_RX_ECHO_ID
    }

    /// Check if this is an error frame
    pub fn is_error(&self) -> bool {
        (self.can_id & GS_CAN_ERR_FLAG) != 0
    }

    /// Check if this is a remote transmission request
    pub fn is_remote(&self) -> bool {
        (self.can_id & GS_CAN_RTR_FLAG) != 0
    }

    pub fn is_extended(&self) -> bool {
        (self.can_id & GS_CAN_EFF_FLAG) != 0
    }

    pub fn is_fd(&self) -> bool {
        (self.flags & GS_CAN_FLAG_FD) != 0
    }

    /// Arbitration ID without flag bits
    pub fn arbitration_id(&self) -> u32 {
        if self.is_extended() {
            self.can_id & CAN_EFF_MASK
        } else {
            self.can_id & CAN_SFF_MASK
        }
    }

    /// Convert to a wire frame; error frames become status frames
    pub fn to_wire<const N: usize>(&self) -> WireFrame<N> {
        if self.is_error() {
            return WireFrame::status(self.can_id & CAN_EFF_MASK);
        }

        let mut wire = WireFrame::<N>::new();
        wire.id = self.arbitration_id();
        wire.dlc = self.can_dlc;
        if self.is_extended() {
            wire.flags |= FRAME_FLAG_EXTENDED;
        }
        if self.is_fd() {
            wire.flags |= FRAME_FLAG_FD;
        }
        if (self.flags & GS_CAN_FLAG_BRS) != 0 {
            wire.flags |= FRAME_FLAG_BRS;
        }
        let len = N.min(CANFD_MAX_DLEN);
        wire.data[..len].copy_from_slice(&self.data[..len]);
        wire
    }
}
