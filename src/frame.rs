//! CAN frames and the frame codec
//!
//! `Frame` is the application-level frame handed to senders and subscribers.
//! `WireFrame<N>` is what a transport moves: an 8-byte classic frame or a
//! 64-byte CAN FD frame whose length is a quantized length code (DLC).
//! Encoding and decoding between the two is pure and deterministic.

use crate::constants::{
    CANFD_DLC_TO_LEN, CANFD_MAX_DLC, CANFD_MAX_DLEN, CAN_EFF_MASK, CAN_MAX_DLEN, CAN_SFF_MASK,
    FRAME_FLAG_BRS, FRAME_FLAG_EXTENDED, FRAME_FLAG_FD, FRAME_FLAG_STATUS,
};
use crate::error::{CanError, Result};

/// Bus mode of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusMode {
    /// Classic CAN, up to 8 data bytes
    Classic,
    /// CAN FD, up to 64 data bytes
    Fd,
}

impl BusMode {
    /// Maximum payload length in this mode
    pub fn max_len(self) -> usize {
        match self {
            BusMode::Classic => CAN_MAX_DLEN,
            BusMode::Fd => CANFD_MAX_DLEN,
        }
    }
}

impl std::fmt::Display for BusMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusMode::Classic => write!(f, "classic CAN"),
            BusMode::Fd => write!(f, "CAN FD"),
        }
    }
}

/// Receive timestamp in microseconds, as reported by the transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Microseconds
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Seconds
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
}

/// Convert a payload length to the CAN FD length code
///
/// Lengths that fall between two table entries round up to the next code.
/// Returns `None` for lengths above 64 bytes.
pub fn len_to_dlc(length: usize) -> Option<u8> {
    CANFD_DLC_TO_LEN
        .iter()
        .position(|&dlen| dlen >= length)
        .map(|dlc| dlc as u8)
}

/// Convert a length code to a payload length
///
/// Classic CAN clamps codes 9..=15 to 8 bytes. Codes above 15 are invalid in
/// both modes.
pub fn dlc_to_len(dlc: u8, fd: bool) -> Option<usize> {
    if dlc > CANFD_MAX_DLC {
        return None;
    }
    if fd {
        Some(CANFD_DLC_TO_LEN[dlc as usize])
    } else {
        Some((dlc as usize).min(CAN_MAX_DLEN))
    }
}

/// Application-level CAN frame
///
/// Holds the arbitration ID, the identifier format and exactly `len()`
/// payload bytes. Bytes past the payload are always zero.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; CANFD_MAX_DLEN],
}

impl Frame {
    /// Create a frame with an 11-bit identifier
    pub fn new(id: u32, data: &[u8]) -> Result<Self> {
        Self::build(id, false, data)
    }

    /// Create a frame with a 29-bit identifier
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self> {
        Self::build(id, true, data)
    }

    fn build(id: u32, extended: bool, data: &[u8]) -> Result<Self> {
        let mask = if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
        if id & !mask != 0 {
            return Err(CanError::InvalidId(id));
        }
        if data.len() > CANFD_MAX_DLEN {
            return Err(CanError::InvalidLength {
                length: data.len(),
                max: CANFD_MAX_DLEN,
                mode: BusMode::Fd,
            });
        }

        let mut buf = [0u8; CANFD_MAX_DLEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            extended,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Arbitration ID (without format flags)
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Check if this frame uses a 29-bit identifier
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len()]
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data_str = self
            .data()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        write!(f, "{:>8X}   [{}]  {}", self.id, self.len, data_str)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &format_args!("0x{:08X}", self.id))
            .field("extended", &self.extended)
            .field("len", &self.len)
            .field("data", &self.data())
            .finish()
    }
}

/// Frame as moved by a transport
///
/// `N` is the wire payload capacity: 8 for classic CAN, 64 for CAN FD.
/// `dlc` is the raw length code, so an FD frame carrying 10 bytes has
/// `dlc == 9` and 12 payload bytes on the wire, the last two zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFrame<const N: usize> {
    /// Arbitration ID
    pub id: u32,
    /// Combination of `FRAME_FLAG_*` constants
    pub flags: u8,
    /// Length code
    pub dlc: u8,
    /// Payload, zero padded to capacity
    pub data: [u8; N],
}

/// Classic CAN wire frame
pub type ClassicWireFrame = WireFrame<CAN_MAX_DLEN>;
/// CAN FD wire frame
pub type FdWireFrame = WireFrame<CANFD_MAX_DLEN>;

impl<const N: usize> Default for WireFrame<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> WireFrame<N> {
    /// Create an empty wire frame
    pub fn new() -> Self {
        Self {
            id: 0,
            flags: 0,
            dlc: 0,
            data: [0u8; N],
        }
    }

    /// Create a driver status frame
    pub fn status(code: u32) -> Self {
        let mut frame = Self::new();
        frame.id = code;
        frame.flags = FRAME_FLAG_STATUS;
        frame
    }

    /// Check if this is an extended ID frame (29-bit)
    pub fn is_extended(&self) -> bool {
        (self.flags & FRAME_FLAG_EXTENDED) != 0
    }

    /// Check if this is a CAN FD frame
    pub fn is_fd(&self) -> bool {
        (self.flags & FRAME_FLAG_FD) != 0
    }

    /// Check if bit rate switch is enabled
    pub fn is_brs(&self) -> bool {
        (self.flags & FRAME_FLAG_BRS) != 0
    }

    /// Check if this is a driver status frame rather than bus data
    pub fn is_status(&self) -> bool {
        (self.flags & FRAME_FLAG_STATUS) != 0
    }

    /// Decode into an application frame
    ///
    /// The length table follows the frame's own FD flag, so a classic frame
    /// carried in an FD wire frame still clamps codes 9..=15 to 8 bytes.
    /// Fails with `CanError::Malformed` when the length code is unknown.
    pub fn decode(&self) -> Result<Frame> {
        let len = dlc_to_len(self.dlc, self.is_fd()).ok_or(CanError::Malformed(self.dlc))?;
        let len = len.min(N);

        let extended = self.is_extended();
        let mask = if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
        Frame::build(self.id & mask, extended, &self.data[..len])
    }
}

/// A frame encoded for one of the two bus modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedFrame {
    Classic(ClassicWireFrame),
    Fd(FdWireFrame),
}

impl EncodedFrame {
    /// Bus mode this frame was encoded for
    pub fn mode(&self) -> BusMode {
        match self {
            EncodedFrame::Classic(_) => BusMode::Classic,
            EncodedFrame::Fd(_) => BusMode::Fd,
        }
    }
}

/// Encode a frame for the given bus mode
pub fn encode(frame: &Frame, mode: BusMode) -> Result<EncodedFrame> {
    match mode {
        BusMode::Classic => encode_classic(frame).map(EncodedFrame::Classic),
        BusMode::Fd => encode_fd(frame).map(EncodedFrame::Fd),
    }
}

/// Decode a frame of either mode
pub fn decode(wire: &EncodedFrame) -> Result<Frame> {
    match wire {
        EncodedFrame::Classic(frame) => frame.decode(),
        EncodedFrame::Fd(frame) => frame.decode(),
    }
}

/// Encode a classic CAN frame; payloads above 8 bytes are rejected
pub fn encode_classic(frame: &Frame) -> Result<ClassicWireFrame> {
    if frame.len() > CAN_MAX_DLEN {
        return Err(CanError::InvalidLength {
            length: frame.len(),
            max: CAN_MAX_DLEN,
            mode: BusMode::Classic,
        });
    }

    let mut wire = ClassicWireFrame::new();
    wire.id = frame.id();
    wire.flags = id_flags(frame);
    wire.dlc = frame.len() as u8;
    wire.data.copy_from_slice(&frame.data[..CAN_MAX_DLEN]);
    Ok(wire)
}

/// Encode a CAN FD frame, quantizing the length to the next length code
///
/// Bit rate switching is not requested: the whole frame goes out at the
/// nominal bitrate, the way the PCAN driver sends plain FD messages.
pub fn encode_fd(frame: &Frame) -> Result<FdWireFrame> {
    let dlc = len_to_dlc(frame.len()).ok_or(CanError::InvalidLength {
        length: frame.len(),
        max: CANFD_MAX_DLEN,
        mode: BusMode::Fd,
    })?;

    let mut wire = FdWireFrame::new();
    wire.id = frame.id();
    wire.flags = id_flags(frame) | FRAME_FLAG_FD;
    wire.dlc = dlc;
    // Unused tail of `frame.data` is zero, which is the padding.
    wire.data = frame.data;
    Ok(wire)
}

fn id_flags(frame: &Frame) -> u8 {
    if frame.is_extended() {
        FRAME_FLAG_EXTENDED
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_to_dlc() {
        assert_eq!(len_to_dlc(0), Some(0));
        assert_eq!(len_to_dlc(8), Some(8));
        assert_eq!(len_to_dlc(9), Some(9));
        assert_eq!(len_to_dlc(12), Some(9));
        assert_eq!(len_to_dlc(13), Some(10));
        assert_eq!(len_to_dlc(24), Some(12));
        assert_eq!(len_to_dlc(25), Some(13));
        assert_eq!(len_to_dlc(33), Some(14));
        assert_eq!(len_to_dlc(49), Some(15));
        assert_eq!(len_to_dlc(64), Some(15));
        assert_eq!(len_to_dlc(65), None);
    }

    #[test]
    fn test_dlc_to_len() {
        assert_eq!(dlc_to_len(8, false), Some(8));
        assert_eq!(dlc_to_len(15, false), Some(8)); // Clamped to 8
        assert_eq!(dlc_to_len(9, true), Some(12));
        assert_eq!(dlc_to_len(10, true), Some(16));
        assert_eq!(dlc_to_len(11, true), Some(20));
        assert_eq!(dlc_to_len(12, true), Some(24));
        assert_eq!(dlc_to_len(13, true), Some(32));
        assert_eq!(dlc_to_len(14, true), Some(48));
        assert_eq!(dlc_to_len(15, true), Some(64));
        assert_eq!(dlc_to_len(16, true), None);
        assert_eq!(dlc_to_len(16, false), None);
    }

    #[test]
    fn test_frame_validation() {
        assert_eq!(Frame::new(0x800, &[]), Err(CanError::InvalidId(0x800)));
        assert!(Frame::new_extended(0x1FFF_FFFF, &[]).is_ok());
        assert_eq!(
            Frame::new_extended(0x2000_0000, &[]),
            Err(CanError::InvalidId(0x2000_0000))
        );
        assert!(matches!(
            Frame::new(0x100, &[0u8; 65]),
            Err(CanError::InvalidLength { length: 65, .. })
        ));
    }

    #[test]
    fn test_classic_round_trip_all_lengths() {
        let payload: Vec<u8> = (1..=8).collect();
        for len in 0..=CAN_MAX_DLEN {
            for extended in [false, true] {
                let frame = if extended {
                    Frame::new_extended(0x1234_5678, &payload[..len]).unwrap()
                } else {
                    Frame::new(0x7FF, &payload[..len]).unwrap()
                };
                let wire = encode(&frame, BusMode::Classic).unwrap();
                assert_eq!(wire.mode(), BusMode::Classic);
                assert_eq!(decode(&wire).unwrap(), frame);
            }
        }
    }

    #[test]
    fn test_classic_rejects_long_payload() {
        let frame = Frame::new(0x123, &[0xAA; 9]).unwrap();
        assert_eq!(
            encode(&frame, BusMode::Classic),
            Err(CanError::InvalidLength {
                length: 9,
                max: 8,
                mode: BusMode::Classic
            })
        );
    }

    #[test]
    fn test_fd_quantization_all_lengths() {
        let payload: Vec<u8> = (1..=64).collect();
        for len in 0..=CANFD_MAX_DLEN {
            let frame = Frame::new(0x321, &payload[..len]).unwrap();
            let wire = encode_fd(&frame).unwrap();
            assert!(wire.is_fd());

            let decoded = wire.decode().unwrap();
            let expected_len = *CANFD_DLC_TO_LEN.iter().find(|&&l| l >= len).unwrap();
            assert_eq!(decoded.len(), expected_len, "length {}", len);
            assert_eq!(&decoded.data()[..len], &payload[..len]);
            assert!(decoded.data()[len..].iter().all(|&b| b == 0));
            assert_eq!(decoded.id(), 0x321);
        }
    }

    #[test]
    fn test_fd_representable_lengths_round_trip() {
        for &len in CANFD_DLC_TO_LEN.iter() {
            let frame = Frame::new_extended(0x18FF_0001, &vec![0x5A; len]).unwrap();
            let wire = encode(&frame, BusMode::Fd).unwrap();
            assert_eq!(decode(&wire).unwrap(), frame);
        }
    }

    #[test]
    fn test_unknown_length_codes_are_malformed() {
        for dlc in 16..=u8::MAX {
            let mut fd = FdWireFrame::new();
            fd.dlc = dlc;
            assert_eq!(fd.decode(), Err(CanError::Malformed(dlc)));

            let mut classic = ClassicWireFrame::new();
            classic.dlc = dlc;
            assert_eq!(classic.decode(), Err(CanError::Malformed(dlc)));
        }
    }

    #[test]
    fn test_classic_decode_clamps_dlc() {
        let mut wire = ClassicWireFrame::new();
        wire.id = 0x10;
        wire.dlc = 12;
        wire.data = [1, 2, 3, 4, 5, 6, 7, 8];
        let frame = wire.decode().unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(frame.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_classic_frame_in_fd_wire_clamps_dlc() {
        for dlc in 9..=CANFD_MAX_DLC {
            let mut wire = FdWireFrame::new();
            wire.id = 0x123;
            wire.dlc = dlc;
            wire.data[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

            let frame = wire.decode().unwrap();
            assert_eq!(frame.len(), 8, "dlc {}", dlc);
            assert_eq!(frame.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        }
    }

    #[test]
    fn test_encode_fd_without_bit_rate_switch() {
        let frame = Frame::new(0x10, &[0; 20]).unwrap();
        let wire = encode_fd(&frame).unwrap();
        assert!(wire.is_fd());
        assert!(!wire.is_brs());
    }

    #[test]
    fn test_status_frame_flags() {
        let status = FdWireFrame::status(0x04);
        assert!(status.is_status());
        assert!(!status.is_fd());
        assert!(!ClassicWireFrame::new().is_status());
    }

    #[test]
    fn test_frame_display() {
        let frame = Frame::new(0x7FF, &[0x12, 0x34]).unwrap();
        assert_eq!(frame.to_string(), "     7FF   [2]  12 34");
    }
}
