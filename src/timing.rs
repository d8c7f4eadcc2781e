//! CAN FD bit-timing table
//!
//! Maps a (nominal bitrate, data bitrate) pair to the adapter's timing
//! configuration. The values are calibration constants for an 80 MHz CAN
//! clock; pairs that are not in the table are rejected rather than computed.

use crate::constants::FD_TIMING_CLOCK_HZ;
use crate::error::{CanError, Result};

/// Segment constants for one phase of a CAN FD bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhaseTiming {
    /// Baud rate prescaler
    pub brp: u32,
    /// Time segment 1 (propagation + phase segment 1)
    pub tseg1: u32,
    /// Time segment 2
    pub tseg2: u32,
    /// Synchronization jump width
    pub sjw: u32,
}

impl PhaseTiming {
    const fn new(brp: u32, tseg1: u32, tseg2: u32, sjw: u32) -> Self {
        Self {
            brp,
            tseg1,
            tseg2,
            sjw,
        }
    }

    /// Bitrate produced by this timing on the given clock
    pub fn bitrate(&self, clock_hz: u32) -> u32 {
        // One sync segment plus tseg1 and tseg2 time quanta per bit
        clock_hz / (self.brp * (1 + self.tseg1 + self.tseg2))
    }
}

/// Timing configuration for a CAN FD connection
///
/// Produced by [`lookup`]; its `Display` form is the driver configuration
/// string (`f_clock = ..., nom_brp = ..., ..., data_sjw = ...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitTimingConfig {
    /// CAN controller clock in Hz
    pub f_clock: u32,
    /// Nominal (arbitration) phase
    pub nominal: PhaseTiming,
    /// Data phase
    pub data: PhaseTiming,
}

impl BitTimingConfig {
    /// Driver configuration string
    pub fn to_config_string(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for BitTimingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "f_clock = {}, nom_brp = {}, nom_tseg1 = {}, nom_tseg2 = {}, nom_sjw = {}, \
             data_brp = {}, data_tseg1 = {}, data_tseg2 = {}, data_sjw = {}",
            self.f_clock,
            self.nominal.brp,
            self.nominal.tseg1,
            self.nominal.tseg2,
            self.nominal.sjw,
            self.data.brp,
            self.data.tseg1,
            self.data.tseg2,
            self.data.sjw
        )
    }
}

/// Nominal bitrates with a CAN FD table entry
pub const SUPPORTED_NOMINAL_BITRATES: [u32; 3] = [250_000, 500_000, 1_000_000];
/// Data bitrates with a CAN FD table entry
pub const SUPPORTED_DATA_BITRATES: [u32; 4] = [2_000_000, 4_000_000, 8_000_000, 10_000_000];

/// Look up the timing configuration for a rate pair
///
/// # Arguments
/// * `nominal` - Arbitration phase bitrate in bits per second
/// * `data` - Data phase bitrate in bits per second
///
/// # Supported pairs
/// 250 kbit/s, 500 kbit/s and 1 Mbit/s nominal, each with 2, 4, 8 or
/// 10 Mbit/s data. Anything else fails with `CanError::UnsupportedBitTiming`.
pub fn lookup(nominal: u32, data: u32) -> Result<BitTimingConfig> {
    let unsupported = CanError::UnsupportedBitTiming { nominal, data };

    let nominal_timing = match nominal {
        250_000 => PhaseTiming::new(20, 12, 3, 1),
        500_000 => PhaseTiming::new(10, 12, 3, 1),
        1_000_000 => PhaseTiming::new(10, 5, 2, 1),
        _ => return Err(unsupported),
    };

    let data_timing = match data {
        2_000_000 => PhaseTiming::new(4, 7, 2, 1),
        4_000_000 => PhaseTiming::new(2, 7, 2, 1),
        8_000_000 => PhaseTiming::new(1, 7, 2, 1),
        10_000_000 => PhaseTiming::new(1, 5, 2, 1),
        _ => return Err(unsupported),
    };

    Ok(BitTimingConfig {
        f_clock: FD_TIMING_CLOCK_HZ,
        nominal: nominal_timing,
        data: data_timing,
    })
}
