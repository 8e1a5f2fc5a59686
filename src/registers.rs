//! Endpoints and register layouts of the pulser firmware

use bitflags::bitflags;
use num_derive::FromPrimitive;

/// Endpoint addresses of the firmware interface
pub mod consts {
    /// Control wire; see [`ControlWire`][`super::ControlWire`]
    pub const WIRE_CONTROL: u8 = 0x00;
    /// PMT collection time in ms for normal counting
    pub const WIRE_COUNT_RATE: u8 = 0x01;
    /// One bit per line; set when the line is under manual control
    pub const WIRE_MANUAL: u8 = 0x02;
    /// One bit per line; manual level or auto inversion
    pub const WIRE_LEVEL: u8 = 0x03;
    /// Number of repetitions for looped runs, 0 is infinite
    pub const WIRE_REPETITIONS: u8 = 0x05;

    /// Value selected by the readout bits of the control wire
    pub const WIREOUT_READOUT: u8 = 0x21;
    /// Number of 16-bit words waiting in the time-tag FIFO
    pub const WIREOUT_RESOLVED_TOTAL: u8 = 0x22;

    pub const TRIGGER: u8 = 0x40;
    pub const TRIG_RESET_SEQ_COUNTER: u8 = 0;
    pub const TRIG_RESET_RAM: u8 = 1;
    pub const TRIG_RESET_FIFO_NORMAL: u8 = 2;
    pub const TRIG_RESET_FIFO_RESOLVED: u8 = 3;
    pub const TRIG_RESET_DDS: u8 = 4;
    /// Capture board only; clears the capture FIFO
    pub const TRIG_RESET_CAPTURE: u8 = 0;

    pub const PIPE_PROGRAM: u8 = 0x80;
    pub const PIPE_RESOLVED: u8 = 0xa0;
    pub const PIPE_NORMAL: u8 = 0xa1;

    /// Block size of sequencer pipes, bytes
    pub const PIPE_BLOCK: usize = 2;
    /// Block size of the capture pipe, bytes
    pub const CAPTURE_BLOCK: usize = 1024;
}

bitflags! {
    /// Layout of the control wire.
    ///
    /// ```text
    ///  bit:   7  6  5  4 | 3 |  2     1   |    0
    ///        +-----------+---+------------+--------+
    ///        |  READOUT  | - | RUN | LOOP | DIFF   |
    ///        +-----------+---+------------+--------+
    /// ```
    pub struct ControlWire: u32 {
        /// Pulse sequence gates photon counting
        const DIFFERENTIAL = 0x01;
        /// Looped (infinite or counted) run
        const LOOP = 0x02;
        /// Sequencer running
        const RUN = 0x04;
        /// Readout selector field
        const READOUT = 0xf0;

        const COUNTING_MASK = Self::DIFFERENTIAL.bits;
        const SEQUENCE_MASK = Self::LOOP.bits | Self::RUN.bits;
        const START_LOOPED = Self::LOOP.bits | Self::RUN.bits;
        const STOP_LOOPED = Self::LOOP.bits;
        const START_SINGLE = Self::RUN.bits;
        const STOP_SINGLE = 0x00;
    }
}

/// Value routed to [`WIREOUT_READOUT`][`consts::WIREOUT_READOUT`]
/// depending on the readout field of the control wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum ReadoutSelect {
    /// Non-zero once the sequencer has finished
    Done = 0x00,
    /// Repetitions completed in looped mode
    Repetitions = 0x20,
    /// 16-bit words waiting in the normal counting FIFO
    NormalTotal = 0x40,
}

impl ReadoutSelect {
    pub fn bits(self) -> u32 {
        self as u32
    }
}

/// Anything that can be serialised into firmware words.
pub trait ToU32s {
    fn as_u32s(&self) -> Vec<u32>;
}

/// Split a word into pipe byte order: high 16-bit half first,
/// each half little-endian.
pub fn to_pipe_bytes(word: u32) -> [u8; 4] {
    let high = ((word >> 16) as u16).to_le_bytes();
    let low = (word as u16).to_le_bytes();
    [high[0], high[1], low[0], low[1]]
}

/// Reassemble a word from pipe byte order. `bytes` must hold at
/// least 4 bytes.
pub fn from_pipe_bytes(bytes: &[u8]) -> u32 {
    let high = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
    let low = u16::from_le_bytes([bytes[2], bytes[3]]) as u32;
    (high << 16) | low
}
