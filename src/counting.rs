//! Photon counting readout
//!
//! In [`CollectionMode::Normal`] the board closes a counting window every
//! collection time and pushes one 4-byte record into the normal FIFO. In
//! [`CollectionMode::Differential`] the windows are delimited by the pulse
//! sequence itself and each record is tagged with the state of the
//! repumping light.
//!
//! ## Record layout
//!
//! ```text
//!  bit:  31 | 30                                   0
//!       +---+--------------------------------------+
//!       |OFF|               count                  |
//!       +---+--------------------------------------+
//! ```
//!
//! The four bytes of a record form a little-endian `u32`.

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::config::CollectionTimes;
use crate::error::{PulserError, Result};
use crate::link::Wire;
use crate::registers::{ControlWire, ReadoutSelect};
use crate::registers::consts::*;

/// Size of a count record, bytes
pub const RECORD_BYTES: usize = 4;

const STATUS_BIT: u32 = 0x8000_0000;

/// Counting cadence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, FromPrimitive)]
pub enum CollectionMode {
    /// Free-running timer
    Normal = 0,
    /// Gated by the pulse sequence
    Differential = 1,
}

impl Default for CollectionMode {
    fn default() -> Self {
        CollectionMode::Normal
    }
}

impl CollectionMode {
    fn control_bits(self) -> u32 {
        match self {
            CollectionMode::Normal => 0x00,
            CollectionMode::Differential => ControlWire::DIFFERENTIAL.bits(),
        }
    }
}

/// State of the gating light while a record was collected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountStatus {
    On,
    Off,
}

/// One decoded counting window
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CountSample {
    /// kilocounts per second
    pub rate_khz: f64,
    pub status: CountStatus,
    /// Approximate acquisition time, seconds since the UNIX epoch
    pub timestamp: f64,
}

/// Decode a raw record into its count and status.
pub fn decode_record(bytes: [u8; RECORD_BYTES]) -> (u32, CountStatus) {
    let raw = u32::from_le_bytes(bytes);
    if raw & STATUS_BIT != 0 {
        (raw & !STATUS_BIT, CountStatus::Off)
    } else {
        (raw, CountStatus::On)
    }
}

/// Convert a raw count collected over `collection_time` seconds to kHz.
pub fn to_khz(count: u32, collection_time: f64) -> f64 {
    (count as f64) / collection_time / 1000.0
}

/// Decode every whole record in `buf`.
///
/// The last record is stamped with `read_time`, each earlier one a
/// further `collection_time` before it.
pub fn decode_counts(buf: &[u8], collection_time: f64, read_time: f64) -> Vec<CountSample> {
    let total = buf.len() / RECORD_BYTES;

    buf.chunks_exact(RECORD_BYTES).enumerate().map(|(i, chunk)| {
        let (count, status) = decode_record([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let back = (total - 1 - i) as f64;
        CountSample {
            rate_khz: to_khz(count, collection_time),
            status,
            timestamp: read_time - back * collection_time,
        }
    }).collect()
}

/// Counting configuration of the board and the operations on its FIFO.
#[derive(Clone, Debug)]
pub struct CountingEngine {
    mode: CollectionMode,
    times: CollectionTimes,
    range: (f64, f64),
}

impl CountingEngine {

    pub fn new(mode: CollectionMode, times: CollectionTimes, range: (f64, f64)) -> Self {
        CountingEngine { mode, times, range }
    }

    pub fn mode(&self) -> CollectionMode {
        self.mode
    }

    /// Collection time of the current mode
    pub fn collection_time(&self) -> f64 {
        self.times.get(self.mode)
    }

    pub fn collection_time_for(&self, mode: CollectionMode) -> f64 {
        self.times.get(mode)
    }

    pub fn collection_time_range(&self) -> (f64, f64) {
        self.range
    }

    /// Check `secs` against the allowed collection time range
    pub fn check_collection_time(&self, secs: f64) -> Result<()> {
        let (low, high) = self.range;
        if !(low <= secs && secs <= high) {
            return Err(PulserError::OutOfRange(
                format!("collection time {} s not within [{}, {}] s", secs, low, high)));
        }
        Ok(())
    }

    fn rate_ms(&self) -> u32 {
        (self.times.normal * 1000.0).round() as u32
    }

    /// Write the mode and the normal collection time to the board.
    pub fn apply(&self, wire: &mut Wire) -> Result<()> {
        wire.set(WIRE_CONTROL, self.mode.control_bits(), ControlWire::COUNTING_MASK.bits())?;
        wire.set(WIRE_COUNT_RATE, self.rate_ms(), 0xffff_ffff)?;
        wire.commit()
    }

    /// Switch the counting mode and clear the normal FIFO.
    pub fn set_mode(&mut self, wire: &mut Wire, mode: CollectionMode) -> Result<()> {
        self.mode = mode;
        self.apply(wire)?;
        self.reset_fifo(wire)?;
        tracing::debug!("collection mode: {:?}", mode);
        Ok(())
    }

    /// Record a new collection time for `mode` without touching the board.
    pub fn store_collection_time(&mut self, secs: f64, mode: CollectionMode) -> Result<()> {
        self.check_collection_time(secs)?;
        self.times.set(mode, secs);
        Ok(())
    }

    /// Set the normal-mode collection time on the board. The FIFO is
    /// cleared since queued records were collected over the old window.
    pub fn set_normal_collection_time(&mut self, wire: &mut Wire, secs: f64) -> Result<()> {
        self.store_collection_time(secs, CollectionMode::Normal)?;
        self.reset_fifo(wire)?;
        wire.write(WIRE_COUNT_RATE, self.rate_ms(), 0xffff_ffff)
    }

    pub fn reset_fifo(&self, wire: &mut Wire) -> Result<()> {
        wire.trigger(TRIG_RESET_FIFO_NORMAL)
    }

    /// Read and decode every complete record waiting in the FIFO.
    ///
    /// Never requests more than the board reports as available; the
    /// board does not time out on over-reads.
    pub fn drain(&self, wire: &mut Wire, read_time: f64) -> Result<Vec<CountSample>> {
        // fill level is reported in 16-bit words
        let words = wire.readout(ReadoutSelect::NormalTotal)? as usize;
        let bytes = (words * 2) / RECORD_BYTES * RECORD_BYTES;

        if bytes == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; bytes];
        wire.read_pipe(PIPE_NORMAL, PIPE_BLOCK, &mut buf)?;

        Ok(decode_counts(&buf, self.collection_time(), read_time))
    }
}
