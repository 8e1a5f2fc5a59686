//! Hardware configuration
//!
//! The configuration describes a single pulser board: its identity on the
//! bus, its timing constants, the TTL lines and DDS channels wired to it
//! and the photon counting defaults. A built-in configuration matching the
//! standard board is available through [`HardwareConfiguration::default()`];
//! site specific setups are loaded from TOML.
//!
//! ```toml
//! device_id = "Pulser"
//! time_resolution_ns = 40
//!
//! [[channels]]
//! name = "866DP"
//! hardware_index = 0
//! is_manual = true
//! manual_state = true
//!
//! [[dds]]
//! name = "729DP"
//! index = 1
//! allowed_frequency = [150.0, 250.0]
//! allowed_amplitude = [-63.0, -3.0]
//! board_frequency = [0.0, 800.0]
//! board_amplitude = [-63.0, -3.0]
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::channelreg::{Channel, DdsChannel};
use crate::counting::CollectionMode;
use crate::error::{PulserError, Result};

lazy_static! {
    static ref DEFAULT_CHANNELS: Vec<Channel> = vec![
        Channel::manual("866DP", 0, true),
        Channel::auto("crystallization", 1),
        Channel::auto("bluePI", 2),
        Channel::auto("397Extra", 3),
        Channel::auto("camera", 4),
        Channel::auto("TimeResolvedCount", 5),
        Channel::auto("AdvanceDDS", 6),
        Channel::auto("ResetDDS", 7),
        Channel::auto("axial", 8),
        Channel::manual("radial", 9, false),
        Channel::auto("DiffCountTrigger", 10),
        Channel::auto("ReadoutCount", 11),
    ];

    static ref DEFAULT_DDS: Vec<DdsChannel> = vec![
        DdsChannel::new("110DP", 0, (90.0, 130.0), (-63.0, -3.0)),
        DdsChannel::new("729DP", 1, (150.0, 250.0), (-63.0, -3.0)),
        DdsChannel::new("854DP", 2, (70.0, 90.0), (-63.0, -3.0)),
    ];
}

/// Timing constraints of a board, in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    /// Smallest schedulable time quantum
    pub resolution: u128,
    /// Longest sequence the board can hold
    pub max_length: u128,
}

impl Timing {
    /// Quantize a time, truncating any sub-resolution remainder.
    pub fn ticks(&self, nanos: u128) -> u128 {
        nanos / self.resolution
    }

    /// Quantize a time, rounding any sub-resolution remainder up.
    pub fn ticks_ceil(&self, nanos: u128) -> u128 {
        (nanos + self.resolution - 1) / self.resolution
    }
}

/// Per-mode photon collection windows, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CollectionTimes {
    pub normal: f64,
    pub differential: f64,
}

impl CollectionTimes {
    pub fn get(&self, mode: CollectionMode) -> f64 {
        match mode {
            CollectionMode::Normal => self.normal,
            CollectionMode::Differential => self.differential,
        }
    }

    pub fn set(&mut self, mode: CollectionMode, secs: f64) {
        match mode {
            CollectionMode::Normal => self.normal = secs,
            CollectionMode::Differential => self.differential = secs,
        }
    }
}

impl Default for CollectionTimes {
    fn default() -> Self {
        CollectionTimes { normal: 0.100, differential: 0.100 }
    }
}

/// Configuration of the pulser board.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct HardwareConfiguration {
    /// Identifier the board reports on the bus
    pub device_id: String,
    /// Interval between reconnection attempts
    pub device_polling_period_ms: u64,
    /// Sequencer time resolution
    pub time_resolution_ns: u64,
    /// Longest programmable sequence
    pub max_sequence_ns: u64,
    /// Number of TTL lines on the board
    pub channel_total: u8,
    pub channels: Vec<Channel>,
    pub dds: Vec<DdsChannel>,
    pub collection_time: CollectionTimes,
    pub collection_mode: CollectionMode,
    /// Allowed collection window, seconds
    pub collection_time_range: (f64, f64),
    /// Duration of one time-tag tick, seconds
    pub timetag_resolution: f64,
    /// Poll interval while waiting for a sequence to finish
    pub wait_poll_interval_ms: u64,
}

impl Default for HardwareConfiguration {
    fn default() -> Self {
        HardwareConfiguration {
            device_id: String::from("Pulser"),
            device_polling_period_ms: 10_000,
            time_resolution_ns: 40,
            max_sequence_ns: 85_000_000_000,
            channel_total: 32,
            channels: DEFAULT_CHANNELS.clone(),
            dds: DEFAULT_DDS.clone(),
            collection_time: CollectionTimes::default(),
            collection_mode: CollectionMode::Normal,
            collection_time_range: (0.010, 5.0),
            timetag_resolution: 10.0e-9,
            wait_poll_interval_ms: 50,
        }
    }
}

impl HardwareConfiguration {

    /// Parse and validate a TOML configuration. Missing fields take
    /// their default values.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: HardwareConfiguration = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PulserError::Configuration(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn timing(&self) -> Timing {
        Timing {
            resolution: self.time_resolution_ns as u128,
            max_length: self.max_sequence_ns as u128,
        }
    }

    pub fn polling_period(&self) -> Duration {
        Duration::from_millis(self.device_polling_period_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.time_resolution_ns == 0 {
            return Err(PulserError::Configuration(String::from("time resolution must be non-zero")));
        }

        if self.channel_total == 0 || self.channel_total > 32 {
            return Err(PulserError::Configuration(
                format!("channel total {} not within 1..=32", self.channel_total)));
        }

        let (low, high) = self.collection_time_range;
        if !(low > 0.0 && low <= high) {
            return Err(PulserError::Configuration(
                format!("invalid collection time range ({}, {})", low, high)));
        }

        let mut names: HashSet<&str> = HashSet::new();
        let mut indices: HashSet<u8> = HashSet::new();
        for channel in &self.channels {
            if !names.insert(channel.name.as_str()) {
                return Err(PulserError::Configuration(
                    format!("duplicate channel name {}", channel.name)));
            }
            if channel.hardware_index >= self.channel_total {
                return Err(PulserError::Configuration(
                    format!("channel {} index {} exceeds channel total {}",
                        channel.name, channel.hardware_index, self.channel_total)));
            }
            if !indices.insert(channel.hardware_index) {
                return Err(PulserError::Configuration(
                    format!("duplicate hardware index {}", channel.hardware_index)));
            }
        }

        let mut dds_names: HashSet<&str> = HashSet::new();
        let mut dds_indices: HashSet<u8> = HashSet::new();
        for dds in &self.dds {
            if !dds_names.insert(dds.name.as_str()) || !dds_indices.insert(dds.index) {
                return Err(PulserError::Configuration(
                    format!("duplicate DDS channel {} ({})", dds.name, dds.index)));
            }
            dds.validate()?;
        }

        Ok(())
    }
}

/// Configuration of the time-resolved capture board.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeResolvedConfiguration {
    pub device_id: String,
    pub device_polling_period_ms: u64,
    /// Capture clock period
    pub clock_period_ns: u64,
    /// Smallest capture buffer, bytes
    pub min_buffer: usize,
    /// Largest capture buffer, bytes
    pub max_buffer: usize,
    /// Capture window used when none is requested explicitly
    pub default_time_length_ns: u64,
}

impl Default for TimeResolvedConfiguration {
    fn default() -> Self {
        TimeResolvedConfiguration {
            device_id: String::from("TimeResolvedFPGA"),
            device_polling_period_ms: 10_000,
            clock_period_ns: 40,
            min_buffer: 1024,
            max_buffer: 16_776_192,
            default_time_length_ns: 100_000_000,
        }
    }
}

impl TimeResolvedConfiguration {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: TimeResolvedConfiguration = toml::from_str(text)?;
        if config.clock_period_ns == 0 || config.min_buffer > config.max_buffer {
            return Err(PulserError::Configuration(String::from("invalid capture limits")));
        }
        Ok(config)
    }

    pub fn polling_period(&self) -> Duration {
        Duration::from_millis(self.device_polling_period_ms)
    }
}
