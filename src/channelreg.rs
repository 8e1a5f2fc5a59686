//! TTL and DDS channel tables

use std::collections::HashMap;
use bitvec::prelude::{BitArray, Lsb0};
use serde::{Deserialize, Serialize};

use crate::config::HardwareConfiguration;
use crate::error::{PulserError, Result};

/// A TTL output line of the board.
///
/// A line is either driven by the pulse sequence (auto mode, optionally
/// inverted) or held at a fixed level (manual mode, optionally inverted).
/// The mode fields here are the power-on state; the live state is kept
/// as a [`LineState`] by the pulser.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Channel {
    pub name: String,
    pub hardware_index: u8,
    #[serde(default)]
    pub is_manual: bool,
    #[serde(default)]
    pub manual_state: bool,
    #[serde(default)]
    pub manual_invert: bool,
    #[serde(default)]
    pub auto_invert: bool,
}

impl Channel {
    /// A line driven by the sequencer
    pub fn auto(name: &str, hardware_index: u8) -> Self {
        Channel {
            name: name.to_string(),
            hardware_index,
            is_manual: false,
            manual_state: false,
            manual_invert: false,
            auto_invert: false,
        }
    }

    /// A line held at a fixed level
    pub fn manual(name: &str, hardware_index: u8, state: bool) -> Self {
        Channel { is_manual: true, manual_state: state, ..Channel::auto(name, hardware_index) }
    }

    pub fn line_state(&self) -> LineState {
        LineState {
            is_manual: self.is_manual,
            manual_state: self.manual_state,
            manual_invert: self.manual_invert,
            auto_invert: self.auto_invert,
        }
    }
}

/// A frequency/amplitude/phase agile synthesizer channel.
///
/// The `allowed_*` ranges bound what a sequence may request; the `board_*`
/// ranges are the full scale of the hardware words.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DdsChannel {
    pub name: String,
    pub index: u8,
    /// MHz
    pub allowed_frequency: (f64, f64),
    /// dBm
    pub allowed_amplitude: (f64, f64),
    /// MHz
    #[serde(default = "DdsChannel::default_board_frequency")]
    pub board_frequency: (f64, f64),
    /// dBm
    #[serde(default = "DdsChannel::default_board_amplitude")]
    pub board_amplitude: (f64, f64),
}

impl DdsChannel {
    pub fn new(name: &str, index: u8, frequency: (f64, f64), amplitude: (f64, f64)) -> Self {
        DdsChannel {
            name: name.to_string(),
            index,
            allowed_frequency: frequency,
            allowed_amplitude: amplitude,
            board_frequency: Self::default_board_frequency(),
            board_amplitude: Self::default_board_amplitude(),
        }
    }

    fn default_board_frequency() -> (f64, f64) {
        (0.0, 800.0)
    }

    fn default_board_amplitude() -> (f64, f64) {
        (-63.0, -3.0)
    }

    /// Allowed ranges must sit within the board ranges.
    pub fn validate(&self) -> Result<()> {
        let within = |inner: (f64, f64), outer: (f64, f64)| {
            inner.0 <= inner.1 && outer.0 < outer.1 && inner.0 >= outer.0 && inner.1 <= outer.1
        };

        if !within(self.allowed_frequency, self.board_frequency)
            || !within(self.allowed_amplitude, self.board_amplitude) {
            return Err(PulserError::Configuration(
                format!("DDS {}: allowed ranges exceed the board ranges", self.name)));
        }

        Ok(())
    }

    pub fn check_frequency(&self, mhz: f64) -> Result<()> {
        let (low, high) = self.allowed_frequency;
        if !(low <= mhz && mhz <= high) {
            return Err(PulserError::OutOfRange(
                format!("{}: frequency {} MHz not within [{}, {}]", self.name, mhz, low, high)));
        }
        Ok(())
    }

    pub fn check_amplitude(&self, dbm: f64) -> Result<()> {
        let (low, high) = self.allowed_amplitude;
        if !(low <= dbm && dbm <= high) {
            return Err(PulserError::OutOfRange(
                format!("{}: amplitude {} dBm not within [{}, {}]", self.name, dbm, low, high)));
        }
        Ok(())
    }
}

/// Live mode of a TTL line, reported as
/// `(manual, manual level, manual inversion, auto inversion)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct LineState {
    pub is_manual: bool,
    pub manual_state: bool,
    pub manual_invert: bool,
    pub auto_invert: bool,
}

impl LineState {
    pub fn as_tuple(&self) -> (bool, bool, bool, bool) {
        (self.is_manual, self.manual_state, self.manual_invert, self.auto_invert)
    }

    /// Bit driven onto the level wire for this line: the output level
    /// in manual mode, the inversion flag in auto mode.
    pub fn level_bit(&self) -> bool {
        if self.is_manual {
            self.manual_state ^ self.manual_invert
        } else {
            self.auto_invert
        }
    }
}

/// Register images of the manual and level wires for every line.
///
/// Each wire carries one bit per hardware line, line 0 being the least
/// significant bit.
pub struct LineRegister {
    manual: BitArray<[u32; 1], Lsb0>,
    level: BitArray<[u32; 1], Lsb0>,
}

impl LineRegister {
    pub fn new() -> LineRegister {
        LineRegister { manual: BitArray::ZERO, level: BitArray::ZERO }
    }

    /// Set the bits of line `index` to reflect `state`
    pub fn set(&mut self, index: u8, state: &LineState) {
        self.manual.set(index as usize, state.is_manual);
        self.level.set(index as usize, state.level_bit());
    }

    pub fn manual_word(&self) -> u32 {
        self.manual.as_raw_slice()[0]
    }

    pub fn level_word(&self) -> u32 {
        self.level.as_raw_slice()[0]
    }
}

impl Default for LineRegister {
    fn default() -> Self {
        Self::new()
    }
}

/// Static name lookup for every TTL line and DDS channel of a board.
#[derive(Clone, Debug)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
    by_name: HashMap<String, usize>,
    dds: Vec<DdsChannel>,
    dds_by_name: HashMap<String, usize>,
}

impl ChannelRegistry {

    /// Build the registry from a validated configuration.
    pub fn from_config(config: &HardwareConfiguration) -> Result<ChannelRegistry> {
        config.validate()?;

        let mut channels = config.channels.clone();
        channels.sort_by_key(|c| c.hardware_index);

        let by_name = channels.iter().enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();

        let dds = config.dds.clone();
        let dds_by_name = dds.iter().enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();

        Ok(ChannelRegistry { channels, by_name, dds, dds_by_name })
    }

    /// Look up a TTL line by name
    pub fn channel(&self, name: &str) -> Result<&Channel> {
        self.by_name.get(name)
            .map(|&i| &self.channels[i])
            .ok_or_else(|| PulserError::UnknownChannel(name.to_string()))
    }

    pub fn hardware_index(&self, name: &str) -> Result<u8> {
        self.channel(name).map(|c| c.hardware_index)
    }

    /// Look up a DDS channel by name
    pub fn dds(&self, name: &str) -> Result<&DdsChannel> {
        self.dds_by_name.get(name)
            .map(|&i| &self.dds[i])
            .ok_or_else(|| PulserError::UnknownChannel(name.to_string()))
    }

    pub fn dds_by_index(&self, index: u8) -> Option<&DdsChannel> {
        self.dds.iter().find(|d| d.index == index)
    }

    /// TTL lines in ascending hardware order
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn dds_channels(&self) -> &[DdsChannel] {
        &self.dds
    }

    /// Name to hardware index table
    pub fn table(&self) -> Vec<(String, u8)> {
        self.channels.iter().map(|c| (c.name.clone(), c.hardware_index)).collect()
    }
}


#[cfg(test)]
mod tests {

    use assert_matches::assert_matches;
    use super::{Channel, ChannelRegistry, LineRegister, LineState};
    use crate::config::HardwareConfiguration;
    use crate::error::PulserError;

    #[test]
    fn lookup() {
        let registry = ChannelRegistry::from_config(&HardwareConfiguration::default()).unwrap();
        assert_eq!(registry.hardware_index("camera").unwrap(), 4);
        assert_eq!(registry.dds("729DP").unwrap().index, 1);
        assert_matches!(registry.hardware_index("nope"), Err(PulserError::UnknownChannel(n)) if n == "nope");
        assert_matches!(registry.dds("camera"), Err(PulserError::UnknownChannel(_)));
    }

    #[test]
    fn table_is_in_hardware_order() {
        let mut config = HardwareConfiguration::default();
        config.channels = vec![Channel::auto("B", 7), Channel::auto("A", 2)];
        let registry = ChannelRegistry::from_config(&config).unwrap();
        assert_eq!(registry.table(), vec![(String::from("A"), 2), (String::from("B"), 7)]);
    }

    #[test]
    fn level_bit() {
        let manual = LineState { is_manual: true, manual_state: true, manual_invert: true, auto_invert: false };
        assert_eq!(manual.level_bit(), false);
        let auto = LineState { is_manual: false, manual_state: true, manual_invert: false, auto_invert: true };
        assert_eq!(auto.level_bit(), true);
    }

    #[test]
    fn line_register_words() {
        let mut reg = LineRegister::new();
        reg.set(0, &LineState { is_manual: true, manual_state: true, ..Default::default() });
        reg.set(3, &LineState { auto_invert: true, ..Default::default() });
        reg.set(31, &LineState { is_manual: true, ..Default::default() });

        assert_eq!(reg.manual_word(), 0x8000_0001);
        assert_eq!(reg.level_word(), 0x0000_0009);
    }
}
