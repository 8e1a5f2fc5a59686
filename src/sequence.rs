//! Pulse sequence assembly
//!
//! A [`Sequence`] is the complete timed program of one experimental shot:
//! TTL pulses on named lines and DDS events on named synthesizer channels,
//! kept in insertion order together with an optional explicit length. It is
//! built through a [`SequenceBuilder`], which resolves channel names against
//! the [`ChannelRegistry`] and validates every entry before it is accepted.
//!
//! All times are integer nanoseconds. Building is purely in-memory; nothing
//! reaches the hardware until the sequence is compiled and programmed.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use ndarray::Array2;

use crate::channelreg::ChannelRegistry;
use crate::compiler::{self, CompiledProgram};
use crate::config::Timing;
use crate::error::{PulserError, Result};

/// Highest DDS profile number
pub const MAX_PROFILE: u8 = 7;

/// A TTL high interval on a hardware line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtlPulse {
    pub channel: u8,
    pub start: u128,
    pub length: u128,
}

impl TtlPulse {
    pub fn end(&self) -> u128 {
        self.start + self.length
    }
}

/// A synthesizer state held on a DDS channel for an interval
#[derive(Clone, Debug, PartialEq)]
pub struct DdsEvent {
    pub channel: u8,
    pub start: u128,
    pub length: u128,
    /// MHz
    pub frequency: f64,
    /// dBm
    pub amplitude: f64,
    /// degrees
    pub phase: Option<f64>,
    pub profile: Option<u8>,
}

impl DdsEvent {
    pub fn end(&self) -> u128 {
        self.start + self.length
    }

    fn overlaps(&self, other: &DdsEvent) -> bool {
        self.channel == other.channel && self.start < other.end() && other.start < self.end()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Ttl(TtlPulse),
    Dds(DdsEvent),
}

impl Event {
    pub fn end(&self) -> u128 {
        match self {
            Event::Ttl(p) => p.end(),
            Event::Dds(e) => e.end(),
        }
    }
}

/// Request for a DDS event, addressed by channel name.
#[derive(Clone, Debug, PartialEq)]
pub struct DdsPulse {
    pub channel: String,
    pub start: u128,
    pub length: u128,
    pub frequency: f64,
    pub amplitude: f64,
    pub phase: Option<f64>,
    pub profile: Option<u8>,
}

impl DdsPulse {
    pub fn new(channel: &str, start: u128, length: u128, frequency: f64, amplitude: f64) -> Self {
        DdsPulse {
            channel: channel.to_string(),
            start,
            length,
            frequency,
            amplitude,
            phase: None,
            profile: None,
        }
    }

    pub fn with_phase(mut self, degrees: f64) -> Self {
        self.phase = Some(degrees);
        self
    }

    pub fn with_profile(mut self, profile: u8) -> Self {
        self.profile = Some(profile);
        self
    }
}

/// TTL pulses and DDS events of one shot plus its explicit length.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sequence {
    events: Vec<Event>,
    extended: u128,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in insertion order
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn ttl_pulses(&self) -> impl Iterator<Item = &TtlPulse> {
        self.events.iter().filter_map(|e| match e {
            Event::Ttl(p) => Some(p),
            _ => None,
        })
    }

    pub fn dds_events(&self) -> impl Iterator<Item = &DdsEvent> {
        self.events.iter().filter_map(|e| match e {
            Event::Dds(d) => Some(d),
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// End of the latest pulse or event
    pub fn end(&self) -> u128 {
        self.events.iter().map(Event::end).max().unwrap_or(0)
    }

    /// Explicitly extended length, or the latest end if that is later
    pub fn declared_length(&self) -> u128 {
        self.extended.max(self.end())
    }
}

/// Capability of programming TTL lines into a sequence.
pub trait ProgramsTTL {
    /// Add a pulse of `length` ns on `channel` starting at `start` ns.
    fn add_ttl_pulse(&mut self, channel: &str, start: u128, length: u128) -> Result<()>;

    /// Add several `(channel, start, length)` pulses. Either all pulses
    /// are added or, on the first invalid entry, none is.
    fn add_ttl_pulses(&mut self, pulses: &[(&str, u128, u128)]) -> Result<()>;

    /// Make the sequence at least `length` ns long.
    fn extend_length(&mut self, length: u128) -> Result<()>;
}

/// Capability of programming DDS channels into a sequence.
pub trait ProgramsDDS {
    fn add_dds_pulse(&mut self, pulse: &DdsPulse) -> Result<()>;

    /// All-or-nothing, like [`ProgramsTTL::add_ttl_pulses`].
    fn add_dds_pulses(&mut self, pulses: &[DdsPulse]) -> Result<()>;
}

/// Validating front end to a caller's [`Sequence`].
///
/// Holds at most one sequence; [`SequenceBuilder::new_sequence()`] discards
/// the current one. Every operation fails with
/// [`PulserError::NoActiveSequence`] until a sequence has been created.
#[derive(Clone, Debug)]
pub struct SequenceBuilder {
    registry: Arc<ChannelRegistry>,
    timing: Timing,
    sequence: Option<Sequence>,
}

impl SequenceBuilder {

    pub fn new(registry: Arc<ChannelRegistry>, timing: Timing) -> Self {
        SequenceBuilder { registry, timing, sequence: None }
    }

    /// Discard any current sequence and start an empty one.
    pub fn new_sequence(&mut self) {
        self.sequence = Some(Sequence::new());
    }

    pub fn sequence(&self) -> Result<&Sequence> {
        self.sequence.as_ref().ok_or(PulserError::NoActiveSequence)
    }

    fn sequence_mut(&mut self) -> Result<&mut Sequence> {
        self.sequence.as_mut().ok_or(PulserError::NoActiveSequence)
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    fn check_window(&self, start: u128, length: u128) -> Result<()> {
        let max = self.timing.max_length;

        match start.checked_add(length) {
            Some(end) if start <= max && end <= max => {},
            _ => {
                return Err(PulserError::OutOfRange(
                    format!("interval {} ns + {} ns not within [0, {}] ns", start, length, max)));
            }
        }

        if length < self.timing.resolution {
            return Err(PulserError::Resolution(length, self.timing.resolution));
        }

        Ok(())
    }

    fn validate_ttl(&self, channel: &str, start: u128, length: u128) -> Result<TtlPulse> {
        let index = self.registry.hardware_index(channel)?;
        self.check_window(start, length)?;
        Ok(TtlPulse { channel: index, start, length })
    }

    // `pending` holds events of the same batch that are not yet committed
    fn validate_dds(&self, pulse: &DdsPulse, pending: &[DdsEvent]) -> Result<DdsEvent> {
        let dds = self.registry.dds(&pulse.channel)?;
        self.check_window(pulse.start, pulse.length)?;
        dds.check_frequency(pulse.frequency)?;
        dds.check_amplitude(pulse.amplitude)?;

        if let Some(profile) = pulse.profile {
            if profile > MAX_PROFILE {
                return Err(PulserError::OutOfRange(
                    format!("{}: profile {} not within [0, {}]", dds.name, profile, MAX_PROFILE)));
            }
        }

        if let Some(phase) = pulse.phase {
            if !phase.is_finite() {
                return Err(PulserError::OutOfRange(format!("{}: phase {}", dds.name, phase)));
            }
        }

        let event = DdsEvent {
            channel: dds.index,
            start: pulse.start,
            length: pulse.length,
            frequency: pulse.frequency,
            amplitude: pulse.amplitude,
            phase: pulse.phase,
            profile: pulse.profile,
        };

        let sequence = self.sequence()?;
        if sequence.dds_events().chain(pending.iter()).any(|e| e.overlaps(&event)) {
            return Err(PulserError::DdsOverlap { channel: dds.name.clone(), start: pulse.start });
        }

        Ok(event)
    }

    /// Grid view of the current sequence for debugging.
    ///
    /// Computed from scratch on every call.
    pub fn human_readable(&self) -> Result<HumanReadable> {
        let sequence = self.sequence()?;
        Ok(HumanReadable::build(sequence, &self.registry, &self.timing))
    }

    /// DDS state changes of the current sequence, in time order.
    pub fn human_readable_dds(&self) -> Result<Vec<DdsTransition>> {
        let sequence = self.sequence()?;
        let transitions = compiler::dds_transitions(sequence, &self.timing);

        Ok(transitions.into_iter().map(|t| {
            let channel = self.registry.dds_by_index(t.channel)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| format!("DDS{}", t.channel));
            DdsTransition {
                channel,
                time: t.tick * self.timing.resolution,
                frequency: t.frequency,
                amplitude: t.amplitude,
                phase: t.phase,
                profile: t.profile,
                on: t.on,
            }
        }).collect())
    }

    /// Compile the current sequence. Pure; the hardware is not touched.
    pub fn compile(&self) -> Result<CompiledProgram> {
        let sequence = self.sequence.as_ref().ok_or(PulserError::EmptySequence)?;
        compiler::compile(sequence, &self.registry, &self.timing)
    }
}

impl ProgramsTTL for SequenceBuilder {

    fn add_ttl_pulse(&mut self, channel: &str, start: u128, length: u128) -> Result<()> {
        self.sequence()?;
        let pulse = self.validate_ttl(channel, start, length)?;
        self.sequence_mut()?.events.push(Event::Ttl(pulse));
        Ok(())
    }

    fn add_ttl_pulses(&mut self, pulses: &[(&str, u128, u128)]) -> Result<()> {
        self.sequence()?;

        let mut validated: Vec<TtlPulse> = Vec::with_capacity(pulses.len());
        for (index, (channel, start, length)) in pulses.iter().enumerate() {
            let pulse = self.validate_ttl(channel, *start, *length)
                .map_err(|e| PulserError::PulseEntry { index, source: Box::new(e) })?;
            validated.push(pulse);
        }

        let sequence = self.sequence_mut()?;
        sequence.events.extend(validated.into_iter().map(Event::Ttl));
        Ok(())
    }

    fn extend_length(&mut self, length: u128) -> Result<()> {
        let max = self.timing.max_length;
        let sequence = self.sequence_mut()?;

        if length > max {
            return Err(PulserError::OutOfRange(
                format!("length {} ns not within [0, {}] ns", length, max)));
        }

        sequence.extended = sequence.extended.max(length);
        Ok(())
    }
}

impl ProgramsDDS for SequenceBuilder {

    fn add_dds_pulse(&mut self, pulse: &DdsPulse) -> Result<()> {
        self.sequence()?;
        let event = self.validate_dds(pulse, &[])?;
        self.sequence_mut()?.events.push(Event::Dds(event));
        Ok(())
    }

    fn add_dds_pulses(&mut self, pulses: &[DdsPulse]) -> Result<()> {
        self.sequence()?;

        let mut validated: Vec<DdsEvent> = Vec::with_capacity(pulses.len());
        for (index, pulse) in pulses.iter().enumerate() {
            let event = self.validate_dds(pulse, &validated)
                .map_err(|e| PulserError::PulseEntry { index, source: Box::new(e) })?;
            validated.push(event);
        }

        let sequence = self.sequence_mut()?;
        sequence.events.extend(validated.into_iter().map(Event::Dds));
        Ok(())
    }
}

/// One DDS state change in physical units
#[derive(Clone, Debug, PartialEq)]
pub struct DdsTransition {
    pub channel: String,
    /// Quantized time, ns
    pub time: u128,
    pub frequency: f64,
    pub amplitude: f64,
    pub phase: f64,
    pub profile: u8,
    /// `false` for the return to the off state at the end of an event
    pub on: bool,
}

/// Grid rendering of a sequence.
///
/// Rows are the TTL lines in hardware order followed by the DDS channels.
/// Column `j` covers `[times[j], times[j+1])`; the columns are the intervals
/// between consecutive quantized switching times, so `times` has one more
/// entry than the grid has columns.
#[derive(Clone, Debug, PartialEq)]
pub struct HumanReadable {
    /// Column boundaries, ns
    pub times: Vec<u128>,
    pub labels: Vec<String>,
    pub grid: Array2<bool>,
}

impl HumanReadable {

    fn build(sequence: &Sequence, registry: &ChannelRegistry, timing: &Timing) -> HumanReadable {

        let total = compiler::total_ticks(sequence, timing);

        let mut boundaries: BTreeSet<u128> = BTreeSet::new();
        boundaries.insert(0);
        boundaries.insert(total);
        for event in sequence.events() {
            let (start, end) = match event {
                Event::Ttl(p) => (p.start, p.end()),
                Event::Dds(e) => (e.start, e.end()),
            };
            boundaries.insert(timing.ticks(start));
            boundaries.insert(timing.ticks(end));
        }
        let ticks: Vec<u128> = boundaries.into_iter().collect();

        let mut labels: Vec<String> = registry.channels().iter().map(|c| c.name.clone()).collect();
        labels.extend(registry.dds_channels().iter().map(|d| d.name.clone()));

        let columns = ticks.len().saturating_sub(1);
        let mut grid = Array2::from_elem((labels.len(), columns), false);
        let nttl = registry.channels().len();

        for (col, window) in ticks.windows(2).enumerate() {
            let at = window[0];
            let active = |start: u128, end: u128| timing.ticks(start) <= at && at < timing.ticks(end);

            for (row, channel) in registry.channels().iter().enumerate() {
                grid[[row, col]] = sequence.ttl_pulses()
                    .any(|p| p.channel == channel.hardware_index && active(p.start, p.end()));
            }

            for (offset, dds) in registry.dds_channels().iter().enumerate() {
                grid[[nttl + offset, col]] = sequence.dds_events()
                    .any(|e| e.channel == dds.index && active(e.start, e.end()));
            }
        }

        HumanReadable {
            times: ticks.iter().map(|t| t * timing.resolution).collect(),
            labels,
            grid,
        }
    }

    /// Whether the row labelled `label` is active at time `nanos`
    pub fn is_active(&self, label: &str, nanos: u128) -> Option<bool> {
        let row = self.labels.iter().position(|l| l == label)?;
        let col = self.times.windows(2).position(|w| w[0] <= nanos && nanos < w[1])?;
        Some(self.grid[[row, col]])
    }
}

impl fmt::Display for HumanReadable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.labels.iter().map(|l| l.len()).max().unwrap_or(0);

        write!(f, "{:width$} |", "t (ns)", width = width)?;
        for t in self.times.iter().take(self.grid.ncols()) {
            write!(f, " {}", t)?;
        }
        writeln!(f)?;

        for (row, label) in self.labels.iter().enumerate() {
            write!(f, "{:width$} |", label, width = width)?;
            for col in 0..self.grid.ncols() {
                write!(f, " {}", if self.grid[[row, col]] { '1' } else { '0' })?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}
