//! Sequence compilation
//!
//! Turns a [`Sequence`] into the word buffer understood by the sequencer
//! firmware. Compilation is pure: it does not touch the device.
//!
//! ## Program layout
//!
//! ```text
//!  TTL section                          DDS section
//! +------+------+-----+------+---+---+  +-------+---------------------+
//! | tick | mask | ... | tick | 0 | 0 |  | count | record × count      |
//! +------+------+-----+------+---+---+  +-------+---------------------+
//!
//!  DDS record
//! +------+-----------------------+-----------+------------------------+
//! | tick | channel << 8 | profile | frequency | amplitude << 16 | phase |
//! +------+-----------------------+-----------+------------------------+
//! ```
//!
//! The TTL section opens with the output mask at tick 0, carries one
//! record per tick where the mask changes and closes with an all-low
//! record at the total length, followed by the `(0, 0)` terminator.
//! Every word is shipped in pipe order, see
//! [`to_pipe_bytes`][`crate::registers::to_pipe_bytes`].

use std::collections::BTreeMap;
use bitvec::prelude::{BitArray, Lsb0};

use crate::channelreg::ChannelRegistry;
use crate::config::Timing;
use crate::error::{PulserError, Result};
use crate::registers::{ToU32s, to_pipe_bytes};
use crate::sequence::{DdsEvent, Sequence};

/// Output mask of the TTL lines from `tick` onwards
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtlRecord {
    pub tick: u32,
    pub mask: u32,
}

impl ToU32s for TtlRecord {
    fn as_u32s(&self) -> Vec<u32> {
        vec![self.tick, self.mask]
    }
}

/// Synthesizer words applied to a DDS channel at `tick`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DdsRecord {
    pub tick: u32,
    pub channel: u8,
    pub profile: u8,
    pub frequency: u32,
    pub amplitude: u16,
    pub phase: u16,
}

impl DdsRecord {
    const WORDS: usize = 4;

    fn from_words(words: &[u32]) -> DdsRecord {
        DdsRecord {
            tick: words[0],
            channel: ((words[1] >> 8) & 0xff) as u8,
            profile: (words[1] & 0xff) as u8,
            frequency: words[2],
            amplitude: (words[3] >> 16) as u16,
            phase: (words[3] & 0xffff) as u16,
        }
    }
}

impl ToU32s for DdsRecord {
    fn as_u32s(&self) -> Vec<u32> {
        vec![
            self.tick,
            ((self.channel as u32) << 8) | (self.profile as u32),
            self.frequency,
            ((self.amplitude as u32) << 16) | (self.phase as u32),
        ]
    }
}

/// A DDS state change in physical units.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Transition {
    pub channel: u8,
    pub tick: u128,
    pub frequency: f64,
    pub amplitude: f64,
    pub phase: f64,
    pub profile: u8,
    pub on: bool,
}

/// Immutable program image of a sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledProgram {
    words: Vec<u32>,
    total_ticks: u128,
}

impl CompiledProgram {

    /// Program words in the order they are shipped
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Program bytes in pipe order
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = Vec::with_capacity(self.words.len() * 4);
        for word in &self.words {
            bytes.extend_from_slice(&to_pipe_bytes(*word));
        }
        bytes
    }

    /// Length of the program in device ticks
    pub fn total_ticks(&self) -> u128 {
        self.total_ticks
    }

    // index of the first DDS section word
    fn dds_offset(&self) -> usize {
        // The first record is always present and sits at tick 0, so it
        // can never be mistaken for the terminator.
        let mut idx = 2;
        while idx + 1 < self.words.len() {
            if self.words[idx] == 0 && self.words[idx+1] == 0 {
                return idx + 2;
            }
            idx += 2;
        }
        self.words.len()
    }

    /// Decode the TTL section, terminator excluded.
    pub fn ttl_records(&self) -> Vec<TtlRecord> {
        let end = self.dds_offset().saturating_sub(2);
        self.words[..end].chunks_exact(2)
            .map(|w| TtlRecord { tick: w[0], mask: w[1] })
            .collect()
    }

    /// Decode the DDS section.
    pub fn dds_records(&self) -> Vec<DdsRecord> {
        let offset = self.dds_offset();
        let count = match self.words.get(offset) {
            Some(c) => *c as usize,
            None => return Vec::new()
        };

        self.words[offset+1..].chunks_exact(DdsRecord::WORDS)
            .take(count)
            .map(DdsRecord::from_words)
            .collect()
    }

    /// TTL output mask during `tick`
    pub fn mask_at(&self, tick: u128) -> u32 {
        if tick >= self.total_ticks {
            return 0;
        }

        self.ttl_records().iter()
            .take_while(|r| (r.tick as u128) <= tick)
            .last()
            .map_or(0, |r| r.mask)
    }
}

/// Length of a sequence in ticks: the declared length, rounded up.
pub(crate) fn total_ticks(sequence: &Sequence, timing: &Timing) -> u128 {
    timing.ticks_ceil(sequence.declared_length())
}

fn to_tick(tick: u128, timing: &Timing) -> Result<u32> {
    u32::try_from(tick).map_err(|_| {
        PulserError::SequenceTooLong(tick * timing.resolution, timing.max_length)
    })
}

fn ttl_section(sequence: &Sequence, timing: &Timing, total: u128) -> Result<Vec<TtlRecord>> {

    // signed changes of the number of pulses holding each line high
    let mut changes: BTreeMap<u128, Vec<(u8, i32)>> = BTreeMap::new();
    for pulse in sequence.ttl_pulses() {
        changes.entry(timing.ticks(pulse.start)).or_default().push((pulse.channel, 1));
        changes.entry(timing.ticks(pulse.end())).or_default().push((pulse.channel, -1));
    }

    let mut active = [0i32; 32];
    let mut mask: BitArray<[u32; 1], Lsb0> = BitArray::ZERO;
    let mut records: Vec<TtlRecord> = Vec::with_capacity(changes.len() + 2);

    // opening record; tick 0 changes are folded into it
    if let Some(initial) = changes.remove(&0) {
        for (channel, delta) in initial {
            active[channel as usize] += delta;
            mask.set(channel as usize, active[channel as usize] > 0);
        }
    }
    records.push(TtlRecord { tick: 0, mask: mask.as_raw_slice()[0] });

    for (tick, deltas) in changes.range(..total) {
        let previous = mask.as_raw_slice()[0];
        for (channel, delta) in deltas {
            active[*channel as usize] += delta;
            mask.set(*channel as usize, active[*channel as usize] > 0);
        }

        let current = mask.as_raw_slice()[0];
        if current != previous {
            records.push(TtlRecord { tick: to_tick(*tick, timing)?, mask: current });
        }
    }

    records.push(TtlRecord { tick: to_tick(total, timing)?, mask: 0 });

    Ok(records)
}

/// DDS state changes of `sequence` in time order.
pub(crate) fn dds_transitions(sequence: &Sequence, timing: &Timing) -> Vec<Transition> {

    let mut by_channel: BTreeMap<u8, Vec<&DdsEvent>> = BTreeMap::new();
    for event in sequence.dds_events() {
        by_channel.entry(event.channel).or_default().push(event);
    }

    let mut transitions: Vec<Transition> = Vec::new();

    for events in by_channel.values_mut() {
        events.sort_by_key(|e| e.start);

        for (idx, event) in events.iter().enumerate() {
            let start = timing.ticks(event.start);
            let end = timing.ticks(event.end());
            let on = Transition {
                channel: event.channel,
                tick: start,
                frequency: event.frequency,
                amplitude: event.amplitude,
                phase: event.phase.unwrap_or(0.0),
                profile: event.profile.unwrap_or(0),
                on: true,
            };

            let followed = events.get(idx+1)
                .map_or(false, |next| timing.ticks(next.start) == end);

            let off = if followed {
                None
            } else {
                Some(Transition { tick: end, on: false, ..on.clone() })
            };

            transitions.push(on);
            transitions.extend(off);
        }
    }

    transitions.sort_by_key(|t| (t.tick, t.channel));
    transitions
}

fn dds_section(sequence: &Sequence, registry: &ChannelRegistry, timing: &Timing)
    -> Result<Vec<DdsRecord>> {

    let mut records: Vec<DdsRecord> = Vec::new();

    for t in dds_transitions(sequence, timing) {
        let dds = registry.dds_by_index(t.channel)
            .ok_or_else(|| PulserError::UnknownChannel(format!("DDS{}", t.channel)))?;

        let (fmin, fmax) = dds.board_frequency;
        let (amin, amax) = dds.board_amplitude;

        let (amplitude, phase) = if t.on {
            let turn = t.phase.rem_euclid(360.0) / 360.0;
            (scaled!(t.amplitude, amin, amax, u16::MAX),
             scaled!(turn, 0.0, 1.0, u16::MAX))
        } else {
            (0u16, 0u16)
        };

        records.push(DdsRecord {
            tick: to_tick(t.tick, timing)?,
            channel: t.channel,
            profile: t.profile,
            frequency: scaled!(t.frequency, fmin, fmax, u32::MAX),
            amplitude,
            phase,
        });
    }

    Ok(records)
}

/// Compile `sequence` into a program image.
///
/// Times are floored to the device resolution; the total length is the
/// declared length rounded up to a whole tick.
pub fn compile(sequence: &Sequence, registry: &ChannelRegistry, timing: &Timing)
    -> Result<CompiledProgram> {

    let declared = sequence.declared_length();
    if declared > timing.max_length {
        return Err(PulserError::SequenceTooLong(declared, timing.max_length));
    }

    let total = total_ticks(sequence, timing);
    if total == 0 {
        return Err(PulserError::EmptySequence);
    }

    let ttl = ttl_section(sequence, timing, total)?;
    let dds = dds_section(sequence, registry, timing)?;

    let mut words: Vec<u32> = Vec::with_capacity(2*ttl.len() + 3 + DdsRecord::WORDS*dds.len());
    for record in &ttl {
        words.extend(record.as_u32s());
    }
    words.extend_from_slice(&[0, 0]);
    words.push(dds.len() as u32);
    for record in &dds {
        words.extend(record.as_u32s());
    }

    tracing::debug!("compiled {} ticks: {} TTL records, {} DDS records",
        total, ttl.len(), dds.len());

    Ok(CompiledProgram { words, total_ticks: total })
}
