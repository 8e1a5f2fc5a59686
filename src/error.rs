//! Errors raised by the pulser core

use thiserror::Error;

/// Failure of a primitive operation on the physical link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The board went away in the middle of an operation
    #[error("Device disconnected")]
    Disconnected,
    /// No board with the expected identifier could be found
    #[error("Device {0} not found")]
    DeviceNotFound(String),
    /// Any other low-level failure
    #[error("{op} failed: {reason}")]
    Failed { op: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum PulserError {
    /// Channel name not present in the channel tables
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
    /// Sequence operation issued before `new_sequence`
    #[error("No active sequence; create a new sequence first")]
    NoActiveSequence,
    /// Time, repetition or parameter outside its allowed bounds
    #[error("Out of range: {0}")]
    OutOfRange(String),
    /// Duration shorter than the device time resolution
    #[error("Duration of {0} ns is below the time resolution of {1} ns")]
    Resolution(u128, u128),
    /// Compiled sequence is longer than the device can hold
    #[error("Sequence length of {0} ns exceeds the maximum of {1} ns")]
    SequenceTooLong(u128, u128),
    /// Nothing to compile
    #[error("Sequence is empty")]
    EmptySequence,
    /// No board attached to the link
    #[error("Device not connected")]
    DeviceNotConnected,
    /// Device is occupied by another run or acquisition
    #[error("Device busy: {0}")]
    Busy(String),
    /// Run requested without a programmed sequence
    #[error("No programmed sequence")]
    NotProgrammed,
    /// Operation not valid in the current run mode
    #[error("Invalid mode: {0}")]
    InvalidMode(String),
    /// Two DDS events overlap on the same channel
    #[error("DDS event on {channel} at {start} ns overlaps an existing event")]
    DdsOverlap { channel: String, start: u128 },
    /// One entry of a batch call failed; nothing from the batch was applied
    #[error("Entry {index}: {source}")]
    PulseEntry { index: usize, #[source] source: Box<PulserError> },
    /// Low-level link failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    /// Invalid hardware configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<toml::de::Error> for PulserError {
    fn from(error: toml::de::Error) -> Self {
        PulserError::Configuration(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PulserError>;
