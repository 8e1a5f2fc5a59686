//! Control library for FPGA pulse pattern generators
//!
//! `libpulser` drives an FPGA pulser board: it assembles timed TTL and DDS
//! sequences, compiles them into the sequencer's program format, uploads
//! and runs them, and reads back photon counts and time tags. A companion
//! capture board for single-shot time-resolved acquisition is supported
//! through [`TimeResolved`].
//!
//! The board is reached through a [`Connector`] which produces a
//! [`Transport`] implementing the primitive wire, trigger and pipe
//! operations of the FPGA interface. All hardware access is serialised
//! through a single lock per board. An in-process [`emulator`] is included
//! for testing without hardware.
//!
//! ```no_run
//! use std::sync::Arc;
//! use libpulser::{Pulser, HardwareConfiguration, ProgramsTTL};
//! use libpulser::emulator::{FakeBoard, FakeConnector};
//!
//! let connector = Arc::new(FakeConnector::new(FakeBoard::new()));
//! let pulser = Pulser::open(HardwareConfiguration::default(), connector).unwrap();
//!
//! let mut session = pulser.session();
//! session.new_sequence();
//! session.add_ttl_pulses(&[("camera", 0, 1_000_000), ("axial", 500_000, 1_000_000)]).unwrap();
//! println!("{}", session.human_readable().unwrap());
//!
//! pulser.program_sequence(&session).unwrap();
//! pulser.start_counted(100).unwrap();
//! ```

#[macro_use]
mod macros;

pub mod error;
pub mod registers;
pub mod config;
pub mod channelreg;
pub mod sequence;
pub mod compiler;
pub mod link;
pub mod controller;
pub mod counting;
pub mod timeresolved;
pub mod session;
pub mod emulator;
mod instrument;

pub use error::{PulserError, TransportError};
pub use config::{HardwareConfiguration, TimeResolvedConfiguration};
pub use channelreg::{Channel, ChannelRegistry, DdsChannel};
pub use sequence::{DdsPulse, ProgramsDDS, ProgramsTTL, Sequence, SequenceBuilder};
pub use compiler::CompiledProgram;
pub use link::{Connector, Transport};
pub use controller::{ExecState, RunMode};
pub use counting::{CollectionMode, CountSample, CountStatus};
pub use timeresolved::{SparseCapture, TimeResolved, TimeTag};
pub use session::{Session, SessionId, SwitchEvent, SwitchNotification};
pub use instrument::Pulser;
