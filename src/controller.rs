//! Sequencer execution state
//!
//! ```text
//!            program             start_*
//!   Idle ------------> Programmed --------> Running{Single,Infinite,Counted}
//!    ^                    ^   ^                  |          |
//!    |                    |   +--- done seen ----+          |
//!    +--------------------+-------- stop -------------------+
//! ```
//!
//! A run that finished on its own leaves its run bits on the control wire.
//! `stop` is still accepted after such a run and clears them; the next
//! start clears them first as well, so the sequencer always sees a fresh
//! start edge.
//!
//! The controller lives behind the link lock together with the device, so
//! its state only ever changes inside a hardware transaction. Every check
//! is made before the first register is touched.

use crate::compiler::CompiledProgram;
use crate::error::{PulserError, Result};
use crate::link::Wire;
use crate::registers::{ControlWire, ReadoutSelect};
use crate::registers::consts::*;

/// How the sequencer is currently running
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    None,
    Single,
    Infinite,
    Counted(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecState {
    Idle,
    Programmed,
    RunningSingle,
    RunningInfinite,
    RunningCounted(u16),
}

impl ExecState {
    pub fn is_running(&self) -> bool {
        matches!(self,
            ExecState::RunningSingle | ExecState::RunningInfinite | ExecState::RunningCounted(_))
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionController {
    state: ExecState,
    // stop bits of a run that finished without being stopped
    finished: Option<ControlWire>,
}

impl Default for ExecutionController {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionController {

    pub fn new() -> Self {
        ExecutionController { state: ExecState::Idle, finished: None }
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn run_mode(&self) -> RunMode {
        match self.state {
            ExecState::RunningSingle => RunMode::Single,
            ExecState::RunningInfinite => RunMode::Infinite,
            ExecState::RunningCounted(n) => RunMode::Counted(n),
            _ => RunMode::None,
        }
    }

    /// Forget any program; used when a board is (re)attached.
    pub fn reset(&mut self) {
        self.finished = None;
        self.transition(ExecState::Idle);
    }

    fn transition(&mut self, next: ExecState) {
        if next != self.state {
            tracing::debug!("sequencer {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    fn check_startable(&self) -> Result<()> {
        match self.state {
            ExecState::Programmed => Ok(()),
            ExecState::Idle => Err(PulserError::NotProgrammed),
            s => Err(PulserError::Busy(format!("sequencer is {:?}", s))),
        }
    }

    fn set_run_control(&self, wire: &mut Wire, bits: ControlWire) -> Result<()> {
        wire.write(WIRE_CONTROL, bits.bits(), ControlWire::SEQUENCE_MASK.bits())
    }

    fn clear_finished(&mut self, wire: &mut Wire) -> Result<()> {
        if let Some(stop) = self.finished {
            self.set_run_control(wire, stop)?;
            self.finished = None;
        }
        Ok(())
    }

    /// Upload a program into sequencer memory.
    pub fn program(&mut self, wire: &mut Wire, program: &CompiledProgram) -> Result<()> {
        if self.state.is_running() {
            return Err(PulserError::Busy(format!("sequencer is {:?}", self.state)));
        }

        let bytes = program.as_bytes();
        wire.trigger(TRIG_RESET_RAM)?;
        wire.write_pipe(PIPE_PROGRAM, PIPE_BLOCK, &bytes)?;
        wire.trigger(TRIG_RESET_SEQ_COUNTER)?;

        tracing::info!("programmed {} bytes ({} ticks)", bytes.len(), program.total_ticks());
        self.transition(ExecState::Programmed);

        Ok(())
    }

    pub fn start_single(&mut self, wire: &mut Wire) -> Result<()> {
        self.check_startable()?;
        self.clear_finished(wire)?;

        wire.trigger(TRIG_RESET_SEQ_COUNTER)?;
        self.set_run_control(wire, ControlWire::START_SINGLE)?;
        self.transition(ExecState::RunningSingle);

        Ok(())
    }

    pub fn start_infinite(&mut self, wire: &mut Wire) -> Result<()> {
        self.check_startable()?;
        self.clear_finished(wire)?;

        wire.write(WIRE_REPETITIONS, 0, 0xffff_ffff)?;
        wire.trigger(TRIG_RESET_SEQ_COUNTER)?;
        self.set_run_control(wire, ControlWire::START_LOOPED)?;
        self.transition(ExecState::RunningInfinite);

        Ok(())
    }

    /// Run the program `n` times, `n` in `[1, 65535]`.
    pub fn start_counted(&mut self, wire: &mut Wire, n: u32) -> Result<()> {
        let reps = Self::check_repetitions(n)?;
        self.check_startable()?;
        self.clear_finished(wire)?;

        wire.write(WIRE_REPETITIONS, reps as u32, 0xffff_ffff)?;
        wire.trigger(TRIG_RESET_SEQ_COUNTER)?;
        self.set_run_control(wire, ControlWire::START_LOOPED)?;
        self.transition(ExecState::RunningCounted(reps));

        Ok(())
    }

    pub fn check_repetitions(n: u32) -> Result<u16> {
        match u16::try_from(n) {
            Ok(reps) if reps >= 1 => Ok(reps),
            _ => Err(PulserError::OutOfRange(format!("{} repetitions not within [1, 65535]", n)))
        }
    }

    /// Halt the sequencer. Program memory is cleared; a new program must
    /// be uploaded before the next run.
    ///
    /// Valid while running and after a run that finished by itself.
    pub fn stop(&mut self, wire: &mut Wire) -> Result<()> {
        let stop = match (self.state, self.finished) {
            (ExecState::RunningSingle, _) => ControlWire::STOP_SINGLE,
            (ExecState::RunningInfinite, _) | (ExecState::RunningCounted(_), _) => ControlWire::STOP_LOOPED,
            (ExecState::Programmed, Some(stop)) => stop,
            (s, _) => return Err(PulserError::InvalidMode(format!("cannot stop; sequencer is {:?}", s))),
        };

        wire.trigger(TRIG_RESET_RAM)?;
        self.set_run_control(wire, stop)?;
        wire.trigger(TRIG_RESET_SEQ_COUNTER)?;
        self.finished = None;
        self.transition(ExecState::Idle);

        Ok(())
    }

    /// Let an infinite run finish its current cycle and halt.
    pub fn complete_infinite_iteration(&mut self, wire: &mut Wire) -> Result<()> {
        if self.state != ExecState::RunningInfinite {
            return Err(PulserError::InvalidMode(
                format!("not running an infinite sequence ({:?})", self.state)));
        }

        self.set_run_control(wire, ControlWire::START_SINGLE)?;
        self.transition(ExecState::RunningSingle);

        Ok(())
    }

    /// Read the done flag once. A finished single or counted run leaves
    /// the program in memory, so the controller returns to `Programmed`.
    pub fn poll_done(&mut self, wire: &mut Wire) -> Result<bool> {
        let done = wire.readout(ReadoutSelect::Done)? != 0;

        let stop = match self.state {
            ExecState::RunningSingle => Some(ControlWire::STOP_SINGLE),
            ExecState::RunningCounted(_) => Some(ControlWire::STOP_LOOPED),
            _ => None,
        };

        if let (true, Some(stop)) = (done, stop) {
            self.finished = Some(stop);
            self.transition(ExecState::Programmed);
        }

        Ok(done)
    }

    /// Completed repetitions of a looped run
    pub fn repetitions_completed(&self, wire: &mut Wire) -> Result<u32> {
        match self.state {
            ExecState::RunningInfinite | ExecState::RunningCounted(_) => {
                wire.readout(ReadoutSelect::Repetitions)
            },
            s => Err(PulserError::InvalidMode(format!("not running a looped sequence ({:?})", s)))
        }
    }
}


#[cfg(test)]
mod tests {

    use std::sync::Arc;
    use assert_matches::assert_matches;
    use super::{ExecState, ExecutionController, RunMode};
    use crate::channelreg::ChannelRegistry;
    use crate::compiler::CompiledProgram;
    use crate::config::HardwareConfiguration;
    use crate::emulator::{FakeBoard, Op};
    use crate::error::PulserError;
    use crate::link::Wire;
    use crate::registers::consts::*;
    use crate::sequence::{ProgramsTTL, SequenceBuilder};

    fn program() -> CompiledProgram {
        let config = HardwareConfiguration::default();
        let registry = Arc::new(ChannelRegistry::from_config(&config).unwrap());
        let mut b = SequenceBuilder::new(registry, config.timing());
        b.new_sequence();
        b.add_ttl_pulse("camera", 0, 400).unwrap();
        b.compile().unwrap()
    }

    #[test]
    fn start_requires_program() {
        let mut board = FakeBoard::new();
        let mut c = ExecutionController::new();
        let mut wire = Wire::new(&mut board);

        assert_matches!(c.start_single(&mut wire), Err(PulserError::NotProgrammed));
        assert_matches!(c.start_infinite(&mut wire), Err(PulserError::NotProgrammed));
        assert_matches!(c.start_counted(&mut wire, 3), Err(PulserError::NotProgrammed));
        assert_matches!(c.stop(&mut wire), Err(PulserError::InvalidMode(_)));
        assert_matches!(c.complete_infinite_iteration(&mut wire), Err(PulserError::InvalidMode(_)));
        assert_matches!(c.repetitions_completed(&mut wire), Err(PulserError::InvalidMode(_)));
        assert!(board.log().is_empty());
    }

    #[test]
    fn program_and_run() {
        let mut board = FakeBoard::new();
        let mut c = ExecutionController::new();

        c.program(&mut Wire::new(&mut board), &program()).unwrap();
        assert_eq!(c.state(), ExecState::Programmed);
        assert_eq!(board.programs().len(), 1);
        assert_eq!(board.programs()[0], program().as_bytes());

        c.start_single(&mut Wire::new(&mut board)).unwrap();
        assert_eq!(c.run_mode(), RunMode::Single);
        assert_eq!(board.wire_in(WIRE_CONTROL) & 0x06, 0x04);

        // busy while running
        assert_matches!(c.program(&mut Wire::new(&mut board), &program()), Err(PulserError::Busy(_)));
        assert_matches!(c.start_single(&mut Wire::new(&mut board)), Err(PulserError::Busy(_)));

        assert_eq!(c.poll_done(&mut Wire::new(&mut board)).unwrap(), false);
        board.set_done(true);
        assert_eq!(c.poll_done(&mut Wire::new(&mut board)).unwrap(), true);
        assert_eq!(c.state(), ExecState::Programmed);

        // program is still there
        c.start_single(&mut Wire::new(&mut board)).unwrap();
        assert_eq!(c.state(), ExecState::RunningSingle);
    }

    #[test]
    fn counted_runs() {
        let mut board = FakeBoard::new();
        let mut c = ExecutionController::new();
        c.program(&mut Wire::new(&mut board), &program()).unwrap();

        board.clear_log();
        assert_matches!(c.start_counted(&mut Wire::new(&mut board), 0), Err(PulserError::OutOfRange(_)));
        assert_matches!(c.start_counted(&mut Wire::new(&mut board), 65536), Err(PulserError::OutOfRange(_)));
        assert!(board.log().is_empty());

        c.start_counted(&mut Wire::new(&mut board), 65535).unwrap();
        assert_eq!(c.run_mode(), RunMode::Counted(65535));
        assert_eq!(board.wire_in(WIRE_REPETITIONS), 65535);
        assert_eq!(board.wire_in(WIRE_CONTROL) & 0x06, 0x06);

        board.set_repetitions(12);
        assert_eq!(c.repetitions_completed(&mut Wire::new(&mut board)).unwrap(), 12);

        c.stop(&mut Wire::new(&mut board)).unwrap();
        assert_eq!(c.state(), ExecState::Idle);
        assert_eq!(board.wire_in(WIRE_CONTROL) & 0x06, 0x02);
        assert_matches!(c.start_single(&mut Wire::new(&mut board)), Err(PulserError::NotProgrammed));
    }

    #[test]
    fn infinite_runs() {
        let mut board = FakeBoard::new();
        let mut c = ExecutionController::new();
        c.program(&mut Wire::new(&mut board), &program()).unwrap();

        c.start_infinite(&mut Wire::new(&mut board)).unwrap();
        assert_eq!(board.wire_in(WIRE_REPETITIONS), 0);
        assert_eq!(c.run_mode(), RunMode::Infinite);

        c.complete_infinite_iteration(&mut Wire::new(&mut board)).unwrap();
        assert_eq!(c.state(), ExecState::RunningSingle);
        assert_eq!(board.wire_in(WIRE_CONTROL) & 0x06, 0x04);
        assert_matches!(c.complete_infinite_iteration(&mut Wire::new(&mut board)),
            Err(PulserError::InvalidMode(_)));

        c.stop(&mut Wire::new(&mut board)).unwrap();
        assert_eq!(board.wire_in(WIRE_CONTROL) & 0x06, 0x00);
        assert_eq!(board.triggers().last(), Some(&TRIG_RESET_SEQ_COUNTER));
    }

    #[test]
    fn finished_run_can_be_stopped() {
        let mut board = FakeBoard::new();
        let mut c = ExecutionController::new();
        c.program(&mut Wire::new(&mut board), &program()).unwrap();

        c.start_counted(&mut Wire::new(&mut board), 3).unwrap();
        board.set_done(true);
        assert!(c.poll_done(&mut Wire::new(&mut board)).unwrap());
        assert_eq!(c.state(), ExecState::Programmed);
        assert_eq!(board.wire_in(WIRE_CONTROL) & 0x06, 0x06);

        c.stop(&mut Wire::new(&mut board)).unwrap();
        assert_eq!(c.state(), ExecState::Idle);
        assert_eq!(board.wire_in(WIRE_CONTROL) & 0x06, 0x02);

        // nothing left to stop
        assert_matches!(c.stop(&mut Wire::new(&mut board)), Err(PulserError::InvalidMode(_)));
    }

    #[test]
    fn restart_after_finish_clears_run_bit() {
        let mut board = FakeBoard::new();
        let mut c = ExecutionController::new();
        c.program(&mut Wire::new(&mut board), &program()).unwrap();

        c.start_single(&mut Wire::new(&mut board)).unwrap();
        board.set_done(true);
        assert!(c.poll_done(&mut Wire::new(&mut board)).unwrap());

        board.clear_log();
        c.start_single(&mut Wire::new(&mut board)).unwrap();

        let runs: Vec<u32> = board.ops().iter().filter_map(|op| match op {
            Op::SetWireIn { addr: WIRE_CONTROL, value, mask } if *mask == 0x06 => Some(*value),
            _ => None
        }).collect();
        assert_eq!(runs, vec![0x00, 0x04]);
        assert_eq!(c.state(), ExecState::RunningSingle);
    }
}
