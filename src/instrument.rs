use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::channelreg::{ChannelRegistry, LineRegister, LineState};
use crate::compiler::CompiledProgram;
use crate::config::HardwareConfiguration;
use crate::controller::{ExecState, ExecutionController, RunMode};
use crate::counting::{CollectionMode, CountSample, CountingEngine};
use crate::error::{PulserError, Result};
use crate::link::{Connector, Link, Wire};
use crate::registers::consts::*;
use crate::session::{Listeners, Session, SwitchEvent, SwitchNotification};
use crate::sequence::SequenceBuilder;
use crate::timeresolved::{decode_timetags, TimeTag, TIMETAG_BYTES};

/// Board state guarded by the link lock.
pub struct PulserState {
    controller: ExecutionController,
    counting: CountingEngine,
    lines: BTreeMap<u8, LineState>,
}

// Push every stored line state, the counting setup and a clean sequencer
// and DDS state to a freshly attached board.
fn initialise(wire: &mut Wire, state: &mut PulserState) -> Result<()> {
    let mut register = LineRegister::new();
    for (index, line) in &state.lines {
        register.set(*index, line);
    }

    wire.set(WIRE_MANUAL, register.manual_word(), 0xffff_ffff)?;
    wire.set(WIRE_LEVEL, register.level_word(), 0xffff_ffff)?;
    wire.commit()?;

    state.counting.apply(wire)?;
    state.counting.reset_fifo(wire)?;
    wire.trigger(TRIG_RESET_DDS)?;

    // program memory does not survive a reconnection
    state.controller.reset();

    Ok(())
}

// Write the manual and level bits of a single line.
fn write_line(wire: &mut Wire, index: u8, line: &LineState) -> Result<()> {
    let bit = 1u32 << index;
    wire.set(WIRE_MANUAL, if line.is_manual { bit } else { 0 }, bit)?;
    wire.set(WIRE_LEVEL, if line.level_bit() { bit } else { 0 }, bit)?;
    wire.commit()
}

fn now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Front end of the pulser board.
///
/// A `Pulser` is shared by all callers of the process. Each caller builds
/// its sequences in its own [`Session`] and hands them to the pulser for
/// programming and execution. Every operation that touches the hardware is
/// a single transaction on the board's [`Link`]; validation happens before
/// the transaction starts so that a rejected request never leaves the board
/// half-configured.
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use libpulser::{Pulser, HardwareConfiguration, ProgramsTTL};
/// use libpulser::emulator::{FakeBoard, FakeConnector};
///
/// let connector = Arc::new(FakeConnector::new(FakeBoard::new()));
/// let pulser = Pulser::open(HardwareConfiguration::default(), connector).unwrap();
///
/// let mut session = pulser.session();
/// session.new_sequence();
/// session.add_ttl_pulse("camera", 0, 10_000).unwrap();
///
/// pulser.program_sequence(&session).unwrap();
/// pulser.start_single().unwrap();
/// pulser.wait_sequence_done(Duration::from_secs(1)).unwrap();
/// let counts = pulser.get_counts().unwrap();
/// ```
pub struct Pulser {
    link: Link<PulserState>,
    registry: Arc<ChannelRegistry>,
    config: HardwareConfiguration,
    listeners: Arc<Listeners>,
}

impl Pulser {

    /// Open the pulser described by `config`. The board does not need to
    /// be present; it is picked up as soon as it appears.
    pub fn open(config: HardwareConfiguration, connector: Arc<dyn Connector>) -> Result<Pulser> {

        let registry = Arc::new(ChannelRegistry::from_config(&config)?);

        let lines = registry.channels().iter()
            .map(|c| (c.hardware_index, c.line_state()))
            .collect();

        let state = PulserState {
            controller: ExecutionController::new(),
            counting: CountingEngine::new(config.collection_mode, config.collection_time,
                config.collection_time_range),
            lines,
        };

        let link = Link::open(connector, state, config.polling_period(), initialise);

        Ok(Pulser { link, registry, config, listeners: Arc::new(Listeners::new()) })
    }

    /// Start a new caller session.
    pub fn session(&self) -> Session {
        let builder = SequenceBuilder::new(self.registry.clone(), self.config.timing());
        Session::new(builder, self.listeners.clone())
    }

    /// Number of live sessions
    pub fn sessions(&self) -> usize {
        self.listeners.len()
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &HardwareConfiguration {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Try to attach the board now instead of waiting for the next
    /// reconnection attempt.
    pub fn connect(&self) -> Result<()> {
        self.link.connect()
    }

    pub fn disconnect(&self) {
        self.link.disconnect()
    }

    /// Current sequencer state
    pub fn exec_state(&self) -> ExecState {
        self.link.with_state(|s| s.controller.state())
    }

    pub fn run_mode(&self) -> RunMode {
        self.link.with_state(|s| s.controller.run_mode())
    }

    /// Compile the sequence of `session` and upload it.
    pub fn program_sequence(&self, session: &Session) -> Result<()> {
        let program = session.compile()?;
        self.program(&program)
    }

    /// Upload an already compiled program.
    pub fn program(&self, program: &CompiledProgram) -> Result<()> {
        self.link.transaction(|w, s| s.controller.program(w, program))
    }

    /// Run the programmed sequence once.
    pub fn start_single(&self) -> Result<()> {
        self.link.transaction(|w, s| s.controller.start_single(w))
    }

    /// Run the programmed sequence until stopped.
    pub fn start_infinite(&self) -> Result<()> {
        self.link.transaction(|w, s| s.controller.start_infinite(w))
    }

    /// Run the programmed sequence `n` times, with `n` in `[1, 65535]`.
    pub fn start_counted(&self, n: u32) -> Result<()> {
        ExecutionController::check_repetitions(n)?;
        self.link.transaction(|w, s| s.controller.start_counted(w, n))
    }

    /// Let an infinite run finish the current cycle and halt.
    pub fn complete_infinite_iteration(&self) -> Result<()> {
        self.link.transaction(|w, s| s.controller.complete_infinite_iteration(w))
    }

    /// Halt the running sequence. The program is cleared and has to be
    /// uploaded again before the next run.
    pub fn stop_sequence(&self) -> Result<()> {
        self.link.transaction(|w, s| s.controller.stop(w))
    }

    /// Poll the done flag until it is raised or `timeout` elapses. The
    /// lock is only held for each poll, not in between.
    ///
    /// Returns `false` on timeout. A timeout too large to represent as an
    /// instant waits without a deadline.
    pub fn wait_sequence_done(&self, timeout: Duration) -> Result<bool> {
        let interval = self.config.wait_poll_interval();
        let deadline = Instant::now().checked_add(timeout);

        loop {
            if self.link.transaction(|w, s| s.controller.poll_done(w))? {
                return Ok(true);
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    interval.min(deadline - now)
                },
                None => interval
            };

            spin_sleep::sleep(pause);
        }
    }

    /// Completed repetitions of the running looped sequence.
    pub fn repetitions_completed(&self) -> Result<u32> {
        self.link.transaction(|w, s| s.controller.repetitions_completed(w))
    }

    /// Drain the normal counting FIFO.
    pub fn get_counts(&self) -> Result<Vec<CountSample>> {
        self.link.transaction(|w, s| s.counting.drain(w, now()))
    }

    /// Discard every queued count record.
    pub fn reset_counting_buffer(&self) -> Result<()> {
        self.link.transaction(|w, s| s.counting.reset_fifo(w))
    }

    /// Switch the counting cadence.
    pub fn set_mode(&self, mode: CollectionMode) -> Result<()> {
        self.link.transaction(|w, s| s.counting.set_mode(w, mode))
    }

    pub fn collection_mode(&self) -> CollectionMode {
        self.link.with_state(|s| s.counting.mode())
    }

    /// Set the collection window of `mode`. Only the normal window is
    /// programmed into the board; the differential one is driven by the
    /// sequence and is used for rate conversion only.
    pub fn set_collection_time(&self, secs: f64, mode: CollectionMode) -> Result<()> {
        self.link.with_state(|s| s.counting.check_collection_time(secs))?;

        match mode {
            CollectionMode::Normal => {
                self.link.transaction(|w, s| s.counting.set_normal_collection_time(w, secs))
            },
            CollectionMode::Differential => {
                self.link.with_state(|s| s.counting.store_collection_time(secs, mode))
            }
        }
    }

    pub fn collection_time(&self, mode: CollectionMode) -> f64 {
        self.link.with_state(|s| s.counting.collection_time_for(mode))
    }

    pub fn collection_time_range(&self) -> (f64, f64) {
        self.config.collection_time_range
    }

    /// Clear the time-tag FIFO.
    pub fn reset_timetags(&self) -> Result<()> {
        self.link.transaction(|w, _| w.trigger(TRIG_RESET_FIFO_RESOLVED))
    }

    /// Read every complete time tag waiting in the FIFO.
    pub fn get_timetags(&self) -> Result<Vec<TimeTag>> {
        self.link.transaction(|w, _| {
            // fill level is reported in 16-bit words
            let words = w.read(WIREOUT_RESOLVED_TOTAL)? as usize;
            let bytes = (words * 2) / TIMETAG_BYTES * TIMETAG_BYTES;

            if bytes == 0 {
                return Ok(Vec::new());
            }

            let mut buf = vec![0u8; bytes];
            w.read_pipe(PIPE_RESOLVED, PIPE_BLOCK, &mut buf)?;
            Ok(decode_timetags(&buf))
        })
    }

    /// Duration of a time-tag tick, seconds
    pub fn timetag_resolution(&self) -> f64 {
        self.config.timetag_resolution
    }

    // Apply `update` to the stored state of `channel`, write it to the
    // board and keep it only if the write succeeded.
    fn switch<F>(&self, channel: &str, update: F) -> Result<LineState>
    where
        F: FnOnce(&mut LineState)
    {
        let index = self.registry.hardware_index(channel)?;

        self.link.transaction(|w, s| {
            let mut line = s.lines.get(&index).copied().unwrap_or_default();
            update(&mut line);
            write_line(w, index, &line)?;
            s.lines.insert(index, line);
            Ok(line)
        })
    }

    fn notify(&self, origin: Option<&Session>, channel: &str, event: SwitchEvent) {
        let notification = SwitchNotification { channel: channel.to_string(), event };
        self.listeners.publish_except(origin.map(Session::id), &notification);
    }

    /// Put `channel` under manual control, at `state` or at its last
    /// manual level. Every session other than `origin` is notified.
    pub fn switch_manual(&self, origin: Option<&Session>, channel: &str, state: Option<bool>)
        -> Result<()> {

        let line = self.switch(channel, |line| {
            line.is_manual = true;
            if let Some(state) = state {
                line.manual_state = state;
            }
        })?;

        let event = if line.manual_state { SwitchEvent::ManualOn } else { SwitchEvent::ManualOff };
        self.notify(origin, channel, event);

        Ok(())
    }

    /// Hand `channel` back to the sequencer, optionally changing its
    /// inversion. Every session other than `origin` is notified.
    pub fn switch_auto(&self, origin: Option<&Session>, channel: &str, invert: Option<bool>)
        -> Result<()> {

        self.switch(channel, |line| {
            line.is_manual = false;
            if let Some(invert) = invert {
                line.auto_invert = invert;
            }
        })?;

        self.notify(origin, channel, SwitchEvent::Auto);

        Ok(())
    }

    /// `(manual, manual level, manual inversion, auto inversion)` of
    /// `channel`
    pub fn get_state(&self, channel: &str) -> Result<(bool, bool, bool, bool)> {
        let index = self.registry.hardware_index(channel)?;
        self.link.with_state(|s| {
            s.lines.get(&index).map(LineState::as_tuple)
                .ok_or_else(|| PulserError::UnknownChannel(channel.to_string()))
        })
    }

    /// Channel names and their hardware lines
    pub fn get_channels(&self) -> Vec<(String, u8)> {
        self.registry.table()
    }
}


#[cfg(test)]
mod tests {

    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use assert_matches::assert_matches;
    use super::Pulser;
    use crate::config::HardwareConfiguration;
    use crate::counting::{CollectionMode, CountStatus};
    use crate::emulator::{FakeBoard, FakeConnector};
    use crate::error::PulserError;
    use crate::registers::consts::*;
    use crate::sequence::ProgramsTTL;
    use crate::session::{SwitchEvent, SwitchNotification};

    fn pulser() -> (Pulser, FakeBoard) {
        let board = FakeBoard::new();
        let connector = Arc::new(FakeConnector::new(board.clone()));
        (Pulser::open(HardwareConfiguration::default(), connector).unwrap(), board)
    }

    #[test]
    fn initial_line_state_written() {
        let (pulser, board) = pulser();
        assert!(pulser.is_connected());

        // 866DP (0) manual on, radial (9) manual off
        assert_eq!(board.wire_in(WIRE_MANUAL), (1 << 0) | (1 << 9));
        assert_eq!(board.wire_in(WIRE_LEVEL), 1 << 0);
        assert_eq!(board.wire_in(WIRE_COUNT_RATE), 100);
        assert!(board.triggers().contains(&TRIG_RESET_DDS));
    }

    #[test]
    fn switching_updates_board_and_state() {
        let (pulser, board) = pulser();

        pulser.switch_manual(None, "camera", Some(true)).unwrap();
        assert_eq!(pulser.get_state("camera").unwrap(), (true, true, false, false));
        assert_eq!(board.wire_in(WIRE_MANUAL) & (1 << 4), 1 << 4);
        assert_eq!(board.wire_in(WIRE_LEVEL) & (1 << 4), 1 << 4);

        // last manual level is remembered
        pulser.switch_auto(None, "camera", Some(true)).unwrap();
        assert_eq!(pulser.get_state("camera").unwrap(), (false, true, false, true));
        assert_eq!(board.wire_in(WIRE_MANUAL) & (1 << 4), 0);
        assert_eq!(board.wire_in(WIRE_LEVEL) & (1 << 4), 1 << 4);

        pulser.switch_manual(None, "camera", None).unwrap();
        assert_eq!(pulser.get_state("camera").unwrap(), (true, true, false, true));

        assert_matches!(pulser.switch_manual(None, "nope", None), Err(PulserError::UnknownChannel(_)));
        assert_matches!(pulser.get_state("nope"), Err(PulserError::UnknownChannel(_)));
    }

    #[test]
    fn notifications_exclude_origin() {
        let (pulser, _board) = pulser();
        let a = pulser.session();
        let b = pulser.session();
        let c = pulser.session();
        assert_eq!(pulser.sessions(), 3);

        pulser.switch_manual(Some(&a), "axial", Some(false)).unwrap();

        assert_eq!(a.try_notification(), None);
        let expected = SwitchNotification { channel: String::from("axial"), event: SwitchEvent::ManualOff };
        assert_eq!(b.try_notification(), Some(expected.clone()));
        assert_eq!(c.try_notification(), Some(expected));

        drop(c);
        assert_eq!(pulser.sessions(), 2);

        pulser.switch_auto(Some(&b), "axial", None).unwrap();
        assert_eq!(a.notifications().len(), 1);
        assert!(b.notifications().is_empty());
    }

    #[test]
    fn collection_settings() {
        let (pulser, board) = pulser();

        assert_matches!(pulser.set_collection_time(10.0, CollectionMode::Normal), Err(PulserError::OutOfRange(_)));
        pulser.set_collection_time(0.25, CollectionMode::Normal).unwrap();
        assert_eq!(board.wire_in(WIRE_COUNT_RATE), 250);

        pulser.set_collection_time(0.5, CollectionMode::Differential).unwrap();
        assert_eq!(board.wire_in(WIRE_COUNT_RATE), 250);
        assert_eq!(pulser.collection_time(CollectionMode::Differential), 0.5);

        pulser.set_mode(CollectionMode::Differential).unwrap();
        assert_eq!(pulser.collection_mode(), CollectionMode::Differential);
        assert_eq!(board.wire_in(WIRE_CONTROL) & 0x01, 0x01);
        assert_eq!(pulser.collection_time_range(), (0.010, 5.0));

        // differential records are converted with the differential window
        board.push_counts(&[0x8000_0000 | 1000]);
        let counts = pulser.get_counts().unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].status, CountStatus::Off);
        assert_eq!(counts[0].rate_khz, 2.0);
    }

    #[test]
    fn timetags() {
        let (pulser, board) = pulser();
        board.push_timetags(&[3, 0x0002_0001]);

        let tags = pulser.get_timetags().unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[1].offset, 0x0002_0001);
        assert_eq!(pulser.timetag_resolution(), 10.0e-9);

        board.push_timetags(&[7]);
        pulser.reset_timetags().unwrap();
        assert!(pulser.get_timetags().unwrap().is_empty());
    }

    #[test]
    fn operations_fail_without_board() {
        let board = FakeBoard::new();
        board.unplug();
        let connector = Arc::new(FakeConnector::new(board.clone()));
        let pulser = Pulser::open(HardwareConfiguration::default(), connector).unwrap();

        assert!(!pulser.is_connected());
        assert_matches!(pulser.start_single(), Err(PulserError::DeviceNotConnected));
        assert_matches!(pulser.get_counts(), Err(PulserError::DeviceNotConnected));
        assert_matches!(pulser.switch_manual(None, "camera", Some(true)), Err(PulserError::DeviceNotConnected));
        // the stored state is untouched
        assert_eq!(pulser.get_state("camera").unwrap(), (false, false, false, false));

        // validation still comes first
        assert_matches!(pulser.start_counted(0), Err(PulserError::OutOfRange(_)));

        board.plug();
        pulser.connect().unwrap();
        assert!(pulser.is_connected());
        pulser.switch_manual(None, "camera", Some(true)).unwrap();
    }

    #[test]
    fn unbounded_wait() {
        let (pulser, board) = pulser();
        let mut session = pulser.session();
        session.new_sequence();
        session.add_ttl_pulse("camera", 0, 1_000).unwrap();
        pulser.program_sequence(&session).unwrap();
        pulser.start_single().unwrap();

        let setter = {
            let board = board.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(80));
                board.set_done(true);
            })
        };

        assert!(pulser.wait_sequence_done(Duration::MAX).unwrap());
        setter.join().unwrap();
    }
}
