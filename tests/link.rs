use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use serial_test::serial;
use assert_matches::assert_matches;

use libpulser::{Pulser, HardwareConfiguration, PulserError, TransportError, ExecState};
use libpulser::ProgramsTTL;
use libpulser::emulator::{FakeBoard, FakeConnector, Op};
use libpulser::registers::consts::*;

fn pulser_with(board: &FakeBoard, config: HardwareConfiguration) -> (Arc<Pulser>, Arc<FakeConnector>) {
    let connector = Arc::new(FakeConnector::new(board.clone()));
    let pulser = Pulser::open(config, connector.clone()).unwrap();
    (Arc::new(pulser), connector)
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, f: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    f()
}


#[test]
#[serial]
fn transactions_do_not_interleave() {

    let board = FakeBoard::new();
    let (pulser, _) = pulser_with(&board, HardwareConfiguration::default());

    board.set_latency(Duration::from_micros(200));
    board.clear_log();

    let channels = ["camera", "axial", "bluePI", "397Extra"];
    let handles: Vec<_> = channels.iter().map(|name| {
        let pulser = pulser.clone();
        let name = name.to_string();
        thread::spawn(move || {
            for i in 0..10 {
                pulser.switch_manual(None, &name, Some(i % 2 == 0)).unwrap();
            }
        })
    }).collect();

    for h in handles {
        h.join().unwrap();
    }

    let log = board.log();
    assert_eq!(log.len(), channels.len() * 10 * 3);

    // every switch is manual bit, level bit, commit; issued by one thread
    for chunk in log.chunks(3) {
        assert!(chunk.iter().all(|l| l.thread == chunk[0].thread));
        assert_matches!(chunk[0].op, Op::SetWireIn { addr: WIRE_MANUAL, .. });
        assert_matches!(chunk[1].op, Op::SetWireIn { addr: WIRE_LEVEL, .. });
        assert_matches!(chunk[2].op, Op::UpdateWireIns);
    }

    // last write of every thread was manual off
    for name in channels.iter() {
        assert_eq!(pulser.get_state(name).unwrap(), (true, false, false, false));
    }
}

#[test]
#[serial]
fn mixed_transactions_do_not_interleave() {

    let board = FakeBoard::new();
    let (pulser, _) = pulser_with(&board, HardwareConfiguration::default());
    board.set_latency(Duration::from_micros(200));
    board.clear_log();

    let switcher = {
        let pulser = pulser.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                pulser.switch_auto(None, "camera", None).unwrap();
            }
        })
    };

    let reader = {
        let pulser = pulser.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                pulser.get_counts().unwrap();
            }
        })
    };

    switcher.join().unwrap();
    reader.join().unwrap();

    // A reader transaction is: set readout, commit, latch, read out. No
    // operation of the other thread may appear between its first and last
    // operation.
    let log = board.log();
    let mut idx = 0;
    while idx < log.len() {
        let len = match log[idx].op {
            Op::SetWireIn { addr: WIRE_MANUAL, .. } => 3,
            Op::SetWireIn { addr: WIRE_CONTROL, .. } => 4,
            ref other => panic!("unexpected transaction start {:?}", other),
        };
        let chunk = &log[idx..idx+len];
        assert!(chunk.iter().all(|l| l.thread == chunk[0].thread));
        idx += len;
    }
}

#[test]
#[serial]
fn wait_done_times_out() {

    let board = FakeBoard::new();
    let (pulser, _) = pulser_with(&board, HardwareConfiguration::default());

    let mut session = pulser.session();
    session.new_sequence();
    session.add_ttl_pulse("camera", 0, 1_000).unwrap();
    pulser.program_sequence(&session).unwrap();
    pulser.start_single().unwrap();
    board.clear_log();

    let start = Instant::now();
    let done = pulser.wait_sequence_done(Duration::from_millis(100)).unwrap();
    let elapsed = start.elapsed();

    assert!(!done);
    assert!(elapsed >= Duration::from_millis(100), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400), "returned after {:?}", elapsed);

    // one poll every 50 ms
    let polls = board.ops().iter().filter(|op| **op == Op::UpdateWireOuts).count();
    assert!(polls >= 2 && polls <= 4, "{} polls", polls);
    assert_eq!(pulser.exec_state(), ExecState::RunningSingle);
}

#[test]
#[serial]
fn wait_done_returns_early() {

    let board = FakeBoard::new();
    let (pulser, _) = pulser_with(&board, HardwareConfiguration::default());

    let mut session = pulser.session();
    session.new_sequence();
    session.add_ttl_pulse("camera", 0, 1_000).unwrap();
    pulser.program_sequence(&session).unwrap();
    pulser.start_single().unwrap();

    let setter = {
        let board = board.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(120));
            board.set_done(true);
        })
    };

    let start = Instant::now();
    assert!(pulser.wait_sequence_done(Duration::from_secs(5)).unwrap());
    assert!(start.elapsed() < Duration::from_secs(1));
    setter.join().unwrap();
}

#[test]
#[serial]
fn reconnects_after_loss() {

    let board = FakeBoard::new();
    board.unplug();

    let config = HardwareConfiguration {
        device_polling_period_ms: 20,
        ..Default::default()
    };
    let (pulser, connector) = pulser_with(&board, config);

    assert!(!pulser.is_connected());
    assert_matches!(pulser.get_counts(), Err(PulserError::DeviceNotConnected));

    board.plug();
    assert!(wait_until(Duration::from_secs(2), || pulser.is_connected()));
    assert!(connector.attempts() >= 2);
    // stored line states were pushed to the board
    assert_eq!(board.wire_in(WIRE_MANUAL), (1 << 0) | (1 << 9));

    let mut session = pulser.session();
    session.new_sequence();
    session.add_ttl_pulse("camera", 0, 1_000).unwrap();
    pulser.program_sequence(&session).unwrap();
    assert_eq!(pulser.exec_state(), ExecState::Programmed);

    // lose the board in the middle of a transaction
    board.unplug();
    assert_matches!(pulser.start_single(),
        Err(PulserError::Transport(TransportError::Disconnected)));
    assert!(!pulser.is_connected());
    assert_matches!(pulser.start_single(), Err(PulserError::DeviceNotConnected));

    board.plug();
    assert!(wait_until(Duration::from_secs(2), || pulser.is_connected()));

    // program memory is gone after a reconnection
    assert_eq!(pulser.exec_state(), ExecState::Idle);
    assert_matches!(pulser.start_single(), Err(PulserError::NotProgrammed));
}
