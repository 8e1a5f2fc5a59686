//! In-process board emulator
//!
//! [`FakeBoard`] implements [`Transport`] with the wire, trigger and pipe
//! semantics of the pulser firmware closely enough to drive the full
//! library without hardware. Every primitive operation is recorded
//! together with the calling thread so tests can check the ordering of
//! operations under concurrent callers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;
use num_traits::FromPrimitive;
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::link::{Connector, Transport};
use crate::registers::{ReadoutSelect, to_pipe_bytes};
use crate::registers::consts::*;

/// A primitive operation as seen by the board
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    SetWireIn { addr: u8, value: u32, mask: u32 },
    UpdateWireIns,
    UpdateWireOuts,
    WireOut(u8),
    Trigger { addr: u8, bit: u8 },
    PipeIn { addr: u8, len: usize },
    PipeOut { addr: u8, len: usize },
}

#[derive(Clone, Debug)]
pub struct LoggedOp {
    pub thread: ThreadId,
    pub op: Op,
}

#[derive(Default)]
struct Board {
    present: bool,
    latency: Duration,
    pending: HashMap<u8, u32>,
    wires: HashMap<u8, u32>,
    latched: HashMap<u8, u32>,
    done: bool,
    repetitions: u32,
    pipes: HashMap<u8, VecDeque<u8>>,
    programs: Vec<Vec<u8>>,
    log: Vec<LoggedOp>,
}

impl Board {
    fn record(&mut self, op: Op) {
        self.log.push(LoggedOp { thread: thread::current().id(), op });
    }

    fn wire(&self, addr: u8) -> u32 {
        self.wires.get(&addr).copied().unwrap_or(0)
    }

    fn fill(&self, addr: u8) -> usize {
        self.pipes.get(&addr).map_or(0, |p| p.len())
    }
}

/// Emulated board. Clones share the same board.
#[derive(Clone)]
pub struct FakeBoard {
    inner: Arc<Mutex<Board>>,
}

impl FakeBoard {

    pub fn new() -> Self {
        FakeBoard {
            inner: Arc::new(Mutex::new(Board { present: true, ..Default::default() }))
        }
    }

    // Every primitive goes through here: simulated link latency outside
    // the board lock, then presence check and logging.
    fn access<T, F>(&self, op: Op, f: F) -> Result<T, TransportError>
    where
        F: FnOnce(&mut Board) -> T
    {
        let latency = self.inner.lock().latency;
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let mut board = self.inner.lock();
        if !board.present {
            return Err(TransportError::Disconnected);
        }
        board.record(op);
        Ok(f(&mut board))
    }

    /// Delay applied to every primitive operation
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    pub fn unplug(&self) {
        self.inner.lock().present = false;
    }

    pub fn plug(&self) {
        self.inner.lock().present = true;
    }

    pub fn is_present(&self) -> bool {
        self.inner.lock().present
    }

    /// Value reported by the done flag
    pub fn set_done(&self, done: bool) {
        self.inner.lock().done = done;
    }

    pub fn set_repetitions(&self, completed: u32) {
        self.inner.lock().repetitions = completed;
    }

    fn push_pipe(&self, addr: u8, bytes: &[u8]) {
        self.inner.lock().pipes.entry(addr).or_default().extend(bytes.iter().copied());
    }

    /// Queue raw count records in the normal FIFO
    pub fn push_counts(&self, records: &[u32]) {
        let bytes: Vec<u8> = records.iter().flat_map(|r| r.to_le_bytes()).collect();
        self.push_pipe(PIPE_NORMAL, &bytes);
    }

    /// Queue raw bytes in the normal FIFO
    pub fn push_count_bytes(&self, bytes: &[u8]) {
        self.push_pipe(PIPE_NORMAL, bytes);
    }

    /// Queue time tags, in tick offsets, in the time-tag FIFO
    pub fn push_timetags(&self, offsets: &[u32]) {
        let bytes: Vec<u8> = offsets.iter().flat_map(|o| to_pipe_bytes(*o)).collect();
        self.push_pipe(PIPE_RESOLVED, &bytes);
    }

    /// Data returned by the next capture read
    pub fn load_capture(&self, bytes: &[u8]) {
        self.push_pipe(PIPE_RESOLVED, bytes);
    }

    /// Bytes waiting in the pipe at `addr`
    pub fn pipe_len(&self, addr: u8) -> usize {
        self.inner.lock().fill(addr)
    }

    /// Committed value of a wire-in
    pub fn wire_in(&self, addr: u8) -> u32 {
        self.inner.lock().wire(addr)
    }

    /// Every program uploaded so far
    pub fn programs(&self) -> Vec<Vec<u8>> {
        self.inner.lock().programs.clone()
    }

    pub fn log(&self) -> Vec<LoggedOp> {
        self.inner.lock().log.clone()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.inner.lock().log.iter().map(|l| l.op.clone()).collect()
    }

    pub fn clear_log(&self) {
        self.inner.lock().log.clear();
    }

    /// Trigger bits activated so far, in order
    pub fn triggers(&self) -> Vec<u8> {
        self.inner.lock().log.iter().filter_map(|l| match l.op {
            Op::Trigger { bit, .. } => Some(bit),
            _ => None,
        }).collect()
    }

    pub fn pipe_reads(&self) -> usize {
        self.inner.lock().log.iter()
            .filter(|l| matches!(l.op, Op::PipeOut { .. }))
            .count()
    }
}

impl Default for FakeBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for FakeBoard {

    fn set_wire_in(&mut self, addr: u8, value: u32, mask: u32) -> Result<(), TransportError> {
        self.access(Op::SetWireIn { addr, value, mask }, |b| {
            let current = b.pending.get(&addr).copied().unwrap_or_else(|| b.wire(addr));
            b.pending.insert(addr, (current & !mask) | (value & mask));
        })
    }

    fn update_wire_ins(&mut self) -> Result<(), TransportError> {
        self.access(Op::UpdateWireIns, |b| {
            let pending: Vec<(u8, u32)> = b.pending.drain().collect();
            b.wires.extend(pending);
        })
    }

    fn update_wire_outs(&mut self) -> Result<(), TransportError> {
        self.access(Op::UpdateWireOuts, |b| {
            let readout = match ReadoutSelect::from_u32(b.wire(WIRE_CONTROL) & 0xf0) {
                Some(ReadoutSelect::Done) => b.done as u32,
                Some(ReadoutSelect::Repetitions) => b.repetitions,
                Some(ReadoutSelect::NormalTotal) => (b.fill(PIPE_NORMAL) / 2) as u32,
                None => 0,
            };
            let resolved = (b.fill(PIPE_RESOLVED) / 2) as u32;
            b.latched.insert(WIREOUT_READOUT, readout);
            b.latched.insert(WIREOUT_RESOLVED_TOTAL, resolved);
        })
    }

    fn wire_out(&mut self, addr: u8) -> Result<u32, TransportError> {
        self.access(Op::WireOut(addr), |b| b.latched.get(&addr).copied().unwrap_or(0))
    }

    fn activate_trigger_in(&mut self, addr: u8, bit: u8) -> Result<(), TransportError> {
        self.access(Op::Trigger { addr, bit }, |b| {
            match bit {
                TRIG_RESET_FIFO_NORMAL => { b.pipes.remove(&PIPE_NORMAL); },
                TRIG_RESET_FIFO_RESOLVED => { b.pipes.remove(&PIPE_RESOLVED); },
                _ => {}
            }
        })
    }

    fn write_pipe_in(&mut self, addr: u8, _block: usize, data: &[u8]) -> Result<usize, TransportError> {
        self.access(Op::PipeIn { addr, len: data.len() }, |b| {
            b.programs.push(data.to_vec());
            data.len()
        })
    }

    fn read_pipe_out(&mut self, addr: u8, _block: usize, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.access(Op::PipeOut { addr, len: buf.len() }, |b| {
            let pipe = b.pipes.entry(addr).or_default();
            for byte in buf.iter_mut() {
                *byte = pipe.pop_front().unwrap_or(0);
            }
            buf.len()
        })
    }
}

/// Connector handing out a [`FakeBoard`] whenever it is plugged in.
pub struct FakeConnector {
    board: FakeBoard,
    device_id: String,
    attempts: AtomicUsize,
}

impl FakeConnector {

    pub fn new(board: FakeBoard) -> Self {
        FakeConnector::with_id(board, "Pulser")
    }

    pub fn with_id(board: FakeBoard, device_id: &str) -> Self {
        FakeConnector {
            board,
            device_id: device_id.to_string(),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Number of connection attempts so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.board.is_present() {
            Ok(Box::new(self.board.clone()))
        } else {
            Err(TransportError::DeviceNotFound(self.device_id.clone()))
        }
    }
}
