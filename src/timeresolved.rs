//! Time-resolved photon acquisition
//!
//! Two sources of time-resolved data exist. The pulser board itself keeps
//! a FIFO of time tags, 32-bit tick offsets of detected photons. The
//! separate capture board records one bit per clock cycle over a fixed
//! window; since the capture is mostly empty it is returned in a sparse
//! form.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::thread;
use parking_lot::Mutex;

use crate::config::TimeResolvedConfiguration;
use crate::error::{PulserError, Result};
use crate::link::{Connector, Link};
use crate::registers::from_pipe_bytes;
use crate::registers::consts::*;

/// Size of a time tag on the pipe, bytes
pub const TIMETAG_BYTES: usize = 4;

/// Arrival of a photon in device clock ticks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeTag {
    pub offset: u32,
}

impl TimeTag {
    /// Physical time given the duration of one tick in seconds
    pub fn seconds(&self, resolution: f64) -> f64 {
        (self.offset as f64) * resolution
    }
}

/// Decode time tags: each tag is a pair of 16-bit words, high half first.
pub fn decode_timetags(buf: &[u8]) -> Vec<TimeTag> {
    buf.chunks_exact(TIMETAG_BYTES)
        .map(|c| TimeTag { offset: from_pipe_bytes(c) })
        .collect()
}

/// Sparse form of a capture: its length and every non-zero byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SparseCapture {
    pub total_length: usize,
    pub hits: Vec<(usize, u8)>,
}

impl SparseCapture {

    pub fn from_raw(raw: &[u8]) -> Self {
        let hits = raw.iter().enumerate()
            .filter(|(_, v)| **v != 0)
            .map(|(i, v)| (i, *v))
            .collect();

        SparseCapture { total_length: raw.len(), hits }
    }

    /// Rebuild the dense capture
    pub fn expand(&self) -> Vec<u8> {
        let mut raw = vec![0u8; self.total_length];
        for (idx, value) in &self.hits {
            raw[*idx] = *value;
        }
        raw
    }
}

/// Capture size in bytes for a window of `nanos`.
///
/// One byte per clock period, rounded down to the 1024-byte transfer
/// granularity and checked against the buffer limits.
pub fn find_buffer_length(nanos: u128, config: &TimeResolvedConfiguration) -> Result<usize> {
    let granularity = CAPTURE_BLOCK as u128;
    let bytes = nanos / (config.clock_period_ns as u128) / granularity * granularity;

    let (min, max) = (config.min_buffer as u128, config.max_buffer as u128);
    if bytes < min || bytes > max {
        return Err(PulserError::OutOfRange(
            format!("capture of {} ns needs {} bytes; not within [{}, {}]", nanos, bytes, min, max)));
    }

    Ok(bytes as usize)
}

type Pending = Receiver<Result<Vec<u8>>>;

/// Front end of the capture board.
///
/// One capture may be outstanding at a time. It runs on a worker thread
/// and its result is collected with [`TimeResolved::get_result()`].
pub struct TimeResolved {
    link: Arc<Link<()>>,
    config: TimeResolvedConfiguration,
    time_length: Mutex<u128>,
    in_request: Arc<AtomicBool>,
    pending: Mutex<Option<Pending>>,
}

impl TimeResolved {

    pub fn open(connector: Arc<dyn Connector>, config: TimeResolvedConfiguration) -> Self {
        let link = Link::open(connector, (), config.polling_period(), |w, _| {
            w.trigger(TRIG_RESET_CAPTURE)
        });

        TimeResolved {
            link: Arc::new(link),
            time_length: Mutex::new(config.default_time_length_ns as u128),
            config,
            in_request: Arc::new(AtomicBool::new(false)),
            pending: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn connect(&self) -> Result<()> {
        self.link.connect()
    }

    pub fn disconnect(&self) {
        self.link.disconnect()
    }

    /// Default capture window, ns
    pub fn time_length(&self) -> u128 {
        *self.time_length.lock()
    }

    pub fn set_time_length(&self, nanos: u128) -> Result<()> {
        find_buffer_length(nanos, &self.config)?;
        *self.time_length.lock() = nanos;
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.in_request.load(Ordering::SeqCst)
    }

    /// Start a capture of `nanos`, or of the default window.
    pub fn perform_measurement(&self, nanos: Option<u128>) -> Result<()> {

        if !self.link.is_connected() {
            return Err(PulserError::DeviceNotConnected);
        }

        let length = find_buffer_length(nanos.unwrap_or_else(|| self.time_length()), &self.config)?;

        if self.in_request.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(PulserError::Busy(String::from("a capture is already in progress")));
        }

        let (sender, receiver) = channel::<Result<Vec<u8>>>();
        *self.pending.lock() = Some(receiver);

        let link = self.link.clone();
        let in_request = self.in_request.clone();

        thread::spawn(move || {
            let res = link.transaction(|w, _| {
                w.trigger(TRIG_RESET_CAPTURE)?;
                let mut buf = vec![0u8; length];
                w.read_pipe(PIPE_RESOLVED, CAPTURE_BLOCK, &mut buf)?;
                Ok(buf)
            });

            in_request.store(false, Ordering::SeqCst);
            // receiver gone means nobody will ask for the result
            let _ = sender.send(res);
        });

        tracing::debug!("capture of {} bytes started", length);

        Ok(())
    }

    /// Block until the outstanding capture completes and return it.
    ///
    /// Only the most recent request is kept: starting a new capture once the
    /// previous one has finished discards its uncollected result.
    pub fn get_result(&self) -> Result<SparseCapture> {
        let pending = self.pending.lock().take().ok_or_else(|| {
            PulserError::InvalidMode(String::from("no capture was requested"))
        })?;

        let raw = pending.recv().map_err(|_| {
            PulserError::InvalidMode(String::from("capture was abandoned"))
        })??;

        Ok(SparseCapture::from_raw(&raw))
    }
}


#[cfg(test)]
mod tests {

    use std::sync::Arc;
    use assert_matches::assert_matches;
    use super::{decode_timetags, find_buffer_length, SparseCapture, TimeResolved, TimeTag};
    use crate::config::TimeResolvedConfiguration;
    use crate::emulator::{FakeBoard, FakeConnector};
    use crate::error::PulserError;

    #[test]
    fn buffer_length() {
        let config = TimeResolvedConfiguration::default();

        // 0.1 s at 40 ns is 2 500 000 bytes
        let len = find_buffer_length(100_000_000, &config).unwrap();
        assert_eq!(len % 1024, 0);
        assert!(len <= 2_500_000);
        assert_eq!(len, 2_499_584);

        assert_eq!(find_buffer_length(40 * 1024, &config).unwrap(), 1024);
        assert_matches!(find_buffer_length(40 * 1023, &config), Err(PulserError::OutOfRange(_)));
        assert_matches!(find_buffer_length(40 * 16_777_216, &config), Err(PulserError::OutOfRange(_)));
        assert_eq!(find_buffer_length(40 * 16_776_192, &config).unwrap(), 16_776_192);
    }

    #[test]
    fn sparse_capture() {
        let raw = [0u8, 0, 3, 0, 0, 0, 0x80, 0];
        let sparse = SparseCapture::from_raw(&raw);
        assert_eq!(sparse.total_length, 8);
        assert_eq!(sparse.hits, vec![(2, 3), (6, 0x80)]);
        assert_eq!(sparse.expand(), raw.to_vec());
    }

    #[test]
    fn timetags() {
        let tags = decode_timetags(&[0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x00, 0xff]);
        assert_eq!(tags, vec![TimeTag { offset: 0x0001_0002 }, TimeTag { offset: 5 }]);
        assert!((tags[1].seconds(10.0e-9) - 50.0e-9).abs() < 1e-18);
    }

    #[test]
    fn measurement_cycle() {
        let board = FakeBoard::new();
        let connector = Arc::new(FakeConnector::with_id(board.clone(), "TimeResolvedFPGA"));
        let tr = TimeResolved::open(connector, TimeResolvedConfiguration::default());

        assert_matches!(tr.get_result(), Err(PulserError::InvalidMode(_)));
        assert_matches!(tr.set_time_length(10), Err(PulserError::OutOfRange(_)));

        let mut capture = vec![0u8; 2048];
        capture[5] = 1;
        capture[2000] = 0x11;
        board.load_capture(&capture);

        tr.perform_measurement(Some(40 * 2048)).unwrap();
        let result = tr.get_result().unwrap();
        assert_eq!(result.total_length, 2048);
        assert_eq!(result.hits, vec![(5, 1), (2000, 0x11)]);
        assert!(!tr.is_busy());
    }

    #[test]
    fn measurement_requires_board() {
        let board = FakeBoard::new();
        board.unplug();
        let connector = Arc::new(FakeConnector::new(board));
        let tr = TimeResolved::open(connector, TimeResolvedConfiguration::default());
        assert_matches!(tr.perform_measurement(None), Err(PulserError::DeviceNotConnected));
    }

    #[test]
    fn one_capture_at_a_time() {
        let board = FakeBoard::new();
        board.set_latency(std::time::Duration::from_millis(200));
        let connector = Arc::new(FakeConnector::new(board.clone()));
        let tr = TimeResolved::open(connector, TimeResolvedConfiguration::default());

        tr.perform_measurement(Some(40 * 1024)).unwrap();
        assert_matches!(tr.perform_measurement(Some(40 * 1024)), Err(PulserError::Busy(_)));
        assert_eq!(tr.get_result().unwrap().total_length, 1024);
    }
}
