//! Shared hardware link
//!
//! All communication with a board goes through a [`Link`]. The link owns
//! the device handle and the controller state of the board behind a single
//! lock; every logical operation is a [`Link::transaction()`] that holds the
//! lock for its full duration, so the low-level operations of two
//! transactions never interleave. The lock is released on every exit path,
//! including failures.
//!
//! A missing board is not fatal. A supervisor thread retries the connection
//! every polling period and in the meantime every transaction fails with
//! [`PulserError::DeviceNotConnected`].

use std::sync::Arc;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use parking_lot::Mutex;

use crate::error::{PulserError, Result, TransportError};
use crate::registers::ReadoutSelect;
use crate::registers::consts::*;

type TResult<T> = std::result::Result<T, TransportError>;

/// Primitive operations of an FPGA front panel interface.
///
/// Wire-in writes are staged and take effect on
/// [`update_wire_ins()`][`Transport::update_wire_ins`]; wire-out values are
/// latched by [`update_wire_outs()`][`Transport::update_wire_outs`].
pub trait Transport: Send {
    fn set_wire_in(&mut self, addr: u8, value: u32, mask: u32) -> TResult<()>;
    fn update_wire_ins(&mut self) -> TResult<()>;
    fn update_wire_outs(&mut self) -> TResult<()>;
    fn wire_out(&mut self, addr: u8) -> TResult<u32>;
    fn activate_trigger_in(&mut self, addr: u8, bit: u8) -> TResult<()>;
    /// Write `data` in blocks of `block` bytes, returning the bytes written
    fn write_pipe_in(&mut self, addr: u8, block: usize, data: &[u8]) -> TResult<usize>;
    /// Fill `buf` in blocks of `block` bytes, returning the bytes read
    fn read_pipe_out(&mut self, addr: u8, block: usize, buf: &mut [u8]) -> TResult<usize>;
}

/// Locates, opens and configures a board.
pub trait Connector: Send + Sync {
    /// Identifier of the board this connector looks for
    fn device_id(&self) -> &str;
    fn connect(&self) -> TResult<Box<dyn Transport>>;
}

/// Exclusive view of a device for the duration of a transaction.
pub struct Wire<'a> {
    device: &'a mut dyn Transport,
}

impl<'a> Wire<'a> {

    pub fn new(device: &'a mut dyn Transport) -> Self {
        Wire { device }
    }

    /// Stage a masked wire-in value
    pub fn set(&mut self, addr: u8, value: u32, mask: u32) -> Result<()> {
        pktdbg!("wire {:#04x} <- {:#010x} & {:#010x}", addr, value, mask);
        self.device.set_wire_in(addr, value, mask)?;
        Ok(())
    }

    /// Commit all staged wire-ins
    pub fn commit(&mut self) -> Result<()> {
        self.device.update_wire_ins()?;
        Ok(())
    }

    /// Stage and commit a single masked value
    pub fn write(&mut self, addr: u8, value: u32, mask: u32) -> Result<()> {
        self.set(addr, value, mask)?;
        self.commit()
    }

    /// Latch and read a wire-out
    pub fn read(&mut self, addr: u8) -> Result<u32> {
        self.device.update_wire_outs()?;
        let value = self.device.wire_out(addr)?;
        pktdbg!("wire {:#04x} -> {:#010x}", addr, value);
        Ok(value)
    }

    pub fn trigger(&mut self, bit: u8) -> Result<()> {
        pktdbg!("trigger {:#04x}:{}", TRIGGER, bit);
        self.device.activate_trigger_in(TRIGGER, bit)?;
        Ok(())
    }

    /// Route `select` to the readout wire-out and read it
    pub fn readout(&mut self, select: ReadoutSelect) -> Result<u32> {
        self.write(WIRE_CONTROL, select.bits(), crate::registers::ControlWire::READOUT.bits())?;
        self.read(WIREOUT_READOUT)
    }

    pub fn write_pipe(&mut self, addr: u8, block: usize, data: &[u8]) -> Result<usize> {
        pktdbg!("pipe {:#04x} <- {} bytes", addr, data.len());

        #[cfg(not(feature="dummy_writes"))]
        let written = self.device.write_pipe_in(addr, block, data)?;

        #[cfg(feature="dummy_writes")]
        let written = {
            let _ = block;
            tracing::info!("dummy write of {} bytes to pipe {:#04x}", data.len(), addr);
            data.len()
        };

        Ok(written)
    }

    pub fn read_pipe(&mut self, addr: u8, block: usize, buf: &mut [u8]) -> Result<usize> {
        let read = self.device.read_pipe_out(addr, block, buf)?;
        pktdbg!("pipe {:#04x} -> {} bytes", addr, read);
        Ok(read)
    }
}

type Hook<S> = dyn Fn(&mut Wire<'_>, &mut S) -> Result<()> + Send + Sync;

struct Shared<S> {
    device: Option<Box<dyn Transport>>,
    state: S,
}

struct Supervisor {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// A board behind one lock, together with its controller state `S`.
pub struct Link<S> {
    shared: Arc<Mutex<Shared<S>>>,
    connector: Arc<dyn Connector>,
    on_connect: Arc<Hook<S>>,
    supervisor: Mutex<Option<Supervisor>>,
}

// Attach a board if none is attached. Locating and configuring the board
// happens outside the lock so a slow attempt never stalls other callers;
// the hook runs under the lock before the device becomes visible to
// transactions.
fn attach<S>(shared: &Mutex<Shared<S>>, connector: &dyn Connector, hook: &Hook<S>) -> Result<()> {

    if shared.lock().device.is_some() {
        return Ok(());
    }

    let mut device = connector.connect()?;

    let mut guard = shared.lock();
    // attached by someone else in the meantime; this handle is dropped
    if guard.device.is_some() {
        return Ok(());
    }

    let state = &mut guard.state;
    if let Err(err) = hook(&mut Wire::new(device.as_mut()), state) {
        tracing::warn!("initialisation of {} failed: {}", connector.device_id(), err);
        return Err(err);
    }

    guard.device = Some(device);
    tracing::info!("connected to {}", connector.device_id());

    Ok(())
}

impl<S: Send + 'static> Link<S> {

    /// Create a link and try to attach a board immediately. A supervisor
    /// thread keeps retrying every `period` while no board is attached.
    /// `on_connect` initialises every freshly attached board.
    pub fn open<F>(connector: Arc<dyn Connector>, state: S, period: Duration, on_connect: F) -> Link<S>
    where
        F: Fn(&mut Wire<'_>, &mut S) -> Result<()> + Send + Sync + 'static
    {
        let shared = Arc::new(Mutex::new(Shared { device: None, state }));
        let on_connect: Arc<Hook<S>> = Arc::new(on_connect);

        if let Err(err) = attach(&shared, connector.as_ref(), on_connect.as_ref()) {
            tracing::warn!("{} not available ({}); retrying every {:?}",
                connector.device_id(), err, period);
        }

        let (stop, stopped) = channel::<()>();
        let handle = {
            let shared = shared.clone();
            let connector = connector.clone();
            let on_connect = on_connect.clone();

            thread::spawn(move || {
                loop {
                    match stopped.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(err) = attach(&shared, connector.as_ref(), on_connect.as_ref()) {
                                tracing::debug!("{} still not available: {}", connector.device_id(), err);
                            }
                        },
                        _ => break
                    }
                }
            })
        };

        Link {
            shared,
            connector,
            on_connect,
            supervisor: Mutex::new(Some(Supervisor { stop, handle })),
        }
    }

    /// Run `f` with exclusive access to the board and the state.
    ///
    /// Fails with [`PulserError::DeviceNotConnected`] if no board is
    /// attached. A [`TransportError::Disconnected`] raised inside `f`
    /// detaches the board.
    pub fn transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Wire<'_>, &mut S) -> Result<R>
    {
        let mut guard = self.shared.lock();
        let shared = &mut *guard;

        let device = shared.device.as_mut().ok_or(PulserError::DeviceNotConnected)?;
        let res = f(&mut Wire::new(device.as_mut()), &mut shared.state);

        if let Err(PulserError::Transport(TransportError::Disconnected)) = res {
            tracing::warn!("lost connection to {}", self.connector.device_id());
            shared.device = None;
        }

        res
    }

    /// Access the state only; does not require a board.
    pub fn with_state<R, F: FnOnce(&mut S) -> R>(&self, f: F) -> R {
        f(&mut self.shared.lock().state)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().device.is_some()
    }

    /// Attempt to attach a board now.
    pub fn connect(&self) -> Result<()> {
        attach(&self.shared, self.connector.as_ref(), self.on_connect.as_ref())
    }

    /// Detach the board. The supervisor will pick it up again on its
    /// next attempt.
    pub fn disconnect(&self) {
        if self.shared.lock().device.take().is_some() {
            tracing::info!("disconnected from {}", self.connector.device_id());
        }
    }
}

impl<S> Drop for Link<S> {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.lock().take() {
            let _ = supervisor.stop.send(());
            let _ = supervisor.handle.join();
        }
    }
}
