//! Caller sessions and switch notifications
//!
//! Every caller works through its own [`Session`]: it owns the caller's
//! sequence and is registered as a listener for line switch notifications.
//! A switch made through one session is announced to every other live
//! session, never to the one that made it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::compiler::CompiledProgram;
use crate::error::Result;
use crate::sequence::{DdsPulse, DdsTransition, HumanReadable, ProgramsDDS, ProgramsTTL};
use crate::sequence::{Sequence, SequenceBuilder};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchEvent {
    ManualOn,
    ManualOff,
    Auto,
}

/// A line changed mode or level
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchNotification {
    pub channel: String,
    pub event: SwitchEvent,
}

/// Registry of live sessions keyed by id.
#[derive(Default)]
pub struct Listeners {
    next: AtomicU64,
    senders: Mutex<HashMap<SessionId, Sender<SwitchNotification>>>,
}

impl Listeners {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (SessionId, Receiver<SwitchNotification>) {
        let id = SessionId(self.next.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = channel();
        self.senders.lock().insert(id, sender);
        (id, receiver)
    }

    pub fn unregister(&self, id: SessionId) {
        self.senders.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `notification` to every listener except `origin`.
    pub fn publish_except(&self, origin: Option<SessionId>, notification: &SwitchNotification) {
        let mut senders = self.senders.lock();
        // listeners whose receiver is gone are pruned
        senders.retain(|id, sender| {
            Some(*id) == origin || sender.send(notification.clone()).is_ok()
        });
    }
}

/// Per-caller context: a private sequence and a notification inbox.
///
/// Created by [`Pulser::session()`][`crate::Pulser::session()`]; dropping
/// the session unregisters it.
pub struct Session {
    id: SessionId,
    builder: SequenceBuilder,
    inbox: Receiver<SwitchNotification>,
    listeners: Arc<Listeners>,
}

impl Session {

    pub(crate) fn new(builder: SequenceBuilder, listeners: Arc<Listeners>) -> Self {
        let (id, inbox) = listeners.register();
        tracing::debug!("session {:?} opened", id);
        Session { id, builder, inbox, listeners }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Discard any sequence of this session and start an empty one.
    pub fn new_sequence(&mut self) {
        self.builder.new_sequence();
    }

    pub fn sequence(&self) -> Result<&Sequence> {
        self.builder.sequence()
    }

    pub fn human_readable(&self) -> Result<HumanReadable> {
        self.builder.human_readable()
    }

    pub fn human_readable_dds(&self) -> Result<Vec<DdsTransition>> {
        self.builder.human_readable_dds()
    }

    pub fn compile(&self) -> Result<CompiledProgram> {
        self.builder.compile()
    }

    /// Next pending switch notification, if any
    pub fn try_notification(&self) -> Option<SwitchNotification> {
        match self.inbox.try_recv() {
            Ok(n) => Some(n),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// All pending switch notifications
    pub fn notifications(&self) -> Vec<SwitchNotification> {
        self.inbox.try_iter().collect()
    }
}

impl ProgramsTTL for Session {
    fn add_ttl_pulse(&mut self, channel: &str, start: u128, length: u128) -> Result<()> {
        self.builder.add_ttl_pulse(channel, start, length)
    }

    fn add_ttl_pulses(&mut self, pulses: &[(&str, u128, u128)]) -> Result<()> {
        self.builder.add_ttl_pulses(pulses)
    }

    fn extend_length(&mut self, length: u128) -> Result<()> {
        self.builder.extend_length(length)
    }
}

impl ProgramsDDS for Session {
    fn add_dds_pulse(&mut self, pulse: &DdsPulse) -> Result<()> {
        self.builder.add_dds_pulse(pulse)
    }

    fn add_dds_pulses(&mut self, pulses: &[DdsPulse]) -> Result<()> {
        self.builder.add_dds_pulses(pulses)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.listeners.unregister(self.id);
        tracing::debug!("session {:?} closed", self.id);
    }
}
