//! Lifecycle shared by every pipeline stage.
//!
//! ```text
//! Uninitialized -> Initialized -> Opened -> Running <-> Paused
//!                                    \         |
//!                                     `---> Stopped -> Closed
//! ```
//!
//! A transition is entered with a compare-and-swap on the phase word that
//! also sets a busy bit, so two threads racing on the same transition are
//! serialized and the loser is rejected instead of running it twice.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{PipelineError, Result};
use crate::message::Message;
use crate::pad::{PadGraph, PadId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Phase {
    Uninitialized = 0,
    Initialized = 1,
    Opened = 2,
    Running = 3,
    Paused = 4,
    Stopped = 5,
    Closed = 6,
}

impl Phase {
    fn from_bits(v: u8) -> Phase {
        match v & !BUSY {
            0 => Phase::Uninitialized,
            1 => Phase::Initialized,
            2 => Phase::Opened,
            3 => Phase::Running,
            4 => Phase::Paused,
            5 => Phase::Stopped,
            _ => Phase::Closed,
        }
    }

    /// Whether the worker thread of a component in this phase is alive.
    pub fn has_worker(&self) -> bool {
        matches!(self, Phase::Running | Phase::Paused)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Initialized => "initialized",
            Phase::Opened => "opened",
            Phase::Running => "running",
            Phase::Paused => "paused",
            Phase::Stopped => "stopped",
            Phase::Closed => "closed",
        };
        f.write_str(s)
    }
}

const BUSY: u8 = 0x80;

pub struct Lifecycle {
    name: String,
    phase: AtomicU8,
    last_error: Mutex<Option<String>>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: AtomicU8::new(Phase::Uninitialized as u8),
            last_error: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current stable phase. While a transition is in flight this is the
    /// phase it started from.
    pub fn phase(&self) -> Phase {
        Phase::from_bits(self.phase.load(Ordering::Acquire))
    }

    pub fn is_transitioning(&self) -> bool {
        self.phase.load(Ordering::Acquire) & BUSY != 0
    }

    /// Enters the transition to `to` if the current phase is one of `from`.
    pub fn begin(&self, from: &[Phase], to: Phase) -> Result<Transition<'_>> {
        let cur = self.phase.load(Ordering::Acquire);
        let cur_phase = Phase::from_bits(cur);
        if cur & BUSY != 0 || !from.contains(&cur_phase) {
            return Err(self.reject(cur_phase, to, cur & BUSY != 0));
        }
        match self
            .phase
            .compare_exchange(cur, cur | BUSY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(Transition {
                lifecycle: self,
                from: cur_phase,
                to,
                done: false,
            }),
            Err(_) => Err(self.reject(cur_phase, to, true)),
        }
    }

    fn reject(&self, from: Phase, to: Phase, busy: bool) -> PipelineError {
        if busy {
            log::warn!("{}: {from} -> {to} rejected, another transition is in flight", self.name);
        } else {
            log::warn!("{}: {from} -> {to} rejected", self.name);
        }
        PipelineError::InvalidTransition {
            component: self.name.clone(),
            from,
            to,
        }
    }

    pub fn record_error(&self, error: impl fmt::Display) {
        let msg = error.to_string();
        log::error!("{}: {msg}", self.name);
        *self.last_error.lock() = Some(msg);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn clear_error(&self) {
        self.last_error.lock().take();
    }
}

/// An in-flight phase change. Dropping it without `commit` restores the
/// phase it started from.
#[must_use]
pub struct Transition<'a> {
    lifecycle: &'a Lifecycle,
    from: Phase,
    to: Phase,
    done: bool,
}

impl Transition<'_> {
    pub fn from(&self) -> Phase {
        self.from
    }

    pub fn commit(self) {
        let to = self.to;
        self.commit_as(to);
    }

    /// Finishes the transition in a phase other than the requested one.
    pub fn commit_as(mut self, phase: Phase) {
        self.lifecycle.phase.store(phase as u8, Ordering::Release);
        log::debug!("{}: {} -> {phase}", self.lifecycle.name, self.from);
        self.done = true;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.lifecycle
                .phase
                .store(self.from as u8, Ordering::Release);
            log::debug!(
                "{}: {} -> {} failed, back to {}",
                self.lifecycle.name,
                self.from,
                self.to,
                self.from
            );
        }
    }
}

/// Common protocol of every stage.
///
/// All methods take `&self`; components are shared between the graph, their
/// own threads and the owner that drives them.
pub trait Component: Send + Sync {
    fn name(&self) -> &str;
    fn phase(&self) -> Phase;

    /// Creates pads.
    fn init(&self) -> Result<()>;
    /// Allocates backend resources.
    fn open(&self) -> Result<()>;
    /// Spawns the worker.
    fn start(&self) -> Result<()>;
    fn pause(&self, paused: bool) -> Result<()>;
    /// Produces STOP downstream, joins the worker and purges queued input.
    fn stop(&self) -> Result<()>;
    /// Releases backend resources and destroys pads.
    fn close(&self) -> Result<()>;
    /// Reopens the backend with the same configuration, keeping pads.
    fn reset(&self) -> Result<()>;

    fn last_error(&self) -> Option<String>;
}

/// Stage that emits compressed packets.
pub trait PacketProducer {
    fn packet_output(&self, stream_index: usize) -> Option<PadId>;
}

pub trait PacketConsumer {
    fn packet_input(&self) -> Option<PadId>;
}

/// Stage that emits decoded frames.
pub trait FrameProducer {
    fn frame_output(&self) -> Option<PadId>;
}

pub trait FrameConsumer {
    fn frame_input(&self) -> Option<PadId>;
}

/// Stage that emits presentable framebuffers.
pub trait FramebufferProducer {
    fn framebuffer_output(&self) -> Option<PadId>;
}

pub fn link(graph: &PadGraph, output: Option<PadId>, input: Option<PadId>) -> Result<()> {
    match (output, input) {
        (Some(o), Some(i)) => graph.connect(o, i),
        _ => Err(PipelineError::PadLink(
            "component not initialized".to_string(),
        )),
    }
}

/// Reported by component threads to whoever drives the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentEvent {
    Failed { component: String, error: String },
    EndOfStream { component: String },
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<ComponentEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<ComponentEvent>;

pub(crate) fn notify(events: &Option<EventSender>, event: ComponentEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// How long `OutputGate::shut` lets in-flight deliveries finish before it
/// interrupts the consumers they are blocked on.
const INTERRUPT_AFTER: Duration = Duration::from_millis(20);

#[derive(Default)]
struct GateState {
    open: bool,
    in_flight: usize,
}

/// Orders what a component's threads produce against its own `stop`.
///
/// Worker and fetcher threads produce through the gate. `shut` closes it and
/// waits until no delivery is in flight, so the STOP that follows is the
/// last message on every output pad. Nothing produced after `shut` goes out
/// until the gate is opened again.
#[derive(Default)]
pub struct OutputGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl OutputGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.state.lock().open = true;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Starts a delivery, or `None` once the gate is shut. `shut` waits for
    /// the returned guard to drop.
    pub fn enter(&self) -> Option<Delivery<'_>> {
        let mut state = self.state.lock();
        if !state.open {
            return None;
        }
        state.in_flight += 1;
        Some(Delivery { gate: self })
    }

    /// Produces `message` on `pad` unless the gate is shut. Returns whether
    /// the message went out.
    pub fn produce(&self, graph: &PadGraph, pad: PadId, message: Message) -> bool {
        match self.enter() {
            Some(_delivery) => {
                graph.produce(pad, message);
                true
            }
            None => {
                log::trace!("{} after stop dropped on {pad}", message.action());
                false
            }
        }
    }

    /// Closes the gate and waits for in-flight deliveries. A delivery still
    /// blocked after a short grace period has its consumers on `pads`
    /// interrupted.
    pub fn shut(&self, graph: &PadGraph, pads: &[PadId]) {
        let mut state = self.state.lock();
        state.open = false;
        while state.in_flight > 0 {
            if self.idle.wait_for(&mut state, INTERRUPT_AFTER).timed_out() && state.in_flight > 0 {
                MutexGuard::unlocked(&mut state, || {
                    for pad in pads {
                        graph.interrupt(*pad);
                    }
                });
            }
        }
    }
}

/// One delivery in flight through an [`OutputGate`].
pub struct Delivery<'a> {
    gate: &'a OutputGate,
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.idle.notify_all();
        }
    }
}

/// A named OS thread whose closure hands back what it owned when it exits.
pub struct Worker<T> {
    name: String,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> Worker<T> {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let name = name.into();
        let handle = std::thread::Builder::new().name(name.clone()).spawn(f)?;
        log::debug!("{name}: thread started");
        Ok(Self { name, handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Joins the thread. `None` if it panicked.
    pub fn join(self) -> Option<T> {
        match self.handle.join() {
            Ok(v) => {
                log::debug!("{}: thread joined", self.name);
                Some(v)
            }
            Err(_) => {
                log::error!("{}: thread panicked", self.name);
                None
            }
        }
    }
}

/// Sequence counter with a condition variable, used where a thread has to
/// wait for "something changed" on another thread.
#[derive(Default)]
pub struct Signal {
    seq: Mutex<u64>,
    cv: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        *self.seq.lock() += 1;
        self.cv.notify_all();
    }

    pub fn current(&self) -> u64 {
        *self.seq.lock()
    }

    /// Waits until the counter moves past `seen` or `timeout` elapses.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut seq = self.seq.lock();
        while *seq == seen {
            if self.cv.wait_until(&mut seq, deadline).timed_out() {
                break;
            }
        }
        *seq
    }
}

#[cfg(test)]
#[path = "component_test.rs"]
mod component_test;
