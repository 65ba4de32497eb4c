//! Presentation timing: a pausable render clock and the lookahead queue that
//! decides which framebuffer is on screen.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::mapper::TimedFramebuffer;

/// Monotonic time since an arbitrary, fixed origin.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Duration;
}

pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Time that only moves when told to.
#[derive(Default)]
pub struct ManualTime {
    now: Mutex<Duration>,
}

impl ManualTime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, now: Duration) {
        let mut current = self.now.lock();
        if now >= *current {
            *current = now;
        }
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

#[derive(Debug, Default)]
struct ClockState {
    /// Set while running and not paused.
    resumed_at: Option<Duration>,
    /// Time accumulated before the last pause.
    offset: Duration,
    running: bool,
}

/// Elapsed playback time in microseconds. Frozen while paused, zero while
/// stopped.
pub struct RenderClock {
    source: Arc<dyn TimeSource>,
    state: Mutex<ClockState>,
}

impl RenderClock {
    pub fn new() -> Self {
        Self::with_source(Arc::new(MonotonicTime::new()))
    }

    pub fn with_source(source: Arc<dyn TimeSource>) -> Self {
        Self {
            source,
            state: Mutex::new(ClockState::default()),
        }
    }

    /// Restarts from zero.
    pub fn start(&self) {
        let mut s = self.state.lock();
        s.resumed_at = Some(self.source.now());
        s.offset = Duration::ZERO;
        s.running = true;
    }

    pub fn stop(&self) {
        *self.state.lock() = ClockState::default();
    }

    pub fn pause(&self, paused: bool) {
        let now = self.source.now();
        let mut s = self.state.lock();
        if !s.running {
            return;
        }
        match (paused, s.resumed_at) {
            (true, Some(at)) => {
                s.offset += now.saturating_sub(at);
                s.resumed_at = None;
            }
            (false, None) => s.resumed_at = Some(now),
            _ => {}
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn is_paused(&self) -> bool {
        let s = self.state.lock();
        s.running && s.resumed_at.is_none()
    }

    pub fn elapsed(&self) -> Duration {
        let now = self.source.now();
        let s = self.state.lock();
        match s.resumed_at {
            Some(at) => s.offset + now.saturating_sub(at),
            None => s.offset,
        }
    }

    pub fn timestamp(&self) -> i64 {
        i64::try_from(self.elapsed().as_micros()).unwrap_or(i64::MAX)
    }
}

impl Default for RenderClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Short lookahead of framebuffers waiting for their presentation time.
///
/// The head is presented once the clock reaches it. A frame is dropped as
/// late when the frame behind it is already due; the newest frame is never
/// dropped.
pub struct PresentQueue {
    depth: usize,
    frames: VecDeque<TimedFramebuffer>,
    presented: u64,
    dropped: u64,
}

impl PresentQueue {
    pub const MIN_DEPTH: usize = 2;

    pub fn new(depth: usize) -> Self {
        let depth = depth.max(Self::MIN_DEPTH);
        Self {
            depth,
            frames: VecDeque::with_capacity(depth),
            presented: 0,
            dropped: 0,
        }
    }

    /// Queues `frame`, handing it back when the lookahead is full.
    pub fn push(&mut self, frame: TimedFramebuffer) -> Result<(), TimedFramebuffer> {
        if self.is_full() {
            return Err(frame);
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// Next framebuffer to put on screen, if one is due.
    pub fn poll(&mut self, clock: &RenderClock) -> Option<TimedFramebuffer> {
        let now = clock.timestamp();
        while self.frames.len() >= 2 && self.frames[1].timestamp <= now {
            if let Some(late) = self.frames.pop_front() {
                self.dropped += 1;
                log::warn!(
                    "late frame dropped: due at {}us, clock at {now}us",
                    late.timestamp
                );
            }
        }
        if self.frames.front()?.timestamp > now {
            return None;
        }
        let next = self.frames.pop_front()?;
        self.presented += 1;
        Some(next)
    }

    /// Time until the head is due, zero when it already is.
    pub fn next_due(&self, clock: &RenderClock) -> Option<Duration> {
        let head = self.frames.front()?;
        let wait = head.timestamp.saturating_sub(clock.timestamp()).max(0);
        Some(Duration::from_micros(wait as u64))
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.depth
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
#[path = "clock_test.rs"]
mod clock_test;
