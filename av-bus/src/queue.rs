//! Bounded blocking queue placed in front of every component worker.
//!
//! One mutex guards the items; producers wait on `not_full`, the consumer
//! waits on `not_empty`. A full queue blocks `push`, which is how a slow
//! stage throttles the stage in front of it. `close` wakes every waiter so
//! shutdown never hangs on a full or empty queue.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

pub enum PushError<T> {
    Closed(T),
    Timeout(T),
    /// A blocked push was abandoned through [`BoundedQueue::interrupt_pushes`].
    Interrupted(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(t) | Self::Timeout(t) | Self::Interrupted(t) => t,
        }
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("Closed(..)"),
            Self::Timeout(_) => f.write_str("Timeout(..)"),
            Self::Interrupted(_) => f.write_str("Interrupted(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    Timeout,
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    paused: bool,
    // Bumped by `interrupt_pushes`; a waiting push gives up when it moves.
    interrupts: u64,
}

pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                paused: false,
                interrupts: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Appends an item, blocking while the queue is full.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        let interrupts = state.interrupts;
        while state.items.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
            if state.interrupts != interrupts {
                return Err(PushError::Interrupted(item));
            }
        }
        if state.closed {
            return Err(PushError::Closed(item));
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), PushError<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let interrupts = state.interrupts;
        while state.items.len() >= self.capacity && !state.closed {
            let timed_out = self.not_full.wait_until(&mut state, deadline).timed_out();
            if state.interrupts != interrupts {
                return Err(PushError::Interrupted(item));
            }
            if timed_out
                && state.items.len() >= self.capacity
                && !state.closed
            {
                return Err(PushError::Timeout(item));
            }
        }
        if state.closed {
            return Err(PushError::Closed(item));
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        self.push_timeout(item, Duration::ZERO)
    }

    /// Removes the oldest item, blocking while the queue is empty or paused.
    pub fn pop(&self) -> Result<T, PopError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PopError::Closed);
            }
            if !state.paused {
                if let Some(item) = state.items.pop_front() {
                    self.not_full.notify_one();
                    return Ok(item);
                }
            }
            self.not_empty.wait(&mut state);
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, PopError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PopError::Closed);
            }
            if !state.paused {
                if let Some(item) = state.items.pop_front() {
                    self.not_full.notify_one();
                    return Ok(item);
                }
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                if state.closed {
                    return Err(PopError::Closed);
                }
                if !state.paused {
                    if let Some(item) = state.items.pop_front() {
                        self.not_full.notify_one();
                        return Ok(item);
                    }
                }
                return Err(PopError::Timeout);
            }
        }
    }

    /// Suspends or resumes dequeuing. Producers are unaffected until the queue fills.
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        state.paused = paused;
        if !paused {
            self.not_empty.notify_all();
        }
    }

    /// Drops every queued item and returns how many were discarded.
    pub fn purge(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.items.len();
        state.items.clear();
        self.not_full.notify_all();
        n
    }

    /// Makes every push currently blocked on a full queue return
    /// `Interrupted`. Later pushes are unaffected.
    pub fn interrupt_pushes(&self) {
        let mut state = self.state.lock();
        state.interrupts += 1;
        self.not_full.notify_all();
    }

    /// Wakes every waiter; subsequent pushes and pops fail until `reopen`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn reopen(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.closed = false;
        state.paused = false;
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
