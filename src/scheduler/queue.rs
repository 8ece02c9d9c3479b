//! Bounded, blocking FIFO of buffers and serialized events.
//!
//! The producer blocks when the queue is full and the consumer blocks when
//! it is empty. Flushing wakes both sides with [`FlowError::Flushing`].
//! Only buffers count towards the limits; events are always accepted so
//! that EOS and segment updates cannot get stuck behind a full queue.

use crate::clock::ClockTime;
use crate::error::FlowError;
use crate::event::StreamItem;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// What happens when a buffer arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LeakyMode {
    /// Block until space is available.
    #[default]
    None,
    /// Drop the incoming buffer.
    Upstream,
    /// Drop the oldest queued buffer.
    Downstream,
}

/// Fill limits. A zero limit is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Maximum queued buffers.
    pub max_buffers: usize,
    /// Maximum queued payload bytes.
    pub max_bytes: usize,
    /// Maximum summed buffer duration.
    pub max_time: ClockTime,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_buffers: 200,
            max_bytes: 10 * 1024 * 1024,
            max_time: ClockTime::from_secs(1),
        }
    }
}

/// Counters describing queue operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Buffers currently queued.
    pub current_buffers: usize,
    /// Payload bytes currently queued.
    pub current_bytes: usize,
    /// Summed duration of queued buffers.
    pub current_time: ClockTime,
    /// Buffers accepted so far.
    pub total_pushed: u64,
    /// Buffers handed out so far.
    pub total_popped: u64,
    /// Buffers dropped by a leaky mode.
    pub total_dropped: u64,
}

struct QueueState {
    items: VecDeque<StreamItem>,
    limits: QueueLimits,
    leaky: LeakyMode,
    buffers: usize,
    bytes: usize,
    time: u64,
    total_pushed: u64,
    total_popped: u64,
    total_dropped: u64,
    flushing: bool,
}

impl QueueState {
    fn is_full(&self) -> bool {
        let l = &self.limits;
        (l.max_buffers > 0 && self.buffers >= l.max_buffers)
            || (l.max_bytes > 0 && self.bytes >= l.max_bytes)
            || (l.max_time.nanos() > 0 && self.time >= l.max_time.nanos())
    }

    fn account_in(&mut self, item: &StreamItem) {
        if item.is_buffer() {
            self.buffers += 1;
            self.bytes += item.size();
            self.time += item.duration().to_option().map_or(0, ClockTime::nanos);
        }
    }

    fn account_out(&mut self, item: &StreamItem) {
        if item.is_buffer() {
            self.buffers -= 1;
            self.bytes = self.bytes.saturating_sub(item.size());
            let d = item.duration().to_option().map_or(0, ClockTime::nanos);
            self.time = self.time.saturating_sub(d);
        }
    }

    fn drop_oldest_buffer(&mut self) -> bool {
        match self.items.iter().position(StreamItem::is_buffer) {
            Some(idx) => {
                if let Some(old) = self.items.remove(idx) {
                    self.account_out(&old);
                }
                self.total_dropped += 1;
                true
            }
            None => false,
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// Thread-safe bounded queue, shared by cloning.
#[derive(Clone)]
pub struct DataQueue {
    inner: Arc<Shared>,
}

impl DataQueue {
    /// Create a queue with the given limits and leaky mode.
    pub fn new(limits: QueueLimits, leaky: LeakyMode) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    items: VecDeque::with_capacity(limits.max_buffers.clamp(16, 1024)),
                    limits,
                    leaky,
                    buffers: 0,
                    bytes: 0,
                    time: 0,
                    total_pushed: 0,
                    total_popped: 0,
                    total_dropped: 0,
                    flushing: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        }
    }

    /// Replace the limits. Waiting producers re-check immediately.
    pub fn set_limits(&self, limits: QueueLimits) {
        self.inner.state.lock().unwrap().limits = limits;
        self.inner.not_full.notify_all();
    }

    /// Current limits.
    pub fn limits(&self) -> QueueLimits {
        self.inner.state.lock().unwrap().limits
    }

    /// Replace the leaky mode.
    pub fn set_leaky(&self, leaky: LeakyMode) {
        self.inner.state.lock().unwrap().leaky = leaky;
        self.inner.not_full.notify_all();
    }

    /// Enqueue an item, blocking while full unless leaky.
    pub fn push(&self, item: StreamItem) -> Result<(), FlowError> {
        self.push_timeout(item, None).map(|_| ())
    }

    /// Enqueue with an optional timeout.
    ///
    /// Returns `Ok(false)` when the timeout expired or a leaky queue dropped
    /// the incoming buffer.
    pub fn push_timeout(&self, item: StreamItem, timeout: Option<Duration>) -> Result<bool, FlowError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.flushing {
            return Err(FlowError::Flushing);
        }

        if item.is_buffer() {
            let deadline = timeout.map(|t| Instant::now() + t);
            while state.is_full() && !state.flushing {
                match state.leaky {
                    LeakyMode::None => {
                        state = match deadline {
                            Some(deadline) => {
                                let remaining = deadline.saturating_duration_since(Instant::now());
                                if remaining.is_zero() {
                                    return Ok(false);
                                }
                                self.inner.not_full.wait_timeout(state, remaining).unwrap().0
                            }
                            None => self.inner.not_full.wait(state).unwrap(),
                        };
                    }
                    LeakyMode::Upstream => {
                        state.total_dropped += 1;
                        tracing::trace!("queue full, dropping incoming buffer");
                        return Ok(false);
                    }
                    LeakyMode::Downstream => {
                        if !state.drop_oldest_buffer() {
                            break;
                        }
                        tracing::trace!("queue full, dropped oldest buffer");
                    }
                }
            }
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            state.total_pushed += 1;
        }

        state.account_in(&item);
        state.items.push_back(item);
        self.inner.not_empty.notify_one();
        Ok(true)
    }

    /// Dequeue the next item, blocking while empty.
    pub fn pop(&self) -> Result<StreamItem, FlowError> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            if let Some(item) = state.items.pop_front() {
                return Ok(self.took(&mut state, item));
            }
            state = self.inner.not_empty.wait(state).unwrap();
        }
    }

    /// Dequeue with a timeout. `Ok(None)` when nothing arrived in time.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<StreamItem>, FlowError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.items.is_empty() && !state.flushing {
            state = self.inner.not_empty.wait_timeout(state, timeout).unwrap().0;
        }
        if state.flushing {
            return Err(FlowError::Flushing);
        }
        Ok(state.items.pop_front().map(|item| self.took(&mut state, item)))
    }

    fn took(&self, state: &mut QueueState, item: StreamItem) -> StreamItem {
        state.account_out(&item);
        if item.is_buffer() {
            state.total_popped += 1;
        }
        self.inner.not_full.notify_one();
        item
    }

    /// Enter or leave flushing. Entering wakes every blocked caller.
    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.inner.state.lock().unwrap();
        state.flushing = flushing;
        if flushing {
            self.inner.not_empty.notify_all();
            self.inner.not_full.notify_all();
        }
    }

    /// Whether the queue is flushing.
    pub fn is_flushing(&self) -> bool {
        self.inner.state.lock().unwrap().flushing
    }

    /// Discard every queued item.
    pub fn flush(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.items.clear();
        state.buffers = 0;
        state.bytes = 0;
        state.time = 0;
        self.inner.not_full.notify_all();
    }

    /// Queued items, events included.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a limit is reached.
    pub fn is_full(&self) -> bool {
        self.inner.state.lock().unwrap().is_full()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().unwrap();
        QueueStats {
            current_buffers: state.buffers,
            current_bytes: state.bytes,
            current_time: ClockTime::from_nanos(state.time),
            total_pushed: state.total_pushed,
            total_popped: state.total_popped,
            total_dropped: state.total_dropped,
        }
    }
}

impl std::fmt::Debug for DataQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataQueue").field("stats", &self.stats()).finish()
    }
}
