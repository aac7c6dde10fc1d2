//! Bounded handoff between the stitch stage and the stream sink.
//!
//! The channel favors freshness: when full, `push` evicts the oldest queued
//! frame and keeps the new one, so the sink always works on the most recent
//! panoramas. Every eviction is counted and reported to an `OverflowObserver`.
//! Frames leave in the order they entered; nothing is ever reordered.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::frame::PanoramaFrame;

pub const DEFAULT_CAPACITY: usize = 3;

/// Receives a `ChannelOverflow` for every evicted frame.
pub trait OverflowObserver: Send + Sync {
    fn frame_dropped(&self, event: &PipelineError);
}

/// Default observer: logs the first drop and then every 100th.
#[derive(Debug, Default)]
pub struct LogOverflow;

impl OverflowObserver for LogOverflow {
    fn frame_dropped(&self, event: &PipelineError) {
        if let PipelineError::ChannelOverflow { total_dropped, .. } = event {
            if *total_dropped == 1 || total_dropped % 100 == 0 {
                log::warn!("{}", event);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub pushed: u64,
    pub popped: u64,
    /// Frames evicted to make room for newer ones.
    pub dropped: u64,
    /// Frames refused because the channel was closed.
    pub rejected: u64,
}

struct ChannelState {
    queue: VecDeque<PanoramaFrame>,
    closed: bool,
    stats: ChannelStats,
}

pub struct FrameChannel {
    state: Mutex<ChannelState>,
    ready: Condvar,
    capacity: usize,
    observer: Box<dyn OverflowObserver>,
}

impl FrameChannel {
    pub fn new(capacity: usize) -> Self {
        Self::with_observer(capacity, Box::new(LogOverflow))
    }

    pub fn with_observer(capacity: usize, observer: Box<dyn OverflowObserver>) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(ChannelState {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
                stats: ChannelStats::default(),
            }),
            ready: Condvar::new(),
            capacity,
            observer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a frame, evicting the oldest if full. `false` once closed.
    pub fn push(&self, frame: PanoramaFrame) -> bool {
        let mut evicted = Vec::new();
        {
            let mut state = self.lock();
            if state.closed {
                state.stats.rejected += 1;
                return false;
            }
            while state.queue.len() >= self.capacity {
                if let Some(oldest) = state.queue.pop_front() {
                    state.stats.dropped += 1;
                    evicted.push(PipelineError::ChannelOverflow {
                        dropped_seq: oldest.seq,
                        total_dropped: state.stats.dropped,
                    });
                }
            }
            state.queue.push_back(frame);
            state.stats.pushed += 1;
        }
        self.ready.notify_one();
        for event in &evicted {
            self.observer.frame_dropped(event);
        }
        true
    }

    /// Oldest queued frame, waiting up to `timeout`. `None` on timeout or when
    /// the channel is closed and drained.
    pub fn pop(&self, timeout: Duration) -> Option<PanoramaFrame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.queue.pop_front() {
                state.stats.popped += 1;
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    /// Stop accepting frames and wake any waiting consumer. Queued frames can
    /// still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        self.lock().stats
    }
}

impl Default for FrameChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
