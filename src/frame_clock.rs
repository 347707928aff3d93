//! Frame counting. The hardware only gives us a small wrapping pulse
//! counter, so [`FrameClock`] pages it out to a 64-bit [`FrameIndex`] by
//! counting overflows. [`FrameTally`] is the alternative for producers that
//! push "n frames produced" notifications instead.

use crate::device::{FrameIndex, PulseCounter, WriteCursor};

use log::{debug, error};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Returned by [`FrameClock::begin`] when the counter cannot be configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    /// The underlying pulse counter refused its configuration.
    CounterUnavailable(String),
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockError::CounterUnavailable(msg) => {
                write!(f, "pulse counter unavailable: {}", msg)
            }
        }
    }
}

impl std::error::Error for ClockError {}

/// A monotonic frame counter built on top of a wrapping [`PulseCounter`].
///
/// `get() = overflow_pages * range + counter`. The overflow page count is
/// bumped from the interrupt side through [`FrameClock::on_overflow`] and
/// read from the consumer side without locking.
pub struct FrameClock {
    counter: Arc<dyn PulseCounter>,
    overflow_pages: AtomicU64,
}

impl FrameClock {
    /// A clock over `counter`. Call [`begin`](Self::begin) before reading it.
    pub fn new(counter: Arc<dyn PulseCounter>) -> Self {
        Self {
            counter,
            overflow_pages: AtomicU64::new(0),
        }
    }

    /// Configure the counter and start from zero. No retries; if this fails
    /// the caller should abort initialization.
    pub fn begin(&self) -> Result<(), ClockError> {
        if let Err(msg) = self.counter.configure() {
            error!("FrameClock : counter configuration failed: {}", msg);
            return Err(ClockError::CounterUnavailable(msg));
        }
        self.clear();
        debug!("FrameClock : started, range {}", self.counter.range());
        Ok(())
    }

    /// Reset both the overflow pages and the hardware counter.
    pub fn clear(&self) {
        self.overflow_pages.store(0, Ordering::Relaxed);
        self.counter.clear();
    }

    /// Current frame index. Safe to call from outside the interrupt context.
    pub fn get(&self) -> FrameIndex {
        let range = self.counter.range() as u64;
        loop {
            let pages = self.overflow_pages.load(Ordering::Acquire);
            let count = self.counter.count() as u64;
            // An overflow landed between the two loads, try again
            if self.overflow_pages.load(Ordering::Acquire) == pages {
                return pages * range + count;
            }
        }
    }

    /// Called from the counter's high-limit interrupt.
    pub fn on_overflow(&self) {
        self.overflow_pages.fetch_add(1, Ordering::Release);
    }
}

impl WriteCursor for FrameClock {
    fn write_index(&self) -> FrameIndex {
        self.get()
    }
}

/// Write index for producers that notify the consumer of how many frames
/// they have just produced, rather than exposing a hardware counter.
#[derive(Debug, Default)]
pub struct FrameTally {
    produced: AtomicU64,
}

impl FrameTally {
    /// Nothing produced yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `frames` more frames are now available.
    pub fn notify(&self, frames: u64) {
        self.produced.fetch_add(frames, Ordering::Release);
    }
}

impl WriteCursor for FrameTally {
    fn write_index(&self) -> FrameIndex {
        self.produced.load(Ordering::Acquire)
    }
}
