//! The boundary between the localization core and whatever hardware is
//! producing samples. The core only ever talks to the traits in here, so
//! the same pipeline runs against the I2S peripheral, the simulator in
//! [`crate::sim_device`], or a test double.

use std::{fmt, time::Duration};

/// Count of stereo frames produced since the acquisition device started.
pub type FrameIndex = u64;

/// One undecoded stereo frame, `[left, right]`, as 32-bit converter codes.
pub type RawFrame = [i32; 2];

/// Errors reported by an [`AcquisitionDevice`] read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Nothing arrived before the timeout elapsed.
    Timeout,
    /// The device went away; no further frames will arrive.
    Disconnected,
    /// Anything else the driver wants to tell us about.
    Driver(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Timeout => write!(f, "device read timed out"),
            DeviceError::Disconnected => write!(f, "device disconnected"),
            DeviceError::Driver(msg) => write!(f, "driver error: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}

/// `AcquisitionDevice`
///
/// A blocking source of raw stereo frames. Implementations fill as much of
/// `buf` as they can before `timeout` elapses and return how many frames
/// were written; returning fewer than requested is a normal short read.
pub trait AcquisitionDevice {
    /// Fill `buf` from the front, waiting at most `timeout`.
    fn read_frames(&mut self, buf: &mut [RawFrame], timeout: Duration)
        -> Result<usize, DeviceError>;
}

/// Anything that knows how many frames the producer has written so far.
///
/// Written only by the producer side and read by the consumer with relaxed
/// semantics; a stale value must never be larger than the true count.
pub trait WriteCursor {
    /// Frames written since the producer started.
    fn write_index(&self) -> FrameIndex;
}

impl<T: WriteCursor + ?Sized> WriteCursor for std::sync::Arc<T> {
    fn write_index(&self) -> FrameIndex {
        (**self).write_index()
    }
}

/// A small wrapping hardware pulse counter, one pulse per frame clock edge.
/// The counter resets to zero when it reaches [`PulseCounter::range`] and
/// whoever owns it is expected to report that overflow to a
/// [`crate::frame_clock::FrameClock`].
pub trait PulseCounter: Send + Sync {
    /// Configure and start the counter. Fails if the resource is unavailable.
    fn configure(&self) -> Result<(), String>;
    /// Current value, always `< range()`.
    fn count(&self) -> u32;
    /// Reset the counter value to zero.
    fn clear(&self);
    /// Number of distinct counter values before it wraps.
    fn range(&self) -> u32;
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory device whose frames carry their own global index, so
    //! tests can tell exactly which frame they were handed.

    use super::*;
    use crate::frame_clock::FrameTally;
    use crate::stream_buffer::voltage_to_code;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    struct Ring {
        frames: VecDeque<RawFrame>,
        capacity: usize,
        produced: u64,
    }

    /// Holds only the newest `capacity` frames, like DMA. Frame `i` is
    /// `[i, -i]`.
    #[derive(Clone)]
    pub struct IndexedDevice {
        ring: Arc<Mutex<Ring>>,
        tally: Arc<FrameTally>,
    }

    impl IndexedDevice {
        pub fn new(capacity: usize) -> Self {
            Self {
                ring: Arc::new(Mutex::new(Ring {
                    frames: VecDeque::new(),
                    capacity,
                    produced: 0,
                })),
                tally: Arc::new(FrameTally::new()),
            }
        }

        pub fn tally(&self) -> Arc<FrameTally> {
            self.tally.clone()
        }

        pub fn produce(&self, n: usize) {
            let mut ring = self.ring.lock().unwrap();
            for _ in 0..n {
                let index = ring.produced as i32;
                ring.frames.push_back([index, -index]);
                ring.produced += 1;
                if ring.frames.len() > ring.capacity {
                    ring.frames.pop_front();
                }
            }
            self.tally.notify(n as u64);
        }
    }

    impl AcquisitionDevice for IndexedDevice {
        fn read_frames(&mut self, buf: &mut [RawFrame], _: Duration) -> Result<usize, DeviceError> {
            let mut ring = self.ring.lock().unwrap();
            let n = buf.len().min(ring.frames.len());
            for slot in buf.iter_mut().take(n) {
                *slot = ring.frames.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    /// Recover the global frame index from a converted left-channel sample.
    pub fn frame_of(volts: f32) -> i64 {
        voltage_to_code(volts) as i64
    }
}
