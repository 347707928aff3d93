//! Read-side bookkeeping for the acquisition ring.
//!
//! The device keeps writing into a fixed-capacity ring whether or not we
//! keep up, so the [`StreamBuffer`] tracks two indices: the write index
//! (frames produced, from a [`WriteCursor`]) and the read index (frames we
//! have physically consumed). Whenever the writer gets more than a ring's
//! worth ahead, the oldest unread frames are gone, and the read index is
//! pushed forward to match. There is no backpressure.

use crate::config::AcquisitionConfig;
use crate::device::{AcquisitionDevice, DeviceError, FrameIndex, RawFrame, WriteCursor};

use log::{debug, warn};
use std::{
    f32::consts::SQRT_2,
    fmt,
    time::{Duration, Instant},
};

/// Converter codes are signed 32-bit, full scale at 2^31.
const CODE_FULL_SCALE: f32 = 2_147_483_648.0;

/// Full scale of the converter input, 2 Vrms differential.
const VRMS_FULL_SCALE: f32 = 2.0;

/// Convert one converter code to volts.
pub fn code_to_voltage(code: i32) -> f32 {
    code as f32 / CODE_FULL_SCALE * (VRMS_FULL_SCALE * SQRT_2)
}

/// Inverse of [`code_to_voltage`], saturating at the converter limits.
pub fn voltage_to_code(volts: f32) -> i32 {
    let code = (volts as f64 / (VRMS_FULL_SCALE as f64 * 2f64.sqrt())) * CODE_FULL_SCALE as f64;
    code.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

/// One side of the microphone pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// First entry of a [`RawFrame`].
    Left,
    /// Second entry of a [`RawFrame`].
    Right,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Left => write!(f, "left"),
            Channel::Right => write!(f, "right"),
        }
    }
}

/// Two synchronized channels of voltages, one entry per frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StereoBlock {
    /// Volts on the left channel.
    pub left: Vec<f32>,
    /// Volts on the right channel.
    pub right: Vec<f32>,
}

impl StereoBlock {
    /// An empty block with room for `frames` frames.
    pub fn with_capacity(frames: usize) -> Self {
        Self {
            left: Vec::with_capacity(frames),
            right: Vec::with_capacity(frames),
        }
    }

    /// Frames in the block.
    pub fn len(&self) -> usize {
        self.left.len()
    }

    /// True when there are no frames.
    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    /// Append raw frames, converting each channel to volts.
    pub fn extend_from_raw(&mut self, frames: &[RawFrame]) {
        for &[l, r] in frames {
            self.left.push(code_to_voltage(l));
            self.right.push(code_to_voltage(r));
        }
    }

    /// The last `n` frames, or everything if there are fewer.
    pub fn tail(&self, n: usize) -> (&[f32], &[f32]) {
        let from = self.len().saturating_sub(n);
        (&self.left[from..], &self.right[from..])
    }
}

/// Counters describing how well the reader kept up with the writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Times the read pointer had to be forced forward.
    pub overruns: u64,
    /// Frames lost to those overruns.
    pub frames_dropped: u64,
    /// Device reads that made no progress.
    pub stalled_reads: u64,
    /// Device reads that returned an error.
    pub device_errors: u64,
}

/// Tracks produced versus consumed frames over a fixed-capacity ring.
///
/// After every operation `read_index <= write_index` and
/// `write_index - read_index <= ring_capacity`.
pub struct StreamBuffer<D, W> {
    device: D,
    cursor: W,
    write_index: FrameIndex,
    read_index: FrameIndex,
    ring_capacity: u64,
    chunk_frames: usize,
    read_timeout: Duration,
    max_stalled_reads: u32,
    read_margin: u64,
    sample_period: Duration,
    scratch: Vec<RawFrame>,
    stats: StreamStats,
}

impl<D, W> StreamBuffer<D, W>
where
    D: AcquisitionDevice,
    W: WriteCursor,
{
    /// Reads from `device`, learning how far it has written from `cursor`.
    pub fn new(device: D, cursor: W, config: &AcquisitionConfig) -> Self {
        Self {
            device,
            cursor,
            write_index: 0,
            read_index: 0,
            ring_capacity: config.ring_capacity,
            chunk_frames: config.chunk_frames.max(1),
            read_timeout: config.read_timeout(),
            max_stalled_reads: config.max_stalled_reads.max(1),
            read_margin: config.read_margin_frames,
            sample_period: Duration::from_secs_f64(1.0 / config.sample_rate_hz.max(1) as f64),
            scratch: vec![[0, 0]; config.chunk_frames.max(1)],
            stats: StreamStats::default(),
        }
    }

    /// Frames consumed so far.
    pub fn read_index(&self) -> FrameIndex {
        self.read_index
    }

    /// Most recent write index observed. Never decreases.
    pub fn write_index(&self) -> FrameIndex {
        self.write_index
    }

    /// Frames the device ring holds.
    pub fn ring_capacity(&self) -> u64 {
        self.ring_capacity
    }

    /// Frames produced but not yet consumed, as of the last refresh.
    pub fn pending(&self) -> u64 {
        self.write_index - self.read_index
    }

    /// Counters so far.
    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// The device being read.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Mutable access to the device being read.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Pull the latest write index from the cursor. A stale cursor value
    /// smaller than what we already know is ignored.
    pub fn refresh_write_index(&mut self) -> FrameIndex {
        self.write_index = self
            .write_index
            .max(self.cursor.write_index())
            .max(self.read_index);
        self.write_index
    }

    /// If the writer is more than a ring ahead, the unread frames it lapped
    /// are lost: move the read index up to the oldest frame still in the
    /// ring. Returns the number of frames dropped.
    pub fn sync_read_pointer(&mut self) -> u64 {
        let write = self.refresh_write_index();
        if write <= self.read_index + self.ring_capacity {
            return 0;
        }

        let oldest = write - self.ring_capacity;
        let dropped = oldest - self.read_index;
        self.read_index = oldest;
        self.stats.overruns += 1;
        self.stats.frames_dropped += dropped;
        warn!(
            "StreamBuffer : overrun, dropped {} frames (read index now {})",
            dropped, self.read_index
        );
        dropped
    }

    /// Consume `frames` frames without converting them. Returns how many
    /// were actually consumed, which is less than asked when the device
    /// stops making progress.
    pub fn discard(&mut self, frames: usize) -> usize {
        let discarded = self.pull(frames, |_| {});
        debug!("StreamBuffer : discarded {}/{} frames", discarded, frames);
        discarded
    }

    /// Consume up to `frames` frames and convert them to volts. A block
    /// shorter than asked means the device timed out or failed.
    pub fn read_frames(&mut self, frames: usize) -> StereoBlock {
        let mut block = StereoBlock::with_capacity(frames);
        let read = self.pull(frames, |raw| block.extend_from_raw(raw));
        if read < frames {
            debug!("StreamBuffer : short read, {}/{} frames", read, frames);
        }
        block
    }

    /// Shared chunked read loop behind [`Self::discard`] and
    /// [`Self::read_frames`].
    fn pull<F>(&mut self, frames: usize, mut sink: F) -> usize
    where
        F: FnMut(&[RawFrame]),
    {
        let mut total = 0;
        let mut stalled = 0;

        while total < frames {
            let want = (frames - total).min(self.chunk_frames);
            self.wait_for(want as u64);

            match self
                .device
                .read_frames(&mut self.scratch[..want], self.read_timeout)
            {
                Ok(0) => {
                    stalled += 1;
                    self.stats.stalled_reads += 1;
                }
                Ok(got) => {
                    let got = got.min(want);
                    sink(&self.scratch[..got]);
                    self.advance(got as u64);
                    total += got;
                    stalled = 0;
                }
                Err(DeviceError::Disconnected) => {
                    warn!("StreamBuffer : device disconnected");
                    self.stats.device_errors += 1;
                    break;
                }
                Err(e) => {
                    warn!("StreamBuffer : device read failed: {}", e);
                    self.stats.device_errors += 1;
                    stalled += 1;
                }
            }

            if stalled >= self.max_stalled_reads {
                warn!(
                    "StreamBuffer : giving up after {} stalled reads, {}/{} frames",
                    stalled, total, frames
                );
                break;
            }
        }

        total
    }

    fn advance(&mut self, frames: u64) {
        self.read_index += frames;
        if self.read_index > self.write_index {
            self.refresh_write_index();
        }
    }

    /// Wait until the writer leads by `frames` plus the safety margin, or
    /// until the read timeout runs out.
    fn wait_for(&mut self, frames: u64) {
        let needed = frames + self.read_margin;
        let deadline = Instant::now() + self.read_timeout;
        loop {
            self.sync_read_pointer();
            let available = self.pending();
            if available >= needed {
                return;
            }

            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let nap = self
                .sample_period
                .mul_f64((needed - available) as f64)
                .min(deadline - now);
            spin_sleep::sleep(nap);
        }
    }
}
