//! Turns "something happened at frame T" into "here are the N frames
//! starting at T".
//!
//! A trigger only snapshots the write index. The next fetch works out how
//! far behind the trigger the reader is, discards up to it (keeping the last
//! stretch before it as a noise sample) and reads the capture. If the
//! reader is already past the trigger there is nothing to discard, and the
//! capture reports how late it starts instead.

use crate::device::{AcquisitionDevice, FrameIndex, WriteCursor};
use crate::stream_buffer::{StereoBlock, StreamBuffer};

use log::{debug, warn};
use std::fmt;

/// Why no capture was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// Fetch was called before any trigger.
    NotTriggered,
    /// The device delivered fewer frames than a capture needs.
    ShortCapture {
        /// Frames delivered.
        got: usize,
        /// Frames a capture needs.
        wanted: usize,
    },
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::NotTriggered => write!(f, "no trigger to align to"),
            AcquireError::ShortCapture { got, wanted } => {
                write!(f, "short capture, got {} of {} frames", got, wanted)
            }
        }
    }
}

impl std::error::Error for AcquireError {}

/// Where the aligner is in its trigger cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignState {
    /// A trigger fired since the last alignment; the next fetch realigns.
    Armed,
    /// Realignment for the current trigger is done.
    Aligned,
}

/// Frames delivered for one trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    /// Write index when the trigger fired.
    pub trigger_index: FrameIndex,
    /// Global index of `signal`'s first frame.
    pub first_frame: FrameIndex,
    /// `first_frame - trigger_index`. Positive when the capture starts late,
    /// negative when a capped discard left it short of the trigger.
    pub offset_frames: i64,
    /// The frames themselves.
    pub signal: StereoBlock,
    /// Frames read just before the trigger, when there were any to read.
    pub noise: Option<StereoBlock>,
    /// Frames lost to overruns while the capture was being read.
    pub frames_lost: u64,
}

impl Capture {
    /// Frames in `signal`.
    pub fn frames(&self) -> usize {
        self.signal.len()
    }
}

/// Cuts the frames following each trigger out of the stream.
pub struct TriggerAligner {
    state: AlignState,
    trigger_index: Option<FrameIndex>,
    noise_frames: usize,
}

impl TriggerAligner {
    /// `noise_frames` is how many pre-trigger frames to keep as a noise
    /// sample instead of discarding them.
    pub fn new(noise_frames: usize) -> Self {
        Self {
            state: AlignState::Aligned,
            trigger_index: None,
            noise_frames,
        }
    }

    /// Current state.
    pub fn state(&self) -> AlignState {
        self.state
    }

    /// The pending or last trigger, if any.
    pub fn trigger_index(&self) -> Option<FrameIndex> {
        self.trigger_index
    }

    /// True while a trigger is waiting for its fetch. Nothing may discard
    /// past the trigger point in that window.
    pub fn is_armed(&self) -> bool {
        self.state == AlignState::Armed
    }

    /// Record the trigger instant. Replaces any earlier pending trigger.
    pub fn trigger(&mut self, write_index: FrameIndex) {
        if self.is_armed() {
            debug!("TriggerAligner : replacing unfetched trigger");
        }
        self.trigger_index = Some(write_index);
        self.state = AlignState::Armed;
    }

    /// Deliver `frames` frames, starting at the trigger if the reader has
    /// not passed it yet.
    pub fn align_and_fetch<D, W>(
        &mut self,
        stream: &mut StreamBuffer<D, W>,
        frames: usize,
    ) -> Result<Capture, AcquireError>
    where
        D: AcquisitionDevice,
        W: WriteCursor,
    {
        let trigger_index = self.trigger_index.ok_or(AcquireError::NotTriggered)?;

        let mut noise = None;
        if self.is_armed() {
            noise = self.align(stream, trigger_index);
            self.state = AlignState::Aligned;
        }

        let dropped_before = stream.stats().frames_dropped;
        stream.sync_read_pointer();
        let first_frame = stream.read_index();
        let signal = stream.read_frames(frames);
        let frames_lost = stream.stats().frames_dropped - dropped_before;
        if frames_lost > 0 {
            warn!("TriggerAligner : capture lost {} frames to overrun", frames_lost);
        }

        let offset_frames = first_frame as i64 - trigger_index as i64;
        debug!(
            "TriggerAligner : captured {} frames from {} (offset {})",
            signal.len(),
            first_frame,
            offset_frames
        );

        Ok(Capture {
            trigger_index,
            first_frame,
            offset_frames,
            signal,
            noise,
            frames_lost,
        })
    }

    /// Discard up to the trigger, returning the frames just before it.
    fn align<D, W>(&self, stream: &mut StreamBuffer<D, W>, trigger_index: FrameIndex) -> Option<StereoBlock>
    where
        D: AcquisitionDevice,
        W: WriteCursor,
    {
        stream.sync_read_pointer();
        let read_index = stream.read_index();
        if read_index > trigger_index {
            debug!(
                "TriggerAligner : trigger passed {} frames ago",
                read_index - trigger_index
            );
            return None;
        }

        let mut needed = trigger_index - read_index;
        if needed > stream.ring_capacity() {
            warn!(
                "TriggerAligner : trigger is {} frames back, only {} are kept",
                needed,
                stream.ring_capacity()
            );
            needed = stream.ring_capacity();
        }

        let keep = (self.noise_frames as u64).min(needed);
        stream.discard((needed - keep) as usize);
        if keep == 0 {
            return None;
        }
        Some(stream.read_frames(keep as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcquisitionConfig;
    use crate::device::testing::{frame_of, IndexedDevice};
    use crate::frame_clock::FrameTally;
    use std::sync::Arc;

    fn setup(capacity: u64) -> (IndexedDevice, StreamBuffer<IndexedDevice, Arc<FrameTally>>) {
        let config = AcquisitionConfig {
            ring_capacity: capacity,
            chunk_frames: 32,
            read_timeout_ms: 1,
            ..AcquisitionConfig::default()
        };
        let device = IndexedDevice::new(capacity as usize);
        let stream = StreamBuffer::new(device.clone(), device.tally(), &config);
        (device, stream)
    }

    #[test]
    fn fetch_without_trigger_fails() {
        let (device, mut stream) = setup(256);
        device.produce(100);
        let mut aligner = TriggerAligner::new(16);
        assert_eq!(
            aligner.align_and_fetch(&mut stream, 10),
            Err(AcquireError::NotTriggered)
        );
    }

    #[test]
    fn capture_starts_at_the_trigger() {
        let (device, mut stream) = setup(256);
        let mut aligner = TriggerAligner::new(16);

        device.produce(100);
        aligner.trigger(stream.refresh_write_index());
        assert!(aligner.is_armed());
        device.produce(150);

        let capture = aligner.align_and_fetch(&mut stream, 50).unwrap();
        assert_eq!(capture.trigger_index, 100);
        assert_eq!(capture.first_frame, 100);
        assert_eq!(capture.offset_frames, 0);
        assert_eq!(capture.frames(), 50);
        assert_eq!(frame_of(capture.signal.left[0]), 100);
        assert_eq!(frame_of(capture.signal.left[49]), 149);

        let noise = capture.noise.unwrap();
        assert_eq!(noise.len(), 16);
        assert_eq!(frame_of(noise.left[0]), 84);
        assert_eq!(frame_of(noise.left[15]), 99);
        assert_eq!(aligner.state(), AlignState::Aligned);
    }

    #[test]
    fn late_fetch_reports_exact_offset() {
        let (device, mut stream) = setup(256);
        let mut aligner = TriggerAligner::new(16);

        device.produce(300);
        aligner.trigger(stream.refresh_write_index());
        device.produce(700);

        // The ring has lapped the trigger; the oldest frame left is 744
        let capture = aligner.align_and_fetch(&mut stream, 20).unwrap();
        assert_eq!(capture.first_frame, 744);
        assert_eq!(capture.offset_frames, 744 - 300);
        assert!(capture.noise.is_none());
        assert_eq!(frame_of(capture.signal.left[0]), 744);
    }

    #[test]
    fn second_fetch_continues_without_discarding() {
        let (device, mut stream) = setup(256);
        let mut aligner = TriggerAligner::new(0);

        device.produce(40);
        aligner.trigger(stream.refresh_write_index());
        device.produce(100);

        let first = aligner.align_and_fetch(&mut stream, 30).unwrap();
        assert_eq!(first.offset_frames, 0);
        assert!(first.noise.is_none());

        let second = aligner.align_and_fetch(&mut stream, 30).unwrap();
        assert_eq!(second.first_frame, 70);
        assert_eq!(second.offset_frames, 30);
        assert_eq!(frame_of(second.signal.left[0]), 70);
    }

    #[test]
    fn new_trigger_realigns() {
        let (device, mut stream) = setup(256);
        let mut aligner = TriggerAligner::new(8);

        device.produce(50);
        aligner.trigger(stream.refresh_write_index());
        device.produce(60);
        aligner.align_and_fetch(&mut stream, 20).unwrap();

        aligner.trigger(stream.refresh_write_index());
        device.produce(40);
        let capture = aligner.align_and_fetch(&mut stream, 20).unwrap();
        assert_eq!(capture.trigger_index, 110);
        assert_eq!(capture.offset_frames, 0);
        assert_eq!(frame_of(capture.signal.left[0]), 110);
    }

    #[test]
    fn capped_discard_surfaces_the_shortfall() {
        let (device, mut stream) = setup(256);
        let mut aligner = TriggerAligner::new(0);
        device.produce(200);

        // Stamped further ahead than one ring; the discard is capped and then
        // runs dry, so the capture cannot reach the trigger
        aligner.trigger(1000);

        let capture = aligner.align_and_fetch(&mut stream, 10).unwrap();
        assert_eq!(capture.first_frame, 200);
        assert_eq!(capture.offset_frames, -800);
        assert_eq!(stream.read_index(), 200);
    }
}
