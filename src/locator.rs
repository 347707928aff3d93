//! One measurement cycle, end to end: keep up with the converter while
//! idle, stamp a trigger, fetch the capture that follows it and solve it.
//!
//! The [`Locator`] owns the acquisition side ([`StreamBuffer`] and
//! [`TriggerAligner`]) and the analysis side ([`LocalizationSolver`]) side by
//! side. The only thing that crosses between them is a [`Capture`].

use crate::config::{AcquisitionConfig, LocatorConfig};
use crate::device::{AcquisitionDevice, FrameIndex};
use crate::frame_clock::{ClockError, FrameClock};
use crate::solver::{Fix, LocalizationSolver, SolveError};
use crate::stream_buffer::{StreamBuffer, StreamStats};
use crate::trigger_aligner::{AcquireError, Capture, TriggerAligner};

use log::{debug, info, warn};
use std::{fmt, sync::Arc};

/// Why a measurement cycle ended without a fix.
#[derive(Debug, Clone, PartialEq)]
pub enum LocateError {
    /// No complete capture.
    Acquire(AcquireError),
    /// The capture could not be solved.
    Solve(SolveError),
}

impl fmt::Display for LocateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocateError::Acquire(e) => write!(f, "acquisition failed: {}", e),
            LocateError::Solve(e) => write!(f, "solve failed: {}", e),
        }
    }
}

impl std::error::Error for LocateError {}

impl From<AcquireError> for LocateError {
    fn from(value: AcquireError) -> Self {
        LocateError::Acquire(value)
    }
}

impl From<SolveError> for LocateError {
    fn from(value: SolveError) -> Self {
        LocateError::Solve(value)
    }
}

/// Runs measurement cycles on one device: trigger, capture, solve.
pub struct Locator<D> {
    clock: Arc<FrameClock>,
    stream: StreamBuffer<D, Arc<FrameClock>>,
    aligner: TriggerAligner,
    solver: LocalizationSolver,
    acquisition: AcquisitionConfig,
}

impl<D> Locator<D>
where
    D: AcquisitionDevice,
{
    /// `clock` must be the frame clock counting `device`'s frames.
    pub fn new(device: D, clock: Arc<FrameClock>, config: &LocatorConfig) -> Self {
        let acquisition = config.acquisition.clone();
        Self {
            stream: StreamBuffer::new(device, clock.clone(), &acquisition),
            clock,
            aligner: TriggerAligner::new(acquisition.noise_frames),
            solver: LocalizationSolver::new(config),
            acquisition,
        }
    }

    /// Start the frame clock and throw away the converter's settling time.
    pub fn begin(&mut self) -> Result<(), ClockError> {
        self.clock.begin()?;
        let settled = self.stream.discard(self.acquisition.settle_frames as usize);
        info!("Locator : started, {} settling frames discarded", settled);
        Ok(())
    }

    /// Mark now as the reference instant for the next capture.
    pub fn trigger(&mut self) -> FrameIndex {
        let index = self.stream.refresh_write_index();
        self.aligner.trigger(index);
        debug!("Locator : trigger at frame {}", index);
        index
    }

    /** service()
     * @brief   Idle-time upkeep. When the reader has fallen far enough
     *          behind, skip ahead and use the newest frames as a fresh noise
     *          sample. Does nothing while a trigger is waiting to be fetched.
     * @returns Whether the noise thresholds were updated
     */
    pub fn service(&mut self) -> bool {
        if self.aligner.is_armed() {
            return false;
        }

        self.stream.sync_read_pointer();
        let noise_frames = self.acquisition.noise_frames as u64;
        let lag = self.stream.pending();
        if lag < self.acquisition.keep_up_threshold + noise_frames {
            return false;
        }

        self.stream.discard((lag - noise_frames) as usize);
        let noise = self.stream.read_frames(noise_frames as usize);
        let updated = self.solver.update_noise_floor(&noise);
        debug!(
            "Locator : caught up {} frames, noise floor {}",
            lag,
            if updated { "updated" } else { "unchanged" }
        );
        updated
    }

    /// Fetch a full capture for the current trigger.
    pub fn acquire(&mut self) -> Result<Capture, AcquireError> {
        let wanted = self.acquisition.frames_per_signal;
        let capture = self.aligner.align_and_fetch(&mut self.stream, wanted)?;
        if capture.frames() < wanted {
            warn!("Locator : capture short, {} of {} frames", capture.frames(), wanted);
            return Err(AcquireError::ShortCapture {
                got: capture.frames(),
                wanted,
            });
        }
        Ok(capture)
    }

    /// Update the noise floor from the capture's pre-trigger frames, then
    /// solve it.
    pub fn solve_capture(&mut self, capture: &Capture) -> Result<Fix, SolveError> {
        if let Some(noise) = &capture.noise {
            self.solver.update_noise_floor(noise);
        }
        self.solver
            .solve(&capture.signal.left, &capture.signal.right, capture.offset_frames)
    }

    /// One full cycle for the current trigger.
    pub fn locate(&mut self) -> Result<Fix, LocateError> {
        let capture = self.acquire()?;
        Ok(self.solve_capture(&capture)?)
    }

    /// Overrun and short-read counters of the stream.
    pub fn stats(&self) -> StreamStats {
        self.stream.stats()
    }

    /// The solver, with the thresholds learned so far.
    pub fn solver(&self) -> &LocalizationSolver {
        &self.solver
    }

    /// The read side of the ring.
    pub fn stream(&self) -> &StreamBuffer<D, Arc<FrameClock>> {
        &self.stream
    }

    /// The device frames come from.
    pub fn device(&self) -> &D {
        self.stream.device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Geometry;
    use crate::signal_analyzer::AnalysisError;
    use crate::sim_device::{SimulatedDevice, SimulatedPulseCounter, COUNTER_RANGE};
    use crate::solver::Channel;

    fn test_config() -> LocatorConfig {
        let mut config = LocatorConfig::default();
        config.acquisition.read_timeout_ms = 1;
        config
    }

    fn started(noise_v: f32) -> Locator<SimulatedDevice> {
        let config = test_config();
        let device = SimulatedDevice::new(&config.acquisition, &Geometry::default(), noise_v, 11);
        let clock = device.clock();
        let mut locator = Locator::new(device, clock, &config);
        locator.begin().unwrap();
        locator
    }

    #[test]
    fn begin_fails_without_a_counter() {
        let config = test_config();
        let counter = Arc::new(SimulatedPulseCounter::unavailable(COUNTER_RANGE));
        let device = SimulatedDevice::with_counter(
            &config.acquisition,
            &Geometry::default(),
            0.0,
            1,
            counter,
        );
        let clock = device.clock();
        let mut locator = Locator::new(device, clock, &config);
        assert!(matches!(
            locator.begin(),
            Err(ClockError::CounterUnavailable(_))
        ));
    }

    #[test]
    fn locates_a_burst_after_the_trigger() {
        let mut locator = started(0.002);
        locator.device().produce(1000);
        assert!(locator.service());
        assert_eq!(locator.stream().read_index(), 1000);

        let at = locator.trigger();
        assert_eq!(at, 1000);
        locator.device().emit_burst(at, 8.0, 50.0);
        locator.device().produce(2000);

        let fix = locator.locate().unwrap();
        assert_eq!(fix.offset_frames, 0);
        assert!((fix.angle_deg - 8.0).abs() < 0.5);
        assert!((fix.distance_cm - 50.0).abs() < 1.5);
        assert_eq!(locator.stats().overruns, 0);
    }

    #[test]
    fn late_fetch_still_measures_from_the_trigger() {
        let mut locator = started(0.0);
        locator.device().produce(500);
        let at = locator.trigger();
        locator.device().emit_burst(at, -5.0, 50.0);
        // More than a ring's worth before anyone reads
        locator.device().produce(4000);

        let fix = locator.locate().unwrap();
        assert_eq!(fix.offset_frames, 4500 - 3840 - 500);
        assert!((fix.angle_deg + 5.0).abs() < 0.5);
        assert!((fix.distance_cm - 50.0).abs() < 1.5);
        assert_eq!(locator.stats().overruns, 1);
    }

    #[test]
    fn noise_before_the_trigger_feeds_the_threshold() {
        let mut locator = started(0.05);
        locator.device().produce(200);
        let before = locator.solver().analyzer(Channel::Right).signal_threshold();

        let at = locator.trigger();
        locator.device().produce(1400);
        let capture = locator.acquire().unwrap();
        assert_eq!(capture.first_frame, at);
        assert_eq!(capture.noise.as_ref().map(|n| n.len()), Some(128));

        // Pure noise, so the solve fails; the threshold still moves
        assert!(locator.solve_capture(&capture).is_err());
        let after = locator.solver().analyzer(Channel::Right).signal_threshold();
        assert!(after > before);
    }

    #[test]
    fn failed_cycle_does_not_poison_the_next() {
        let mut locator = started(0.0);
        locator.device().produce(300);
        locator.trigger();
        locator.device().produce(1300);
        assert_eq!(
            locator.locate(),
            Err(LocateError::Solve(SolveError::Analysis(
                Channel::Left,
                AnalysisError::NoSignalStart
            )))
        );

        let at = locator.trigger();
        locator.device().emit_burst(at, 0.0, 40.0);
        locator.device().produce(1500);
        let fix = locator.locate().unwrap();
        assert!(fix.angle_deg.abs() < 0.5);
        assert!((fix.distance_cm - 40.0).abs() < 1.5);
    }

    #[test]
    fn short_capture_is_an_error() {
        let mut locator = started(0.0);
        assert_eq!(locator.acquire().unwrap_err(), AcquireError::NotTriggered);

        locator.trigger();
        locator.device().produce(100);
        assert_eq!(
            locator.acquire().unwrap_err(),
            AcquireError::ShortCapture {
                got: 100,
                wanted: 1280
            }
        );
    }

    #[test]
    fn service_waits_for_lag_and_trigger() {
        let mut locator = started(0.0);
        locator.device().produce(100);
        assert!(!locator.service());
        assert_eq!(locator.stream().read_index(), 0);

        locator.device().produce(500);
        locator.trigger();
        assert!(!locator.service());
        assert_eq!(locator.stream().read_index(), 0);
    }
}
