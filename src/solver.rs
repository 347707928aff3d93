//! The offline half of localization: two fixed-length channels in, one
//! [`Fix`] out.
//!
//! The solver never touches the acquisition layer. It gets plain sample
//! slices and the capture's frame offset, so recorded captures and live
//! ones go through exactly the same path.

use crate::config::{Geometry, LocatorConfig};
use crate::correlator::CrossPeakCorrelator;
use crate::delay_estimator::{DelayError, DelayEstimator};
use crate::peak_interpolator::{InterpolatedPeak, InterpolationError, PeakInterpolator};
use crate::signal_analyzer::{AnalysisError, ChannelPeaks, SignalAnalyzer};
use crate::stream_buffer::StereoBlock;

pub use crate::stream_buffer::Channel;

use log::{debug, info};
use std::{borrow::Cow, fmt};

/// Why a solve produced no fix. None of these are fatal; the next capture
/// is solved as if nothing happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveError {
    /// The two channels hold different numbers of samples.
    ChannelLengthMismatch {
        /// Left channel length.
        left: usize,
        /// Right channel length.
        right: usize,
    },
    /// Start or peak detection failed on a channel.
    Analysis(Channel, AnalysisError),
    /// A peak of the channel could not be refined.
    Interpolation(Channel, InterpolationError),
    /// The channel's envelope could not be extrapolated.
    Delay(Channel, DelayError),
}

impl fmt::Display for SolveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            SolveError::ChannelLengthMismatch { left, right } => Cow::from(format!(
                "channels differ in length, left {} and right {}",
                left, right
            )),
            SolveError::Analysis(channel, error) => Cow::from(format!("{} analyzer: {}", channel, error)),
            SolveError::Interpolation(channel, error) => {
                Cow::from(format!("{} interpolator: {}", channel, error))
            }
            SolveError::Delay(channel, error) => Cow::from(format!("{} delay: {}", channel, error)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for SolveError {}

/// One successful localization.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    /// Bearing off the microphone axis normal, positive towards the left
    /// microphone (the right channel hears it later).
    pub angle_deg: f32,
    /// Range from the trigger to the burst start.
    pub distance_cm: f32,
    /// Right minus left arrival time.
    pub t_diff_us: f32,
    /// Combined burst start, relative to the first sample.
    pub sig_delay_us: f32,
    /// Peak-index lag the correlator settled on.
    pub lag: i32,
    /// Amplitude correlation at that lag.
    pub correlation: f32,
    /// Frames between the trigger and the first sample.
    pub offset_frames: i64,
    /// Sample index where each channel's burst was detected.
    pub starts: (usize, usize),
    /// Envelope zero crossing of each channel.
    pub intercepts_us: (f32, f32),
}

/// Remove the DC offset over `[first - margin, last + margin]` and scale
/// the whole channel so that region peaks at unit magnitude.
pub fn condition_channel(samples: &mut [f32], first: usize, last: usize, margin: usize) {
    let from = first.saturating_sub(margin);
    let to = (last + margin + 1).min(samples.len());
    if from >= to {
        return;
    }

    let mean = samples[from..to].iter().sum::<f32>() / (to - from) as f32;
    let mut abs_max = 0.0f32;
    for v in samples[from..to].iter_mut() {
        *v -= mean;
        abs_max = abs_max.max(v.abs());
    }

    if abs_max > 1e-12 {
        let inv = 1.0 / abs_max;
        samples.iter_mut().for_each(|v| *v *= inv);
    }
}

/// Turns two captured channels into a [`Fix`].
pub struct LocalizationSolver {
    left: SignalAnalyzer,
    right: SignalAnalyzer,
    interpolator: PeakInterpolator,
    correlator: CrossPeakCorrelator,
    estimator: DelayEstimator,
    geometry: Geometry,
    sample_period_us: f32,
    condition: bool,
    neighbours: usize,
}

impl LocalizationSolver {
    /// One analyzer per channel, both from `config.analyzer`.
    pub fn new(config: &LocatorConfig) -> Self {
        let sample_period_us = config.acquisition.sample_period_us();
        Self {
            left: SignalAnalyzer::new(config.analyzer.clone()),
            right: SignalAnalyzer::new(config.analyzer.clone()),
            interpolator: PeakInterpolator::new(config.interpolator.clone(), sample_period_us),
            correlator: CrossPeakCorrelator::new(config.correlator.clone()),
            estimator: DelayEstimator::new(config.delay.clone()),
            geometry: config.geometry.clone(),
            sample_period_us,
            condition: config.solver.condition,
            neighbours: config.interpolator.neighbours,
        }
    }

    /// The analyzer of one channel.
    pub fn analyzer(&self, channel: Channel) -> &SignalAnalyzer {
        match channel {
            Channel::Left => &self.left,
            Channel::Right => &self.right,
        }
    }

    /// Mutable access, e.g. to force a threshold.
    pub fn analyzer_mut(&mut self, channel: Channel) -> &mut SignalAnalyzer {
        match channel {
            Channel::Left => &mut self.left,
            Channel::Right => &mut self.right,
        }
    }

    /// Feed noise-only frames to both channel thresholds. Returns false if
    /// the block was too short to update either.
    pub fn update_noise_floor(&mut self, noise: &StereoBlock) -> bool {
        let left = self.left.update_threshold(&noise.left);
        let right = self.right.update_threshold(&noise.right);
        left && right
    }

    /// `asin(t_diff * c / d)` in degrees, with the sine clamped to `[-1, 1]`.
    pub fn angle_deg(&self, t_diff_us: f32) -> f32 {
        let sine = (t_diff_us * self.geometry.angle_factor()).clamp(-1.0, 1.0);
        sine.asin().to_degrees()
    }

    /// Range for a burst starting `sig_delay_us` into a capture that itself
    /// started `offset_frames` after the trigger.
    pub fn distance_cm(&self, sig_delay_us: f32, offset_frames: i64) -> f32 {
        let offset_us = offset_frames as f32 * self.sample_period_us;
        (sig_delay_us + offset_us) * self.geometry.sound_speed_cm_per_us()
    }

    fn channel_peaks(
        &self,
        channel: Channel,
        samples: &[f32],
    ) -> Result<(ChannelPeaks, Vec<InterpolatedPeak>), SolveError> {
        let found = self
            .analyzer(channel)
            .analyze(samples)
            .map_err(|e| SolveError::Analysis(channel, e))?;

        let conditioned;
        let samples = match (self.condition, found.peaks.first(), found.peaks.last()) {
            (true, Some(&first), Some(&last)) => {
                let mut copy = samples.to_vec();
                condition_channel(&mut copy, first, last, self.neighbours + 2);
                conditioned = copy;
                &conditioned[..]
            }
            _ => samples,
        };

        let peaks = self
            .interpolator
            .interpolate_peaks(samples, &found.peaks)
            .map_err(|e| SolveError::Interpolation(channel, e))?;

        Ok((found, peaks))
    }

    /** solve()
     * @brief   Runs every analysis stage over one capture
     * @param   Left and right channels in volts, trigger-to-capture offset
     * @returns The fix, or the first stage that failed
     */
    pub fn solve(&self, left: &[f32], right: &[f32], offset_frames: i64) -> Result<Fix, SolveError> {
        if left.len() != right.len() {
            return Err(SolveError::ChannelLengthMismatch {
                left: left.len(),
                right: right.len(),
            });
        }

        let (found_l, peaks_l) = self.channel_peaks(Channel::Left, left)?;
        let (found_r, peaks_r) = self.channel_peaks(Channel::Right, right)?;

        let correlation = self.correlator.correlate(&peaks_l, &peaks_r);

        let delay = self
            .estimator
            .estimate(&peaks_l, &peaks_r)
            .map_err(|(channel, e)| SolveError::Delay(channel, e))?;

        debug!(
            "LocalizationSolver : starts {}/{}, intercepts {:.2}/{:.2} us",
            found_l.start, found_r.start, delay.left_us, delay.right_us
        );

        let fix = Fix {
            angle_deg: self.angle_deg(correlation.t_diff_us),
            distance_cm: self.distance_cm(delay.delay_us, offset_frames),
            t_diff_us: correlation.t_diff_us,
            sig_delay_us: delay.delay_us,
            lag: correlation.lag,
            correlation: correlation.correlation,
            offset_frames,
            starts: (found_l.start, found_r.start),
            intercepts_us: (delay.left_us, delay.right_us),
        };
        info!(
            "LocalizationSolver : angle {:.3} deg, distance {:.2} cm",
            fix.angle_deg, fix.distance_cm
        );
        Ok(fix)
    }
}
