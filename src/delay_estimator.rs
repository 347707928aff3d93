//! Propagation delay from the rising envelope of each channel.
//!
//! A least-squares line through amplitude against time crosses zero
//! roughly where the burst began at that microphone. The two channel
//! estimates are then combined under a [`DelayPolicy`].

use crate::config::DelayConfig;
use crate::peak_interpolator::InterpolatedPeak;
use crate::stream_buffer::Channel;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a channel's start time could not be extrapolated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayError {
    /// Fewer than two points, all points at one time, or a flat envelope.
    DegenerateFit,
}

impl fmt::Display for DelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayError::DegenerateFit => write!(f, "envelope line fit is degenerate"),
        }
    }
}

impl std::error::Error for DelayError {}

/// How the two per-channel start times become one delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DelayPolicy {
    /// The earlier of the two, i.e. the shorter acoustic path.
    #[default]
    ShortestPath,
    /// The average of the two.
    Mean,
}

impl DelayPolicy {
    /// One delay from the two channel start times.
    pub fn combine(self, left_us: f32, right_us: f32) -> f32 {
        match self {
            DelayPolicy::ShortestPath => left_us.min(right_us),
            DelayPolicy::Mean => 0.5 * (left_us + right_us),
        }
    }
}

/// A line `amplitude = slope * t + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    /// Amplitude per microsecond.
    pub slope: f32,
    /// Amplitude at time zero.
    pub intercept: f32,
}

impl LineFit {
    /// Where the line crosses zero amplitude.
    pub fn time_intercept(&self) -> f32 {
        -self.intercept / self.slope
    }
}

/// Ordinary least squares over the peaks. Sums are kept in `f64`: peak
/// times are hundreds of microseconds, and their squares lose too much in
/// `f32`.
pub fn fit_line(peaks: &[InterpolatedPeak]) -> Result<LineFit, DelayError> {
    if peaks.len() < 2 {
        return Err(DelayError::DegenerateFit);
    }

    let (mut t, mut y, mut tt, mut ty) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for p in peaks {
        let ti = p.time_us as f64;
        let yi = p.amplitude as f64;
        t += ti;
        y += yi;
        tt += ti * ti;
        ty += ti * yi;
    }

    let n = peaks.len() as f64;
    let d = n * tt - t * t;
    if d.abs() < 1e-9 {
        return Err(DelayError::DegenerateFit);
    }

    let slope = (n * ty - t * y) / d;
    let intercept = (y - slope * t) / n;
    // A flat envelope never crosses zero
    if slope.abs() < 1e-12 || !(intercept / slope).is_finite() {
        return Err(DelayError::DegenerateFit);
    }

    Ok(LineFit {
        slope: slope as f32,
        intercept: intercept as f32,
    })
}

/// Per-channel start times and their combination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayEstimate {
    /// Envelope zero crossing of the left channel, in microseconds.
    pub left_us: f32,
    /// Envelope zero crossing of the right channel, in microseconds.
    pub right_us: f32,
    /// The two combined under the estimator's [`DelayPolicy`].
    pub delay_us: f32,
}

/// Fits each channel's envelope and combines the two start times.
#[derive(Debug, Clone)]
pub struct DelayEstimator {
    policy: DelayPolicy,
}

impl DelayEstimator {
    /// An estimator combining channels under `config.policy`.
    pub fn new(config: DelayConfig) -> Self {
        Self {
            policy: config.policy,
        }
    }

    /// How the two channel start times are combined.
    pub fn policy(&self) -> DelayPolicy {
        self.policy
    }

    /// Start time of one channel's burst, in microseconds from the first
    /// sample.
    pub fn channel_start(&self, peaks: &[InterpolatedPeak]) -> Result<f32, DelayError> {
        Ok(fit_line(peaks)?.time_intercept())
    }

    /** estimate()
     * @brief   Start time of each channel and the propagation delay
     * @param   Left and right interpolated peaks
     * @returns The estimate, or the first channel whose fit is degenerate
     */
    pub fn estimate(
        &self,
        left: &[InterpolatedPeak],
        right: &[InterpolatedPeak],
    ) -> Result<DelayEstimate, (Channel, DelayError)> {
        let left_us = self.channel_start(left).map_err(|e| (Channel::Left, e))?;
        let right_us = self.channel_start(right).map_err(|e| (Channel::Right, e))?;
        Ok(DelayEstimate {
            left_us,
            right_us,
            delay_us: self.policy.combine(left_us, right_us),
        })
    }
}
