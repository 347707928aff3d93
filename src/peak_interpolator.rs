//! Sub-sample refinement of detected peaks.
//!
//! A detected peak is only an integer sample index. Both methods in here
//! estimate where between samples the true maximum sits and how high it is,
//! and report it as a time in microseconds from the start of the capture.

use crate::config::InterpolatorConfig;

use serde::{Deserialize, Serialize};
use std::{f32::consts::PI, fmt};

/// Which refinement [`PeakInterpolator`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterpolationMethod {
    /// Vertex of the parabola through the peak and its two neighbours.
    #[default]
    Parabolic,
    /// Zero of the derivative of a truncated sinc reconstruction.
    WindowedSinc,
}

/// A peak located between samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolatedPeak {
    /// Microseconds from the first sample of the channel.
    pub time_us: f32,
    /// Interpolated value at `time_us`.
    pub amplitude: f32,
}

/// Why a peak could not be refined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpolationError {
    /// The peak is too close to either end of the channel for the method's
    /// neighbourhood.
    OutOfBounds {
        /// Integer index of the peak.
        index: usize,
    },
}

impl fmt::Display for InterpolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpolationError::OutOfBounds { index } => {
                write!(f, "peak at {} is too close to the channel edge", index)
            }
        }
    }
}

impl std::error::Error for InterpolationError {}

/** parabolic()
 * @brief   Fits y = a*x^2 + b*x + c through samples index-1, index, index+1
 * @param   samples, index of the integer peak
 * @returns (vertex offset from index in [-0.5, 0.5], parabola value there)
 */
pub fn parabolic(samples: &[f32], index: usize) -> Result<(f32, f32), InterpolationError> {
    if index == 0 || index + 1 >= samples.len() {
        return Err(InterpolationError::OutOfBounds { index });
    }

    let ym = samples[index - 1];
    let c = samples[index];
    let yp = samples[index + 1];

    let a = 0.5 * (ym + yp) - c;
    let b = 0.5 * (yp - ym);

    // Three collinear samples have no vertex
    let delta = if (2.0 * a).abs() < 1e-9 {
        0.0
    } else {
        (-b / (2.0 * a)).clamp(-0.5, 0.5)
    };

    Ok((delta, (a * delta + b) * delta + c))
}

fn sinc(u: f32) -> f32 {
    if u.abs() < 1e-6 {
        return 1.0;
    }
    let theta = PI * u;
    theta.sin() / theta
}

fn sinc_derivative(u: f32) -> f32 {
    if u.abs() < 1e-6 {
        return 0.0;
    }
    let theta = PI * u;
    (theta * theta.cos() - theta.sin()) / (PI * u * u)
}

/// Reconstructed signal (or its derivative, depending on `kernel`) at
/// `index + delta`, using `neighbours` samples either side.
fn reconstruct(samples: &[f32], index: usize, neighbours: usize, delta: f32, kernel: fn(f32) -> f32) -> f32 {
    samples[index - neighbours..=index + neighbours]
        .iter()
        .enumerate()
        .map(|(j, x)| {
            let m = j as f32 - neighbours as f32;
            x * kernel(delta - m)
        })
        .sum()
}

/** windowed_sinc()
 * @brief   Secant search for the zero of the reconstructed signal's
 *          derivative, seeded either side of the integer peak
 * @param   samples, index of the integer peak, kernel half-width, iteration cap
 * @returns (peak offset from index in [-0.5, 0.5], reconstructed value there)
 */
pub fn windowed_sinc(
    samples: &[f32],
    index: usize,
    neighbours: usize,
    max_iterations: usize,
) -> Result<(f32, f32), InterpolationError> {
    if index < neighbours || index + neighbours >= samples.len() {
        return Err(InterpolationError::OutOfBounds { index });
    }

    let slope = |delta: f32| reconstruct(samples, index, neighbours, delta, sinc_derivative);

    let (mut d0, mut d1) = (-0.01f32, 0.01f32);
    let (mut g0, mut g1) = (slope(d0), slope(d1));

    for _ in 0..max_iterations {
        let denom = g1 - g0;
        if denom.abs() < 1e-6 || g1.abs() < 1e-6 {
            break;
        }

        let d2 = (d1 - g1 * (d1 - d0) / denom).clamp(-0.5, 0.5);
        d0 = d1;
        g0 = g1;
        d1 = d2;
        g1 = slope(d1);
    }

    Ok((d1, reconstruct(samples, index, neighbours, d1, sinc)))
}

/// Divide `samples[first - margin ..= last + margin]` (clipped to the slice) by
/// its largest absolute value. Leaves an all-but-silent region untouched.
pub fn normalize_region(samples: &mut [f32], first: usize, last: usize, margin: usize) {
    let from = first.saturating_sub(margin);
    let to = (last + margin + 1).min(samples.len());
    if from >= to {
        return;
    }

    let region = &mut samples[from..to];
    let max = region.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if max < 1e-12 {
        return;
    }
    for v in region.iter_mut() {
        *v /= max;
    }
}

/// Refines integer peaks with the configured method.
#[derive(Debug, Clone)]
pub struct PeakInterpolator {
    config: InterpolatorConfig,
    sample_period_us: f32,
}

impl PeakInterpolator {
    /// `sample_period_us` converts indices to times.
    pub fn new(config: InterpolatorConfig, sample_period_us: f32) -> Self {
        Self {
            config,
            sample_period_us,
        }
    }

    /// The configured method.
    pub fn method(&self) -> InterpolationMethod {
        self.config.method
    }

    /// Samples each side of a peak the configured method reads.
    pub fn margin(&self) -> usize {
        match self.config.method {
            InterpolationMethod::Parabolic => 1,
            InterpolationMethod::WindowedSinc => self.config.neighbours,
        }
    }

    /// Refine one integer peak.
    pub fn interpolate(&self, samples: &[f32], index: usize) -> Result<InterpolatedPeak, InterpolationError> {
        let (delta, amplitude) = match self.config.method {
            InterpolationMethod::Parabolic => parabolic(samples, index)?,
            InterpolationMethod::WindowedSinc => windowed_sinc(
                samples,
                index,
                self.config.neighbours,
                self.config.max_iterations,
            )?,
        };

        Ok(InterpolatedPeak {
            time_us: (index as f32 + delta) * self.sample_period_us,
            amplitude,
        })
    }

    /// Refine every peak of a channel, in order. Fails on the first peak
    /// that cannot be refined. With `normalize` set, the peak region of a
    /// copy of the channel is scaled to unit maximum first.
    pub fn interpolate_peaks(
        &self,
        samples: &[f32],
        peaks: &[usize],
    ) -> Result<Vec<InterpolatedPeak>, InterpolationError> {
        let (first, last) = match (peaks.first(), peaks.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => return Ok(Vec::new()),
        };

        let normalized;
        let samples = if self.config.normalize {
            let mut copy = samples.to_vec();
            normalize_region(&mut copy, first, last, self.config.neighbours);
            normalized = copy;
            &normalized[..]
        } else {
            samples
        };

        peaks
            .iter()
            .map(|&index| self.interpolate(samples, index))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(method: InterpolationMethod) -> InterpolatorConfig {
        InterpolatorConfig {
            method,
            ..InterpolatorConfig::default()
        }
    }

    #[test]
    fn parabola_vertex_is_exact() {
        let vertex = 100.3f32;
        let samples: Vec<f32> = (0..200)
            .map(|i| {
                let x = i as f32 - vertex;
                5.0 - 2.0 * x * x
            })
            .collect();

        let (delta, value) = parabolic(&samples, 100).unwrap();
        assert!((delta - 0.3).abs() < 1e-4);
        assert!((value - 5.0).abs() < 1e-4);

        let interpolator = PeakInterpolator::new(config(InterpolationMethod::Parabolic), 2.0);
        let peak = interpolator.interpolate(&samples, 100).unwrap();
        assert!((peak.time_us - 2.0 * vertex).abs() < 1e-3);
    }

    #[test]
    fn parabolic_clamps_and_handles_flat_runs() {
        // Vertex far to the right of the sampled peak
        let (delta, _) = parabolic(&[0.0, 1.0, 1.9], 1).unwrap();
        assert_eq!(delta, 0.5);

        let (delta, value) = parabolic(&[1.0, 1.0, 1.0], 1).unwrap();
        assert_eq!(delta, 0.0);
        assert_eq!(value, 1.0);
    }

    #[test]
    fn parabolic_rejects_edges() {
        let samples = [0.0, 1.0, 0.0];
        assert_eq!(
            parabolic(&samples, 0),
            Err(InterpolationError::OutOfBounds { index: 0 })
        );
        assert_eq!(
            parabolic(&samples, 2),
            Err(InterpolationError::OutOfBounds { index: 2 })
        );
        assert!(parabolic(&samples, 1).is_ok());
    }

    #[test]
    fn sinc_finds_symmetric_peak_exactly() {
        let samples = [0.0, 0.0, 0.2, 0.5, 0.8, 1.0, 0.8, 0.5, 0.2, 0.0, 0.0];
        let (delta, value) = windowed_sinc(&samples, 5, 5, 10).unwrap();
        assert!(delta.abs() < 1e-3);
        assert!((value - 1.0).abs() < 1e-3);
    }

    #[test]
    fn sinc_tracks_an_off_grid_cosine() {
        // Band-limited tone peaking a quarter sample right of index 100
        let true_peak = 100.25f32;
        let samples: Vec<f32> = (0..200)
            .map(|i| (2.0 * PI * 0.2 * (i as f32 - true_peak)).cos())
            .collect();

        let (delta, _) = windowed_sinc(&samples, 100, 5, 10).unwrap();
        assert!((100.0 + delta - true_peak).abs() < 0.05);
    }

    #[test]
    fn sinc_needs_full_neighbourhood() {
        let samples = vec![0.0f32; 20];
        assert!(windowed_sinc(&samples, 4, 5, 10).is_err());
        assert!(windowed_sinc(&samples, 15, 5, 10).is_err());
        assert!(windowed_sinc(&samples, 5, 5, 10).is_ok());
        assert!(windowed_sinc(&samples, 14, 5, 10).is_ok());
    }

    #[test]
    fn normalizes_only_the_peak_region() {
        let mut samples = vec![4.0f32; 30];
        samples[15] = -8.0;
        normalize_region(&mut samples, 12, 18, 5);

        assert_eq!(samples[6], 4.0);
        assert_eq!(samples[7], 0.5);
        assert_eq!(samples[15], -1.0);
        assert_eq!(samples[23], 0.5);
        assert_eq!(samples[24], 4.0);

        let mut silent = vec![0.0f32; 10];
        normalize_region(&mut silent, 2, 4, 5);
        assert!(silent.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn interpolates_a_train_in_order() {
        let samples: Vec<f32> = (0..120)
            .map(|i| 3.0 * (2.0 * PI * (i as f32 - 0.2) / 5.0).cos())
            .collect();
        let peaks: Vec<usize> = (2..22).map(|k| k * 5).collect();

        for method in [InterpolationMethod::Parabolic, InterpolationMethod::WindowedSinc] {
            let interpolator = PeakInterpolator::new(config(method), 1.0);
            let found = interpolator.interpolate_peaks(&samples, &peaks).unwrap();
            assert_eq!(found.len(), peaks.len());
            for (peak, index) in found.iter().zip(&peaks) {
                assert!((peak.time_us - (*index as f32 + 0.2)).abs() < 0.1);
                // Normalized to the region maximum
                assert!(peak.amplitude > 0.9 && peak.amplitude < 1.1);
            }
        }
    }

    #[test]
    fn one_bad_peak_fails_the_channel() {
        let samples = vec![1.0f32; 50];
        let interpolator = PeakInterpolator::new(config(InterpolationMethod::WindowedSinc), 1.0);
        assert_eq!(
            interpolator.interpolate_peaks(&samples, &[10, 20, 47]),
            Err(InterpolationError::OutOfBounds { index: 47 })
        );
    }
}
