//! Per-channel signal detection: where does the burst start, and where are
//! its peaks?
//!
//! Each channel gets its own [`SignalAnalyzer`], because each keeps its own
//! noise-adaptive energy threshold across measurement cycles.

use crate::config::AnalyzerConfig;

use log::debug;
use std::fmt;

/// Why a channel yielded no usable peaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// No energy window in the channel reached the threshold.
    NoSignalStart,
    /// The peak scan ended early, either running out of samples or on a
    /// spacing violation.
    InsufficientPeaks {
        /// Peaks accepted before the scan ended.
        found: usize,
        /// `n_peaks`.
        wanted: usize,
    },
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::NoSignalStart => write!(f, "signal start not found"),
            AnalysisError::InsufficientPeaks { found, wanted } => {
                write!(f, "found {} of {} peaks", found, wanted)
            }
        }
    }
}

impl std::error::Error for AnalysisError {}

/// Where the burst starts and the integer index of each of its peaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPeaks {
    /// First sample of the first window over the threshold.
    pub start: usize,
    /// Exactly `n_peaks` indices, increasing.
    pub peaks: Vec<usize>,
}

/// States of the slope machine in [`SignalAnalyzer::detect_peaks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slope {
    /// Waiting for two rises in a row.
    Ready,
    /// Rising; waiting for the top.
    Rising,
    /// Past the top; waiting for two falls in a row.
    Falling,
}

/// Start and peak detection for one channel, with its own threshold.
#[derive(Debug, Clone)]
pub struct SignalAnalyzer {
    config: AnalyzerConfig,
    signal_threshold: f32,
}

impl SignalAnalyzer {
    /// Starts at `initial_threshold`, held to the floor.
    pub fn new(config: AnalyzerConfig) -> Self {
        let signal_threshold = config.initial_threshold.max(config.threshold_floor);
        Self {
            config,
            signal_threshold,
        }
    }

    /// Energy a window has to reach to count as signal.
    pub fn signal_threshold(&self) -> f32 {
        self.signal_threshold
    }

    /// Force the threshold, e.g. to one measured on an earlier run. Still
    /// held to the floor.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.signal_threshold = threshold.max(self.config.threshold_floor);
    }

    /// The configuration in use.
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Find the signal start, then exactly `n_peaks` peaks after it.
    pub fn analyze(&self, samples: &[f32]) -> Result<ChannelPeaks, AnalysisError> {
        let start = self
            .detect_start(samples)
            .ok_or(AnalysisError::NoSignalStart)?;

        let peaks = self.detect_peaks(samples, start);
        if peaks.len() < self.config.n_peaks {
            return Err(AnalysisError::InsufficientPeaks {
                found: peaks.len(),
                wanted: self.config.n_peaks,
            });
        }

        debug!(
            "SignalAnalyzer : start {}, peaks {}..={}",
            start,
            peaks[0],
            peaks[peaks.len() - 1]
        );
        Ok(ChannelPeaks { start, peaks })
    }

    /// Re-derive the threshold from noise-only samples:
    /// `mean * W + K * stddev * sqrt(W)` over the squared values of the
    /// trailing `noise_window` samples, never below the floor. Does nothing
    /// and returns false when there are too few samples.
    pub fn update_threshold(&mut self, noise: &[f32]) -> bool {
        let n = self.config.noise_window;
        if n == 0 || noise.len() < n {
            return false;
        }

        let (sum, sum2) = noise[noise.len() - n..]
            .iter()
            .map(|v| v * v)
            .fold((0.0f32, 0.0f32), |(s, s2), vv| (s + vv, s2 + vv * vv));

        let mean = sum / n as f32;
        let variance = (sum2 / n as f32 - mean * mean).max(0.0);
        let window = self.config.energy_window as f32;
        let threshold =
            mean * window + self.config.threshold_k * variance.sqrt() * window.sqrt();

        self.signal_threshold = threshold.max(self.config.threshold_floor);
        debug!("SignalAnalyzer : threshold {:.6}", self.signal_threshold);
        true
    }

    /// Sum of squares over the window of `energy_window` samples ending at
    /// `index`, clipped at the start of the channel.
    fn window_energy(&self, samples: &[f32], index: usize) -> f32 {
        let from = (index + 1).saturating_sub(self.config.energy_window);
        samples[from..=index].iter().map(|v| v * v).sum()
    }

    /// Coarse scan every `coarse_step` samples for the first window over the
    /// threshold, then walk the step before it sample by sample to find the
    /// earliest window that also qualifies.
    pub fn detect_start(&self, samples: &[f32]) -> Option<usize> {
        let step = self.config.coarse_step.max(1);
        let coarse_hit = (0..samples.len())
            .step_by(step)
            .find(|&p| self.window_energy(samples, p) >= self.signal_threshold)?;

        (coarse_hit.saturating_sub(step)..=coarse_hit)
            .find(|&i| self.window_energy(samples, i) >= self.signal_threshold)
    }

    /// Walk the sample-to-sample slope from `start` and pick out up to
    /// `n_peaks` peaks. A peak needs two rises before it and two falls
    /// after it. The first peak whose distance from the previous one is
    /// outside the spacing bounds ends the scan; the burst is assumed to be
    /// a regular train, so nothing after an irregular gap is trusted.
    pub fn detect_peaks(&self, samples: &[f32], start: usize) -> Vec<usize> {
        let eps = self.config.slope_eps;
        let wanted = self.config.n_peaks;
        let mut peaks: Vec<usize> = Vec::with_capacity(wanted);
        let mut state = Slope::Ready;
        let mut count = 0usize;

        for i in (start + 1)..samples.len() {
            let diff = samples[i] - samples[i - 1];

            match state {
                Slope::Ready => {
                    count = if diff > eps { count + 1 } else { 0 };
                    if count >= 2 {
                        count = 0;
                        state = Slope::Rising;
                    }
                }
                Slope::Rising => {
                    if diff < -eps {
                        count = 1;
                        state = Slope::Falling;
                    } else if diff <= eps {
                        // Flat top
                        count = 0;
                        state = Slope::Falling;
                    }
                }
                Slope::Falling => {
                    if diff < -eps {
                        count += 1;
                    } else {
                        count = 0;
                        state = Slope::Ready;
                    }

                    if count >= 2 {
                        let peak = i - count;
                        if let Some(&last) = peaks.last() {
                            let spacing = peak - last;
                            if spacing < self.config.min_peak_spacing
                                || spacing > self.config.max_peak_spacing
                            {
                                debug!(
                                    "SignalAnalyzer : peak spacing {} at {}, stopping",
                                    spacing, peak
                                );
                                return peaks;
                            }
                        }

                        peaks.push(peak);
                        if peaks.len() >= wanted {
                            return peaks;
                        }
                        count = 0;
                        state = Slope::Ready;
                    }
                }
            }
        }

        peaks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    /// Zeros, then from `step` on a constant level with a train of
    /// triangular pulses, one every `spacing` samples, peaking two samples
    /// into each period.
    fn pulse_train(len: usize, step: usize, level: f32, spacing: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                if i < step {
                    return 0.0;
                }
                let phase = (i - step) % spacing;
                let bump = match phase {
                    1 | 3 => 0.1,
                    2 => 0.2,
                    _ => 0.0,
                };
                level + bump
            })
            .collect()
    }

    fn analyzer() -> SignalAnalyzer {
        SignalAnalyzer::new(AnalyzerConfig::default())
    }

    #[test]
    fn finds_step_and_every_peak() {
        let config = AnalyzerConfig::default();
        let spacing = (config.min_peak_spacing + config.max_peak_spacing) / 2;
        let samples = pulse_train(256, 100, 0.5, spacing);

        let analyzer = analyzer();
        assert_eq!(analyzer.detect_start(&samples), Some(100));

        let found = analyzer.analyze(&samples).unwrap();
        assert_eq!(found.start, 100);
        let expected: Vec<usize> = (0..config.n_peaks).map(|k| 102 + k * spacing).collect();
        assert_eq!(found.peaks, expected);
    }

    #[test]
    fn quiet_channel_has_no_start() {
        let analyzer = analyzer();
        let samples = vec![0.001f32; 512];
        assert_eq!(analyzer.detect_start(&samples), None);
        assert_eq!(analyzer.analyze(&samples), Err(AnalysisError::NoSignalStart));
    }

    #[test]
    fn start_at_the_very_beginning() {
        let analyzer = analyzer();
        let samples = pulse_train(200, 0, 0.5, 5);
        assert_eq!(analyzer.detect_start(&samples), Some(0));
    }

    #[test]
    fn irregular_gap_ends_the_scan() {
        let mut samples = pulse_train(256, 10, 0.5, 5);
        // Flatten the fourth pulse so the gap after the third is 10
        for s in samples.iter_mut().skip(10 + 15).take(5) {
            *s = 0.5;
        }

        let analyzer = analyzer();
        let peaks = analyzer.detect_peaks(&samples, 10);
        assert_eq!(peaks, vec![12, 17, 22]);
        assert_eq!(
            analyzer.analyze(&samples),
            Err(AnalysisError::InsufficientPeaks { found: 3, wanted: 20 })
        );
    }

    #[test]
    fn flat_top_counts_as_a_peak() {
        // rise, rise, flat, fall, fall
        let samples = [0.0, 0.1, 0.2, 0.2, 0.1, 0.0];
        let peaks = analyzer().detect_peaks(&samples, 0);
        assert_eq!(peaks, vec![3]);
    }

    #[test]
    fn threshold_tracks_noise_energy() {
        // Squared Gaussian noise has mean sigma^2 and stddev sqrt(2) sigma^2,
        // so the threshold should settle at 8 sigma^2 + 10 sqrt(2) sigma^2 sqrt(8)
        let config = AnalyzerConfig {
            noise_window: 20_000,
            ..AnalyzerConfig::default()
        };
        let mut analyzer = SignalAnalyzer::new(config);
        let mut rng = StdRng::seed_from_u64(3);
        let sigma = 0.05f32;
        let normal = Normal::new(0.0, sigma).unwrap();

        // Loud lead-in that falls outside the trailing window
        let mut noise = vec![1.0f32; 5_000];
        noise.extend((0..20_000).map(|_| normal.sample(&mut rng)));

        assert!(analyzer.update_threshold(&noise));

        let var = sigma * sigma;
        let expected = 8.0 * var + 10.0 * 2f32.sqrt() * var * 8f32.sqrt();
        assert!((expected - 48.0 * var).abs() < 1e-6);
        let relative = (analyzer.signal_threshold() - expected).abs() / expected;
        assert!(relative < 0.05, "threshold {} vs {}", analyzer.signal_threshold(), expected);
    }

    #[test]
    fn threshold_never_drops_below_floor() {
        let mut analyzer = analyzer();
        assert!(analyzer.update_threshold(&[0.0; 20]));
        assert_eq!(analyzer.signal_threshold(), 1e-3);

        analyzer.set_threshold(0.0);
        assert_eq!(analyzer.signal_threshold(), 1e-3);
        analyzer.set_threshold(0.5);
        assert_eq!(analyzer.signal_threshold(), 0.5);
    }

    #[test]
    fn too_little_noise_leaves_threshold_alone() {
        let mut analyzer = analyzer();
        assert!(analyzer.update_threshold(&[0.2; 30]));
        let raised = analyzer.signal_threshold();
        assert!(raised > 0.3);

        assert!(!analyzer.update_threshold(&[0.0; 19]));
        assert_eq!(analyzer.signal_threshold(), raised);
    }
}
