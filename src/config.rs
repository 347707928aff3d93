//! Every tunable of the acquisition and localization pipeline, in one
//! place. Configurations are stored as [ron] and every field has a default
//! matching the measurement rig, so a file only needs to list what it
//! changes:
//!
//! ```text
//! (
//!     geometry: (sensor_distance_m: 0.12),
//!     interpolator: (method: WindowedSinc),
//! )
//! ```

use crate::delay_estimator::DelayPolicy;
use crate::peak_interpolator::InterpolationMethod;

use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, fs, path::Path, time::Duration};

/// Things that can go wrong loading, saving or checking a [LocatorConfig].
#[derive(Debug)]
pub enum ConfigError {
    /// Reading or writing the file failed.
    Io(std::io::Error),
    /// Serialization failed.
    Ron(ron::Error),
    /// The file is not valid RON for this structure.
    RonSpanned(ron::de::SpannedError),
    /// The values parse but cannot work together.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ConfigError::Io(error) => Cow::from(format!("io error: {}", error)),
            ConfigError::Ron(error) => Cow::from(format!("ron error: {}", error)),
            ConfigError::RonSpanned(error) => Cow::from(format!("ron parse error: {}", error)),
            ConfigError::Invalid(why) => Cow::from(format!("invalid configuration: {}", why)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

/// Sampling and buffering of the two microphone channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Frames per second.
    pub sample_rate_hz: u32,
    /// Frames the device ring holds before unread data is overwritten.
    pub ring_capacity: u64,
    /// Frames delivered per capture.
    pub frames_per_signal: usize,
    /// Largest single device read.
    pub chunk_frames: usize,
    /// How long one device read may block.
    pub read_timeout_ms: u64,
    /// Consecutive zero-progress reads tolerated before a read gives up.
    pub max_stalled_reads: u32,
    /// Frames the write pointer must lead by before a read is issued.
    pub read_margin_frames: u64,
    /// Pre-trigger frames kept for the noise floor estimate.
    pub noise_frames: usize,
    /// Read lag beyond which idle servicing flushes the ring.
    pub keep_up_threshold: u64,
    /// Frames thrown away at startup while the converter settles.
    pub settle_frames: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 192_000,
            ring_capacity: 30 * 128,
            frames_per_signal: 10 * 128,
            chunk_frames: 128,
            read_timeout_ms: 100,
            max_stalled_reads: 3,
            read_margin_frames: 0,
            noise_frames: 128,
            keep_up_threshold: 128,
            settle_frames: 192_000 / 10,
        }
    }
}

impl AcquisitionConfig {
    /// Time between frames.
    pub fn sample_period_us(&self) -> f32 {
        1e6 / self.sample_rate_hz as f32
    }

    /// `read_timeout_ms` as a Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Start and peak detection on a single channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Peaks expected in every burst.
    pub n_peaks: usize,
    /// Trailing noise samples used to update the threshold.
    pub noise_window: usize,
    /// Length of the sum-of-squares energy window.
    pub energy_window: usize,
    /// Stride of the coarse start search.
    pub coarse_step: usize,
    /// Standard deviations above the noise mean for the threshold.
    pub threshold_k: f32,
    /// Slopes within this of zero count as flat.
    pub slope_eps: f32,
    /// Closest two consecutive peaks may be, in samples.
    pub min_peak_spacing: usize,
    /// Farthest two consecutive peaks may be, in samples.
    pub max_peak_spacing: usize,
    /// The threshold never drops below this.
    pub threshold_floor: f32,
    /// Threshold in use before the first noise update.
    pub initial_threshold: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            n_peaks: 20,
            noise_window: 20,
            energy_window: 8,
            coarse_step: 32,
            threshold_k: 10.0,
            slope_eps: 1e-7,
            min_peak_spacing: 4,
            max_peak_spacing: 6,
            threshold_floor: 1e-3,
            initial_threshold: 1e-3,
        }
    }
}

/// Sub-sample peak refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolatorConfig {
    /// Which refinement to run.
    pub method: InterpolationMethod,
    /// Half-width of the sinc kernel, in samples.
    pub neighbours: usize,
    /// Scale the peak region by its absolute maximum first.
    pub normalize: bool,
    /// Newton steps allowed per sinc peak.
    pub max_iterations: usize,
}

impl Default for InterpolatorConfig {
    fn default() -> Self {
        Self {
            method: InterpolationMethod::Parabolic,
            neighbours: 5,
            normalize: true,
            max_iterations: 10,
        }
    }
}

/// Lag search between the two peak trains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Largest lag searched, in peaks. Capped at `n_peaks - 1`.
    pub max_lag: usize,
    /// Correlations this close count as a tie.
    pub tie_eps: f32,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            max_lag: 10,
            tie_eps: 1e-4,
        }
    }
}

/// Propagation delay estimation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    /// How the two channel intercepts combine into one delay.
    pub policy: DelayPolicy,
}

/// Physical layout of the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Geometry {
    /// Speed of sound in air.
    pub sound_speed_m_s: f32,
    /// Spacing between the two microphones.
    pub sensor_distance_m: f32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            sound_speed_m_s: 343.0,
            sensor_distance_m: 0.1,
        }
    }
}

impl Geometry {
    /// The speed of sound in the units the solver works in.
    pub fn sound_speed_cm_per_us(&self) -> f32 {
        self.sound_speed_m_s * 1e-4
    }

    /// Converts a channel time difference in microseconds to `sin(angle)`.
    pub fn angle_factor(&self) -> f32 {
        (self.sound_speed_m_s / self.sensor_distance_m) * 1e-6
    }
}

/// Whole-capture options of the solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Remove DC offset and rescale around the peaks before interpolating.
    pub condition: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self { condition: true }
    }
}

/// The whole configuration, one section per stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Converter and ring.
    pub acquisition: AcquisitionConfig,
    /// Applied to each channel.
    pub analyzer: AnalyzerConfig,
    /// Sub-sample peaks.
    pub interpolator: InterpolatorConfig,
    /// Channel time difference.
    pub correlator: CorrelatorConfig,
    /// Propagation delay.
    pub delay: DelayConfig,
    /// Receiver layout.
    pub geometry: Geometry,
    /// Solver options.
    pub solver: SolverConfig,
}

impl LocatorConfig {
    /// Read and validate a configuration from a RON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_ron(&text)
    }

    /// Parse and validate.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: LocatorConfig = ron::from_str(text).map_err(ConfigError::RonSpanned)?;
        config.validate()?;
        Ok(config)
    }

    /// Pretty-printed RON.
    pub fn to_ron(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, PrettyConfig::default()).map_err(ConfigError::Ron)
    }

    /// Write [`to_ron`](Self::to_ron) to a file.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        fs::write(path, self.to_ron()?).map_err(ConfigError::Io)
    }

    /// Reject combinations the pipeline cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let acq = &self.acquisition;
        let ana = &self.analyzer;
        let invalid = |why: &str| Err(ConfigError::Invalid(why.to_string()));

        if acq.sample_rate_hz == 0 {
            return invalid("sample_rate_hz must be positive");
        }
        if acq.chunk_frames == 0 || acq.frames_per_signal == 0 || acq.ring_capacity == 0 {
            return invalid("chunk_frames, frames_per_signal and ring_capacity must be positive");
        }
        if acq.frames_per_signal as u64 > acq.ring_capacity {
            return invalid("frames_per_signal cannot exceed ring_capacity");
        }
        if acq.noise_frames < ana.noise_window {
            return invalid("noise_frames must cover the analyzer noise_window");
        }
        if ana.n_peaks < 2 || ana.energy_window == 0 || ana.coarse_step == 0 {
            return invalid("n_peaks must be at least 2, energy_window and coarse_step positive");
        }
        if ana.min_peak_spacing > ana.max_peak_spacing {
            return invalid("min_peak_spacing exceeds max_peak_spacing");
        }
        if self.interpolator.neighbours == 0 {
            return invalid("interpolator neighbours must be positive");
        }
        if self.geometry.sound_speed_m_s <= 0.0 || self.geometry.sensor_distance_m <= 0.0 {
            return invalid("geometry must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = LocatorConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.acquisition.sample_period_us() - 5.208_333).abs() < 1e-4);
        assert!((config.geometry.sound_speed_cm_per_us() - 0.0343).abs() < 1e-6);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let text = "(geometry: (sensor_distance_m: 0.12), interpolator: (method: WindowedSinc))";
        let config = LocatorConfig::from_ron(text).unwrap();
        assert_eq!(config.geometry.sensor_distance_m, 0.12);
        assert_eq!(config.geometry.sound_speed_m_s, 343.0);
        assert_eq!(config.interpolator.method, InterpolationMethod::WindowedSinc);
        assert_eq!(config.analyzer, AnalyzerConfig::default());
    }

    #[test]
    fn survives_a_trip_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locator.ron");

        let mut config = LocatorConfig::default();
        config.delay.policy = DelayPolicy::Mean;
        config.acquisition.ring_capacity = 4096;
        config.to_path(&path).unwrap();

        assert_eq!(LocatorConfig::from_path(&path).unwrap(), config);
    }

    #[test]
    fn rejects_inverted_peak_spacing() {
        let text = "(analyzer: (min_peak_spacing: 7, max_peak_spacing: 5))";
        assert!(matches!(
            LocatorConfig::from_ron(text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_signal_longer_than_ring() {
        let mut config = LocatorConfig::default();
        config.acquisition.frames_per_signal = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            LocatorConfig::from_ron("(analyzer: 12"),
            Err(ConfigError::RonSpanned(_))
        ));
    }
}
