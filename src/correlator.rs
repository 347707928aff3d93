//! Channel time difference from two trains of interpolated peaks.
//!
//! Matching peak `i` on the left to peak `i` on the right is only right when
//! both channels caught the same first peak. The correlator first finds the
//! peak-index lag at which the two amplitude envelopes line up best, then
//! pairs peaks under that lag and takes the median of their time
//! differences.

use crate::config::CorrelatorConfig;
use crate::peak_interpolator::InterpolatedPeak;

use log::debug;

/// Outcome of a correlation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correlation {
    /// Right peak `i + lag` pairs with left peak `i`.
    pub lag: i32,
    /// Normalized correlation of the amplitudes at `lag`, in `[-1, 1]`.
    pub correlation: f32,
    /// Median of `right - left` peak times, in microseconds.
    pub t_diff_us: f32,
}

/// Dot product over the square root of the product of energies. A silent
/// side correlates at -1.
fn normalized_correlation(a: &[f32], b: &[f32]) -> f32 {
    let (num, da, db) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(num, da, db), (x, y)| {
            (num + x * y, da + x * x, db + y * y)
        });
    let denom = (da * db).sqrt();
    if denom < 1e-12 {
        return -1.0;
    }
    num / denom
}

/// Median of an unsorted set; mean of the middle two for even sizes. Empty
/// sets have median 0.
pub fn median(mut values: Vec<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        0.5 * (values[mid - 1] + values[mid])
    }
}

/// `right - left` time of every peak pair under `lag`.
fn time_diffs(left: &[InterpolatedPeak], right: &[InterpolatedPeak], lag: i32) -> Vec<f32> {
    let shift = lag.unsigned_abs() as usize;
    if lag >= 0 {
        left.iter()
            .zip(right.iter().skip(shift))
            .map(|(l, r)| r.time_us - l.time_us)
            .collect()
    } else {
        left.iter()
            .skip(shift)
            .zip(right.iter())
            .map(|(l, r)| r.time_us - l.time_us)
            .collect()
    }
}

/// Matches the peak trains of the two channels.
#[derive(Debug, Clone)]
pub struct CrossPeakCorrelator {
    config: CorrelatorConfig,
}

impl CrossPeakCorrelator {
    /// A correlator searching `config.max_lag` peaks either way.
    pub fn new(config: CorrelatorConfig) -> Self {
        Self { config }
    }

    /// Normalized correlation at every lag in `[-L, L]`,
    /// `L = min(max_lag, n - 1)`, comparing windows of the same width
    /// `n - L` at every lag. Empty when either side is.
    pub fn lag_scores(&self, left: &[f32], right: &[f32]) -> Vec<(i32, f32)> {
        let n = left.len().min(right.len());
        if n == 0 {
            return Vec::new();
        }

        let max_lag = self.config.max_lag.min(n - 1) as i32;
        let width = n - max_lag as usize;

        (-max_lag..=max_lag)
            .map(|lag| {
                let i0 = if lag < 0 { -lag } else { 0 } as usize;
                let j0 = (i0 as i32 + lag) as usize;
                let c = normalized_correlation(&left[i0..i0 + width], &right[j0..j0 + width]);
                (lag, c)
            })
            .collect()
    }

    /** correlate()
     * @brief   Right-minus-left time offset between two peak trains
     * @param   Left and right peaks, in order of time
     * @returns The winning lag, its correlation and the median time difference
     *
     * Every lag within `tie_eps` of the best correlation is a candidate. The
     * smallest |lag| wins, then the larger correlation, then the smaller
     * |t_diff|. When `+k` and `-k` still cannot be told apart the peaks are
     * paired unshifted, so swapping the channels always negates the result.
     */
    pub fn correlate(&self, left: &[InterpolatedPeak], right: &[InterpolatedPeak]) -> Correlation {
        let amp_l: Vec<f32> = left.iter().map(|p| p.amplitude).collect();
        let amp_r: Vec<f32> = right.iter().map(|p| p.amplitude).collect();
        let scores = self.lag_scores(&amp_l, &amp_r);

        let at_lag = |lag: i32, correlation: f32| Correlation {
            lag,
            correlation,
            t_diff_us: median(time_diffs(left, right, lag)),
        };

        let best = scores
            .iter()
            .map(|&(_, c)| c)
            .fold(f32::NEG_INFINITY, f32::max);
        let mut candidates: Vec<Correlation> = scores
            .iter()
            .filter(|&&(_, c)| c >= best - self.config.tie_eps)
            .map(|&(lag, c)| at_lag(lag, c))
            .collect();
        candidates.sort_by(|a, b| {
            a.lag
                .abs()
                .cmp(&b.lag.abs())
                .then(b.correlation.total_cmp(&a.correlation))
                .then(a.t_diff_us.abs().total_cmp(&b.t_diff_us.abs()))
        });

        let chosen = match candidates.as_slice() {
            [first, second, ..]
                if first.lag != 0
                    && first.lag == -second.lag
                    && first.correlation == second.correlation
                    && first.t_diff_us.abs() == second.t_diff_us.abs() =>
            {
                debug!(
                    "CrossPeakCorrelator : lags {} and {} are indistinguishable, pairing unshifted",
                    first.lag, second.lag
                );
                let unshifted = scores
                    .iter()
                    .find(|&&(lag, _)| lag == 0)
                    .map_or(-1.0, |&(_, c)| c);
                at_lag(0, unshifted)
            }
            [first, ..] => *first,
            [] => at_lag(0, -1.0),
        };

        debug!(
            "CrossPeakCorrelator : lag {}, corr {:.4}, t_diff {:.3} us",
            chosen.lag, chosen.correlation, chosen.t_diff_us
        );
        chosen
    }
}
