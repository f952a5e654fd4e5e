//! Multi-peak decomposition of one baseline-reduced trace: detect candidate
//! apexes, partition the trace at the valleys between them, and fit one
//! skewed-Gaussian model per region.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::peak_shape::{FitConfig, PeakShape, PeakShapeModel, SkewedGaussianPeakShape};

/// Settings for one whole-trace peak fit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakFitParams {
    /// Apexes below this fraction of the trace maximum are ignored
    pub min_height_fraction: f64,
    /// A candidate region must span at least this many points to be fit
    pub min_region_points: usize,
    pub fit: FitConfig,
}

impl Default for PeakFitParams {
    fn default() -> Self {
        Self {
            min_height_fraction: 0.05,
            min_region_points: 5,
            fit: FitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PeakFitError {
    #[error("cannot fit peaks on an empty trace")]
    EmptyTrace,
    #[error("peak model near time {location} diverged to a non-finite loss")]
    FitFailure { location: f64 },
}

/// One fitted peak, reported in trace units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FittedPeak {
    pub shape: PeakShape,
    pub location: f64,
    pub amplitude: f64,
    pub fwhm: f64,
    pub skew: f64,
    pub area: f64,
    pub score: f64,
}

/// The full decomposition of one trace
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPeaks {
    pub peaks: Vec<FittedPeak>,
    /// Fraction of trace variance explained by the summed peak models
    pub score: f64,
    /// Root-mean-square residual of the summed models over the whole trace
    pub residual_rms: f64,
}

impl FittedPeaks {
    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }
}

/// Decompose a gap-free trace into fitted peaks.
///
/// A trace with no apex above the height threshold fits to an empty peak
/// list; that is a valid outcome, not an error.
pub fn fit_peaks(
    time: &[f64],
    signal: &[f64],
    params: &PeakFitParams,
) -> Result<FittedPeaks, PeakFitError> {
    if time.is_empty() || signal.is_empty() {
        return Err(PeakFitError::EmptyTrace);
    }
    let n = time.len().min(signal.len());
    let time = &time[..n];
    let signal = &signal[..n];

    let apexes = find_apexes(signal, params.min_height_fraction);
    if apexes.is_empty() {
        debug!("no apex above threshold, reporting an empty peak list");
        return Ok(FittedPeaks::default());
    }
    let regions = partition_at_valleys(signal, &apexes);

    let mut peaks = Vec::with_capacity(apexes.len());
    for (apex, (start, end)) in apexes.iter().zip(regions) {
        if end - start < params.min_region_points {
            continue;
        }
        let seg_time = &time[start..end];
        let seg_signal = &signal[start..end];

        let width = seg_time[seg_time.len() - 1] - seg_time[0];
        let mut model = SkewedGaussianPeakShape::new(
            time[*apex],
            (width / 4.0).max(f64::EPSILON),
            signal[*apex],
            0.0,
        );
        let result = model.fit_with(seg_time, seg_signal, params.fit);
        if !result.success {
            return Err(PeakFitError::FitFailure {
                location: time[*apex],
            });
        }
        debug!(
            location = model.mu,
            loss = result.loss,
            iterations = result.iterations,
            converged = result.converged,
            "fitted peak region"
        );
        peaks.push(FittedPeak {
            location: model.mu,
            amplitude: model.amplitude,
            fwhm: model.fwhm(),
            skew: model.lambda,
            area: model.area(seg_time),
            score: model.score(seg_time, seg_signal),
            shape: PeakShape::SkewedGaussian(model),
        });
    }

    let (score, residual_rms) = whole_trace_metrics(time, signal, &peaks);
    Ok(FittedPeaks {
        peaks,
        score,
        residual_rms,
    })
}

/// Local maxima above `min_height_fraction` of the trace maximum
fn find_apexes(signal: &[f64], min_height_fraction: f64) -> Vec<usize> {
    let max = signal.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max > 0.0) {
        return Vec::new();
    }
    let threshold = max * min_height_fraction;
    let mut apexes = Vec::new();
    for i in 1..signal.len().saturating_sub(1) {
        if signal[i] > signal[i - 1] && signal[i] >= signal[i + 1] && signal[i] >= threshold {
            apexes.push(i);
        }
    }
    apexes
}

/// Half-open index ranges around each apex, split at the minimum between
/// consecutive apexes
fn partition_at_valleys(signal: &[f64], apexes: &[usize]) -> Vec<(usize, usize)> {
    let mut boundaries = Vec::with_capacity(apexes.len() + 1);
    boundaries.push(0);
    for pair in apexes.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let valley = (a..=b)
            .min_by(|i, j| signal[*i].total_cmp(&signal[*j]))
            .unwrap_or(a);
        boundaries.push(valley);
    }
    boundaries.push(signal.len());

    boundaries
        .windows(2)
        .map(|pair| (pair[0], pair[1]))
        .collect()
}

fn whole_trace_metrics(time: &[f64], signal: &[f64], peaks: &[FittedPeak]) -> (f64, f64) {
    let n = signal.len() as f64;
    let mean = signal.iter().sum::<f64>() / n;
    let mut ss_total = 0.0;
    let mut ss_resid = 0.0;
    for (t, y) in time.iter().zip(signal) {
        let predicted: f64 = peaks.iter().map(|p| p.shape.density(*t)).sum();
        ss_total += (y - mean).powi(2);
        ss_resid += (y - predicted).powi(2);
    }
    let score = if ss_total > 0.0 {
        (1.0 - ss_resid / ss_total).clamp(0.0, 1.0)
    } else {
        0.0
    };
    (score, (ss_resid / n).sqrt())
}
