//! Batch orchestration: fan the per-sample baseline and peak-fit work out
//! over a thread pool, then merge results back into the dataset in a single
//! deterministic pass. One bad sample never aborts the batch; it is recorded
//! in the [`BatchReport`] and the rest proceed.

use std::fmt::Display;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::baseline::{fit_baseline, BaselineError, BaselineParams};
use crate::crossover::{locate_crossover, CrossoverError};
use crate::dataset::Dataset;
use crate::peak_fit::{fit_peaks, PeakFitParams};
use crate::trace::IonType;

/// An inclusive retention-time interval, parsed from `start-end`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: f64) -> bool {
        self.start <= time && time <= self.end
    }
}

impl Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for TimeWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split('-');
        let start = tokens
            .next()
            .ok_or_else(|| format!("`{s}` is missing a start time"))?
            .trim();
        let start: f64 = start
            .parse()
            .map_err(|e| format!("failed to parse window start `{start}`: {e}"))?;
        let end = match tokens.next().map(str::trim) {
            Some("") | None => f64::INFINITY,
            Some(tail) => tail
                .parse()
                .map_err(|e| format!("failed to parse window end `{tail}`: {e}"))?,
        };
        if start > end {
            return Err(format!("window start {start} exceeds its end {end}"));
        }
        Ok(Self { start, end })
    }
}

/// Which ion channels a pass should operate on
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IonSelection {
    Anion,
    Cation,
    #[default]
    Both,
}

impl IonSelection {
    pub fn ions(&self) -> &'static [IonType] {
        match self {
            IonSelection::Anion => &[IonType::Anion],
            IonSelection::Cation => &[IonType::Cation],
            IonSelection::Both => &IonType::BOTH,
        }
    }
}

/// Settings for one baseline pass over a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineConfig {
    /// Retention window fitted on the anion channel
    pub anion_window: TimeWindow,
    /// Retention window fitted on the cation channel
    pub cation_window: TimeWindow,
    /// Retention time at which the smoother switches stiffness
    pub crossover_time: f64,
    pub params: BaselineParams,
}

impl BaselineConfig {
    pub fn window_for(&self, ion: IonType) -> &TimeWindow {
        match ion {
            IonType::Anion => &self.anion_window,
            IonType::Cation => &self.cation_window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("the dataset has no reduced signal; run the baseline pass first")]
    ReducedSignalMissing,
}

/// Why a single sample cell did not produce a result
#[derive(Debug, Clone, PartialEq, Error)]
enum StepError {
    #[error(transparent)]
    Crossover(#[from] CrossoverError),
    #[error(transparent)]
    Baseline(#[from] BaselineError),
}

/// The terminal state of one (ion, sample) cell after a pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleStatus {
    Fitted,
    SkippedUnmeasured,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleOutcome {
    pub ion: IonType,
    pub sample_index: usize,
    pub ident: String,
    pub status: SampleStatus,
}

/// Per-cell outcomes of one pass, in (ion, sample) order
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub outcomes: Vec<SampleOutcome>,
}

impl BatchReport {
    pub fn fitted(&self) -> usize {
        self.count(|s| matches!(s, SampleStatus::Fitted))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, SampleStatus::SkippedUnmeasured))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, SampleStatus::Failed(_)))
    }

    fn count(&self, predicate: impl Fn(&SampleStatus) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|o| predicate(&o.status))
            .count()
    }
}

/// A progress event emitted while a pass runs. Events may arrive from worker
/// threads in any order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    SampleStarted {
        ion: IonType,
        ident: String,
    },
    SampleFinished {
        ion: IonType,
        ident: String,
    },
    SampleFailed {
        ion: IonType,
        ident: String,
        message: String,
    },
}

pub trait ProgressSink: Sync {
    fn record(&self, event: ProgressEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn record(&self, _event: ProgressEvent) {}
}

/// Forwards events to the `tracing` subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn record(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::SampleStarted { ion, ident } => {
                info!(%ion, ident, "processing sample")
            }
            ProgressEvent::SampleFinished { ion, ident } => {
                info!(%ion, ident, "finished sample")
            }
            ProgressEvent::SampleFailed { ion, ident, message } => {
                warn!(%ion, ident, message, "sample failed")
            }
        }
    }
}

/// Fit a two-region baseline for every measured (ion, sample) cell and
/// populate the dataset's `background` and `reduced_signal` variables.
///
/// Fitting is fanned out over the rayon pool; the write-back into the
/// dataset happens afterwards on the calling thread in cell order, so the
/// result does not depend on worker scheduling. Rerunning the pass replaces
/// the previous background rather than accumulating onto it.
pub fn apply_baseline(
    dataset: &mut Dataset,
    config: &BaselineConfig,
    selection: IonSelection,
    sink: &dyn ProgressSink,
) -> BatchReport {
    let mut report = BatchReport::default();
    let mut jobs = Vec::new();
    for ion in selection.ions().iter().copied() {
        for si in 0..dataset.n_samples() {
            if dataset.sample(si).is_measured(ion) {
                jobs.push((ion, si));
            } else {
                report.outcomes.push(SampleOutcome {
                    ion,
                    sample_index: si,
                    ident: dataset.sample(si).ident.clone(),
                    status: SampleStatus::SkippedUnmeasured,
                });
            }
        }
    }

    let shared: &Dataset = dataset;
    let results: Vec<(IonType, usize, Result<Vec<(usize, f64)>, StepError>)> = jobs
        .par_iter()
        .map(|(ion, si)| {
            let ident = shared.sample(*si).ident.clone();
            sink.record(ProgressEvent::SampleStarted {
                ion: *ion,
                ident: ident.clone(),
            });
            let outcome = baseline_cell(shared, *ion, *si, config);
            match &outcome {
                Ok(_) => sink.record(ProgressEvent::SampleFinished { ion: *ion, ident }),
                Err(e) => sink.record(ProgressEvent::SampleFailed {
                    ion: *ion,
                    ident,
                    message: e.to_string(),
                }),
            }
            (*ion, *si, outcome)
        })
        .collect();

    for (ion, si, outcome) in results {
        let status = match outcome {
            Ok(values) => {
                dataset.merge_background(ion, si, &values);
                SampleStatus::Fitted
            }
            Err(e) => SampleStatus::Failed(e.to_string()),
        };
        report.outcomes.push(SampleOutcome {
            ion,
            sample_index: si,
            ident: dataset.sample(si).ident.clone(),
            status,
        });
    }
    report
        .outcomes
        .sort_by_key(|o| (o.ion.axis_index(), o.sample_index));

    dataset.compute_reduced();
    report
}

fn baseline_cell(
    dataset: &Dataset,
    ion: IonType,
    sample: usize,
    config: &BaselineConfig,
) -> Result<Vec<(usize, f64)>, StepError> {
    let window = config.window_for(ion);
    let row = dataset.signal_row(ion, sample);

    // Keep the grid index of each usable point so the fitted baseline can be
    // written back at its original position
    let mut indices = Vec::new();
    let mut time = Vec::new();
    let mut signal = Vec::new();
    for (i, (t, y)) in dataset.time().iter().zip(row).enumerate() {
        if window.contains(*t) && !t.is_nan() && !y.is_nan() {
            indices.push(i);
            time.push(*t);
            signal.push(*y);
        }
    }

    let crossover = locate_crossover(&time, config.crossover_time)?;
    let fit = fit_baseline(&time, &signal, crossover, &config.params)?;
    Ok(indices.into_iter().zip(fit.baseline).collect())
}

/// Fit peaks on the reduced signal of every measured (ion, sample) cell.
///
/// Requires [`apply_baseline`] to have run; the peak models only make sense
/// on background-subtracted data.
pub fn fit_dataset_peaks(
    dataset: &mut Dataset,
    params: &PeakFitParams,
    selection: IonSelection,
    sink: &dyn ProgressSink,
) -> Result<BatchReport, PipelineError> {
    if !dataset.has_reduced_signal() {
        return Err(PipelineError::ReducedSignalMissing);
    }

    let mut report = BatchReport::default();
    let mut jobs = Vec::new();
    for ion in selection.ions().iter().copied() {
        for si in 0..dataset.n_samples() {
            if dataset.sample(si).is_measured(ion) {
                jobs.push((ion, si));
            } else {
                report.outcomes.push(SampleOutcome {
                    ion,
                    sample_index: si,
                    ident: dataset.sample(si).ident.clone(),
                    status: SampleStatus::SkippedUnmeasured,
                });
            }
        }
    }

    let shared: &Dataset = dataset;
    let results: Vec<_> = jobs
        .par_iter()
        .map(|(ion, si)| {
            let ident = shared.sample(*si).ident.clone();
            sink.record(ProgressEvent::SampleStarted {
                ion: *ion,
                ident: ident.clone(),
            });
            let row = shared.reduced_row(*ion, *si);
            let mut time = Vec::new();
            let mut signal = Vec::new();
            for (t, y) in shared.time().iter().zip(row) {
                if !t.is_nan() && !y.is_nan() {
                    time.push(*t);
                    signal.push(*y);
                }
            }
            let outcome = fit_peaks(&time, &signal, params);
            match &outcome {
                Ok(_) => sink.record(ProgressEvent::SampleFinished { ion: *ion, ident }),
                Err(e) => sink.record(ProgressEvent::SampleFailed {
                    ion: *ion,
                    ident,
                    message: e.to_string(),
                }),
            }
            (*ion, *si, outcome)
        })
        .collect();

    for (ion, si, outcome) in results {
        let status = match outcome {
            Ok(peaks) => {
                dataset.set_fitting_result(ion, si, peaks);
                SampleStatus::Fitted
            }
            Err(e) => SampleStatus::Failed(e.to_string()),
        };
        report.outcomes.push(SampleOutcome {
            ion,
            sample_index: si,
            ident: dataset.sample(si).ident.clone(),
            status,
        });
    }
    report
        .outcomes
        .sort_by_key(|o| (o.ion.axis_index(), o.sample_index));
    Ok(report)
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;
    use crate::dataset::GridConfig;
    use crate::peak_shape::GaussianPeakShape;
    use crate::trace::{SampleRecord, Trace};
    use chrono::NaiveDate;

    fn record(ident: &str, signal_of: impl Fn(f64) -> f64) -> SampleRecord {
        let time: Vec<f64> = (0..401).map(|i| i as f64 * 0.05).collect();
        let signal: Vec<f64> = time.iter().map(|t| signal_of(*t)).collect();
        let anion = Trace::new(time, signal).unwrap();
        SampleRecord {
            ident: ident.into(),
            measured_at: NaiveDate::from_ymd_opt(2024, 5, 4)
                .unwrap()
                .and_hms_opt(9, 30, 0)
                .unwrap(),
            cation: anion.to_placeholder(),
            anion,
            anion_measured: true,
            cation_measured: false,
        }
    }

    fn config() -> BaselineConfig {
        BaselineConfig {
            anion_window: TimeWindow::new(0.0, 20.0),
            cation_window: TimeWindow::new(0.0, 20.0),
            crossover_time: 10.0,
            params: BaselineParams::default(),
        }
    }

    #[test]
    fn test_window_parsing() {
        assert_eq!("2.5-30".parse::<TimeWindow>().unwrap(), TimeWindow::new(2.5, 30.0));
        let open = "4-".parse::<TimeWindow>().unwrap();
        assert_eq!(open.start, 4.0);
        assert!(open.end.is_infinite());
        assert!("30-2".parse::<TimeWindow>().is_err());
        assert!("abc-3".parse::<TimeWindow>().is_err());
    }

    #[test]
    fn test_baseline_pass_reduces_flat_offset() {
        let records = vec![record("w1_pos1", |_| 2.0)];
        let grid = GridConfig::new(0.0, 20.0, 401);
        let mut ds = Dataset::from_records(&records, &grid).unwrap();

        let report = apply_baseline(&mut ds, &config(), IonSelection::Both, &NullSink);
        assert_eq!(report.fitted(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed(), 0);

        let reduced = ds.reduced_row(IonType::Anion, 0);
        for y in reduced.iter().filter(|y| !y.is_nan()) {
            assert!(y.abs() < 0.05, "reduced value {y} is far from zero");
        }
        // Unmeasured cation cell was never fit
        assert!(ds.background_row(IonType::Cation, 0).iter().all(|y| y.is_nan()));
    }

    #[test]
    fn test_baseline_pass_is_idempotent() {
        let shape = GaussianPeakShape::new(8.0, 0.4, 6.0);
        let records = vec![record("w1_pos1", move |t| 1.5 + shape.density(t))];
        let grid = GridConfig::new(0.0, 20.0, 401);
        let mut ds = Dataset::from_records(&records, &grid).unwrap();

        apply_baseline(&mut ds, &config(), IonSelection::Anion, &NullSink);
        let first: Vec<f64> = ds.reduced_row(IonType::Anion, 0).to_vec();
        apply_baseline(&mut ds, &config(), IonSelection::Anion, &NullSink);
        assert_eq!(first, ds.reduced_row(IonType::Anion, 0));
    }

    #[test]
    fn test_windowing_leaves_outside_missing() {
        let records = vec![record("w1_pos1", |_| 2.0)];
        let grid = GridConfig::new(0.0, 20.0, 401);
        let mut ds = Dataset::from_records(&records, &grid).unwrap();

        let mut cfg = config();
        cfg.anion_window = TimeWindow::new(5.0, 15.0);
        apply_baseline(&mut ds, &cfg, IonSelection::Anion, &NullSink);

        let reduced = ds.reduced_row(IonType::Anion, 0);
        let time = ds.time().to_vec();
        for (t, y) in time.iter().zip(reduced) {
            if *t < 5.0 || *t > 15.0 {
                assert!(y.is_nan(), "t={t} outside the window should stay missing");
            }
        }
    }

    #[test]
    fn test_rerun_with_narrower_window_drops_stale_background() {
        let records = vec![record("w1_pos1", |_| 2.0)];
        let grid = GridConfig::new(0.0, 20.0, 401);
        let mut ds = Dataset::from_records(&records, &grid).unwrap();

        apply_baseline(&mut ds, &config(), IonSelection::Anion, &NullSink);
        let mut cfg = config();
        cfg.anion_window = TimeWindow::new(5.0, 15.0);
        apply_baseline(&mut ds, &cfg, IonSelection::Anion, &NullSink);

        let time = ds.time().to_vec();
        let background = ds.background_row(IonType::Anion, 0).to_vec();
        let reduced = ds.reduced_row(IonType::Anion, 0);
        for ((t, b), r) in time.iter().zip(&background).zip(reduced) {
            if *t < 5.0 || *t > 15.0 {
                assert!(b.is_nan(), "t={t} kept background {b} from the first pass");
                assert!(r.is_nan(), "t={t} kept reduced value {r} from the first pass");
            }
        }
    }

    #[test]
    fn test_peak_fit_requires_reduced_signal() {
        let records = vec![record("w1_pos1", |_| 2.0)];
        let grid = GridConfig::new(0.0, 20.0, 401);
        let mut ds = Dataset::from_records(&records, &grid).unwrap();

        let err = fit_dataset_peaks(
            &mut ds,
            &PeakFitParams::default(),
            IonSelection::Both,
            &NullSink,
        )
        .unwrap_err();
        assert_eq!(err, PipelineError::ReducedSignalMissing);
    }

    #[test]
    fn test_full_pass_recovers_peak() {
        let shape = GaussianPeakShape::new(8.0, 0.4, 6.0);
        let records = vec![record("w1_pos1", move |t| 1.5 + shape.density(t))];
        let grid = GridConfig::new(0.0, 20.0, 401);
        let mut ds = Dataset::from_records(&records, &grid).unwrap();

        apply_baseline(&mut ds, &config(), IonSelection::Anion, &NullSink);
        let report = fit_dataset_peaks(
            &mut ds,
            &PeakFitParams::default(),
            IonSelection::Anion,
            &NullSink,
        )
        .unwrap();
        assert_eq!(report.fitted(), 1);

        let peaks = ds.fitting_result(IonType::Anion, 0).unwrap();
        assert!(!peaks.is_empty());
        let main = peaks
            .peaks
            .iter()
            .max_by(|a, b| a.amplitude.total_cmp(&b.amplitude))
            .unwrap();
        assert!((main.location - 8.0).abs() < 0.5, "location {}", main.location);
    }

    #[test]
    fn test_failed_cell_recorded_not_fatal() {
        let records = vec![
            record("bad_pos1", |_| 2.0),
            record("good_pos2", |_| 2.0),
        ];
        let grid = GridConfig::new(0.0, 20.0, 401);
        let mut ds = Dataset::from_records(&records, &grid).unwrap();

        // A window this narrow keeps too few points for the smoother
        let mut cfg = config();
        cfg.anion_window = TimeWindow::new(0.0, 0.06);
        let report = apply_baseline(&mut ds, &cfg, IonSelection::Anion, &NullSink);
        assert_eq!(report.failed(), 2);

        cfg.anion_window = TimeWindow::new(0.0, 20.0);
        let report = apply_baseline(&mut ds, &cfg, IonSelection::Anion, &NullSink);
        assert_eq!(report.fitted(), 2);
    }

    struct RecordingSink(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for RecordingSink {
        fn record(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_progress_events_emitted() {
        let records = vec![record("w1_pos1", |_| 2.0)];
        let grid = GridConfig::new(0.0, 20.0, 401);
        let mut ds = Dataset::from_records(&records, &grid).unwrap();

        let sink = RecordingSink(Mutex::new(Vec::new()));
        apply_baseline(&mut ds, &config(), IonSelection::Anion, &sink);
        let events = sink.0.into_inner().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::SampleStarted { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::SampleFinished { .. })));
    }
}
