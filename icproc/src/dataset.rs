//! The labeled (ion_type, sample, time) container the orchestrators operate
//! on. All samples share one explicit time grid; positions a sample never
//! covered are NaN, which keeps per-sample extents intact through an
//! outer-join style merge.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::peak_fit::FittedPeaks;
use crate::trace::{IonType, SampleRecord, Trace};

pub const DEFAULT_GRID_POINTS: usize = 2000;

/// The explicit resampling grid every trace is interpolated onto.
///
/// Making the grid an input rather than a side effect of data loading keeps
/// two imports of the same folder byte-comparable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub start: f64,
    pub end: f64,
    pub points: usize,
}

impl GridConfig {
    pub fn new(start: f64, end: f64, points: usize) -> Self {
        Self { start, end, points }
    }

    /// A grid spanning the global min/max time over every record's traces
    pub fn spanning(records: &[SampleRecord], points: usize) -> Option<Self> {
        let mut start = f64::INFINITY;
        let mut end = f64::NEG_INFINITY;
        for record in records {
            for ion in IonType::BOTH {
                for t in &record.trace(ion).time {
                    if t.is_finite() {
                        start = start.min(*t);
                        end = end.max(*t);
                    }
                }
            }
        }
        (start < end).then_some(Self { start, end, points })
    }

    pub fn validate(&self) -> Result<(), DatasetError> {
        if !(self.start < self.end) || self.points < 2 {
            return Err(DatasetError::BadGrid {
                start: self.start,
                end: self.end,
                points: self.points,
            });
        }
        Ok(())
    }

    pub fn axis(&self) -> Vec<f64> {
        let step = (self.end - self.start) / (self.points - 1) as f64;
        (0..self.points)
            .map(|i| self.start + step * i as f64)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DatasetError {
    #[error("cannot build a dataset from zero sample records")]
    NoSamples,
    #[error("sample `{ident}` has a non-increasing {ion} time axis at position {position}")]
    UnorderedTime {
        ident: String,
        ion: IonType,
        position: usize,
    },
    #[error("invalid resampling grid: start {start}, end {end}, {points} points")]
    BadGrid {
        start: f64,
        end: f64,
        points: usize,
    },
}

/// Per-sample metadata carried along the sample axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleInfo {
    pub ident: String,
    pub measured_at: NaiveDateTime,
    pub anion_measured: bool,
    pub cation_measured: bool,
}

impl SampleInfo {
    pub fn is_measured(&self, ion: IonType) -> bool {
        match ion {
            IonType::Anion => self.anion_measured,
            IonType::Cation => self.cation_measured,
        }
    }
}

impl From<&SampleRecord> for SampleInfo {
    fn from(record: &SampleRecord) -> Self {
        Self {
            ident: record.ident.clone(),
            measured_at: record.measured_at,
            anion_measured: record.anion_measured,
            cation_measured: record.cation_measured,
        }
    }
}

/// A batch of runs on one shared time grid, with the `signal`,
/// `background`, `reduced_signal`, and `fitting_results` variables of the
/// processing pipeline. Constructed once per import; the orchestrators add
/// variables but never touch `signal` or the time axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    time: Vec<f64>,
    samples: Vec<SampleInfo>,
    signal: Vec<f64>,
    background: Vec<f64>,
    reduced: Vec<f64>,
    results: Vec<Option<FittedPeaks>>,
    has_background: bool,
}

impl Dataset {
    /// Resample every record onto `grid` and assemble the dataset. Records
    /// are ordered by measurement time, the acquisition order.
    pub fn from_records(records: &[SampleRecord], grid: &GridConfig) -> Result<Self, DatasetError> {
        if records.is_empty() {
            return Err(DatasetError::NoSamples);
        }
        grid.validate()?;

        let mut ordered: Vec<&SampleRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.measured_at);

        let time = grid.axis();
        let n_time = time.len();
        let n_samples = ordered.len();
        let mut signal = vec![f64::NAN; 2 * n_samples * n_time];

        for (si, record) in ordered.iter().enumerate() {
            for ion in IonType::BOTH {
                let clean = record.trace(ion).drop_missing();
                if let Err(crate::trace::TraceError::UnorderedTime(position)) =
                    clean.check_ordered()
                {
                    return Err(DatasetError::UnorderedTime {
                        ident: record.ident.clone(),
                        ion,
                        position,
                    });
                }
                let row = resample_onto(&clean, &time);
                let offset = (ion.axis_index() * n_samples + si) * n_time;
                signal[offset..offset + n_time].copy_from_slice(&row);
            }
        }

        let samples = ordered.iter().map(|r| SampleInfo::from(*r)).collect();
        let cells = 2 * n_samples;
        Ok(Self {
            background: vec![f64::NAN; signal.len()],
            reduced: vec![f64::NAN; signal.len()],
            results: vec![None; cells],
            time,
            samples,
            signal,
            has_background: false,
        })
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[SampleInfo] {
        &self.samples
    }

    pub fn sample(&self, index: usize) -> &SampleInfo {
        &self.samples[index]
    }

    fn row_offset(&self, ion: IonType, sample: usize) -> usize {
        (ion.axis_index() * self.samples.len() + sample) * self.time.len()
    }

    pub fn signal_row(&self, ion: IonType, sample: usize) -> &[f64] {
        let offset = self.row_offset(ion, sample);
        &self.signal[offset..offset + self.time.len()]
    }

    pub fn background_row(&self, ion: IonType, sample: usize) -> &[f64] {
        let offset = self.row_offset(ion, sample);
        &self.background[offset..offset + self.time.len()]
    }

    pub fn reduced_row(&self, ion: IonType, sample: usize) -> &[f64] {
        let offset = self.row_offset(ion, sample);
        &self.reduced[offset..offset + self.time.len()]
    }

    /// Whether `reduced_signal` has been computed by the baseline pass
    pub fn has_reduced_signal(&self) -> bool {
        self.has_background
    }

    pub fn fitting_result(&self, ion: IonType, sample: usize) -> Option<&FittedPeaks> {
        self.results[ion.axis_index() * self.samples.len() + sample].as_ref()
    }

    pub(crate) fn set_fitting_result(
        &mut self,
        ion: IonType,
        sample: usize,
        result: FittedPeaks,
    ) {
        let cell = ion.axis_index() * self.samples.len() + sample;
        self.results[cell] = Some(result);
    }

    /// Replace the cell's background row with fitted values written back at
    /// their original grid positions. Positions not listed become missing,
    /// including any carried over from an earlier pass.
    pub(crate) fn merge_background(
        &mut self,
        ion: IonType,
        sample: usize,
        values: &[(usize, f64)],
    ) {
        let offset = self.row_offset(ion, sample);
        let n = self.time.len();
        self.background[offset..offset + n].fill(f64::NAN);
        for (index, value) in values {
            self.background[offset + index] = *value;
        }
    }

    /// Recompute `reduced_signal = signal - background` over the whole grid;
    /// missing on either side stays missing in the result
    pub(crate) fn compute_reduced(&mut self) {
        for (out, (y, b)) in self
            .reduced
            .iter_mut()
            .zip(self.signal.iter().zip(self.background.iter()))
        {
            *out = y - b;
        }
        self.has_background = true;
    }
}

/// Linearly interpolate a gap-free trace onto a grid; grid positions beyond
/// the trace's own extent become NaN rather than extrapolations.
fn resample_onto(clean: &Trace, axis: &[f64]) -> Vec<f64> {
    let mut out = vec![f64::NAN; axis.len()];
    if clean.len() < 2 {
        return out;
    }
    let first = clean.time[0];
    let last = clean.time[clean.time.len() - 1];
    let mut seg = 0usize;
    for (i, t) in axis.iter().copied().enumerate() {
        if t < first || t > last {
            continue;
        }
        while seg + 2 < clean.time.len() && clean.time[seg + 1] < t {
            seg += 1;
        }
        let (t0, t1) = (clean.time[seg], clean.time[seg + 1]);
        let (y0, y1) = (clean.signal[seg], clean.signal[seg + 1]);
        let span = t1 - t0;
        out[i] = if span == 0.0 {
            y0
        } else {
            y0 + (t - t0) / span * (y1 - y0)
        };
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::trace::UNMEASURED_PLACEHOLDER;
    use chrono::NaiveDate;

    fn record(ident: &str, day: u32, slope: f64) -> SampleRecord {
        let time: Vec<f64> = (0..11).map(|i| i as f64).collect();
        let signal: Vec<f64> = time.iter().map(|t| t * slope).collect();
        let anion = Trace::new(time, signal).unwrap();
        SampleRecord {
            ident: ident.into(),
            measured_at: NaiveDate::from_ymd_opt(2024, 3, day)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            cation: anion.to_placeholder(),
            anion,
            anion_measured: true,
            cation_measured: false,
        }
    }

    #[test]
    fn test_from_records_resamples_and_orders() {
        // Records deliberately out of acquisition order
        let records = vec![record("b_pos2", 2, 2.0), record("a_pos1", 1, 1.0)];
        let grid = GridConfig::new(0.0, 10.0, 21);
        let ds = Dataset::from_records(&records, &grid).unwrap();

        assert_eq!(ds.n_samples(), 2);
        assert_eq!(ds.sample(0).ident, "a_pos1");
        assert_eq!(ds.sample(1).ident, "b_pos2");
        assert_eq!(ds.time().len(), 21);

        // Sample 0 has slope 1: at grid t=2.5 the interpolated value is 2.5
        let row = ds.signal_row(IonType::Anion, 0);
        assert!((row[5] - 2.5).abs() < 1e-12);
        // Sample 1 has slope 2
        let row = ds.signal_row(IonType::Anion, 1);
        assert!((row[5] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_placeholder_channel_is_sentinel_not_missing() {
        let records = vec![record("a_pos1", 1, 1.0)];
        let grid = GridConfig::new(0.0, 10.0, 21);
        let ds = Dataset::from_records(&records, &grid).unwrap();
        let row = ds.signal_row(IonType::Cation, 0);
        assert!(row.iter().all(|y| *y == UNMEASURED_PLACEHOLDER));
        assert!(!ds.sample(0).is_measured(IonType::Cation));
    }

    #[test]
    fn test_out_of_extent_positions_missing() {
        let records = vec![record("a_pos1", 1, 1.0)];
        // Grid wider than the trace's 0..=10 extent
        let grid = GridConfig::new(-5.0, 15.0, 41);
        let ds = Dataset::from_records(&records, &grid).unwrap();
        let row = ds.signal_row(IonType::Anion, 0);
        assert!(row[0].is_nan());
        assert!(row[40].is_nan());
        let inside = row.iter().filter(|y| !y.is_nan()).count();
        assert_eq!(inside, 21);
    }

    #[test]
    fn test_reduced_signal_nan_propagation() {
        let records = vec![record("a_pos1", 1, 1.0)];
        let grid = GridConfig::new(0.0, 10.0, 11);
        let mut ds = Dataset::from_records(&records, &grid).unwrap();

        ds.merge_background(IonType::Anion, 0, &[(0, 0.25), (1, 0.25)]);
        ds.compute_reduced();

        let reduced = ds.reduced_row(IonType::Anion, 0);
        assert!((reduced[0] - (0.0 - 0.25)).abs() < 1e-12);
        assert!((reduced[1] - (1.0 - 0.25)).abs() < 1e-12);
        // No background fitted beyond index 1
        assert!(reduced[2].is_nan());
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            Dataset::from_records(&[], &GridConfig::new(0.0, 1.0, 10)).unwrap_err(),
            DatasetError::NoSamples
        );
        let records = vec![record("a_pos1", 1, 1.0)];
        assert!(matches!(
            Dataset::from_records(&records, &GridConfig::new(1.0, 1.0, 10)).unwrap_err(),
            DatasetError::BadGrid { .. }
        ));
    }

    #[test]
    fn test_spanning_grid() {
        let records = vec![record("a_pos1", 1, 1.0)];
        let grid = GridConfig::spanning(&records, 101).unwrap();
        assert_eq!(grid.start, 0.0);
        assert_eq!(grid.end, 10.0);
        assert_eq!(grid.axis().len(), 101);
    }
}
