//! Writing processed results to disk: a peak table and a long-format trace
//! table as CSV, and the per-cell outcome report as JSON.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use icproc::dataset::Dataset;
use icproc::pipeline::BatchReport;
use icproc::trace::IonType;

use crate::driver::ICProcessorError;

#[derive(Debug, Serialize)]
struct PeakRow<'a> {
    ident: &'a str,
    ion_type: &'a str,
    peak: usize,
    location: f64,
    amplitude: f64,
    fwhm: f64,
    skew: f64,
    area: f64,
    score: f64,
}

#[derive(Debug, Serialize)]
struct TraceRow<'a> {
    ident: &'a str,
    ion_type: &'a str,
    time: f64,
    signal: f64,
    background: f64,
    reduced_signal: f64,
}

/// One row per fitted peak, over every measured (ion, sample) cell
pub fn write_peak_table(dataset: &Dataset, dir: &Path) -> Result<usize, ICProcessorError> {
    let path = dir.join("peaks.csv");
    let mut writer = csv::Writer::from_path(&path)?;
    let mut rows = 0;
    for ion in IonType::BOTH {
        for (si, sample) in dataset.samples().iter().enumerate() {
            let Some(fitted) = dataset.fitting_result(ion, si) else {
                continue;
            };
            for (pi, peak) in fitted.peaks.iter().enumerate() {
                writer.serialize(PeakRow {
                    ident: &sample.ident,
                    ion_type: ion.as_str(),
                    peak: pi,
                    location: peak.location,
                    amplitude: peak.amplitude,
                    fwhm: peak.fwhm,
                    skew: peak.skew,
                    area: peak.area,
                    score: peak.score,
                })?;
                rows += 1;
            }
        }
    }
    writer.flush().map_err(ICProcessorError::Io)?;
    info!(path = %path.display(), rows, "wrote peak table");
    Ok(rows)
}

/// Long-format dump of signal, background, and reduced signal on the shared
/// grid. Positions the sample never covered are omitted.
pub fn write_traces(dataset: &Dataset, dir: &Path) -> Result<(), ICProcessorError> {
    let path = dir.join("traces.csv");
    let mut writer = csv::Writer::from_path(&path)?;
    for ion in IonType::BOTH {
        for (si, sample) in dataset.samples().iter().enumerate() {
            if !sample.is_measured(ion) {
                continue;
            }
            let signal = dataset.signal_row(ion, si);
            let background = dataset.background_row(ion, si);
            let reduced = dataset.reduced_row(ion, si);
            for (i, t) in dataset.time().iter().enumerate() {
                if signal[i].is_nan() {
                    continue;
                }
                writer.serialize(TraceRow {
                    ident: &sample.ident,
                    ion_type: ion.as_str(),
                    time: *t,
                    signal: signal[i],
                    background: background[i],
                    reduced_signal: reduced[i],
                })?;
            }
        }
    }
    writer.flush().map_err(ICProcessorError::Io)?;
    info!(path = %path.display(), "wrote trace table");
    Ok(())
}

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    baseline: &'a BatchReport,
    peaks: &'a BatchReport,
}

pub fn write_report(
    baseline: &BatchReport,
    peaks: &BatchReport,
    dir: &Path,
) -> Result<(), ICProcessorError> {
    let path = dir.join("report.json");
    let handle = fs::File::create(&path)?;
    serde_json::to_writer_pretty(handle, &RunReport { baseline, peaks })?;
    info!(path = %path.display(), "wrote outcome report");
    Ok(())
}

/// Record the parameters the run actually used, so a processed folder is
/// reproducible without the original shell invocation
pub fn write_effective_config(rendered: &str, dir: &Path) -> Result<(), ICProcessorError> {
    let path = dir.join("icprocessor.toml");
    fs::write(&path, rendered)?;
    info!(path = %path.display(), "wrote effective configuration");
    Ok(())
}
