use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Instant;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use icproc::baseline::BaselineParams;
use icproc::dataset::{Dataset, DatasetError, GridConfig, DEFAULT_GRID_POINTS};
use icproc::peak_fit::PeakFitParams;
use icproc::pipeline::{
    apply_baseline, fit_dataset_peaks, BaselineConfig, PipelineError, TimeWindow, TracingSink,
};
use icproc::reader::{read_folder, stage_imports, ReaderError};

use crate::args::{non_negative_float, ArgIonSelection, ArgSmoothingMethod};
use crate::export;
use crate::progress::BatchCounts;

#[derive(Debug, Error)]
pub enum ICProcessorError {
    #[error("An IO error occurred: {0}")]
    Io(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("Failed to resolve configuration: {0}")]
    Config(
        #[source]
        #[from]
        figment::Error,
    ),
    #[error(transparent)]
    Reader(#[from] ReaderError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("Failed to write CSV output: {0}")]
    Export(
        #[source]
        #[from]
        csv::Error,
    ),
    #[error("Failed to write the outcome report: {0}")]
    Report(
        #[source]
        #[from]
        serde_json::Error,
    ),
    #[error("Failed to render the effective configuration: {0}")]
    ConfigRender(
        #[source]
        #[from]
        toml::ser::Error,
    ),
    #[error("`{0}` contains no usable chromatogram data")]
    NoUsableData(PathBuf),
}

/// Baseline correction and peak fitting for ion chromatography exports.
///
/// Read a folder of instrument `.txt` exports, assemble them onto a shared
/// time grid, subtract a two-region baseline, fit peaks, and write the
/// results out as CSV and JSON.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version)]
pub struct ICProcessor {
    /// The folder containing the instrument `.txt` exports to process
    #[arg()]
    pub input_dir: PathBuf,

    /// The folder to write processed results into
    #[arg(short = 'o', long = "output-dir", default_value = "processed")]
    pub output_dir: PathBuf,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read additional parameters from.
    ///
    /// Configurations are also read from `icprocessor.toml` in the working
    /// directory. Environment variables prefixed with `ICPROCESSOR_` will be
    /// read too.
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// The number of threads to use, passing a value < 1 to use all available threads
    #[arg(
        short='t',
        long="threads",
        default_value_t=-1,
    )]
    pub threads: i32,

    /// Which ion channels to process
    #[arg(short = 'n', long = "ion", default_value = "both")]
    pub ion: ArgIonSelection,

    /// Do not snapshot the raw exports into a `from_import` subfolder
    #[arg(long = "no-stage")]
    pub no_stage: bool,

    /// The anion retention window to fit, denoted (start?)-(stop?) in seconds
    #[arg(
        long = "anion-window",
        value_parser = TimeWindow::from_str,
        value_name = "BEGIN-END",
        default_value_t = TimeWindow::new(0.0, f64::INFINITY),
    )]
    pub anion_window: TimeWindow,

    /// The cation retention window to fit, denoted (start?)-(stop?) in seconds
    #[arg(
        long = "cation-window",
        value_parser = TimeWindow::from_str,
        value_name = "BEGIN-END",
        default_value_t = TimeWindow::new(0.0, f64::INFINITY),
    )]
    pub cation_window: TimeWindow,

    /// The retention time at which the baseline switches from the stiff to
    /// the flexible smoothness penalty
    #[arg(short = 'x', long = "crossover-time", default_value_t = 160.0)]
    pub crossover_time: f64,

    /// The smoothness penalty before the crossover
    #[arg(long = "lam-early", default_value_t = 1e8, value_parser = non_negative_float)]
    pub lam_early: f64,

    /// The smoothness penalty from the crossover onward
    #[arg(long = "lam-late", default_value_t = 1e6, value_parser = non_negative_float)]
    pub lam_late: f64,

    /// The asymmetric reweighting scheme for the baseline
    #[arg(long = "method", default_value = "ar-pls")]
    pub method: ArgSmoothingMethod,

    /// Fit the baseline on every k-th point and interpolate back
    #[arg(long = "sampling-stride", default_value_t = 15)]
    pub sampling_stride: usize,

    /// The maximum number of baseline reweighting sweeps per sample
    #[arg(long = "baseline-max-iter", default_value_t = 50)]
    pub baseline_max_iter: usize,

    /// The relative weight-change threshold for baseline convergence
    #[arg(long = "baseline-tol", default_value_t = 1e-3, value_parser = non_negative_float)]
    pub baseline_tol: f64,

    /// The asymmetry parameter used by the as-ls method
    #[arg(long = "asymmetry", default_value_t = 0.01, value_parser = non_negative_float)]
    pub asymmetry: f64,

    /// The number of points on the shared resampling grid
    #[arg(long = "grid-points", default_value_t = DEFAULT_GRID_POINTS)]
    pub grid_points: usize,

    /// Override the start of the shared grid instead of spanning the data
    #[arg(long = "grid-start")]
    pub grid_start: Option<f64>,

    /// Override the end of the shared grid instead of spanning the data
    #[arg(long = "grid-end")]
    pub grid_end: Option<f64>,

    /// Apexes below this fraction of a trace's maximum are not fit as peaks
    #[arg(long = "min-height-fraction", default_value_t = 0.05, value_parser = non_negative_float)]
    pub min_height_fraction: f64,
}

impl ICProcessor {
    fn create_threadpool(&self) -> rayon::ThreadPool {
        let num_threads = if self.threads > 0 {
            self.threads as usize
        } else {
            thread::available_parallelism().unwrap().into()
        };
        debug!("Using {} cores", num_threads);
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .unwrap()
    }

    fn baseline_config(&self) -> BaselineConfig {
        BaselineConfig {
            anion_window: self.anion_window,
            cation_window: self.cation_window,
            crossover_time: self.crossover_time,
            params: BaselineParams {
                lam_early: self.lam_early,
                lam_late: self.lam_late,
                method: self.method.into(),
                sampling_stride: self.sampling_stride,
                max_iter: self.baseline_max_iter,
                tol: self.baseline_tol,
                asymmetry: self.asymmetry,
            },
        }
    }

    fn peak_params(&self) -> PeakFitParams {
        PeakFitParams {
            min_height_fraction: self.min_height_fraction,
            ..Default::default()
        }
    }

    pub fn main(&self) -> Result<(), ICProcessorError> {
        info!(
            "icprocessor v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        info!("Input: {}", self.input_dir.display());
        info!("Output: {}", self.output_dir.display());
        self.create_threadpool().install(|| self.run())
    }

    fn run(&self) -> Result<(), ICProcessorError> {
        let started = Instant::now();

        if !self.no_stage {
            let (staged, copied) = stage_imports(&self.input_dir)?;
            debug!(staged = %staged.display(), copied, "staged raw exports");
        }

        let records = read_folder(&self.input_dir)?;
        if records.is_empty() {
            return Err(ICProcessorError::NoUsableData(self.input_dir.clone()));
        }
        info!("Read {} sample records", records.len());

        let grid = self.resolve_grid(&records)?;
        info!(
            "Resampling onto a {}-point grid over {:.1}-{:.1} s",
            grid.points, grid.start, grid.end
        );
        let mut dataset = Dataset::from_records(&records, &grid)?;

        let baseline_report = apply_baseline(
            &mut dataset,
            &self.baseline_config(),
            self.ion.into(),
            &TracingSink,
        );
        let baseline_counts = BatchCounts::from(&baseline_report);
        info!(
            "Baselines: {} fitted | {} skipped | {} failed",
            baseline_counts.fitted, baseline_counts.skipped, baseline_counts.failed
        );

        let peaks_report =
            fit_dataset_peaks(&mut dataset, &self.peak_params(), self.ion.into(), &TracingSink)?;
        let peak_counts = BatchCounts::from(&peaks_report);
        info!(
            "Peak fits: {} fitted | {} skipped | {} failed",
            peak_counts.fitted, peak_counts.skipped, peak_counts.failed
        );

        let totals = baseline_counts + peak_counts;
        if totals.failed > 0 {
            warn!("{} of {} cells failed; see the outcome report", totals.failed, totals.total());
        }

        fs::create_dir_all(&self.output_dir)?;
        let n_peaks = export::write_peak_table(&dataset, &self.output_dir)?;
        export::write_traces(&dataset, &self.output_dir)?;
        export::write_report(&baseline_report, &peaks_report, &self.output_dir)?;
        export::write_effective_config(&toml::to_string_pretty(self)?, &self.output_dir)?;
        info!("Fitted {} peaks in total", n_peaks);

        info!("Elapsed Time: {:0.3?}", Instant::now() - started);
        Ok(())
    }

    fn resolve_grid(
        &self,
        records: &[icproc::trace::SampleRecord],
    ) -> Result<GridConfig, ICProcessorError> {
        let spanned = GridConfig::spanning(records, self.grid_points)
            .ok_or_else(|| ICProcessorError::NoUsableData(self.input_dir.clone()))?;
        Ok(GridConfig {
            start: self.grid_start.unwrap_or(spanned.start),
            end: self.grid_end.unwrap_or(spanned.end),
            points: self.grid_points,
        })
    }
}
