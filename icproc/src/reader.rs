//! Reading Metrohm ion-chromatograph `.txt` exports.
//!
//! The export is line oriented: the first line carries the acquisition
//! timestamp, the second the operator-entered sample ident, and each ion
//! block is introduced by a line naming the channel followed by two header
//! lines and then `time;signal` rows. Pressure blocks trail the conductivity
//! data and are discarded.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::{debug, info};

use crate::trace::{SampleRecord, Trace};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{0}` is missing its timestamp or ident header lines")]
    MissingHeader(PathBuf),
    #[error("could not parse acquisition timestamp `{0}`: {1}")]
    BadTimestamp(String, #[source] chrono::ParseError),
    #[error("malformed data row at line {line}: `{content}`")]
    MalformedRow { line: usize, content: String },
    #[error("`{0}` contains neither an anion nor a cation block")]
    NoIonsMeasured(PathBuf),
}

impl ReaderError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Parse one instrument export into a [`SampleRecord`].
///
/// When only one channel was measured, the other is filled with the
/// unmeasured-channel placeholder over the measured channel's time axis and
/// its measured flag is left false.
pub fn read_chromatogram(path: &Path) -> Result<SampleRecord, ReaderError> {
    // Exports are not guaranteed to be UTF-8
    let raw = fs::read(path).map_err(|e| ReaderError::io(path, e))?;
    let text = String::from_utf8_lossy(&raw);
    let lines: Vec<&str> = text.lines().collect();

    if lines.len() < 2 {
        return Err(ReaderError::MissingHeader(path.to_path_buf()));
    }
    let stamp = lines[0].split(" UTC").next().unwrap_or(lines[0]).trim();
    let measured_at = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .map_err(|e| ReaderError::BadTimestamp(stamp.to_string(), e))?;
    let ident = lines[1].trim().to_string();
    if ident.is_empty() {
        return Err(ReaderError::MissingHeader(path.to_path_buf()));
    }

    // Everything from the first pressure block onward is discarded
    let end = lines
        .iter()
        .position(|l| contains_ignore_case(l, "pressure"))
        .unwrap_or(lines.len());
    let lines = &lines[..end];

    let anion_block = find_block(lines, "anion");
    let cation_block = find_block(lines, "cation");

    let anion = anion_block.map(|start| parse_block(lines, start)).transpose()?;
    let cation = cation_block
        .map(|start| parse_block(lines, start))
        .transpose()?;

    let (anion, cation, anion_measured, cation_measured) = match (anion, cation) {
        (Some(an), Some(cat)) => (an, cat, true, true),
        (Some(an), None) => {
            let cat = an.to_placeholder();
            (an, cat, true, false)
        }
        (None, Some(cat)) => (cat.to_placeholder(), cat, false, true),
        (None, None) => return Err(ReaderError::NoIonsMeasured(path.to_path_buf())),
    };

    debug!(
        ident,
        %measured_at,
        anion_measured,
        cation_measured,
        "parsed chromatogram"
    );
    Ok(SampleRecord {
        ident,
        measured_at,
        anion,
        cation,
        anion_measured,
        cation_measured,
    })
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(needle)
}

/// Index of the line introducing the named channel's conductivity block
fn find_block(lines: &[&str], channel: &str) -> Option<usize> {
    lines.iter().position(|l| contains_ignore_case(l, channel))
}

/// Parse `time;signal` rows starting three lines past the block header,
/// stopping at the first row without a separator
fn parse_block(lines: &[&str], block_start: usize) -> Result<Trace, ReaderError> {
    let data_start = block_start + 3;
    let mut time = Vec::new();
    let mut signal = Vec::new();
    for (offset, line) in lines.iter().enumerate().skip(data_start) {
        if !line.contains(';') {
            break;
        }
        let mut fields = line.split(';');
        let row = || ReaderError::MalformedRow {
            line: offset + 1,
            content: line.to_string(),
        };
        let t: f64 = fields
            .next()
            .and_then(|f| f.trim().parse().ok())
            .ok_or_else(row)?;
        let y: f64 = fields
            .next()
            .and_then(|f| f.trim().parse().ok())
            .ok_or_else(row)?;
        time.push(t);
        signal.push(y);
    }
    Ok(Trace { time, signal })
}

/// Read every `.txt` export in a folder, in file-name order.
pub fn read_folder(folder: &Path) -> Result<Vec<SampleRecord>, ReaderError> {
    let mut paths: Vec<PathBuf> = fs::read_dir(folder)
        .map_err(|e| ReaderError::io(folder, e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("txt")))
        .collect();
    paths.sort();

    info!(folder = %folder.display(), files = paths.len(), "reading chromatogram folder");
    paths.iter().map(|p| read_chromatogram(p)).collect()
}

/// Snapshot raw exports into a `from_import` subfolder before processing.
///
/// If `from_import` already exists nothing is copied, so re-running an
/// import never clobbers the staged originals. Returns the staging folder
/// and the number of files copied this call.
pub fn stage_imports(folder: &Path) -> Result<(PathBuf, usize), ReaderError> {
    let staged = folder.join("from_import");
    if staged.exists() {
        info!(staged = %staged.display(), "staging folder exists, not copying");
        return Ok((staged, 0));
    }
    fs::create_dir(&staged).map_err(|e| ReaderError::io(&staged, e))?;

    let mut copied = 0;
    for entry in fs::read_dir(folder).map_err(|e| ReaderError::io(folder, e))? {
        let entry = entry.map_err(|e| ReaderError::io(folder, e))?;
        let path = entry.path();
        if !path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"))
        {
            continue;
        }
        let dest = staged.join(entry.file_name());
        fs::copy(&path, &dest).map_err(|e| ReaderError::io(&path, e))?;
        copied += 1;
    }
    info!(staged = %staged.display(), copied, "staged raw exports");
    Ok((staged, copied))
}
