//! Core sample-trace types shared across the processing pipeline.

use std::fmt::Display;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The signal value assigned to every point of an ion channel that the
/// instrument never measured. A placeholder trace is still a real trace
/// over the measured channel's time axis, it is *not* missing data.
pub const UNMEASURED_PLACEHOLDER: f64 = -1.0;

/// The measurement channel of the ion chromatograph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IonType {
    Anion,
    Cation,
}

impl IonType {
    pub const BOTH: [IonType; 2] = [IonType::Anion, IonType::Cation];

    /// Position of this channel along the dataset's ion axis
    pub fn axis_index(&self) -> usize {
        match self {
            IonType::Anion => 0,
            IonType::Cation => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IonType::Anion => "anion",
            IonType::Cation => "cation",
        }
    }
}

impl Display for IonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IonType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anion" => Ok(IonType::Anion),
            "cation" => Ok(IonType::Cation),
            _ => Err(format!("unknown ion type `{s}`")),
        }
    }
}

/// An error produced while validating or cleaning a [`Trace`]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TraceError {
    #[error("time array length ({0}) must equal signal length ({1})")]
    LengthMismatch(usize, usize),
    #[error("time axis is not strictly increasing at position {0}")]
    UnorderedTime(usize),
}

/// One (ion_type, sample) time-ordered signal sequence.
///
/// Gaps are carried as NaN in either array until [`Trace::drop_missing`]
/// removes them; the fitting routines require gap-free input.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub time: Vec<f64>,
    pub signal: Vec<f64>,
}

impl Trace {
    pub fn new(time: Vec<f64>, signal: Vec<f64>) -> Result<Self, TraceError> {
        if time.len() != signal.len() {
            return Err(TraceError::LengthMismatch(time.len(), signal.len()));
        }
        Ok(Self { time, signal })
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Check that the time axis is strictly increasing over the non-missing
    /// positions.
    pub fn check_ordered(&self) -> Result<(), TraceError> {
        let mut last: Option<f64> = None;
        for (i, t) in self.time.iter().copied().enumerate() {
            if t.is_nan() {
                continue;
            }
            if let Some(prev) = last {
                if t <= prev {
                    return Err(TraceError::UnorderedTime(i));
                }
            }
            last = Some(t);
        }
        Ok(())
    }

    /// Drop every position where either coordinate is missing, producing a
    /// gap-free trace. The surviving positions keep their relative order.
    pub fn drop_missing(&self) -> Trace {
        let (time, signal) = self
            .time
            .iter()
            .copied()
            .zip(self.signal.iter().copied())
            .filter(|(t, y)| !t.is_nan() && !y.is_nan())
            .unzip();
        Trace { time, signal }
    }

    /// Whether any position is missing on either axis
    pub fn has_gaps(&self) -> bool {
        self.time.iter().any(|t| t.is_nan()) || self.signal.iter().any(|y| y.is_nan())
    }

    /// A copy of this trace with every signal value replaced by the
    /// unmeasured-channel placeholder.
    pub fn to_placeholder(&self) -> Trace {
        Trace {
            time: self.time.clone(),
            signal: vec![UNMEASURED_PLACEHOLDER; self.time.len()],
        }
    }
}

/// Everything parsed out of one instrument run file.
///
/// Both ion channels are always populated: when one was not measured, its
/// trace spans the measured channel's time axis filled with
/// [`UNMEASURED_PLACEHOLDER`] and the corresponding `*_measured` flag is
/// false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// The sample name as entered into the chromatograph by the operator
    pub ident: String,
    /// Wall-clock time the run was acquired, a proxy for acquisition order
    pub measured_at: NaiveDateTime,
    pub anion: Trace,
    pub cation: Trace,
    pub anion_measured: bool,
    pub cation_measured: bool,
}

impl SampleRecord {
    pub fn trace(&self, ion: IonType) -> &Trace {
        match ion {
            IonType::Anion => &self.anion,
            IonType::Cation => &self.cation,
        }
    }

    pub fn is_measured(&self, ion: IonType) -> bool {
        match ion {
            IonType::Anion => self.anion_measured,
            IonType::Cation => self.cation_measured,
        }
    }

    /// The rack position encoded in idents of the form `...posN`, if any
    pub fn rack_position(&self) -> Option<u32> {
        let (_, tail) = self.ident.rsplit_once("pos")?;
        tail.trim().parse().ok()
    }
}
