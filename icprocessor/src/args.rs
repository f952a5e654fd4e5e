use std::fmt::Display;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use icproc::baseline::SmoothingMethod;
use icproc::pipeline::IonSelection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
pub enum ArgIonSelection {
    /// Process only the anion conductivity channel
    Anion,
    /// Process only the cation conductivity channel
    Cation,
    #[default]
    /// Process both channels
    Both,
}

impl From<ArgIonSelection> for IonSelection {
    fn from(value: ArgIonSelection) -> Self {
        match value {
            ArgIonSelection::Anion => IonSelection::Anion,
            ArgIonSelection::Cation => IonSelection::Cation,
            ArgIonSelection::Both => IonSelection::Both,
        }
    }
}

impl Display for ArgIonSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
pub enum ArgSmoothingMethod {
    #[default]
    /// Asymmetrically reweighted penalized least squares
    ArPls,
    /// Asymmetric least squares with a fixed asymmetry parameter
    AsLs,
}

impl From<ArgSmoothingMethod> for SmoothingMethod {
    fn from(value: ArgSmoothingMethod) -> Self {
        match value {
            ArgSmoothingMethod::ArPls => SmoothingMethod::ArPls,
            ArgSmoothingMethod::AsLs => SmoothingMethod::AsLs,
        }
    }
}

impl Display for ArgSmoothingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub fn non_negative_float(s: &str) -> Result<f64, String> {
    let value = s.parse::<f64>().map_err(|e| e.to_string())?;
    if value < 0.0 {
        Err(format!("`{s}` is less than zero"))
    } else {
        Ok(value)
    }
}
