//! Locating the boundary between the two baseline-smoothness regimes.

use thiserror::Error;

/// An error raised by [`locate_crossover`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CrossoverError {
    #[error("cannot locate a crossover on an empty time axis")]
    EmptyTimeAxis,
}

/// Find the index of the time value closest to `boundary_time`.
///
/// Ties break to the lowest index, so a boundary exactly between two grid
/// points selects the earlier one. The time axis is expected to be ordered
/// but the search is a plain scan and does not rely on it.
pub fn locate_crossover(time_axis: &[f64], boundary_time: f64) -> Result<usize, CrossoverError> {
    if time_axis.is_empty() {
        return Err(CrossoverError::EmptyTimeAxis);
    }
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, t) in time_axis.iter().copied().enumerate() {
        let dist = (t - boundary_time).abs();
        if dist < best_dist {
            best_dist = dist;
            best = i;
        }
    }
    Ok(best)
}
