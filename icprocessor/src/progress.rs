use std::ops::{Add, AddAssign};

use icproc::pipeline::BatchReport;

/// Summed cell outcomes of one or more pipeline passes
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BatchCounts {
    pub fitted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchCounts {
    pub fn total(&self) -> usize {
        self.fitted + self.skipped + self.failed
    }
}

impl From<&BatchReport> for BatchCounts {
    fn from(report: &BatchReport) -> Self {
        Self {
            fitted: report.fitted(),
            skipped: report.skipped(),
            failed: report.failed(),
        }
    }
}

impl Add for BatchCounts {
    type Output = BatchCounts;

    fn add(self, rhs: Self) -> Self::Output {
        let mut dup = self;
        dup += rhs;
        dup
    }
}

impl AddAssign for BatchCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.fitted += rhs.fitted;
        self.skipped += rhs.skipped;
        self.failed += rhs.failed;
    }
}
