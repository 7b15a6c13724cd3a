use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::event::{AbandonReason, EventOutcome, SkipReason};

/// Per-run counts by outcome. Every line read lands in exactly one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub lines: u64,
    pub emitted: u64,
    pub emitted_by_year: BTreeMap<i32, u64>,
    pub skipped: BTreeMap<SkipReason, u64>,
    pub abandoned: BTreeMap<AbandonReason, u64>,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &EventOutcome) {
        self.lines += 1;
        match outcome {
            EventOutcome::Emitted { year } => {
                self.emitted += 1;
                *self.emitted_by_year.entry(*year).or_default() += 1;
            }
            EventOutcome::Skipped(reason) => *self.skipped.entry(*reason).or_default() += 1,
            EventOutcome::Abandoned(reason) => {
                *self.abandoned.entry(*reason).or_default() += 1
            }
        }
    }

    pub fn skipped(&self, reason: SkipReason) -> u64 {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }

    pub fn abandoned(&self, reason: AbandonReason) -> u64 {
        self.abandoned.get(&reason).copied().unwrap_or(0)
    }

    /// Lines accounted for across all buckets.
    pub fn accounted(&self) -> u64 {
        self.emitted + self.skipped.values().sum::<u64>() + self.abandoned.values().sum::<u64>()
    }

    pub fn log(&self) {
        info!("{} lines read, {} fact rows emitted", self.lines, self.emitted);
        for (year, rows) in &self.emitted_by_year {
            info!("  {}: {} rows", year, rows);
        }
        for (reason, count) in &self.skipped {
            info!("  skipped ({}): {}", reason.as_str(), count);
        }
        for (reason, count) in &self.abandoned {
            info!("  abandoned ({}): {}", reason.as_str(), count);
        }
    }
}
