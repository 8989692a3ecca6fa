use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::line::{TargetMatch, NOT_FOUND};
use crate::result::round_to;

/// Minimum accuracy (percent) a batch run must reach.
pub const ACCURACY_TARGET: f64 = 75.0;

/// One ground-truth comparison from a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    pub filename: String,
    pub expected: String,
    pub predicted: String,
    pub confidence: f64,
    #[serde(rename = "match")]
    pub is_match: bool,
    /// Set when the sample could not be decoded or recognized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SampleResult {
    pub fn compare(
        filename: impl Into<String>,
        expected: impl Into<String>,
        target: &TargetMatch,
    ) -> Self {
        let expected = expected.into();
        let is_match = target.line() == Some(expected.as_str());
        Self {
            filename: filename.into(),
            expected,
            predicted: target.line().unwrap_or(NOT_FOUND).to_string(),
            confidence: round_to(target.confidence() as f64, 4),
            is_match,
            error: None,
        }
    }

    /// A sample whose image failed before extraction. Counts as incorrect.
    pub fn failed(
        filename: impl Into<String>,
        expected: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            expected: expected.into(),
            predicted: NOT_FOUND.to_string(),
            confidence: 0.0,
            is_match: false,
            error: Some(error.into()),
        }
    }
}

/// Aggregate outcome of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub test_date: String,
    pub total_samples: usize,
    pub correct_extractions: usize,
    /// Rounded to 2 decimal places.
    pub accuracy_percentage: f64,
    pub threshold_met: bool,
}

impl AccuracyReport {
    pub fn from_samples(samples: &[SampleResult], run_at: DateTime<Local>) -> Self {
        let total = samples.len();
        let correct = samples.iter().filter(|s| s.is_match).count();
        let accuracy = accuracy_percentage(correct, total);
        Self {
            test_date: run_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            total_samples: total,
            correct_extractions: correct,
            accuracy_percentage: round_to(accuracy, 2),
            // Compared before rounding so 74.996 does not pass.
            threshold_met: accuracy >= ACCURACY_TARGET,
        }
    }
}

/// `100 * correct / total`, or 0 for an empty run.
pub fn accuracy_percentage(correct: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    100.0 * correct as f64 / total as f64
}
