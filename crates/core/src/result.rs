use serde::{Deserialize, Serialize};

use crate::line::{TargetMatch, NOT_FOUND};

/// Round to a fixed number of decimal places for report output.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Per-image JSON record: `{filename, target_line, confidence, success}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelResult {
    pub filename: String,
    /// The canonical target line, or `"Not Found"`.
    pub target_line: String,
    /// Rounded to 4 decimal places.
    pub confidence: f64,
    pub success: bool,
}

impl LabelResult {
    pub fn from_match(filename: impl Into<String>, target: &TargetMatch) -> Self {
        let (target_line, confidence) = match target.line() {
            Some(line) => (line.to_string(), round_to(target.confidence() as f64, 4)),
            None => (NOT_FOUND.to_string(), 0.0),
        };
        Self {
            filename: filename.into(),
            target_line,
            confidence,
            success: target.success(),
        }
    }
}
