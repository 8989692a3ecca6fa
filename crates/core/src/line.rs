use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker rendered in place of a target line when no OCR line matched.
pub const NOT_FOUND: &str = "Not Found";

/// One line of text as reported by the OCR engine, in scan order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrLine {
    pub text: String,
    /// Engine-reported confidence (0.0–1.0). Carried through untouched.
    pub confidence: f32,
}

impl OcrLine {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self { text: text.into(), confidence }
    }
}

/// The single line chosen for one image.
///
/// Fields are private so that a match can only be built through
/// [`TargetMatch::found`] or [`TargetMatch::not_found`], which keeps
/// `success`, `confidence` and the line in agreement.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetMatch {
    line: Option<String>,
    confidence: f32,
}

impl TargetMatch {
    pub fn found(line: impl Into<String>, confidence: f32) -> Self {
        Self { line: Some(line.into()), confidence }
    }

    pub fn not_found() -> Self {
        Self { line: None, confidence: 0.0 }
    }

    /// The canonical target line, or `None` when nothing matched.
    pub fn line(&self) -> Option<&str> {
        self.line.as_deref()
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn success(&self) -> bool {
        self.line.is_some()
    }
}

impl fmt::Display for TargetMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.line {
            Some(line) => write!(f, "{line} ({:.2})", self.confidence),
            None => write!(f, "{NOT_FOUND}"),
        }
    }
}
