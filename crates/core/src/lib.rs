pub mod line;
pub mod report;
pub mod result;

pub use line::{OcrLine, TargetMatch, NOT_FOUND};
pub use report::{accuracy_percentage, AccuracyReport, SampleResult, ACCURACY_TARGET};
pub use result::{round_to, LabelResult};
