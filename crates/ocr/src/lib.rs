pub mod batch;
pub mod config;
pub mod extract;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;

pub use batch::{
    load_ground_truth, BatchConfig, BatchError, BatchOutcome, BatchRunner, GroundTruth, ResultNames,
};
pub use config::{ConfigError, WaybillConfig};
pub use extract::{find_target_span, normalize_line, Extractor};
pub use pipeline::{spawn_intake_watcher, Extraction, LabelPipeline, PipelineError};
pub use preprocess::{encode_png, Morphology, Normalizer, NormalizerConfig, PreprocessError, Stage};
pub use recognizer::{build_backend, CommandRecognizer, EngineConfig, EngineKind, MockRecognizer, OcrBackend, OcrError};
