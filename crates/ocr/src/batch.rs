//! Ground-truth accuracy runs over a folder of label images.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use waybill_core::{AccuracyReport, SampleResult};

use crate::pipeline::{LabelPipeline, PipelineError};
use crate::recognizer::OcrBackend;

pub const SAMPLE_OUTPUT_DIR: &str = "extracted_json_outputs";
pub const REPORT_FILE: &str = "accuracy_report.json";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Failed to read ground truth {path}: {source}")]
    GroundTruth {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sample task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Images processed at once.
    pub max_concurrency: usize,
    /// Write one JSON record per sample next to the report.
    pub write_sample_files: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            write_sample_files: true,
        }
    }
}

/// Expected target line per image file name, ordered by file name.
pub type GroundTruth = BTreeMap<String, String>;

pub fn load_ground_truth(path: &Path) -> Result<GroundTruth, BatchError> {
    let content = std::fs::read_to_string(path).map_err(|source| BatchError::GroundTruth {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// One record per processed sample, in ground-truth order.
    pub samples: Vec<SampleResult>,
    pub report: AccuracyReport,
    /// Ground-truth entries whose image was missing.
    pub skipped: Vec<String>,
}

pub struct BatchRunner<R: OcrBackend + 'static> {
    pipeline: Arc<LabelPipeline<R>>,
    config: BatchConfig,
}

impl<R: OcrBackend + 'static> BatchRunner<R> {
    pub fn new(pipeline: Arc<LabelPipeline<R>>, config: BatchConfig) -> Self {
        Self { pipeline, config }
    }

    /// Run every ground-truth sample found in `data_dir`.
    ///
    /// Samples are independent and run concurrently; a sample that fails to
    /// decode or recognize is recorded as incorrect and the run continues.
    pub async fn run(&self, data_dir: &Path, truth: &GroundTruth) -> Result<BatchOutcome, BatchError> {
        info!(samples = truth.len(), dir = %data_dir.display(), "starting accuracy run");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut skipped = Vec::new();

        for (index, (filename, expected)) in truth.iter().enumerate() {
            let path = data_dir.join(filename);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                warn!(file = %filename, "image not found in {}", data_dir.display());
                skipped.push(filename.clone());
                continue;
            }

            let pipeline = Arc::clone(&self.pipeline);
            let semaphore = Arc::clone(&semaphore);
            let filename = filename.clone();
            let expected = expected.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let sample = tokio::task::spawn_blocking(move || {
                    run_sample(&pipeline, &path, filename, expected)
                })
                .await;
                (index, sample)
            });
        }

        let mut indexed = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let (index, sample) = joined?;
            indexed.push((index, sample?));
        }
        indexed.sort_by_key(|(index, _)| *index);
        let samples: Vec<SampleResult> = indexed.into_iter().map(|(_, s)| s).collect();

        let report = AccuracyReport::from_samples(&samples, Local::now());
        info!(
            total = report.total_samples,
            correct = report.correct_extractions,
            accuracy = report.accuracy_percentage,
            threshold_met = report.threshold_met,
            "accuracy run complete"
        );

        Ok(BatchOutcome { samples, report, skipped })
    }

    /// Write the report (and per-sample records when enabled) under `out_dir`.
    /// Returns the report path.
    pub async fn write_outputs(&self, out_dir: &Path, outcome: &BatchOutcome) -> Result<PathBuf, BatchError> {
        tokio::fs::create_dir_all(out_dir).await?;

        if self.config.write_sample_files {
            let sample_dir = out_dir.join(SAMPLE_OUTPUT_DIR);
            tokio::fs::create_dir_all(&sample_dir).await?;
            let mut names = ResultNames::new();
            for sample in &outcome.samples {
                let path = sample_dir.join(names.assign(&sample.filename));
                tokio::fs::write(&path, serde_json::to_vec_pretty(sample)?).await?;
            }
        }

        let report_path = out_dir.join(REPORT_FILE);
        tokio::fs::write(&report_path, serde_json::to_vec_pretty(&outcome.report)?).await?;
        Ok(report_path)
    }
}

fn run_sample<R: OcrBackend>(
    pipeline: &LabelPipeline<R>,
    path: &Path,
    filename: String,
    expected: String,
) -> SampleResult {
    let outcome = std::fs::read(path)
        .map_err(PipelineError::from)
        .and_then(|data| pipeline.extract_lines(&data));

    match outcome {
        Ok(extraction) => {
            let sample = SampleResult::compare(filename, expected, &extraction.target);
            info!(
                file = %sample.filename,
                confidence = sample.confidence,
                matched = sample.is_match,
                "{}",
                if sample.is_match { "correct" } else { "incorrect" }
            );
            sample
        }
        Err(e) => {
            warn!(file = %filename, "sample failed: {e}");
            SampleResult::failed(filename, expected, e.to_string())
        }
    }
}

/// Hands out result file names: `<stem>.json`, or `<file name>.json` once a
/// different source has already claimed that stem (`a.png` then `a.jpg`).
#[derive(Debug, Default)]
pub struct ResultNames {
    claimed: HashMap<String, String>,
}

impl ResultNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, filename: &str) -> String {
        let stem = Path::new(filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());

        match self.claimed.get(&stem) {
            Some(owner) if owner != filename => {
                warn!(file = %filename, other = %owner, "{stem}.json already taken, writing {filename}.json");
                format!("{filename}.json")
            }
            Some(_) => format!("{stem}.json"),
            None => {
                self.claimed.insert(stem.clone(), filename.to_string());
                format!("{stem}.json")
            }
        }
    }
}
