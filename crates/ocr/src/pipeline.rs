use image::GrayImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use waybill_core::{LabelResult, OcrLine, TargetMatch};

use crate::extract::Extractor;
use crate::preprocess::{Normalizer, NormalizerConfig, PreprocessError};
use crate::recognizer::{OcrBackend, OcrError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("OCR recognition failed: {0}")]
    Ocr(#[from] OcrError),
    #[error("Label task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Everything the engine saw for one image, plus the chosen line.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Raw engine output in scan order.
    pub lines: Vec<OcrLine>,
    pub target: TargetMatch,
}

/// Orchestrates: decode → normalize → OCR → extract.
///
/// Holds no per-call state; one pipeline may serve any number of images,
/// concurrently if the backend allows it.
pub struct LabelPipeline<R: OcrBackend> {
    normalizer: Normalizer,
    recognizer: R,
}

impl<R: OcrBackend> LabelPipeline<R> {
    pub fn new(normalizer: Normalizer, recognizer: R) -> Self {
        Self { normalizer, recognizer }
    }

    pub fn from_config(config: &NormalizerConfig, recognizer: R) -> Result<Self, PipelineError> {
        Ok(Self::new(Normalizer::new(config)?, recognizer))
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn recognizer(&self) -> &R {
        &self.recognizer
    }

    /// Run the pipeline on raw image bytes, keeping the engine's lines.
    pub fn extract_lines(&self, data: &[u8]) -> Result<Extraction, PipelineError> {
        let (_, extraction) = self.extract_with_image(data)?;
        Ok(extraction)
    }

    /// Like [`extract_lines`](Self::extract_lines), also handing back the
    /// normalized image the engine saw.
    pub fn extract_with_image(&self, data: &[u8]) -> Result<(GrayImage, Extraction), PipelineError> {
        let image = self.normalizer.normalize_bytes(data)?;
        let lines = self.recognizer.recognize(&image)?;
        debug!(engine = self.recognizer.name(), lines = lines.len(), "recognized");
        let target = Extractor::extract(&lines);
        Ok((image, Extraction { lines, target }))
    }

    /// Run the pipeline on raw image bytes (from an upload or a file read).
    pub fn process_bytes(&self, filename: &str, data: &[u8]) -> Result<LabelResult, PipelineError> {
        let extraction = self.extract_lines(data)?;
        Ok(LabelResult::from_match(filename, &extraction.target))
    }

    /// Process a file on disk.
    pub async fn process_file(&self, path: &Path) -> Result<LabelResult, PipelineError> {
        let bytes = tokio::fs::read(path).await?;
        self.process_bytes(&display_name(path), &bytes)
    }
}

impl<R: OcrBackend + 'static> LabelPipeline<R> {
    /// Process a file on disk, running normalization and the engine call on
    /// the blocking thread pool so the caller's runtime stays responsive.
    pub async fn process_file_blocking(self: Arc<Self>, path: PathBuf) -> Result<LabelResult, PipelineError> {
        let bytes = tokio::fs::read(&path).await?;
        let filename = display_name(&path);
        tokio::task::spawn_blocking(move || self.process_bytes(&filename, &bytes)).await?
    }
}

/// File name used in result records; falls back to the full path.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Extensions accepted as label images.
pub fn is_label_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| matches!(e.as_str(), "jpg" | "jpeg" | "png" | "webp" | "bmp" | "tif" | "tiff"))
}

// ── Watch-folder integration ──────────────────────────────────────────────────

/// Spawn a notify watcher on `watch_dir` that sends new label image paths to `tx`.
/// The returned watcher must be kept alive for watching to continue.
pub fn spawn_intake_watcher(
    watch_dir: &Path,
    tx: mpsc::Sender<PathBuf>,
) -> notify::Result<impl notify::Watcher> {
    use notify::{EventKind, RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if let Ok(ev) = event {
            if matches!(ev.kind, EventKind::Create(_)) {
                for path in ev.paths.into_iter().filter(|p| is_label_image(p)) {
                    let _ = tx.try_send(path);
                }
            }
        }
    })?;

    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::MockRecognizer;
    use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
    use std::io::Cursor;

    fn tiny_png() -> Vec<u8> {
        let img: GrayImage = ImageBuffer::from_fn(8, 8, |_, _| Luma([200u8]));
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    struct FailingRecognizer;

    impl OcrBackend for FailingRecognizer {
        fn name(&self) -> &str {
            "failing"
        }

        fn recognize(&self, _image: &GrayImage) -> Result<Vec<OcrLine>, OcrError> {
            Err(OcrError::Engine("model crashed".into()))
        }
    }

    fn pipeline(texts: &[&str], confidence: f32) -> LabelPipeline<MockRecognizer> {
        LabelPipeline::new(Normalizer::default(), MockRecognizer::from_texts(texts, confidence))
    }

    #[test]
    fn process_bytes_produces_label_result() {
        let p = pipeline(&["SHIP TO: DEPOT 7", "163233702292313922.1.IWV", "ORDER 2024-05-01"], 0.87654);
        let result = p.process_bytes("label.jpg", &tiny_png()).unwrap();
        assert_eq!(result.filename, "label.jpg");
        assert_eq!(result.target_line, "163233702292313922_1_IWV");
        assert_eq!(result.confidence, 0.8765);
        assert!(result.success);
    }

    #[test]
    fn process_bytes_not_found_is_ok() {
        let p = pipeline(&["ORDER 2024-05-01"], 0.99);
        let result = p.process_bytes("label.jpg", &tiny_png()).unwrap();
        assert_eq!(result.target_line, "Not Found");
        assert_eq!(result.confidence, 0.0);
        assert!(!result.success);
    }

    #[test]
    fn extract_lines_keeps_engine_output() {
        let p = pipeline(&["A", "163233702292313922_1_IWV"], 0.5);
        let extraction = p.extract_lines(&tiny_png()).unwrap();
        assert_eq!(extraction.lines.len(), 2);
        assert_eq!(extraction.target.line(), Some("163233702292313922_1_IWV"));
    }

    #[test]
    fn corrupt_bytes_are_a_decode_error() {
        let p = pipeline(&["163233702292313922_1_IWV"], 0.9);
        let err = p.process_bytes("bad.jpg", b"\xff\xd8 truncated").unwrap_err();
        assert!(matches!(err, PipelineError::Preprocess(PreprocessError::ImageDecode(_))));
    }

    #[test]
    fn engine_failure_propagates() {
        let p = LabelPipeline::new(Normalizer::default(), FailingRecognizer);
        let err = p.process_bytes("label.png", &tiny_png()).unwrap_err();
        assert!(matches!(err, PipelineError::Ocr(OcrError::Engine(_))));
    }

    #[test]
    fn pipeline_accepts_borrowed_backend() {
        let engine = MockRecognizer::from_texts(&["163233702292313922-1 IWV"], 0.6);
        let p = LabelPipeline::new(Normalizer::default(), &engine);
        let result = p.process_bytes("a.png", &tiny_png()).unwrap();
        assert_eq!(result.target_line, "163233702292313922_1_IWV");
    }

    #[tokio::test]
    async fn process_file_uses_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample_01.png");
        std::fs::write(&path, tiny_png()).unwrap();

        let p = pipeline(&["163233702292313922_1_IWV"], 0.75);
        let result = p.process_file(&path).await.unwrap();
        assert_eq!(result.filename, "sample_01.png");
        assert!(result.success);
    }

    #[test]
    fn extract_with_image_returns_normalized_pixels() {
        let p = pipeline(&["163233702292313922_1_IWV"], 0.9);
        let png = tiny_png();
        let (image, extraction) = p.extract_with_image(&png).unwrap();
        assert_eq!(image, p.normalizer().normalize_bytes(&png).unwrap());
        assert_eq!(image.dimensions(), (16, 16));
        assert!(extraction.target.success());
        assert_eq!(p.recognizer().name(), "mock");
    }

    #[tokio::test]
    async fn process_file_blocking_matches_process_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drop_03.png");
        std::fs::write(&path, tiny_png()).unwrap();

        let p = Arc::new(pipeline(&["ORDER 7", "163233702292313922 1 IWV"], 0.66));
        let direct = p.process_file(&path).await.unwrap();
        let offloaded = Arc::clone(&p).process_file_blocking(path).await.unwrap();
        assert_eq!(offloaded, direct);
        assert_eq!(offloaded.filename, "drop_03.png");
        assert_eq!(offloaded.target_line, "163233702292313922_1_IWV");
    }

    #[tokio::test]
    async fn process_file_blocking_surfaces_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"\xff\xd8 truncated").unwrap();

        let p = Arc::new(pipeline(&[], 0.0));
        let err = p.process_file_blocking(path).await.unwrap_err();
        assert!(matches!(err, PipelineError::Preprocess(PreprocessError::ImageDecode(_))));
    }

    #[tokio::test]
    async fn process_file_missing_is_io_error() {
        let p = pipeline(&[], 0.0);
        let err = p.process_file(Path::new("/nonexistent/label.png")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
    }

    #[test]
    fn label_image_extensions() {
        assert!(is_label_image(Path::new("a/B.JPG")));
        assert!(is_label_image(Path::new("scan.tiff")));
        assert!(!is_label_image(Path::new("notes.txt")));
        assert!(!is_label_image(Path::new("README")));
    }
}
