use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, warn};
use waybill_core::OcrLine;

use crate::preprocess::encode_png;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Image decode error: {0}")]
    ImageDecode(String),
    #[error("Failed to encode image for the engine: {0}")]
    Encode(String),
    #[error("OCR engine error: {0}")]
    Engine(String),
    #[error("OCR engine not available: {0}")]
    NotAvailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstraction over an OCR backend.
///
/// Implementations take the normalized label and return one [`OcrLine`] per
/// detected line, top to bottom. A backend is built once and shared by
/// reference across calls, so implementations must not keep per-call state.
pub trait OcrBackend: Send + Sync {
    fn name(&self) -> &str;
    fn recognize(&self, image: &GrayImage) -> Result<Vec<OcrLine>, OcrError>;
}

impl<B: OcrBackend + ?Sized> OcrBackend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn recognize(&self, image: &GrayImage) -> Result<Vec<OcrLine>, OcrError> {
        (**self).recognize(image)
    }
}

impl<B: OcrBackend + ?Sized> OcrBackend for &B {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn recognize(&self, image: &GrayImage) -> Result<Vec<OcrLine>, OcrError> {
        (**self).recognize(image)
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// External program speaking the JSON line protocol.
    Command,
    /// Built-in libtesseract binding (`tesseract` feature).
    Tesseract,
    /// Fixed lines from the config, for dry runs.
    Mock,
}

impl Default for EngineKind {
    fn default() -> Self {
        if cfg!(feature = "tesseract") {
            EngineKind::Tesseract
        } else {
            EngineKind::Command
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Program for [`EngineKind::Command`].
    pub program: String,
    pub args: Vec<String>,
    /// Tesseract language code.
    pub language: String,
    /// Tesseract tessdata directory.
    pub data_path: Option<String>,
    /// Lines returned by [`EngineKind::Mock`].
    pub mock_lines: Vec<OcrLine>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            program: String::new(),
            args: Vec::new(),
            language: "eng".to_string(),
            data_path: None,
            mock_lines: Vec::new(),
        }
    }
}

/// Construct the long-lived engine handle described by `config`.
pub fn build_backend(config: &EngineConfig) -> Result<Box<dyn OcrBackend>, OcrError> {
    match config.kind {
        EngineKind::Command => {
            if config.program.trim().is_empty() {
                return Err(OcrError::NotAvailable(
                    "engine.program is not set in the config".to_string(),
                ));
            }
            Ok(Box::new(CommandRecognizer::new(&config.program, config.args.clone())))
        }
        EngineKind::Mock => Ok(Box::new(MockRecognizer::new(config.mock_lines.clone()))),
        #[cfg(feature = "tesseract")]
        EngineKind::Tesseract => Ok(Box::new(tesseract_backend::TesseractRecognizer::new(
            config.data_path.clone(),
            &config.language,
        ))),
        #[cfg(not(feature = "tesseract"))]
        EngineKind::Tesseract => Err(OcrError::NotAvailable(
            "Tesseract not available, build with the `tesseract` feature".to_string(),
        )),
    }
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// Returns preset lines; used for unit testing the extraction pipeline
/// without an OCR engine installed.
pub struct MockRecognizer {
    pub lines: Vec<OcrLine>,
}

impl MockRecognizer {
    pub fn new(lines: Vec<OcrLine>) -> Self {
        Self { lines }
    }

    /// Preset lines that all share one confidence.
    pub fn from_texts(texts: &[&str], confidence: f32) -> Self {
        Self::new(texts.iter().map(|t| OcrLine::new(*t, confidence)).collect())
    }
}

impl OcrBackend for MockRecognizer {
    fn name(&self) -> &str {
        "mock"
    }

    fn recognize(&self, _image: &GrayImage) -> Result<Vec<OcrLine>, OcrError> {
        Ok(self.lines.clone())
    }
}

// ── External command backend ──────────────────────────────────────────────────

/// Runs an external OCR program once per image.
///
/// The normalized image is written to the program's stdin as PNG. The program
/// must print a JSON array of `{"text": ..., "confidence": ...}` objects, one
/// per line in reading order, and exit with status 0.
pub struct CommandRecognizer {
    program: String,
    args: Vec<String>,
}

impl CommandRecognizer {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        Self { program: program.to_string(), args }
    }
}

impl OcrBackend for CommandRecognizer {
    fn name(&self) -> &str {
        &self.program
    }

    fn recognize(&self, image: &GrayImage) -> Result<Vec<OcrLine>, OcrError> {
        let png = encode_png(image).map_err(|e| OcrError::Encode(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    OcrError::NotAvailable(format!("{} not found", self.program))
                }
                _ => OcrError::Io(e),
            })?;

        // Feed stdin from a separate thread so a chatty engine cannot deadlock
        // on a full stdout pipe.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrError::Engine("engine stdin unavailable".to_string()))?;
        let writer = std::thread::spawn(move || stdin.write_all(&png));

        let output = child.wait_with_output()?;
        let write_result = writer
            .join()
            .map_err(|_| OcrError::Engine("stdin writer panicked".to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Engine(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        if let Err(e) = write_result {
            // Engines that read the image elsewhere may close stdin early.
            warn!(program = %self.program, "engine did not consume stdin: {e}");
        }

        let lines = parse_engine_output(&output.stdout)?;
        debug!(program = %self.program, lines = lines.len(), "engine finished");
        Ok(lines)
    }
}

/// Parse the JSON line protocol spoken by [`CommandRecognizer`] engines.
pub fn parse_engine_output(stdout: &[u8]) -> Result<Vec<OcrLine>, OcrError> {
    serde_json::from_slice(stdout)
        .map_err(|e| OcrError::Engine(format!("malformed engine output: {e}")))
}

// ── Tesseract backend (optional, gated behind `tesseract` feature) ─────────────

#[cfg(feature = "tesseract")]
pub mod tesseract_backend {
    use super::{OcrBackend, OcrError};
    use crate::preprocess::encode_png;
    use image::GrayImage;
    use leptess::LepTess;
    use waybill_core::OcrLine;

    pub struct TesseractRecognizer {
        data_path: Option<String>,
        lang: String,
    }

    impl TesseractRecognizer {
        pub fn new(data_path: Option<String>, lang: &str) -> Self {
            Self { data_path, lang: lang.to_string() }
        }
    }

    impl OcrBackend for TesseractRecognizer {
        fn name(&self) -> &str {
            "tesseract"
        }

        /// Tesseract reports one mean confidence per page; every line gets it.
        fn recognize(&self, image: &GrayImage) -> Result<Vec<OcrLine>, OcrError> {
            let png = encode_png(image).map_err(|e| OcrError::Encode(e.to_string()))?;
            let mut lt = LepTess::new(self.data_path.as_deref(), &self.lang)
                .map_err(|e| OcrError::Engine(e.to_string()))?;
            lt.set_image_from_mem(&png)
                .map_err(|e| OcrError::ImageDecode(e.to_string()))?;
            let text = lt.get_utf8_text().map_err(|e| OcrError::Engine(e.to_string()))?;
            let confidence = (lt.mean_text_conf() as f32 / 100.0).clamp(0.0, 1.0);

            Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| OcrLine::new(l, confidence))
                .collect())
        }
    }
}
