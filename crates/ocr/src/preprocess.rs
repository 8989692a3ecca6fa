//! Label image normalization.
//!
//! A raw photo or scan is reduced to a single-channel grid and pushed through
//! an ordered list of [`Stage`]s built from a [`NormalizerConfig`]. Every stage
//! is a pure `&GrayImage -> GrayImage` function, so the same bytes and the
//! same config always produce the same pixels.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::filter::bilateral_filter;
use imageproc::morphology::{grayscale_dilate, grayscale_erode, Mask};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("Failed to encode processed image: {0}")]
    Encode(String),
    #[error("Invalid normalizer config: {0}")]
    InvalidConfig(String),
}

pub const INK: u8 = 0;
pub const BACKGROUND: u8 = 255;

/// Largest structuring element side accepted for morphology.
pub const MAX_KERNEL: u32 = 255;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Upscale multiplier in `[1.0, 2.0]`. `1.0` disables the stage.
    pub scale_factor: f32,
    /// Upscaling never pushes the longer side past this many pixels.
    pub max_dimension: u32,
    pub denoise: DenoiseConfig,
    pub contrast: ClaheConfig,
    pub binarization: AdaptiveThresholdConfig,
    pub morphology: Morphology,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            scale_factor: 2.0,
            max_dimension: 5000,
            denoise: DenoiseConfig::default(),
            contrast: ClaheConfig::default(),
            binarization: AdaptiveThresholdConfig::default(),
            morphology: Morphology::default(),
        }
    }
}

/// Edge-preserving bilateral smoothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseConfig {
    pub enabled: bool,
    /// Neighbourhood diameter in pixels.
    pub diameter: u32,
    pub sigma_color: f32,
    pub sigma_space: f32,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self { enabled: true, diameter: 9, sigma_color: 75.0, sigma_space: 75.0 }
    }
}

/// Contrast-limited adaptive histogram equalization over a square tile grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaheConfig {
    pub enabled: bool,
    /// Histogram clip limit relative to a flat histogram. `0.0` disables clipping.
    pub clip_limit: f32,
    /// Tiles per side.
    pub tiles: u32,
}

impl Default for ClaheConfig {
    fn default() -> Self {
        Self { enabled: true, clip_limit: 2.0, tiles: 8 }
    }
}

/// Gaussian-weighted local threshold: a pixel is background when it is
/// brighter than its neighbourhood mean minus `offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveThresholdConfig {
    pub enabled: bool,
    /// Odd neighbourhood size, at least 3.
    pub block_size: u32,
    pub offset: i32,
}

impl Default for AdaptiveThresholdConfig {
    fn default() -> Self {
        Self { enabled: true, block_size: 11, offset: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Morphology {
    None,
    /// Grow ink to reconnect broken strokes.
    Dilate { kernel: u32, iterations: u32 },
    /// Erode then dilate ink to drop isolated specks.
    Open { kernel: u32 },
}

impl Default for Morphology {
    fn default() -> Self {
        Morphology::Dilate { kernel: 2, iterations: 1 }
    }
}

impl NormalizerConfig {
    pub fn validate(&self) -> Result<(), PreprocessError> {
        let invalid = |msg: String| Err(PreprocessError::InvalidConfig(msg));

        if !self.scale_factor.is_finite() || !(1.0..=2.0).contains(&self.scale_factor) {
            return invalid(format!("scale_factor must be within [1.0, 2.0], got {}", self.scale_factor));
        }
        if self.max_dimension == 0 {
            return invalid("max_dimension must be positive".into());
        }
        if self.denoise.enabled {
            let d = &self.denoise;
            if d.diameter == 0 {
                return invalid("denoise.diameter must be positive".into());
            }
            if !(d.sigma_color > 0.0 && d.sigma_space > 0.0) {
                return invalid("denoise sigmas must be positive".into());
            }
        }
        if self.contrast.enabled {
            let c = &self.contrast;
            if c.tiles == 0 {
                return invalid("contrast.tiles must be positive".into());
            }
            if !c.clip_limit.is_finite() || c.clip_limit < 0.0 {
                return invalid(format!("contrast.clip_limit must be >= 0, got {}", c.clip_limit));
            }
        }
        if self.binarization.enabled {
            let b = self.binarization.block_size;
            if b < 3 || b % 2 == 0 {
                return invalid(format!("binarization.block_size must be odd and >= 3, got {b}"));
            }
        }
        match self.morphology {
            Morphology::None => {}
            Morphology::Dilate { kernel, iterations } => {
                if kernel == 0 || iterations == 0 {
                    return invalid("morphology kernel and iterations must be positive".into());
                }
                if kernel > MAX_KERNEL {
                    return invalid(format!("morphology kernel must be at most {MAX_KERNEL}"));
                }
            }
            Morphology::Open { kernel } => {
                if kernel == 0 || kernel > MAX_KERNEL {
                    return invalid(format!("morphology kernel must be within 1..={MAX_KERNEL}"));
                }
            }
        }
        Ok(())
    }
}

// ── Stages ────────────────────────────────────────────────────────────────────

/// One step of the normalization pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Upscale { factor: f32, max_dimension: u32 },
    Denoise(DenoiseConfig),
    Contrast(ClaheConfig),
    Binarize(AdaptiveThresholdConfig),
    Dilate { kernel: u32, iterations: u32 },
    Open { kernel: u32 },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Upscale { .. } => "upscale",
            Stage::Denoise(_) => "denoise",
            Stage::Contrast(_) => "contrast",
            Stage::Binarize(_) => "binarize",
            Stage::Dilate { .. } => "dilate",
            Stage::Open { .. } => "open",
        }
    }

    pub fn apply(&self, img: &GrayImage) -> GrayImage {
        if img.width() == 0 || img.height() == 0 {
            return img.clone();
        }
        match self {
            Stage::Upscale { factor, max_dimension } => upscale(img, *factor, *max_dimension),
            Stage::Denoise(cfg) => {
                bilateral_filter(img, cfg.diameter, cfg.sigma_color, cfg.sigma_space)
            }
            Stage::Contrast(cfg) => clahe(img, cfg),
            Stage::Binarize(cfg) => adaptive_threshold(img, cfg),
            Stage::Dilate { kernel, iterations } => {
                let mut out = img.clone();
                for _ in 0..*iterations {
                    out = dilate_ink(&out, *kernel);
                }
                out
            }
            Stage::Open { kernel } => open_ink(img, *kernel),
        }
    }
}

/// Ordered stage list: grayscale (implicit) → upscale → denoise → contrast →
/// binarize → morphology.
pub struct Normalizer {
    stages: Vec<Stage>,
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Result<Self, PreprocessError> {
        config.validate()?;

        let mut stages = Vec::new();
        if config.scale_factor > 1.0 {
            stages.push(Stage::Upscale {
                factor: config.scale_factor,
                max_dimension: config.max_dimension,
            });
        }
        if config.denoise.enabled {
            stages.push(Stage::Denoise(config.denoise.clone()));
        }
        if config.contrast.enabled {
            stages.push(Stage::Contrast(config.contrast.clone()));
        }
        if config.binarization.enabled {
            stages.push(Stage::Binarize(config.binarization.clone()));
        }
        match config.morphology {
            Morphology::None => {}
            Morphology::Dilate { kernel, iterations } => {
                stages.push(Stage::Dilate { kernel, iterations })
            }
            Morphology::Open { kernel } => stages.push(Stage::Open { kernel }),
        }

        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Decode raw image bytes (JPEG / PNG / WEBP / …) and normalize them.
    pub fn normalize_bytes(&self, data: &[u8]) -> Result<GrayImage, PreprocessError> {
        let img = image::load_from_memory(data)?;
        Ok(self.normalize(&img))
    }

    pub fn normalize(&self, img: &DynamicImage) -> GrayImage {
        let mut gray = img.to_luma8();
        debug!(width = gray.width(), height = gray.height(), "grayscale");
        for stage in &self.stages {
            gray = stage.apply(&gray);
            debug!(stage = stage.name(), width = gray.width(), height = gray.height(), "stage applied");
        }
        gray
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(&NormalizerConfig::default()).expect("default normalizer config is valid")
    }
}

pub fn encode_png(img: &GrayImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;
    Ok(buf)
}

// ── Upscale ───────────────────────────────────────────────────────────────────

fn upscale(img: &GrayImage, factor: f32, max_dimension: u32) -> GrayImage {
    let longest = img.width().max(img.height()) as f32;
    let factor = factor.min(max_dimension as f32 / longest).max(1.0);
    let w = (img.width() as f32 * factor).round() as u32;
    let h = (img.height() as f32 * factor).round() as u32;
    if (w, h) == img.dimensions() {
        return img.clone();
    }
    image::imageops::resize(img, w, h, FilterType::CatmullRom)
}

// ── CLAHE ─────────────────────────────────────────────────────────────────────

fn clahe(img: &GrayImage, cfg: &ClaheConfig) -> GrayImage {
    let (w, h) = img.dimensions();
    // Round the tile size up, then drop grid cells that would start past the
    // edge so every tile holds pixels.
    let tile_w = w.div_ceil(cfg.tiles.min(w).max(1));
    let tile_h = h.div_ceil(cfg.tiles.min(h).max(1));
    let tiles_x = w.div_ceil(tile_w);
    let tiles_y = h.div_ceil(tile_h);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = (tx * tile_w).min(w);
            let y0 = (ty * tile_h).min(h);
            let x1 = ((tx + 1) * tile_w).min(w);
            let y1 = ((ty + 1) * tile_h).min(h);
            luts.push(tile_lut(img, x0..x1, y0..y1, cfg.clip_limit));
        }
    }

    let idx = |tx: u32, ty: u32| (ty * tiles_x + tx) as usize;

    GrayImage::from_fn(w, h, |x, y| {
        let v = img.get_pixel(x, y)[0] as usize;

        let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
        let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let (tx1, ax) = split_coord(fx, tiles_x);
        let (ty1, ay) = split_coord(fy, tiles_y);
        let tx2 = (tx1 + 1).min(tiles_x - 1);
        let ty2 = (ty1 + 1).min(tiles_y - 1);

        let top = luts[idx(tx1, ty1)][v] as f32 * (1.0 - ax) + luts[idx(tx2, ty1)][v] as f32 * ax;
        let bottom =
            luts[idx(tx1, ty2)][v] as f32 * (1.0 - ax) + luts[idx(tx2, ty2)][v] as f32 * ax;
        let out = top * (1.0 - ay) + bottom * ay;
        Luma([out.round().clamp(0.0, 255.0) as u8])
    })
}

/// Tile index and interpolation weight toward the next tile, clamped to the grid.
fn split_coord(f: f32, tiles: u32) -> (u32, f32) {
    if f <= 0.0 {
        return (0, 0.0);
    }
    let i = f.floor() as u32;
    if i >= tiles - 1 {
        return (tiles - 1, 0.0);
    }
    (i, f - f.floor())
}

fn tile_lut(
    img: &GrayImage,
    xs: std::ops::Range<u32>,
    ys: std::ops::Range<u32>,
    clip_limit: f32,
) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in ys.clone() {
        for x in xs.clone() {
            hist[img.get_pixel(x, y)[0] as usize] += 1;
        }
    }
    let area = xs.len() as u32 * ys.len() as u32;
    let mut lut = [0u8; 256];
    if area == 0 {
        for (i, out) in lut.iter_mut().enumerate() {
            *out = i as u8;
        }
        return lut;
    }

    if clip_limit > 0.0 {
        let clip = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > clip {
                excess += *bin - clip;
                *bin = clip;
            }
        }
        let batch = excess / 256;
        let residual = excess % 256;
        for bin in hist.iter_mut() {
            *bin += batch;
        }
        if residual > 0 {
            let step = (256 / residual).max(1) as usize;
            for bin in hist.iter_mut().step_by(step).take(residual as usize) {
                *bin += 1;
            }
        }
    }

    let scale = 255.0 / area as f32;
    let mut cdf = 0u32;
    for (bin, out) in hist.iter().zip(lut.iter_mut()) {
        cdf += bin;
        *out = (cdf as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

// ── Adaptive threshold ────────────────────────────────────────────────────────

fn adaptive_threshold(img: &GrayImage, cfg: &AdaptiveThresholdConfig) -> GrayImage {
    // Gaussian sigma for a given aperture, matching the usual block-size convention.
    let sigma = 0.3 * ((cfg.block_size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let local_mean = imageproc::filter::gaussian_blur_f32(img, sigma);

    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let v = img.get_pixel(x, y)[0] as i32;
        let threshold = local_mean.get_pixel(x, y)[0] as i32 - cfg.offset;
        Luma([if v > threshold { BACKGROUND } else { INK }])
    })
}

// ── Morphology ────────────────────────────────────────────────────────────────

/// Square `kernel`-wide structuring element anchored at `kernel / 2`, so a
/// 2×2 element covers offsets `-1..=0`. `reflected` mirrors it through the
/// anchor.
fn ink_mask(kernel: u32, reflected: bool) -> Mask {
    let lo = kernel / 2;
    let anchor = if reflected { kernel - 1 - lo } else { lo };
    let element = GrayImage::from_pixel(kernel, kernel, Luma([255]));
    Mask::from_image(&element, anchor as u8, anchor as u8)
}

/// Grow dark (ink) regions by one kernel. Ink is dark, so this is a
/// grayscale erosion.
fn dilate_ink(img: &GrayImage, kernel: u32) -> GrayImage {
    grayscale_erode(img, &ink_mask(kernel, false))
}

/// Erode ink, then dilate with the reflected element so surviving strokes keep
/// their position.
fn open_ink(img: &GrayImage, kernel: u32) -> GrayImage {
    let eroded = grayscale_dilate(img, &ink_mask(kernel, false));
    grayscale_erode(&eroded, &ink_mask(kernel, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};

    fn solid_gray(width: u32, height: u32, value: u8) -> GrayImage {
        ImageBuffer::from_fn(width, height, |_, _| Luma([value]))
    }

    fn count(img: &GrayImage, value: u8) -> usize {
        img.pixels().filter(|p| p[0] == value).count()
    }

    /// Off-white label with a dark identifier-like bar, optionally speckled.
    fn label(speckled: bool) -> DynamicImage {
        let img: RgbImage = ImageBuffer::from_fn(60, 30, |x, y| {
            if (10..50).contains(&x) && (12..16).contains(&y) {
                Rgb([30, 30, 40])
            } else if speckled && (x * 7 + y * 13) % 17 == 0 {
                Rgb([200, 190, 180])
            } else {
                Rgb([235, 230, 220])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    fn synthetic_label() -> DynamicImage {
        label(true)
    }

    fn png_bytes(img: &DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn default_stage_order() {
        let n = Normalizer::default();
        let names: Vec<_> = n.stages().iter().map(Stage::name).collect();
        assert_eq!(names, ["upscale", "denoise", "contrast", "binarize", "dilate"]);
    }

    #[test]
    fn disabled_stages_are_skipped() {
        let config = NormalizerConfig {
            scale_factor: 1.0,
            denoise: DenoiseConfig { enabled: false, ..Default::default() },
            contrast: ClaheConfig { enabled: false, ..Default::default() },
            binarization: AdaptiveThresholdConfig { enabled: false, ..Default::default() },
            morphology: Morphology::None,
            ..Default::default()
        };
        let n = Normalizer::new(&config).unwrap();
        assert!(n.stages().is_empty());

        // Grayscale still applies.
        let out = n.normalize(&synthetic_label());
        assert_eq!(out.dimensions(), (60, 30));
        assert_eq!(out, synthetic_label().to_luma8());
    }

    #[test]
    fn rejects_out_of_range_scale() {
        for bad in [0.5, 2.5, f32::NAN] {
            let config = NormalizerConfig { scale_factor: bad, ..Default::default() };
            assert!(matches!(
                Normalizer::new(&config),
                Err(PreprocessError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn rejects_even_block_size() {
        let config = NormalizerConfig {
            binarization: AdaptiveThresholdConfig { block_size: 10, ..Default::default() },
            ..Default::default()
        };
        assert!(Normalizer::new(&config).is_err());
    }

    #[test]
    fn normalize_is_deterministic() {
        let bytes = png_bytes(&synthetic_label());
        let n = Normalizer::default();
        let a = n.normalize_bytes(&bytes).unwrap();
        let b = n.normalize_bytes(&bytes).unwrap();
        assert_eq!(a, b);
        // A second normalizer built from the same config agrees too.
        let c = Normalizer::default().normalize_bytes(&bytes).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn default_output_is_binary_and_upscaled() {
        let out = Normalizer::default().normalize(&label(false));
        assert_eq!(out.dimensions(), (120, 60));
        assert!(out.pixels().all(|p| p[0] == INK || p[0] == BACKGROUND));
        // The bar survives as ink.
        assert_eq!(out.get_pixel(60, 28)[0], INK);
        assert_eq!(out.get_pixel(2, 2)[0], BACKGROUND);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = Normalizer::default().normalize_bytes(b"not an image").unwrap_err();
        assert!(matches!(err, PreprocessError::ImageDecode(_)));
    }

    #[test]
    fn upscale_respects_factor_and_cap() {
        let img = solid_gray(40, 20, 128);
        assert_eq!(upscale(&img, 1.5, 5000).dimensions(), (60, 30));
        assert_eq!(upscale(&img, 2.0, 5000).dimensions(), (80, 40));
        // Capped at 60 px on the long side.
        assert_eq!(upscale(&img, 2.0, 60).dimensions(), (60, 30));
        // The cap never shrinks the image.
        assert_eq!(upscale(&img, 2.0, 10).dimensions(), (40, 20));
    }

    #[test]
    fn bilateral_keeps_uniform_image() {
        let img = solid_gray(16, 16, 90);
        let out = Stage::Denoise(DenoiseConfig::default()).apply(&img);
        assert_eq!(out, img);
    }

    #[test]
    fn bilateral_preserves_hard_edge() {
        let img: GrayImage = ImageBuffer::from_fn(20, 10, |x, _| Luma([if x < 10 { 0 } else { 255 }]));
        let cfg = DenoiseConfig { sigma_color: 20.0, ..Default::default() };
        let out = Stage::Denoise(cfg).apply(&img);
        // A 255-level step is far outside sigma_color, so neither side bleeds.
        assert_eq!(out.get_pixel(9, 5)[0], 0);
        assert_eq!(out.get_pixel(10, 5)[0], 255);
    }

    #[test]
    fn clahe_keeps_uniform_image_uniform() {
        let img = solid_gray(64, 64, 120);
        let out = clahe(&img, &ClaheConfig::default());
        let first = out.get_pixel(0, 0)[0];
        assert!(out.pixels().all(|p| p[0] == first));
    }

    #[test]
    fn clahe_stretches_faint_gradient() {
        // Values 100..=115 across the width.
        let img: GrayImage = ImageBuffer::from_fn(256, 256, |x, _| Luma([100 + (x / 16) as u8]));
        let cfg = ClaheConfig { enabled: true, clip_limit: 0.0, tiles: 8 };
        let out = clahe(&img, &cfg);
        let min = out.pixels().map(|p| p[0]).min().unwrap();
        let max = out.pixels().map(|p| p[0]).max().unwrap();
        assert!(max - min > 100, "range was {min}..{max}");
    }

    #[test]
    fn clahe_handles_images_smaller_than_grid() {
        let img = solid_gray(3, 5, 10);
        let out = clahe(&img, &ClaheConfig::default());
        assert_eq!(out.dimensions(), (3, 5));
    }

    #[test]
    fn clahe_narrow_image_has_no_empty_tiles() {
        // 10 px across 8 requested tiles: five 2 px tiles, each holding one
        // column of each level.
        let img: GrayImage = ImageBuffer::from_fn(10, 10, |x, _| Luma([if x % 2 == 0 { 100 } else { 110 }]));
        let cfg = ClaheConfig { enabled: true, clip_limit: 0.0, tiles: 8 };
        let out = clahe(&img, &cfg);
        for x in 0..10 {
            let expected = if x % 2 == 0 { 128 } else { 255 };
            assert_eq!(out.get_pixel(x, 5)[0], expected, "column {x}");
        }
    }

    #[test]
    fn adaptive_threshold_uniform_is_background() {
        let img = solid_gray(32, 32, 140);
        let out = adaptive_threshold(&img, &AdaptiveThresholdConfig::default());
        assert_eq!(count(&out, BACKGROUND), 32 * 32);
    }

    #[test]
    fn adaptive_threshold_tolerates_uneven_lighting() {
        // Left half dim, right half bright, a dark stroke across both.
        let img: GrayImage = ImageBuffer::from_fn(64, 32, |x, y| {
            let paper = if x < 32 { 120 } else { 230 };
            Luma([if (15..18).contains(&y) { paper - 90 } else { paper }])
        });
        let out = adaptive_threshold(&img, &AdaptiveThresholdConfig::default());
        assert_eq!(out.get_pixel(8, 16)[0], INK);
        assert_eq!(out.get_pixel(56, 16)[0], INK);
        assert_eq!(out.get_pixel(8, 4)[0], BACKGROUND);
        assert_eq!(out.get_pixel(56, 28)[0], BACKGROUND);
    }

    #[test]
    fn dilate_grows_single_ink_pixel_to_kernel() {
        let mut img = solid_gray(10, 10, BACKGROUND);
        img.put_pixel(5, 5, Luma([INK]));
        let out = dilate_ink(&img, 2);
        assert_eq!(count(&out, INK), 4);
        for (x, y) in [(5, 5), (6, 5), (5, 6), (6, 6)] {
            assert_eq!(out.get_pixel(x, y)[0], INK);
        }
    }

    #[test]
    fn dilate_reconnects_one_pixel_gap() {
        // An underscore with a one-pixel break.
        let mut img = solid_gray(12, 5, BACKGROUND);
        for x in (1..5).chain(6..11) {
            img.put_pixel(x, 2, Luma([INK]));
        }
        let out = Stage::Dilate { kernel: 2, iterations: 1 }.apply(&img);
        assert_eq!(out.get_pixel(5, 2)[0], INK);
    }

    #[test]
    fn open_removes_speck_but_keeps_block() {
        let mut img = solid_gray(12, 12, BACKGROUND);
        img.put_pixel(1, 1, Luma([INK]));
        for y in 5..9 {
            for x in 5..9 {
                img.put_pixel(x, y, Luma([INK]));
            }
        }
        let out = open_ink(&img, 2);
        assert_eq!(out.get_pixel(1, 1)[0], BACKGROUND);
        assert_eq!(count(&out, INK), 16);
        assert_eq!(out.get_pixel(5, 5)[0], INK);
        assert_eq!(out.get_pixel(8, 8)[0], INK);
    }

    #[test]
    fn open_keeps_stroke_in_place_for_odd_kernel() {
        let mut img = solid_gray(15, 15, BACKGROUND);
        for y in 4..10 {
            for x in 4..10 {
                img.put_pixel(x, y, Luma([INK]));
            }
        }
        let out = open_ink(&img, 3);
        assert_eq!(out, img);
    }

    #[test]
    fn oversized_kernel_is_rejected() {
        let config = NormalizerConfig {
            morphology: Morphology::Dilate { kernel: MAX_KERNEL + 1, iterations: 1 },
            ..Default::default()
        };
        assert!(matches!(Normalizer::new(&config), Err(PreprocessError::InvalidConfig(_))));
    }

    #[test]
    fn encode_png_rejects_empty_image() {
        assert!(matches!(encode_png(&GrayImage::new(0, 0)), Err(PreprocessError::Encode(_))));
    }

    #[test]
    fn encode_png_produces_png_header() {
        let bytes = encode_png(&solid_gray(4, 4, 100)).unwrap();
        assert_eq!(&bytes[..4], b"\x89PNG");
    }

    #[test]
    fn config_parses_from_toml() {
        let config: NormalizerConfig = toml::from_str(
            r#"
            scale_factor = 1.5

            [denoise]
            enabled = false

            [morphology]
            op = "open"
            kernel = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.scale_factor, 1.5);
        assert!(!config.denoise.enabled);
        assert!(config.contrast.enabled);
        assert_eq!(config.morphology, Morphology::Open { kernel: 2 });
    }
}
