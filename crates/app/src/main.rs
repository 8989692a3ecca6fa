use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use waybill_core::{LabelResult, ACCURACY_TARGET};
use waybill_ocr::pipeline::display_name;
use waybill_ocr::{
    build_backend, encode_png, load_ground_truth, normalize_line, BatchRunner, LabelPipeline,
    OcrBackend, ResultNames, WaybillConfig,
};

type Pipeline = LabelPipeline<Box<dyn OcrBackend>>;

#[derive(Parser)]
#[command(name = "waybill")]
#[command(about = "Normalize shipping label photos and pull out the shipment identifier line")]
#[command(version)]
struct Cli {
    /// TOML settings file
    #[arg(long, global = true, env = "WAYBILL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract the target line from one label image
    Extract {
        image: PathBuf,
        /// Print every recognized line, marking the target
        #[arg(long)]
        show_lines: bool,
        /// Also write the normalized image as PNG
        #[arg(long, value_name = "PNG")]
        save_normalized: Option<PathBuf>,
    },
    /// Score extraction against a ground-truth file
    Batch {
        #[arg(long, value_name = "DIR")]
        data_dir: PathBuf,
        #[arg(long, value_name = "FILE")]
        ground_truth: PathBuf,
        #[arg(long, value_name = "DIR", default_value = "results")]
        out: PathBuf,
    },
    /// Process label images as they are dropped into a folder
    Watch {
        dir: PathBuf,
        /// Write one JSON result per image here instead of stdout
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries JSON results; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => WaybillConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => WaybillConfig::default(),
    };

    match cli.command {
        Command::Extract { image, show_lines, save_normalized } => {
            let pipeline = build_pipeline(&config)?;
            extract(&pipeline, &image, show_lines, save_normalized.as_deref()).await
        }
        Command::Batch { data_dir, ground_truth, out } => {
            let pipeline = build_pipeline(&config)?;
            batch(pipeline, &config, &data_dir, &ground_truth, &out).await
        }
        Command::Watch { dir, out } => {
            let pipeline = build_pipeline(&config)?;
            watch(pipeline, &dir, out.as_deref()).await
        }
    }
}

fn build_pipeline(config: &WaybillConfig) -> Result<Pipeline> {
    let backend = build_backend(&config.engine).context("starting OCR engine")?;
    let pipeline =
        LabelPipeline::from_config(&config.normalizer, backend).context("building normalizer")?;
    tracing::info!("Using OCR engine: {}", pipeline.recognizer().name());
    Ok(pipeline)
}

async fn extract(
    pipeline: &Pipeline,
    image: &Path,
    show_lines: bool,
    save_normalized: Option<&Path>,
) -> Result<()> {
    let bytes = tokio::fs::read(image)
        .await
        .with_context(|| format!("reading {}", image.display()))?;

    let (normalized, extraction) = pipeline
        .extract_with_image(&bytes)
        .with_context(|| format!("processing {}", image.display()))?;

    if let Some(out) = save_normalized {
        tokio::fs::write(out, encode_png(&normalized)?)
            .await
            .with_context(|| format!("writing {}", out.display()))?;
        tracing::info!("Normalized image written to {}", out.display());
    }

    if show_lines {
        let target = extraction
            .lines
            .iter()
            .position(|line| normalize_line(&line.text).is_some());
        for (index, line) in extraction.lines.iter().enumerate() {
            let marker = if Some(index) == target { ">" } else { " " };
            eprintln!("{marker} [{:.2}] {}", line.confidence, line.text);
        }
    }

    let result = LabelResult::from_match(display_name(image), &extraction.target);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn batch(
    pipeline: Pipeline,
    config: &WaybillConfig,
    data_dir: &Path,
    ground_truth: &Path,
    out: &Path,
) -> Result<()> {
    if !data_dir.is_dir() {
        bail!("data directory {} does not exist", data_dir.display());
    }
    let truth = load_ground_truth(ground_truth)?;
    let runner = BatchRunner::new(Arc::new(pipeline), config.batch.clone());

    let outcome = runner.run(data_dir, &truth).await?;
    let report_path = runner.write_outputs(out, &outcome).await?;
    let report = &outcome.report;

    println!("Samples:   {}", report.total_samples);
    if !outcome.skipped.is_empty() {
        println!("Skipped:   {} (image missing)", outcome.skipped.len());
    }
    println!("Correct:   {}", report.correct_extractions);
    println!("Accuracy:  {:.2}%", report.accuracy_percentage);
    println!(
        "Target:    {ACCURACY_TARGET:.0}% ({})",
        if report.threshold_met { "met" } else { "not met" }
    );
    println!("Report:    {}", report_path.display());
    Ok(())
}

async fn watch(pipeline: Pipeline, dir: &Path, out: Option<&Path>) -> Result<()> {
    if let Some(out) = out {
        tokio::fs::create_dir_all(out)
            .await
            .with_context(|| format!("creating {}", out.display()))?;
    }

    // The channel bridges the notify watcher thread and the async loop.
    let (tx, mut rx) = mpsc::channel::<PathBuf>(64);
    let _watcher = waybill_ocr::spawn_intake_watcher(dir, tx)
        .with_context(|| format!("watching {}", dir.display()))?;
    tracing::info!("Watching intake folder: {}", dir.display());

    let pipeline = Arc::new(pipeline);
    let mut names = ResultNames::new();
    let mut jobs = JoinSet::new();

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(path) = received else { break };
                let target = out.map(|dir| dir.join(names.assign(&display_name(&path))));
                jobs.spawn(process_dropped(Arc::clone(&pipeline), path, target));
            }
            Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!("Label task failed: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping watcher");
                break;
            }
        }
    }

    jobs.shutdown().await;
    Ok(())
}

async fn process_dropped(pipeline: Arc<Pipeline>, path: PathBuf, target: Option<PathBuf>) {
    tracing::info!("Processing label: {}", path.display());
    match pipeline.process_file_blocking(path.clone()).await {
        Ok(result) => {
            if let Err(e) = emit(&result, target.as_deref()).await {
                tracing::warn!("Failed to write result for {}: {e:#}", path.display());
            }
        }
        Err(e) => tracing::warn!("Label pipeline error for {}: {e}", path.display()),
    }
}

/// Write `result` to `target`, or print it when no output folder is set.
async fn emit(result: &LabelResult, target: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    match target {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(target_line = %result.target_line, "Result written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
