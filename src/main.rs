//! NoteScan - sticky note photo digitization
//!
//! Runs one photo through the pipeline and prints the result as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use notescan::capture::read_image_file;
use notescan::config::{self, PipelineConfig};
use notescan::pipeline::{LayoutHint, Pipeline, ProcessingOptions, ProcessingRequest, RunStatus};
use notescan::vision::OcrMode;

/// NoteScan - digitize a photo of sticky notes
#[derive(Parser, Debug)]
#[command(name = "notescan")]
#[command(about = "Separate, read and structure the sticky notes in a photo")]
struct Args {
    /// Photo to process (jpeg, png, webp or tiff)
    #[arg(required_unless_present = "print_config")]
    image: Option<PathBuf>,

    /// Text extraction mode: auto, traditional or vision
    #[arg(short, long, default_value = "auto")]
    mode: OcrMode,

    /// Process at most this many notes
    #[arg(long)]
    max_notes: Option<usize>,

    /// Flag notes whose overall confidence is below this value
    #[arg(long)]
    confidence_threshold: Option<f32>,

    /// Known page layout, e.g. grid3x3
    #[arg(long)]
    layout: Option<LayoutHint>,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging on stderr so stdout stays valid JSON
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = config::load_or_default(args.config.as_deref())?;

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    let Some(path) = args.image.as_deref() else {
        anyhow::bail!("no image given");
    };

    let (bytes, format) = read_image_file(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let options = ProcessingOptions {
        ocr_mode: args.mode,
        max_notes: args.max_notes,
        confidence_threshold: args.confidence_threshold,
        layout_hint: args.layout,
    };

    let pipeline = build_pipeline(config)?;
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, returning the notes finished so far");
            ctrl_c.cancel();
        }
    });

    info!("Processing {}", path.display());
    let output = pipeline
        .process_with_cancel(ProcessingRequest::new(bytes, format).with_options(options), cancel)
        .await;

    println!("{}", output.to_json(args.pretty)?);

    Ok(if output.summary.status == RunStatus::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn build_pipeline(config: PipelineConfig) -> Result<Pipeline> {
    Pipeline::from_config(config).context("Failed to set up the pipeline")
}
