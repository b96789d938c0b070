//! Geotiler CLI tool
//!
//! Plans and runs tiled processing of a georeferenced raster from the
//! command line, using the built-in demonstration models.

use super::config::{parse_extent, CliConfigBuilder};
use crate::{
    config::{ModelKind, ProcessingParameters},
    error::Result as TilingResult,
    extent::ProcessingExtents,
    inference::{BandThreshold, RasterSampler, TileInference},
    processor::{MapProcessor, ProcessingTask},
    services::{
        ConsoleProgressObserver, InMemoryRaster, ProcessingStage, ProgressObserver, RasterIo,
    },
    tracing_config::spans,
    types::{Extent, ProcessingArtifact, ProcessingResult, ProcessingTimings, TileOutput, TileParams},
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use ndarray::Array3;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info as trace_info, Instrument};

/// Tiled model inference over georeferenced rasters
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "geotiler")]
pub struct Cli {
    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Plain log output without colors, for CI logs
    #[arg(long, global = true)]
    pub compact_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Compute extents, grid and tiles without running a model
    Plan(PlanArgs),
    /// Process a raster and save the assembled result
    Run(RunArgs),
}

#[derive(Args)]
pub struct PlanArgs {
    /// Input raster (PNG, JPEG or TIFF, optionally with a world file)
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    #[command(flatten)]
    pub tiling: TilingArgs,

    #[command(flatten)]
    pub area: AreaArgs,

    /// Layer extent as x_min,y_min,x_max,y_max (overrides the world file)
    #[arg(long, value_parser = parse_extent, allow_hyphen_values = true)]
    pub layer_extent: Option<Extent>,

    /// Include every tile that will be processed in the report
    #[arg(long)]
    pub list_tiles: bool,

    /// Write the report to a file instead of stdout
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct RunArgs {
    /// Input raster (PNG, JPEG or TIFF, optionally with a world file)
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Output file: PNG for raster results, JSON for detections
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: PathBuf,

    #[command(flatten)]
    pub tiling: TilingArgs,

    #[command(flatten)]
    pub area: AreaArgs,

    /// Layer extent as x_min,y_min,x_max,y_max (overrides the world file)
    #[arg(long, value_parser = parse_extent, allow_hyphen_values = true)]
    pub layer_extent: Option<Extent>,

    /// Model input channel thresholded by the segmentation demo model
    #[arg(long, default_value_t = 0)]
    pub threshold_channel: usize,

    /// Foreground threshold of the segmentation demo model
    #[arg(long, default_value_t = 128.0)]
    pub threshold: f32,

    /// Band of a raster result written to the output PNG
    #[arg(long, default_value_t = 0)]
    pub output_band: usize,

    /// Also write run metadata (grid, tile counts, timings) as JSON
    #[arg(long, value_name = "PATH")]
    pub metadata: Option<PathBuf>,

    /// Show a progress bar instead of periodic log lines
    #[arg(long)]
    pub progress: bool,
}

/// Tiling overrides applied on top of the parameter file
#[derive(Args, Clone)]
pub struct TilingArgs {
    /// Parameter file (JSON); command line values override its fields
    #[arg(short, long, value_name = "PATH")]
    pub params: Option<PathBuf>,

    /// Layer units per processed pixel
    #[arg(short, long)]
    pub resolution: Option<f64>,

    /// Tile edge length in pixels
    #[arg(short, long)]
    pub tile_size: Option<usize>,

    /// Overlap between neighbouring tiles in percent (0-99)
    #[arg(long)]
    pub overlap: Option<f64>,

    /// Margin around the processed area in pixels [default: half a tile]
    #[arg(long)]
    pub margin: Option<usize>,

    /// Raster bands fed to the model, in channel order (e.g. 2,1,0)
    #[arg(long, value_delimiter = ',')]
    pub bands: Option<Vec<usize>>,

    /// How overlapping tile outputs are combined
    #[arg(long, value_enum)]
    pub composition: Option<CliComposition>,

    /// Pad areas smaller than one tile instead of failing
    #[arg(long)]
    pub pad_undersized_area: bool,
}

/// Selection of the processed area
#[derive(Args, Clone)]
pub struct AreaArgs {
    /// Part of the layer to process
    #[arg(long, value_enum)]
    pub area: Option<CliAreaType>,

    /// Visible extent as x_min,y_min,x_max,y_max
    #[arg(long, value_parser = parse_extent, allow_hyphen_values = true)]
    pub viewport: Option<Extent>,

    /// Polygon mask (JSON); implies the from-polygons area type
    #[arg(long, value_name = "PATH")]
    pub mask: Option<PathBuf>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliAreaType {
    EntireLayer,
    VisiblePart,
    FromPolygons,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliComposition {
    CenterCrop,
    Maximum,
    Average,
    LastWrite,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    crate::tracing_config::init_cli_tracing(cli.verbose, cli.compact_logs)
        .context("Failed to initialize tracing")?;

    match cli.command {
        Command::Plan(args) => plan_command(&args),
        Command::Run(args) => {
            let span = spans::command("run", &args.input);
            run_command(args, cli.verbose).instrument(span).await
        },
    }
}

/// Processor built from command line arguments
struct Prepared {
    processor: MapProcessor,
    params: ProcessingParameters,
}

fn prepare(
    input: &Path,
    layer_extent: Option<Extent>,
    tiling: &TilingArgs,
    area: &AreaArgs,
) -> Result<Prepared> {
    let raster = RasterIo::load_raster(input, layer_extent)
        .with_context(|| format!("Failed to load raster {}", input.display()))?;
    let (cols, rows) = raster.size_px();
    info!(
        "📂 Loaded {} ({}x{} px, {} bands, extent {})",
        input.display(),
        cols,
        rows,
        raster.band_count(),
        raster.layer_extent()
    );

    let params = CliConfigBuilder::from_cli(tiling, area, input, raster.band_count())?;
    CliConfigBuilder::validate_area(&params, area)?;
    debug!(
        tile_size_px = params.tile_size_px,
        overlap = params.overlap_fraction,
        resolution = params.resolution,
        model = params.model.name(),
        "Resolved processing parameters"
    );

    let sampler: Arc<InMemoryRaster> = Arc::new(raster);
    let mut processor = MapProcessor::new(params.clone(), sampler)
        .context("Raster does not match the processing parameters")?;
    if let Some(viewport) = area.viewport {
        processor = processor.with_viewport(viewport);
    }
    if let Some(geometry) = CliConfigBuilder::load_mask(area)? {
        processor = processor.with_mask(geometry);
    }

    Ok(Prepared { processor, params })
}

#[derive(Serialize)]
struct PlanReport<'a> {
    parameters: &'a ProcessingParameters,
    extents: &'a ProcessingExtents,
    /// Pixels inside the area mask, absent when the whole extent is processed
    mask_pixels: Option<usize>,
    total_tiles: usize,
    tiles_to_process: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    tiles: Option<Vec<TileParams>>,
}

fn plan_command(args: &PlanArgs) -> Result<()> {
    let _span = spans::command("plan", &args.input).entered();
    let prepared = prepare(&args.input, args.layer_extent, &args.tiling, &args.area)?;
    let plan = prepared.processor.plan().context("Failed to plan processing")?;

    let grid = plan.tile_grid();
    let tiles: Vec<TileParams> = grid.tiles(&plan.mask).collect();
    let mask_pixels = plan
        .mask
        .grid()
        .map(|values| values.iter().filter(|inside| **inside).count());

    info!(
        "🧩 {} of {} tiles to process ({}x{} grid, stride {} px)",
        tiles.len(),
        grid.total_tiles(),
        plan.extents.grid.x_bins_number,
        plan.extents.grid.y_bins_number,
        plan.extents.stride_px
    );

    let report = PlanReport {
        parameters: &prepared.params,
        extents: &plan.extents,
        mask_pixels,
        total_tiles: grid.total_tiles(),
        tiles_to_process: tiles.len(),
        tiles: args.list_tiles.then_some(tiles),
    };
    let json = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("💾 Plan written to {}", path.display());
        },
        None => println!("{}", json),
    }
    Ok(())
}

async fn run_command(args: RunArgs, verbose: u8) -> Result<()> {
    let prepared = prepare(&args.input, args.layer_extent, &args.tiling, &args.area)?;
    let inference = demo_inference(&prepared.params.model, &args)?;

    let observer: Arc<dyn ProgressObserver> = if args.progress {
        Arc::new(IndicatifProgressObserver::new())
    } else {
        Arc::new(ConsoleProgressObserver::new(verbose > 0))
    };
    let task = ProcessingTask::new(prepared.processor).with_observer(observer);
    trace_info!(task_id = %task.id(), "Starting processing task");

    let handle = task.start(inference).context("Failed to start processing")?;
    let wait = handle.wait();
    tokio::pin!(wait);
    let result = tokio::select! {
        result = &mut wait => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("🛑 Interrupt received, cancelling after the current tile");
            task.cancel();
            wait.await
        },
    };

    match result {
        ProcessingResult::Success { artifact, metadata } => {
            save_artifact(&artifact, &args)?;
            if let Some(path) = &args.metadata {
                std::fs::write(path, serde_json::to_string_pretty(&metadata)?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
            info!(
                "✅ Processed {} tiles ({} skipped) in {} ms",
                metadata.processed_tiles, metadata.skipped_tiles, metadata.timings.total_ms
            );
            Ok(())
        },
        ProcessingResult::Cancelled => {
            warn!("Processing cancelled, no output written");
            anyhow::bail!("Processing cancelled")
        },
        ProcessingResult::Failed { message, .. } => {
            anyhow::bail!("Processing failed: {}", message)
        },
    }
}

fn save_artifact(artifact: &ProcessingArtifact, args: &RunArgs) -> Result<()> {
    let output = &args.output;
    match artifact {
        ProcessingArtifact::ClassMap(map) => {
            let _span = spans::save_output(output, "class_map").entered();
            RasterIo::save_class_map(map, output)
                .with_context(|| format!("Failed to save {}", output.display()))?;
        },
        ProcessingArtifact::Raster(raster) => {
            let _span = spans::save_output(output, "raster").entered();
            RasterIo::save_raster_band(raster, args.output_band, output)
                .with_context(|| format!("Failed to save {}", output.display()))?;
        },
        ProcessingArtifact::Detections(detections) => {
            let _span = spans::save_output(output, "detections").entered();
            std::fs::write(output, serde_json::to_string_pretty(detections)?)
                .with_context(|| format!("Failed to write {}", output.display()))?;
        },
    }
    info!("💾 Result saved to {}", output.display());
    Ok(())
}

/// Built-in models for running the pipeline without an external runtime
fn demo_inference(model: &ModelKind, args: &RunArgs) -> Result<Box<dyn TileInference>> {
    match model {
        ModelKind::Segmentation { .. } => Ok(Box::new(BandThreshold::new(
            args.threshold_channel,
            args.threshold,
        ))),
        ModelKind::Regression { .. } => Ok(Box::new(
            |input: &Array3<f32>, _tile: &TileParams| -> TilingResult<TileOutput> {
                Ok(TileOutput::Raster(input.clone()))
            },
        )),
        ModelKind::SuperResolution { scale_factor, .. } => {
            let scale = *scale_factor;
            Ok(Box::new(
                move |input: &Array3<f32>, _tile: &TileParams| -> TilingResult<TileOutput> {
                    Ok(TileOutput::Raster(upsample_nearest(input, scale)))
                },
            ))
        },
        ModelKind::Detection { .. } => anyhow::bail!(
            "Detection models need an inference callback from the library API; \
             the CLI only ships segmentation, regression and super-resolution demos"
        ),
    }
}

fn upsample_nearest(input: &Array3<f32>, scale: usize) -> Array3<f32> {
    let (channels, rows, cols) = input.dim();
    Array3::from_shape_fn((channels, rows * scale, cols * scale), |(c, r, col)| {
        input[[c, r / scale, col / scale]]
    })
}

/// Progress bar observer for interactive terminals
struct IndicatifProgressObserver {
    bar: ProgressBar,
}

impl IndicatifProgressObserver {
    fn new() -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        Self { bar }
    }
}

impl ProgressObserver for IndicatifProgressObserver {
    fn report_progress(&self, percent: f64) {
        self.bar.set_position(percent.clamp(0.0, 100.0).round() as u64);
    }

    fn report_stage(&self, stage: ProcessingStage) {
        self.bar.set_message(stage.description());
    }

    fn report_completion(&self, timings: &ProcessingTimings) {
        self.bar
            .finish_with_message(format!("done in {} ms", timings.total_ms));
    }

    fn report_error(&self, stage: ProcessingStage, error: &str) {
        self.bar
            .abandon_with_message(format!("{} failed: {}", stage.description(), error));
    }
}
