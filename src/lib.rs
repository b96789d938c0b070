#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]

//! # Geotiler
//!
//! Tiled model inference over large georeferenced rasters.
//!
//! A model accepts fixed-size square tiles; a map layer is arbitrarily large.
//! Geotiler computes the processed extents, cuts the area into overlapping
//! tiles, feeds each tile to an inference callback and stitches the per-tile
//! outputs back into a single georeferenced result.
//!
//! ## Features
//!
//! - **Extent planning**: requested area snapped to the pixel lattice, grown by
//!   a margin and aligned so tiles cover it exactly
//! - **Area masks**: polygon masks rasterized once, with constant-time tile
//!   intersection tests so tiles outside the mask are never sampled
//! - **Compositing**: center-crop, maximum, average or last-write policies
//! - **Model kinds**: segmentation, regression, super-resolution and detection
//! - **Background tasks**: cancellable [`ProcessingTask`] with a single
//!   terminal result and completion callback
//! - **CLI Integration**: optional command-line interface (`cli` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use geotiler::{
//!     BandThreshold, ChannelMapping, ProcessingParameters, ProcessingTask, MapProcessor,
//!     RasterIo,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let raster = RasterIo::load_raster("ortho.png", None)?;
//! let params = ProcessingParameters::builder()
//!     .resolution(0.5)
//!     .tile_size_px(256)
//!     .overlap_percentage(15.0)
//!     .input_layer_id("ortho")
//!     .input_channels_mapping(ChannelMapping::identity(3))
//!     .build()?;
//!
//! let task = ProcessingTask::new(MapProcessor::new(params, Arc::new(raster))?);
//! let handle = task.start(Box::new(BandThreshold::new(1, 128.0)))?;
//! let result = handle.wait().await;
//! if let Some(artifact) = result.artifact() {
//!     println!("output size: {:?}", artifact.dimensions());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `cli` (default): command-line interface and progress bars
//! - `tracing-json`: JSON log output for the CLI

pub mod assembler;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod extent;
pub mod inference;
pub mod mask;
pub mod processor;
pub mod services;
pub mod tiles;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod types;

use std::sync::Arc;

// Public API exports
pub use assembler::{
    scale_output, segmentation_class_map, DetectionAssembler, ResultAssembler, TileCompositor,
};
pub use config::{
    ChannelMapping, CompositionPolicy, ModelKind, ProcessedAreaType, ProcessingParameters,
    ProcessingParametersBuilder,
};
pub use error::{Result, TilingError};
pub use extent::{ExtentCalculator, ProcessingExtents};
pub use inference::{BandThreshold, RasterSampler, TileInference, TileRequest};
pub use mask::{
    AreaMask, AreaMaskEngine, MaskGeometry, MaskGrid, MaskRasterizer, Polygon,
    ScanlineRasterizer,
};
pub use processor::{
    MapProcessor, ProcessingOutcome, ProcessingPlan, ProcessingTask, TaskHandle, TaskState,
};
pub use services::{
    CancellationToken, ConsoleProgressObserver, InMemoryRaster, NoOpProgressObserver,
    ProcessingStage, ProgressObserver, ProgressTracker, RasterIo,
};
pub use tiles::{SampledTiles, TileGrid, TileGridIterator};
pub use types::{
    Detection, Extent, GeoArray, GridDimensions, MapDetection, PixelBoundingBox, PixelOffset,
    ProcessingArtifact, ProcessingMetadata, ProcessingResult, ProcessingTimings, TileOutput,
    TileParams,
};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, spans, TracingConfig, TracingFormat};

/// Process a whole layer on the current thread
///
/// Convenience wrapper for the entire-layer area type. Use [`MapProcessor`]
/// directly to supply a viewport or a polygon mask.
///
/// # Errors
///
/// Returns an error when the parameters do not fit the raster (e.g. a channel
/// mapping naming a missing band). Failures during the run itself are
/// reported as [`ProcessingResult::Failed`].
///
/// # Examples
///
/// ```rust,no_run
/// use geotiler::{process_map, BandThreshold, InMemoryRaster, Extent, ProcessingParameters};
/// use ndarray::Array3;
/// use std::sync::Arc;
///
/// # fn example() -> geotiler::Result<()> {
/// let raster = InMemoryRaster::new(
///     Array3::zeros((3, 1024, 1024)),
///     Extent::new(0.0, 0.0, 1024.0, 1024.0)?,
/// )?;
/// let params = ProcessingParameters::builder().tile_size_px(256).build()?;
/// let mut model = BandThreshold::new(0, 0.5);
/// let result = process_map(params, Arc::new(raster), &mut model)?;
/// assert!(result.is_success());
/// # Ok(())
/// # }
/// ```
pub fn process_map(
    params: ProcessingParameters,
    sampler: Arc<dyn RasterSampler>,
    inference: &mut dyn TileInference,
) -> Result<ProcessingResult> {
    let task = ProcessingTask::new(MapProcessor::new(params, sampler)?);
    task.run(inference)
}

/// Process a whole layer in the background and await the result
///
/// Runs on the Tokio blocking pool so the caller's executor stays free.
///
/// # Errors
///
/// Same as [`process_map`].
pub async fn process_map_async(
    params: ProcessingParameters,
    sampler: Arc<dyn RasterSampler>,
    inference: Box<dyn TileInference>,
) -> Result<ProcessingResult> {
    let task = ProcessingTask::new(MapProcessor::new(params, sampler)?);
    let handle = task.start(inference)?;
    Ok(handle.wait().await)
}
