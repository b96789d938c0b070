//! Map processor and cancellable processing task
//!
//! [`MapProcessor`] runs one pipeline end to end: extents, area mask, tile
//! iteration with per-tile inference, compositing and assembly.
//! [`ProcessingTask`] wraps one run in a background unit of work with a
//! single terminal [`ProcessingResult`].

use crate::{
    assembler::{
        scale_output, segmentation_class_map, DetectionAssembler, ResultAssembler, TileCompositor,
    },
    config::{ModelKind, ProcessedAreaType, ProcessingParameters},
    error::{Result, TilingError},
    extent::{ExtentCalculator, ProcessingExtents},
    inference::{RasterSampler, TileInference},
    mask::{AreaMask, AreaMaskEngine, MaskGeometry, MaskRasterizer, ScanlineRasterizer},
    services::{
        CancellationToken, NoOpProgressObserver, ProcessingStage, ProgressObserver,
        ProgressTracker,
    },
    tiles::TileGrid,
    types::{
        Extent, ProcessingArtifact, ProcessingMetadata, ProcessingResult, ProcessingTimings,
        TileOutput,
    },
};
use chrono::Utc;
use instant::Instant;
use log::{debug, info};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::oneshot;
use tracing::{info as trace_info, instrument, span, Level};
use uuid::Uuid;

/// Extents and area mask computed before any tile work
#[derive(Debug, Clone)]
pub struct ProcessingPlan {
    pub extents: ProcessingExtents,
    pub mask: AreaMask,
}

impl ProcessingPlan {
    #[must_use]
    pub fn tile_grid(&self) -> TileGrid<'_> {
        TileGrid::new(&self.extents)
    }
}

/// How a run ended when no error occurred
#[derive(Debug, Clone)]
pub enum ProcessingOutcome {
    Completed {
        artifact: ProcessingArtifact,
        metadata: ProcessingMetadata,
    },
    Cancelled,
}

impl From<ProcessingOutcome> for ProcessingResult {
    fn from(outcome: ProcessingOutcome) -> Self {
        match outcome {
            ProcessingOutcome::Completed { artifact, metadata } => {
                ProcessingResult::Success { artifact, metadata }
            },
            ProcessingOutcome::Cancelled => ProcessingResult::Cancelled,
        }
    }
}

/// Raster or detection accumulator selected by the model kind
enum Accumulator {
    Raster(TileCompositor),
    Detections(DetectionAssembler),
}

/// Runs tiled processing of one raster layer
pub struct MapProcessor {
    params: ProcessingParameters,
    sampler: Arc<dyn RasterSampler>,
    rasterizer: Arc<dyn MaskRasterizer>,
    viewport: Option<Extent>,
    mask_geometry: Option<MaskGeometry>,
    task_id: Uuid,
}

impl MapProcessor {
    /// Create a processor reading pixels from `sampler`
    ///
    /// # Errors
    ///
    /// Returns `TilingError::InvalidParameter` for invalid parameters or a
    /// channel mapping that references bands the sampler does not have.
    pub fn new(params: ProcessingParameters, sampler: Arc<dyn RasterSampler>) -> Result<Self> {
        params.validate()?;
        let bands = sampler.band_count();
        if let Some(&band) = params
            .input_channels_mapping
            .bands()
            .iter()
            .find(|&&b| b >= bands)
        {
            return Err(TilingError::config_value_error(
                "channel mapping band",
                band,
                &format!("0..{}", bands),
            ));
        }
        Ok(Self {
            params,
            sampler,
            rasterizer: Arc::new(ScanlineRasterizer),
            viewport: None,
            mask_geometry: None,
            task_id: Uuid::new_v4(),
        })
    }

    /// Visible area used by [`ProcessedAreaType::VisiblePart`]
    #[must_use]
    pub fn with_viewport(mut self, viewport: Extent) -> Self {
        self.viewport = Some(viewport);
        self
    }

    /// Polygons used by [`ProcessedAreaType::FromPolygons`]
    #[must_use]
    pub fn with_mask(mut self, geometry: MaskGeometry) -> Self {
        self.mask_geometry = Some(geometry);
        self
    }

    /// Replace the default scanline rasterizer
    #[must_use]
    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn MaskRasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    #[must_use]
    pub fn params(&self) -> &ProcessingParameters {
        &self.params
    }

    #[must_use]
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Area requested by the area type, `None` for the whole layer
    fn requested_area(&self) -> Result<Option<Extent>> {
        match self.params.processed_area_type {
            ProcessedAreaType::EntireLayer => Ok(None),
            ProcessedAreaType::VisiblePart => self.viewport.map(Some).ok_or_else(|| {
                TilingError::invalid_parameter("Visible part area type requires a viewport extent")
            }),
            ProcessedAreaType::FromPolygons => {
                let geometry = self.mask_geometry.as_ref().ok_or_else(|| {
                    TilingError::invalid_parameter("Polygon area type requires a mask geometry")
                })?;
                geometry.bounding_extent().map(Some)
            },
        }
    }

    /// Compute extents and the area mask without touching pixel data
    ///
    /// # Errors
    /// - `InvalidArea` for an area outside the layer or a mask covering no pixel
    /// - `InsufficientArea` when the layer cannot hold a tile
    /// - `InvalidParameter` for a missing viewport or mask geometry
    pub fn plan(&self) -> Result<ProcessingPlan> {
        let calculator = ExtentCalculator::new(&self.params, self.sampler.layer_extent())?;
        let requested = self.requested_area()?;
        let extents = calculator.compute(requested.as_ref())?;
        let mask = AreaMaskEngine::new(self.rasterizer.as_ref()).build(
            self.params.processed_area_type,
            self.mask_geometry.as_ref(),
            &extents,
        )?;
        Ok(ProcessingPlan { extents, mask })
    }

    /// Run the whole pipeline on the current thread
    ///
    /// Cancellation is checked once per tile through `tracker`.
    ///
    /// # Errors
    ///
    /// Setup errors are returned before any tile is sampled. The first tile
    /// that fails sampling or inference aborts the run with an error naming
    /// the tile and its bins.
    #[instrument(
        skip(self, inference, tracker),
        fields(
            task_id = %self.task_id,
            model = %self.params.model.name(),
            layer = %self.params.input_layer_id
        )
    )]
    pub fn run(
        &self,
        inference: &mut dyn TileInference,
        tracker: &ProgressTracker,
    ) -> Result<ProcessingOutcome> {
        let started_at = Utc::now();
        let total_start = Instant::now();
        let mut timings = ProcessingTimings::default();

        trace_info!(
            tile_size = self.params.tile_size_px,
            overlap = self.params.overlap_fraction,
            resolution = self.params.resolution,
            "🗺️ Starting tiled processing"
        );

        tracker.report_stage(ProcessingStage::Planning);
        let plan_start = Instant::now();
        let calculator = ExtentCalculator::new(&self.params, self.sampler.layer_extent())?;
        let requested = self.requested_area()?;
        let extents = calculator.compute(requested.as_ref())?;
        timings.planning_ms = plan_start.elapsed().as_millis() as u64;

        tracker.report_stage(ProcessingStage::MaskBuilding);
        let mask_start = Instant::now();
        let mask = {
            let _span = span!(Level::DEBUG, "area_mask", area = ?self.params.processed_area_type)
                .entered();
            AreaMaskEngine::new(self.rasterizer.as_ref()).build(
                self.params.processed_area_type,
                self.mask_geometry.as_ref(),
                &extents,
            )?
        };
        timings.mask_ms = mask_start.elapsed().as_millis() as u64;

        let scale = self.params.model.output_scale();
        let mut accumulator = match &self.params.model {
            ModelKind::Detection {
                confidence,
                iou_threshold,
                remove_overlapping,
            } => Accumulator::Detections(DetectionAssembler::new(
                *confidence,
                *iou_threshold,
                *remove_overlapping,
                extents.grid,
            )),
            _ => Accumulator::Raster(TileCompositor::new(
                self.params.composition,
                extents.grid,
                scale,
            )),
        };

        tracker.report_stage(ProcessingStage::Tiling);
        let grid = TileGrid::new(&extents);
        let mut tiles = grid
            .tiles_with_progress(&mask, tracker)
            .sampled(self.sampler.as_ref(), &self.params.input_channels_mapping);

        {
            let _span = span!(
                Level::INFO,
                "tiling",
                x_bins = extents.grid.x_bins_number,
                y_bins = extents.grid.y_bins_number
            )
            .entered();

            for item in tiles.by_ref() {
                let (data, tile) = item?;
                let infer_start = Instant::now();
                let output = inference.infer(&data, &tile).map_err(|e| match e {
                    TilingError::Inference { .. } | TilingError::DataAccess { .. } => e,
                    other => TilingError::inference_for_tile(&tile, other),
                })?;
                timings.inference_ms += infer_start.elapsed().as_millis() as u64;

                match (&mut accumulator, output) {
                    (Accumulator::Raster(compositor), TileOutput::Raster(raster)) => {
                        compositor.add_tile(&tile, raster.view())?;
                    },
                    (Accumulator::Detections(detections), TileOutput::Detections(found)) => {
                        detections.add_tile(&tile, &found)?;
                    },
                    (_, _) => {
                        return Err(TilingError::inference_for_tile(
                            &tile,
                            format!(
                                "output kind does not match the {} model",
                                self.params.model.name()
                            ),
                        ));
                    },
                }
            }
        }
        timings.sampling_ms = tiles.sampling_ms();

        let tile_iter = tiles.tiles();
        if tile_iter.is_cancelled() || tracker.is_cancelled() {
            info!(
                "Processing cancelled after {} of {} tiles",
                tile_iter.yielded_tiles(),
                tile_iter.total_tiles()
            );
            return Ok(ProcessingOutcome::Cancelled);
        }
        let (processed_tiles, skipped_tiles) = (tile_iter.yielded_tiles(), tile_iter.skipped_tiles());
        debug!(
            "Processed {} tiles, skipped {} outside the mask",
            processed_tiles, skipped_tiles
        );

        tracker.report_stage(ProcessingStage::Assembly);
        let assembly_start = Instant::now();
        let artifact = {
            let _span = span!(Level::DEBUG, "assembly").entered();
            let assembler = ResultAssembler::new(&extents, &mask, scale);
            match accumulator {
                Accumulator::Detections(detections) => {
                    ProcessingArtifact::Detections(detections.finish(&extents, &mask))
                },
                Accumulator::Raster(compositor) => {
                    let mut buffer = compositor
                        .finish()
                        .ok_or_else(|| TilingError::internal("No tile produced any output"))?;
                    match &self.params.model {
                        ModelKind::Segmentation {
                            probability_threshold,
                        } => {
                            let probabilities = assembler.assemble(buffer.view(), 0.0)?;
                            let classes =
                                segmentation_class_map(probabilities.view(), *probability_threshold)?;
                            ProcessingArtifact::ClassMap(assembler.georeference(classes))
                        },
                        ModelKind::Regression { output_scaling }
                        | ModelKind::SuperResolution { output_scaling, .. } => {
                            scale_output(&mut buffer, *output_scaling);
                            let raster =
                                assembler.assemble(buffer.view(), self.params.nodata_value)?;
                            ProcessingArtifact::Raster(assembler.georeference(raster))
                        },
                        ModelKind::Detection { .. } => {
                            return Err(TilingError::internal(
                                "Detection model composited as raster",
                            ));
                        },
                    }
                },
            }
        };
        timings.assembly_ms = assembly_start.elapsed().as_millis() as u64;
        timings.total_ms = total_start.elapsed().as_millis() as u64;

        tracker.report_stage(ProcessingStage::Completed);
        tracker.report_completion(&timings);

        let metadata = ProcessingMetadata {
            task_id: self.task_id.to_string(),
            model: self.params.model.name().to_string(),
            started_at,
            grid: extents.grid,
            total_tiles: extents.grid.total_tiles(),
            processed_tiles,
            skipped_tiles,
            timings,
        };
        trace_info!(
            total_ms = metadata.timings.total_ms,
            processed = processed_tiles,
            skipped = skipped_tiles,
            "✅ Tiled processing completed"
        );
        Ok(ProcessingOutcome::Completed { artifact, metadata })
    }
}

/// Lifecycle of a [`ProcessingTask`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

type CompletionCallback = Box<dyn FnOnce(&ProcessingResult) + Send>;

/// State shared between a task and its background run
struct TaskShared {
    state: Mutex<TaskState>,
    result: OnceLock<ProcessingResult>,
    callback: Mutex<Option<CompletionCallback>>,
}

impl TaskShared {
    fn set_state(&self, state: TaskState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the terminal result and fire the completion callback once
    fn complete(&self, result: ProcessingResult) -> ProcessingResult {
        let state = match &result {
            ProcessingResult::Success { .. } => TaskState::Succeeded,
            ProcessingResult::Failed { .. } => TaskState::Failed,
            ProcessingResult::Cancelled => TaskState::Cancelled,
        };
        if self.result.set(result.clone()).is_err() {
            log::warn!("Processing task completed twice, keeping the first result");
        }
        self.set_state(state);

        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(&result);
        }
        result
    }
}

/// Handle to a started task
pub struct TaskHandle {
    task_id: Uuid,
    receiver: oneshot::Receiver<ProcessingResult>,
}

impl TaskHandle {
    #[must_use]
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Wait for the terminal result
    pub async fn wait(self) -> ProcessingResult {
        self.receiver
            .await
            .unwrap_or_else(|_| ProcessingResult::failed("Processing task ended without a result"))
    }

    /// Wait for the terminal result from synchronous code
    ///
    /// Must not be called from inside an async context.
    #[must_use]
    pub fn wait_blocking(self) -> ProcessingResult {
        self.receiver
            .blocking_recv()
            .unwrap_or_else(|_| ProcessingResult::failed("Processing task ended without a result"))
    }
}

/// Cancellable, single-use unit of work owning one processing run
///
/// `Created -> Running -> {Succeeded, Failed, Cancelled}`. Errors and panics
/// inside the run end in [`ProcessingResult::Failed`].
pub struct ProcessingTask {
    id: Uuid,
    processor: Mutex<Option<MapProcessor>>,
    observer: Arc<dyn ProgressObserver>,
    token: CancellationToken,
    shared: Arc<TaskShared>,
}

impl ProcessingTask {
    #[must_use]
    pub fn new(processor: MapProcessor) -> Self {
        Self {
            id: processor.task_id(),
            processor: Mutex::new(Some(processor)),
            observer: Arc::new(NoOpProgressObserver),
            token: CancellationToken::new(),
            shared: Arc::new(TaskShared {
                state: Mutex::new(TaskState::Created),
                result: OnceLock::new(),
                callback: Mutex::new(None),
            }),
        }
    }

    /// Report progress to `observer`, which may also request cancellation
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    /// True while the run is in progress
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// Token that cancels this task; may be shared with other threads
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request cooperative cancellation at the next tile boundary
    pub fn cancel(&self) {
        info!("Cancellation requested for task {}", self.id);
        self.token.cancel();
    }

    /// Terminal result, once available
    #[must_use]
    pub fn result(&self) -> Option<ProcessingResult> {
        self.shared.result.get().cloned()
    }

    /// Register the completion notification
    ///
    /// Fires exactly once with the terminal result; immediately if the task
    /// already finished. A later registration replaces a pending one.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&ProcessingResult) + Send + 'static,
    {
        let mut slot = self
            .shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match self.shared.result.get() {
            Some(result) => {
                slot.take();
                drop(slot);
                callback(result);
            },
            None => *slot = Some(Box::new(callback)),
        }
    }

    /// Move `Created -> Running` and hand out the processor
    fn begin(&self) -> Result<MapProcessor> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            TaskState::Created => {},
            TaskState::Running => return Err(TilingError::task("Task is already running")),
            finished => {
                return Err(TilingError::task(format!(
                    "Task already finished ({:?}) and cannot be restarted",
                    finished
                )))
            },
        }
        let processor = self
            .processor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TilingError::task("Task has no processor to run"))?;
        *state = TaskState::Running;
        Ok(processor)
    }

    /// Run the pipeline and capture errors and panics into a result
    fn execute(
        processor: &MapProcessor,
        inference: &mut dyn TileInference,
        tracker: &ProgressTracker,
    ) -> ProcessingResult {
        let outcome = catch_unwind(AssertUnwindSafe(|| processor.run(inference, tracker)));
        match outcome {
            Ok(Ok(outcome)) => outcome.into(),
            Ok(Err(e)) => {
                tracker.report_error(tracker.current_stage(), &e.to_string());
                ProcessingResult::from_error(e)
            },
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracker.report_error(tracker.current_stage(), &message);
                ProcessingResult::failed(format!("Processing panicked: {}", message))
            },
        }
    }

    /// Run on the calling thread and return the terminal result
    ///
    /// # Errors
    ///
    /// Returns `TilingError::Task` when the task is running or already finished.
    pub fn run(&self, inference: &mut dyn TileInference) -> Result<ProcessingResult> {
        let processor = self.begin()?;
        let tracker = ProgressTracker::new(self.observer.clone(), self.token.clone());
        let result = Self::execute(&processor, inference, &tracker);
        Ok(self.shared.complete(result))
    }

    /// Start the run on a background thread
    ///
    /// Uses the Tokio blocking pool when called inside a runtime, a dedicated
    /// thread otherwise.
    ///
    /// # Errors
    ///
    /// Returns `TilingError::Task` when the task is running or already finished.
    pub fn start(&self, mut inference: Box<dyn TileInference>) -> Result<TaskHandle> {
        let processor = self.begin()?;
        let tracker = ProgressTracker::new(self.observer.clone(), self.token.clone());
        let shared = Arc::clone(&self.shared);
        let (sender, receiver) = oneshot::channel();
        let task_id = self.id;

        let job = move || {
            let result = Self::execute(&processor, inference.as_mut(), &tracker);
            let result = shared.complete(result);
            // The handle may have been dropped
            let _ = sender.send(result);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Starting task {} on the blocking pool", task_id);
                drop(runtime.spawn_blocking(job));
            },
            Err(_) => {
                debug!("Starting task {} on a dedicated thread", task_id);
                let spawned = std::thread::Builder::new()
                    .name(format!("geotiler-{}", task_id))
                    .spawn(job);
                if let Err(e) = spawned {
                    self.shared.complete(ProcessingResult::failed(format!(
                        "Could not spawn processing thread: {}",
                        e
                    )));
                    return Err(e.into());
                }
            },
        }

        Ok(TaskHandle { task_id, receiver })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelMapping;
    use crate::services::InMemoryRaster;
    use crate::types::{Detection, PixelBoundingBox, TileParams};
    use ndarray::Array3;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sampler(size: usize) -> Arc<dyn RasterSampler> {
        let data = Array3::from_shape_fn((1, size, size), |(_, r, c)| (r + c) as f32);
        Arc::new(
            InMemoryRaster::new(
                data,
                Extent::new(0.0, 0.0, size as f64, size as f64).unwrap(),
            )
            .unwrap(),
        )
    }

    fn params(model: ModelKind) -> ProcessingParameters {
        ProcessingParameters::builder()
            .resolution(1.0)
            .tile_size_px(16)
            .overlap_fraction(0.5)
            .input_channels_mapping(ChannelMapping::identity(1))
            .model(model)
            .build()
            .unwrap()
    }

    fn identity(input: &Array3<f32>, _tile: &TileParams) -> Result<TileOutput> {
        Ok(TileOutput::Raster(input.clone()))
    }

    #[test]
    fn test_regression_reproduces_input() {
        let processor = MapProcessor::new(
            params(ModelKind::Regression {
                output_scaling: 2.0,
            }),
            sampler(40),
        )
        .unwrap();
        let mut model = identity;
        let outcome = processor.run(&mut model, &ProgressTracker::no_op()).unwrap();
        let ProcessingOutcome::Completed { artifact, metadata } = outcome else {
            panic!("expected completion");
        };
        let ProcessingArtifact::Raster(raster) = artifact else {
            panic!("expected raster");
        };
        assert_eq!(raster.data.dim(), (1, 40, 40));
        assert_eq!(raster.data[[0, 3, 5]], 16.0);
        assert_eq!(raster.extent, Extent::new(0.0, 0.0, 40.0, 40.0).unwrap());
        assert_eq!(metadata.processed_tiles, metadata.total_tiles);
        assert_eq!(metadata.model, "regression");
    }

    #[test]
    fn test_super_resolution_output_scaled() {
        let processor = MapProcessor::new(
            params(ModelKind::SuperResolution {
                scale_factor: 2,
                output_scaling: 1.0,
            }),
            sampler(32),
        )
        .unwrap();
        let mut model = |input: &Array3<f32>, _tile: &TileParams| -> Result<TileOutput> {
            let (c, h, w) = input.dim();
            Ok(TileOutput::Raster(Array3::from_shape_fn(
                (c, h * 2, w * 2),
                |(ch, r, col)| input[[ch, r / 2, col / 2]],
            )))
        };
        let outcome = processor.run(&mut model, &ProgressTracker::no_op()).unwrap();
        let result: ProcessingResult = outcome.into();
        let artifact = result.artifact().unwrap();
        assert_eq!(artifact.dimensions(), Some((64, 64)));
        let ProcessingArtifact::Raster(raster) = artifact else {
            panic!("expected raster");
        };
        assert_eq!(raster.units_per_pixel, 0.5);
        assert_eq!(raster.data[[0, 7, 3]], 4.0);
    }

    #[test]
    fn test_detection_model() {
        let processor = MapProcessor::new(
            params(ModelKind::Detection {
                confidence: 0.5,
                iou_threshold: 0.4,
                remove_overlapping: true,
            }),
            sampler(32),
        )
        .unwrap();
        // Every tile reports an object at the same map position
        let mut model = |_input: &Array3<f32>, tile: &TileParams| -> Result<TileOutput> {
            let (ox, oy) = (tile.pixel_offset.x, tile.pixel_offset.y);
            if ox > 10 || oy > 10 {
                return Ok(TileOutput::Detections(Vec::new()));
            }
            Ok(TileOutput::Detections(vec![Detection {
                bbox: PixelBoundingBox {
                    x_min: 10 - ox,
                    x_max: 13 - ox,
                    y_min: 10 - oy,
                    y_max: 13 - oy,
                },
                class_id: 3,
                confidence: 0.9,
            }]))
        };
        let outcome = processor.run(&mut model, &ProgressTracker::no_op()).unwrap();
        let result: ProcessingResult = outcome.into();
        let Some(ProcessingArtifact::Detections(found)) = result.artifact() else {
            panic!("expected detections");
        };
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].class_id, 3);
        assert_eq!(found[0].extent, Extent::new(10.0, 18.0, 14.0, 22.0).unwrap());
    }

    #[test]
    fn test_output_kind_mismatch_fails() {
        let processor = MapProcessor::new(params(ModelKind::default()), sampler(32)).unwrap();
        let mut model = |_input: &Array3<f32>, _tile: &TileParams| -> Result<TileOutput> {
            Ok(TileOutput::Detections(Vec::new()))
        };
        let err = processor
            .run(&mut model, &ProgressTracker::no_op())
            .unwrap_err();
        assert!(matches!(err, TilingError::Inference { .. }));
        assert!(err.to_string().contains("tile 0"));
    }

    #[test]
    fn test_invalid_channel_mapping_rejected() {
        let p = ProcessingParameters::builder()
            .tile_size_px(16)
            .input_channels_mapping(ChannelMapping::new(vec![0, 1, 2]))
            .build()
            .unwrap();
        assert!(matches!(
            MapProcessor::new(p, sampler(32)),
            Err(TilingError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_viewport_required_for_visible_part() {
        let mut p = params(ModelKind::default());
        p.processed_area_type = ProcessedAreaType::VisiblePart;
        let processor = MapProcessor::new(p.clone(), sampler(64)).unwrap();
        assert!(matches!(
            processor.plan(),
            Err(TilingError::InvalidParameter(_))
        ));

        let processor = MapProcessor::new(p, sampler(64))
            .unwrap()
            .with_viewport(Extent::new(20.0, 20.0, 30.0, 30.0).unwrap());
        let plan = processor.plan().unwrap();
        assert!(plan.mask.is_absent());
        assert_eq!(plan.extents.base_size_px(), (10, 10));
    }

    #[test]
    fn test_task_panic_becomes_failure() {
        let processor = MapProcessor::new(params(ModelKind::default()), sampler(32)).unwrap();
        let task = ProcessingTask::new(processor);
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        task.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut model = |_input: &Array3<f32>, _tile: &TileParams| -> Result<TileOutput> {
            panic!("model crashed")
        };
        let result = task.run(&mut model).unwrap();
        assert!(result.is_failed());
        assert!(result.error_message().unwrap().contains("model crashed"));
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // Single use
        assert!(matches!(task.run(&mut identity), Err(TilingError::Task(_))));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }
}
