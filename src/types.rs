//! Core geometry and result types for tiled processing

use crate::error::{Result, TilingError};
use chrono::{DateTime, Utc};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Axis-aligned rectangle in the raster layer's native coordinate units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl Extent {
    /// Create an extent, rejecting empty or inverted rectangles
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Result<Self> {
        let extent = Self {
            x_min,
            y_min,
            x_max,
            y_max,
        };
        extent.validate()?;
        Ok(extent)
    }

    /// Check the `x_max > x_min`, `y_max > y_min` invariant
    pub fn validate(&self) -> Result<()> {
        let finite = [self.x_min, self.y_min, self.x_max, self.y_max]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.x_max <= self.x_min || self.y_max <= self.y_min {
            return Err(TilingError::invalid_area(format!(
                "Degenerate extent {}",
                self
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    /// Intersection with another extent, `None` when the overlap has no area
    #[must_use]
    pub fn intersect(&self, other: &Extent) -> Option<Extent> {
        let x_min = self.x_min.max(other.x_min);
        let y_min = self.y_min.max(other.y_min);
        let x_max = self.x_max.min(other.x_max);
        let y_max = self.y_max.min(other.y_max);
        if x_max > x_min && y_max > y_min {
            Some(Extent {
                x_min,
                y_min,
                x_max,
                y_max,
            })
        } else {
            None
        }
    }

    #[must_use]
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }

    /// Bounding box of a set of points
    pub fn from_points<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Result<Self> {
        let mut x_min = f64::INFINITY;
        let mut y_min = f64::INFINITY;
        let mut x_max = f64::NEG_INFINITY;
        let mut y_max = f64::NEG_INFINITY;
        for (x, y) in points {
            x_min = x_min.min(x);
            y_min = y_min.min(y);
            x_max = x_max.max(x);
            y_max = y_max.max(y);
        }
        Self::new(x_min, y_min, x_max, y_max)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}] - [{}, {}]",
            self.x_min, self.y_min, self.x_max, self.y_max
        )
    }
}

/// Pixel position inside the extended-extent image (column, row)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelOffset {
    pub x: usize,
    pub y: usize,
}

/// Inclusive integer box in extended-extent pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBoundingBox {
    pub x_min: usize,
    pub x_max: usize,
    pub y_min: usize,
    pub y_max: usize,
}

impl PixelBoundingBox {
    #[must_use]
    pub fn width(&self) -> usize {
        self.x_max - self.x_min + 1
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.y_max - self.y_min + 1
    }

    #[must_use]
    pub fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }

    /// Same box on a grid upscaled by `scale` (super-resolution outputs)
    #[must_use]
    pub fn scaled(&self, scale: usize) -> Self {
        Self {
            x_min: self.x_min * scale,
            x_max: (self.x_max + 1) * scale - 1,
            y_min: self.y_min * scale,
            y_max: (self.y_max + 1) * scale - 1,
        }
    }

    /// Intersection-over-union of two boxes
    #[must_use]
    pub fn iou(&self, other: &PixelBoundingBox) -> f32 {
        let x_min = self.x_min.max(other.x_min);
        let y_min = self.y_min.max(other.y_min);
        let x_max = self.x_max.min(other.x_max);
        let y_max = self.y_max.min(other.y_max);
        if x_max < x_min || y_max < y_min {
            return 0.0;
        }
        let inter = ((x_max - x_min + 1) * (y_max - y_min + 1)) as f32;
        let union = (self.width() * self.height() + other.width() * other.height()) as f32 - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Pixel size of the extended extent and its partition into tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridDimensions {
    pub img_size_x_px: usize,
    pub img_size_y_px: usize,
    pub x_bins_number: usize,
    pub y_bins_number: usize,
}

impl GridDimensions {
    /// Derive bin counts, requiring an exact fit of tiles at the given stride
    pub fn from_image_size(
        img_size_x_px: usize,
        img_size_y_px: usize,
        tile_size_px: usize,
        stride_px: usize,
    ) -> Result<Self> {
        if stride_px == 0 {
            return Err(TilingError::invalid_parameter("stride must be at least 1 pixel"));
        }
        if img_size_x_px < tile_size_px || img_size_y_px < tile_size_px {
            return Err(TilingError::insufficient_area(format!(
                "image of {}x{} px is smaller than one {} px tile",
                img_size_x_px, img_size_y_px, tile_size_px
            )));
        }
        let rest_x = (img_size_x_px - tile_size_px) % stride_px;
        let rest_y = (img_size_y_px - tile_size_px) % stride_px;
        if rest_x != 0 || rest_y != 0 {
            return Err(TilingError::internal(format!(
                "image of {}x{} px is not tiled exactly by {} px tiles at stride {}",
                img_size_x_px, img_size_y_px, tile_size_px, stride_px
            )));
        }
        Ok(Self {
            img_size_x_px,
            img_size_y_px,
            x_bins_number: (img_size_x_px - tile_size_px) / stride_px + 1,
            y_bins_number: (img_size_y_px - tile_size_px) / stride_px + 1,
        })
    }

    #[must_use]
    pub fn total_tiles(&self) -> usize {
        self.x_bins_number * self.y_bins_number
    }
}

/// Identity of one tile within the grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileParams {
    pub tile_no: usize,
    pub x_bin: usize,
    pub y_bin: usize,
    pub x_bins_number: usize,
    pub y_bins_number: usize,
    pub tile_size_px: usize,
    pub stride_px: usize,
    /// Tile extent in layer coordinates
    pub extent: Extent,
    /// Top-left pixel of the tile in the extended-extent image
    pub pixel_offset: PixelOffset,
}

impl TileParams {
    /// Pixel box covered by the whole tile in the extended-extent image
    #[must_use]
    pub fn pixel_box(&self) -> PixelBoundingBox {
        PixelBoundingBox {
            x_min: self.pixel_offset.x,
            x_max: self.pixel_offset.x + self.tile_size_px - 1,
            y_min: self.pixel_offset.y,
            y_max: self.pixel_offset.y + self.tile_size_px - 1,
        }
    }

    #[must_use]
    pub fn is_first_column(&self) -> bool {
        self.x_bin == 0
    }

    #[must_use]
    pub fn is_last_column(&self) -> bool {
        self.x_bin + 1 == self.x_bins_number
    }

    #[must_use]
    pub fn is_first_row(&self) -> bool {
        self.y_bin == 0
    }

    #[must_use]
    pub fn is_last_row(&self) -> bool {
        self.y_bin + 1 == self.y_bins_number
    }

    /// Short human readable identity used in logs and error messages
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{} (x_bin={}, y_bin={} of {}x{})",
            self.tile_no, self.x_bin, self.y_bin, self.x_bins_number, self.y_bins_number
        )
    }
}

/// Object detected inside a single tile, in tile-local pixels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: PixelBoundingBox,
    pub class_id: usize,
    pub confidence: f32,
}

/// Result of the inference callback for one tile
#[derive(Debug, Clone)]
pub enum TileOutput {
    /// Channel-first raster `(channels, rows, cols)` aligned with the tile
    Raster(Array3<f32>),
    /// Detected objects in tile pixel coordinates
    Detections(Vec<Detection>),
}

/// Detection mapped onto the base extent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapDetection {
    /// Box in base-extent image pixels
    pub bbox_px: PixelBoundingBox,
    /// Box in layer coordinates
    pub extent: Extent,
    pub class_id: usize,
    pub confidence: f32,
}

/// Georeferenced array covering the base extent
#[derive(Debug, Clone)]
pub struct GeoArray<A> {
    pub data: A,
    pub extent: Extent,
    /// Layer units per output pixel
    pub units_per_pixel: f64,
}

/// Final deliverable of a successful run
#[derive(Debug, Clone)]
pub enum ProcessingArtifact {
    /// Channel-first float raster (regression, super-resolution)
    Raster(GeoArray<Array3<f32>>),
    /// Per-pixel class ids (segmentation)
    ClassMap(GeoArray<Array2<u8>>),
    /// Detected objects (detection)
    Detections(Vec<MapDetection>),
}

impl ProcessingArtifact {
    /// Output size in pixels (width, height), `None` for detections
    #[must_use]
    pub fn dimensions(&self) -> Option<(usize, usize)> {
        match self {
            Self::Raster(raster) => {
                let (_, rows, cols) = raster.data.dim();
                Some((cols, rows))
            },
            Self::ClassMap(map) => {
                let (rows, cols) = map.data.dim();
                Some((cols, rows))
            },
            Self::Detections(_) => None,
        }
    }
}

/// Per-stage timings for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTimings {
    /// Extent and grid computation
    pub planning_ms: u64,
    /// Area mask rasterization
    pub mask_ms: u64,
    /// Raster sampling across all tiles
    pub sampling_ms: u64,
    /// Inference callback across all tiles
    pub inference_ms: u64,
    /// Compositing, masking and cropping
    pub assembly_ms: u64,
    /// Total end-to-end processing time
    pub total_ms: u64,
}

/// Metadata describing a completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub task_id: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub grid: GridDimensions,
    pub total_tiles: usize,
    pub processed_tiles: usize,
    pub skipped_tiles: usize,
    pub timings: ProcessingTimings,
}

/// Terminal outcome of a processing run
#[derive(Debug, Clone)]
pub enum ProcessingResult {
    Success {
        artifact: ProcessingArtifact,
        metadata: ProcessingMetadata,
    },
    Failed {
        message: String,
        cause: Option<Arc<TilingError>>,
    },
    Cancelled,
}

impl ProcessingResult {
    /// Failure with an underlying error; the message repeats the error verbatim
    #[must_use]
    pub fn from_error(error: TilingError) -> Self {
        Self::Failed {
            message: error.to_string(),
            cause: Some(Arc::new(error)),
        }
    }

    /// Failure without an underlying error
    #[must_use]
    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self::Failed {
            message: message.into(),
            cause: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    #[must_use]
    pub fn artifact(&self) -> Option<&ProcessingArtifact> {
        match self {
            Self::Success { artifact, .. } => Some(artifact),
            _ => None,
        }
    }

    #[must_use]
    pub fn metadata(&self) -> Option<&ProcessingMetadata> {
        match self {
            Self::Success { metadata, .. } => Some(metadata),
            _ => None,
        }
    }

    /// Failure message, if the run failed
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Failed { message, .. } => Some(message),
            _ => None,
        }
    }
}
