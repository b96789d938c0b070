//! Base and extended extent computation
//!
//! All positions are tracked as integer pixel indices on the layer's pixel
//! lattice, anchored at the layer's lower-left corner. Map coordinates are
//! derived from those integers, so the extents, the grid and the base box
//! never disagree by a rounding step.

use crate::config::ProcessingParameters;
use crate::error::{Result, TilingError};
use crate::types::{Extent, GridDimensions, PixelBoundingBox};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tolerance, in pixels, applied before rounding map positions to the lattice
const SNAP_EPSILON_PX: f64 = 1e-6;

/// Everything downstream components need to know about the processed area
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingExtents {
    /// Requested area clipped to the layer, then snapped outward to the pixel lattice
    ///
    /// When the layer size is not a whole number of pixels the lattice ends
    /// with a partial pixel, and a base extent touching that edge reaches up
    /// to one pixel past the layer so that `extent / units_per_pixel` stays
    /// integral and the result georeferences exactly.
    pub base_extent: Extent,
    /// Base extent plus margin, aligned so tiles cover it exactly
    pub extended_extent: Extent,
    pub grid: GridDimensions,
    /// Inclusive box of the base extent inside the extended image, rows from the top
    pub base_extent_bbox_in_full_image: PixelBoundingBox,
    pub units_per_pixel: f64,
    pub tile_size_px: usize,
    pub stride_px: usize,
}

impl ProcessingExtents {
    /// Size of the base extent in pixels (width, height)
    #[must_use]
    pub fn base_size_px(&self) -> (usize, usize) {
        (
            self.base_extent_bbox_in_full_image.width(),
            self.base_extent_bbox_in_full_image.height(),
        )
    }

    /// Map coordinates of the centre of an extended-image pixel
    #[must_use]
    pub fn pixel_center(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.extended_extent.x_min + (col + 0.5) * self.units_per_pixel,
            self.extended_extent.y_max - (row + 0.5) * self.units_per_pixel,
        )
    }
}

/// Half-open pixel span `[start, end)` along one axis of the layer lattice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: i64,
    end: i64,
}

impl Span {
    fn len(self) -> i64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Y,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X => write!(f, "x"),
            Self::Y => write!(f, "y"),
        }
    }
}

/// Computes base and extended extents for one run
#[derive(Debug, Clone)]
pub struct ExtentCalculator {
    layer_extent: Extent,
    units_per_pixel: f64,
    tile_size_px: usize,
    stride_px: usize,
    margin_px: usize,
    pad_undersized_area: bool,
}

impl ExtentCalculator {
    /// Create a calculator for a layer and validated parameters
    pub fn new(params: &ProcessingParameters, layer_extent: Extent) -> Result<Self> {
        params.validate()?;
        layer_extent.validate()?;
        Ok(Self {
            layer_extent,
            units_per_pixel: params.resolution,
            tile_size_px: params.tile_size_px,
            stride_px: params.stride_px()?,
            margin_px: params.margin_px(),
            pad_undersized_area: params.pad_undersized_area,
        })
    }

    #[must_use]
    pub fn layer_extent(&self) -> &Extent {
        &self.layer_extent
    }

    /// Compute the extents for a requested area, `None` meaning the whole layer
    ///
    /// # Errors
    /// - `InvalidArea` when the requested area does not intersect the layer
    /// - `InsufficientArea` when the layer cannot hold one tile along an axis
    ///   and padding is disabled
    pub fn compute(&self, requested_area: Option<&Extent>) -> Result<ProcessingExtents> {
        let area = match requested_area {
            Some(requested) => {
                requested.validate()?;
                self.layer_extent.intersect(requested).ok_or_else(|| {
                    TilingError::invalid_area(format!(
                        "Requested area {} does not intersect layer {}",
                        requested, self.layer_extent
                    ))
                })?
            },
            None => self.layer_extent,
        };

        let layer_cols = self.to_px_ceil(self.layer_extent.width());
        let layer_rows = self.to_px_ceil(self.layer_extent.height());

        let base_x = self.snap(
            area.x_min - self.layer_extent.x_min,
            area.x_max - self.layer_extent.x_min,
            layer_cols,
        );
        let base_y = self.snap(
            area.y_min - self.layer_extent.y_min,
            area.y_max - self.layer_extent.y_min,
            layer_rows,
        );
        if base_x.len() <= 0 || base_y.len() <= 0 {
            return Err(TilingError::invalid_area(format!(
                "Requested area {} is thinner than one pixel at {} units/px",
                area, self.units_per_pixel
            )));
        }

        // Lattice rows count upwards, so "down" is the low end of the y span
        let ext_x = self.extend(base_x, layer_cols, Axis::X)?;
        let ext_y = self.extend(base_y, layer_rows, Axis::Y)?;

        let grid = GridDimensions::from_image_size(
            ext_x.len() as usize,
            ext_y.len() as usize,
            self.tile_size_px,
            self.stride_px,
        )?;

        // Rows grow downwards from the extended extent's top edge
        let base_bbox = PixelBoundingBox {
            x_min: (base_x.start - ext_x.start) as usize,
            x_max: (base_x.end - ext_x.start - 1) as usize,
            y_min: (ext_y.end - base_y.end) as usize,
            y_max: (ext_y.end - base_y.start - 1) as usize,
        };

        let extents = ProcessingExtents {
            base_extent: self.span_extent(base_x, base_y)?,
            extended_extent: self.span_extent(ext_x, ext_y)?,
            grid,
            base_extent_bbox_in_full_image: base_bbox,
            units_per_pixel: self.units_per_pixel,
            tile_size_px: self.tile_size_px,
            stride_px: self.stride_px,
        };

        debug!(
            base = %extents.base_extent,
            extended = %extents.extended_extent,
            img_x = grid.img_size_x_px,
            img_y = grid.img_size_y_px,
            x_bins = grid.x_bins_number,
            y_bins = grid.y_bins_number,
            "Computed processing extents"
        );

        Ok(extents)
    }

    fn to_px_ceil(&self, length: f64) -> i64 {
        (length / self.units_per_pixel - SNAP_EPSILON_PX).ceil() as i64
    }

    /// Snap a map interval outward to whole pixels, clipped to the layer
    fn snap(&self, from: f64, to: f64, layer_len: i64) -> Span {
        let start = (from / self.units_per_pixel + SNAP_EPSILON_PX).floor() as i64;
        let end = (to / self.units_per_pixel - SNAP_EPSILON_PX).ceil() as i64;
        Span {
            start: start.clamp(0, layer_len),
            end: end.clamp(0, layer_len),
        }
    }

    /// Grow a base span by the margin, then until tiles fit exactly
    ///
    /// Alignment growth goes right (x) or down (y) first, then the opposite
    /// way while inside the layer. Whatever is left spills past the right or
    /// bottom layer edge.
    fn extend(&self, base: Span, layer_len: i64, axis: Axis) -> Result<Span> {
        let tile = self.tile_size_px as i64;
        let stride = self.stride_px as i64;
        let margin = self.margin_px as i64;

        let mut span = Span {
            start: (base.start - margin).max(0),
            end: (base.end + margin).min(layer_len),
        };

        let len = span.len();
        let mut missing = if len < tile {
            if layer_len < tile && !self.pad_undersized_area {
                return Err(TilingError::insufficient_area(format!(
                    "Layer is {} px along {} which is smaller than one {} px tile",
                    layer_len, axis, tile
                )));
            }
            tile - len
        } else {
            (stride - (len - tile) % stride) % stride
        };

        let room_high = (layer_len - span.end).max(0);
        let room_low = span.start.max(0);
        match axis {
            Axis::X => {
                let grow = missing.min(room_high);
                span.end += grow;
                missing -= grow;
                let grow = missing.min(room_low);
                span.start -= grow;
                missing -= grow;
                span.end += missing;
            },
            Axis::Y => {
                let grow = missing.min(room_low);
                span.start -= grow;
                missing -= grow;
                let grow = missing.min(room_high);
                span.end += grow;
                missing -= grow;
                span.start -= missing;
            },
        }
        Ok(span)
    }

    fn span_extent(&self, x: Span, y: Span) -> Result<Extent> {
        let r = self.units_per_pixel;
        Extent::new(
            self.layer_extent.x_min + x.start as f64 * r,
            self.layer_extent.y_min + y.start as f64 * r,
            self.layer_extent.x_min + x.end as f64 * r,
            self.layer_extent.y_min + y.end as f64 * r,
        )
    }
}
