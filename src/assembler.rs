//! Tile compositing and result assembly
//!
//! Tile outputs are first composited into a buffer covering the extended
//! extent. [`ResultAssembler`] then blanks pixels outside the area mask and
//! crops the buffer to the base extent.

use crate::config::CompositionPolicy;
use crate::error::{Result, TilingError};
use crate::extent::ProcessingExtents;
use crate::mask::AreaMask;
use crate::types::{
    Detection, Extent, GeoArray, GridDimensions, MapDetection, PixelBoundingBox, TileParams,
};
use ndarray::{s, Array2, Array3, ArrayView3, Axis, Zip};
use tracing::debug;

/// Accumulates raster tile outputs into the extended-extent buffer
#[derive(Debug)]
pub struct TileCompositor {
    policy: CompositionPolicy,
    grid: GridDimensions,
    scale: usize,
    buffer: Option<Array3<f32>>,
    counts: Option<Array2<u32>>,
}

impl TileCompositor {
    /// Create a compositor for a grid; `scale` is the output to input pixel ratio
    #[must_use]
    pub fn new(policy: CompositionPolicy, grid: GridDimensions, scale: usize) -> Self {
        Self {
            policy,
            grid,
            scale: scale.max(1),
            buffer: None,
            counts: None,
        }
    }

    #[must_use]
    pub fn policy(&self) -> CompositionPolicy {
        self.policy
    }

    /// Output buffer size in pixels (width, height)
    #[must_use]
    pub fn output_size(&self) -> (usize, usize) {
        (
            self.grid.img_size_x_px * self.scale,
            self.grid.img_size_y_px * self.scale,
        )
    }

    fn ensure_buffer(&mut self, channels: usize) -> Result<()> {
        let (width, height) = self.output_size();
        match &self.buffer {
            Some(buffer) if buffer.dim().0 != channels => Err(TilingError::internal(format!(
                "Tile output has {} channels, earlier tiles had {}",
                channels,
                buffer.dim().0
            ))),
            Some(_) => Ok(()),
            None => {
                let fill = match self.policy {
                    CompositionPolicy::Maximum => f32::NEG_INFINITY,
                    _ => 0.0,
                };
                self.buffer = Some(Array3::from_elem((channels, height, width), fill));
                if self.policy == CompositionPolicy::Average {
                    self.counts = Some(Array2::zeros((height, width)));
                }
                Ok(())
            },
        }
    }

    /// Composite one tile output, shaped `(channels, tile * scale, tile * scale)`
    pub fn add_tile(&mut self, tile: &TileParams, output: ArrayView3<'_, f32>) -> Result<()> {
        let side = tile.tile_size_px * self.scale;
        let (channels, rows, cols) = output.dim();
        if rows != side || cols != side || channels == 0 {
            return Err(TilingError::inference_for_tile(
                tile,
                format!(
                    "model output is {}x{}x{}, expected Cx{}x{}",
                    channels, rows, cols, side, side
                ),
            ));
        }
        self.ensure_buffer(channels)?;

        // Source window inside the tile output
        let (x0, x1, y0, y1) = match self.policy {
            CompositionPolicy::CenterCrop => {
                // Leading and trailing trims sum to the overlap so cores of
                // neighbouring tiles never share a pixel
                let overlap = tile.tile_size_px - tile.stride_px;
                let lead = overlap / 2 * self.scale;
                let trail = (overlap - overlap / 2) * self.scale;
                (
                    if tile.is_first_column() { 0 } else { lead },
                    if tile.is_last_column() { side } else { side - trail },
                    if tile.is_first_row() { 0 } else { lead },
                    if tile.is_last_row() { side } else { side - trail },
                )
            },
            _ => (0, side, 0, side),
        };
        let ox = tile.pixel_offset.x * self.scale;
        let oy = tile.pixel_offset.y * self.scale;

        let src = output.slice(s![.., y0..y1, x0..x1]);
        let buffer = self
            .buffer
            .as_mut()
            .ok_or_else(|| TilingError::internal("compositor buffer missing"))?;
        let mut dst = buffer.slice_mut(s![.., oy + y0..oy + y1, ox + x0..ox + x1]);

        match self.policy {
            CompositionPolicy::CenterCrop | CompositionPolicy::LastWrite => dst.assign(&src),
            CompositionPolicy::Maximum => {
                Zip::from(&mut dst).and(&src).for_each(|d, &v| *d = d.max(v));
            },
            CompositionPolicy::Average => {
                Zip::from(&mut dst).and(&src).for_each(|d, &v| *d += v);
                if let Some(counts) = self.counts.as_mut() {
                    counts
                        .slice_mut(s![oy + y0..oy + y1, ox + x0..ox + x1])
                        .mapv_inplace(|c| c + 1);
                }
            },
        }
        Ok(())
    }

    /// Finish compositing; pixels no tile wrote stay 0
    ///
    /// Returns `None` when no tile was added.
    #[must_use]
    pub fn finish(self) -> Option<Array3<f32>> {
        let mut buffer = self.buffer?;
        match self.policy {
            CompositionPolicy::Maximum => {
                buffer.mapv_inplace(|v| if v == f32::NEG_INFINITY { 0.0 } else { v });
            },
            CompositionPolicy::Average => {
                if let Some(counts) = &self.counts {
                    for mut channel in buffer.axis_iter_mut(Axis(0)) {
                        Zip::from(&mut channel).and(counts).for_each(|v, &c| {
                            if c > 0 {
                                *v /= c as f32;
                            }
                        });
                    }
                }
            },
            CompositionPolicy::CenterCrop | CompositionPolicy::LastWrite => {},
        }
        Some(buffer)
    }
}

/// Masks and crops extended-extent buffers down to the base extent
#[derive(Debug, Clone, Copy)]
pub struct ResultAssembler<'a> {
    extents: &'a ProcessingExtents,
    mask: &'a AreaMask,
    scale: usize,
}

impl<'a> ResultAssembler<'a> {
    #[must_use]
    pub fn new(extents: &'a ProcessingExtents, mask: &'a AreaMask, scale: usize) -> Self {
        Self {
            extents,
            mask,
            scale: scale.max(1),
        }
    }

    fn expected_size(&self) -> (usize, usize) {
        (
            self.extents.grid.img_size_y_px * self.scale,
            self.extents.grid.img_size_x_px * self.scale,
        )
    }

    fn check_shape(&self, rows: usize, cols: usize) -> Result<()> {
        if (rows, cols) != self.expected_size() {
            return Err(TilingError::internal(format!(
                "Buffer is {}x{} px, expected {}x{} for the extended extent",
                cols,
                rows,
                self.expected_size().1,
                self.expected_size().0
            )));
        }
        Ok(())
    }

    /// Set every pixel outside the area mask to `nodata`
    pub fn apply_mask<A: Clone>(&self, data: ArrayView3<'_, A>, nodata: A) -> Result<Array3<A>> {
        let (_, rows, cols) = data.dim();
        self.check_shape(rows, cols)?;
        let mut out = data.to_owned();
        if self.mask.is_absent() {
            return Ok(out);
        }
        let scale = self.scale;
        for mut channel in out.axis_iter_mut(Axis(0)) {
            for ((row, col), value) in channel.indexed_iter_mut() {
                if !self.mask.value_at(row / scale, col / scale) {
                    *value = nodata.clone();
                }
            }
        }
        Ok(out)
    }

    /// Crop to the inclusive base-extent box
    pub fn crop<A: Clone>(&self, data: ArrayView3<'_, A>) -> Result<Array3<A>> {
        let (_, rows, cols) = data.dim();
        self.check_shape(rows, cols)?;
        let b = self.extents.base_extent_bbox_in_full_image.scaled(self.scale);
        Ok(data
            .slice(s![.., b.y_min..=b.y_max, b.x_min..=b.x_max])
            .to_owned())
    }

    /// Mask, then crop
    pub fn assemble<A: Clone>(&self, data: ArrayView3<'_, A>, nodata: A) -> Result<Array3<A>> {
        let masked = self.apply_mask(data, nodata)?;
        let cropped = self.crop(masked.view())?;
        debug!(
            channels = cropped.dim().0,
            rows = cropped.dim().1,
            cols = cropped.dim().2,
            "Assembled result"
        );
        Ok(cropped)
    }

    /// Attach the base extent and output resolution
    #[must_use]
    pub fn georeference<T>(&self, data: T) -> GeoArray<T> {
        GeoArray {
            data,
            extent: self.extents.base_extent,
            units_per_pixel: self.extents.units_per_pixel / self.scale as f64,
        }
    }
}

/// Reduce class probabilities to a class map
///
/// Pixels whose best probability is below `probability_threshold` become
/// class 0. Ties resolve to the lower class.
pub fn segmentation_class_map(
    probabilities: ArrayView3<'_, f32>,
    probability_threshold: f32,
) -> Result<Array2<u8>> {
    let (channels, rows, cols) = probabilities.dim();
    if channels == 0 || channels > usize::from(u8::MAX) + 1 {
        return Err(TilingError::invalid_parameter(format!(
            "Segmentation output must have 1..=256 channels, got {}",
            channels
        )));
    }
    let mut classes = Array2::<u8>::zeros((rows, cols));
    for ((row, col), class) in classes.indexed_iter_mut() {
        let mut best = 0usize;
        let mut best_p = probabilities[[0, row, col]];
        for c in 1..channels {
            let p = probabilities[[c, row, col]];
            if p > best_p {
                best = c;
                best_p = p;
            }
        }
        if best_p < probability_threshold {
            best = 0;
        }
        *class = best as u8;
    }
    Ok(classes)
}

/// Multiply raster values by a scaling factor in place
pub fn scale_output(data: &mut Array3<f32>, output_scaling: f32) {
    if (output_scaling - 1.0).abs() > f32::EPSILON {
        data.mapv_inplace(|v| v * output_scaling);
    }
}

/// Greedy non-maximum suppression within each class, highest confidence first
fn non_max_suppression(
    mut boxes: Vec<(PixelBoundingBox, usize, f32)>,
    iou_threshold: f32,
) -> Vec<(PixelBoundingBox, usize, f32)> {
    boxes.sort_by(|a, b| b.2.total_cmp(&a.2));
    let mut kept: Vec<(PixelBoundingBox, usize, f32)> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let suppressed = kept
            .iter()
            .any(|k| k.1 == candidate.1 && k.0.iou(&candidate.0) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Collects per-tile detections in extended-image pixels
#[derive(Debug)]
pub struct DetectionAssembler {
    confidence: f32,
    iou_threshold: f32,
    remove_overlapping: bool,
    grid: GridDimensions,
    boxes: Vec<(PixelBoundingBox, usize, f32)>,
}

impl DetectionAssembler {
    #[must_use]
    pub fn new(
        confidence: f32,
        iou_threshold: f32,
        remove_overlapping: bool,
        grid: GridDimensions,
    ) -> Self {
        Self {
            confidence,
            iou_threshold,
            remove_overlapping,
            grid,
            boxes: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Filter by confidence, suppress in-tile overlaps and shift to full-image pixels
    pub fn add_tile(&mut self, tile: &TileParams, detections: &[Detection]) -> Result<()> {
        let last = tile.tile_size_px - 1;
        let mut local = Vec::with_capacity(detections.len());
        for det in detections {
            let b = det.bbox;
            if b.x_min > b.x_max || b.y_min > b.y_max || b.x_min > last || b.y_min > last {
                return Err(TilingError::inference_for_tile(
                    tile,
                    format!("detection box {:?} outside the {} px tile", b, tile.tile_size_px),
                ));
            }
            if det.confidence < self.confidence {
                continue;
            }
            local.push((b, det.class_id, det.confidence));
        }

        let max_x = self.grid.img_size_x_px - 1;
        let max_y = self.grid.img_size_y_px - 1;
        for (b, class_id, confidence) in non_max_suppression(local, self.iou_threshold) {
            let shifted = PixelBoundingBox {
                x_min: b.x_min + tile.pixel_offset.x,
                x_max: (b.x_max.min(last) + tile.pixel_offset.x).min(max_x),
                y_min: b.y_min + tile.pixel_offset.y,
                y_max: (b.y_max.min(last) + tile.pixel_offset.y).min(max_y),
            };
            self.boxes.push((shifted, class_id, confidence));
        }
        Ok(())
    }

    /// Cross-tile suppression, mask and base filtering, and map conversion
    ///
    /// A detection is kept when its centre pixel lies inside the area mask
    /// and the base extent. Boxes are clipped to the base extent.
    #[must_use]
    pub fn finish(self, extents: &ProcessingExtents, mask: &AreaMask) -> Vec<MapDetection> {
        let boxes = if self.remove_overlapping {
            non_max_suppression(self.boxes, self.iou_threshold)
        } else {
            let mut boxes = self.boxes;
            boxes.sort_by(|a, b| b.2.total_cmp(&a.2));
            boxes
        };

        let base = extents.base_extent_bbox_in_full_image;
        let r = extents.units_per_pixel;
        let origin = extents.extended_extent;

        boxes
            .into_iter()
            .filter(|(b, _, _)| {
                let cx = (b.x_min + b.x_max) / 2;
                let cy = (b.y_min + b.y_max) / 2;
                base.contains(cx, cy) && mask.value_at(cy, cx)
            })
            .map(|(b, class_id, confidence)| {
                let clipped = PixelBoundingBox {
                    x_min: b.x_min.max(base.x_min),
                    x_max: b.x_max.min(base.x_max),
                    y_min: b.y_min.max(base.y_min),
                    y_max: b.y_max.min(base.y_max),
                };
                MapDetection {
                    bbox_px: PixelBoundingBox {
                        x_min: clipped.x_min - base.x_min,
                        x_max: clipped.x_max - base.x_min,
                        y_min: clipped.y_min - base.y_min,
                        y_max: clipped.y_max - base.y_min,
                    },
                    extent: Extent {
                        x_min: origin.x_min + clipped.x_min as f64 * r,
                        y_min: origin.y_max - (clipped.y_max + 1) as f64 * r,
                        x_max: origin.x_min + (clipped.x_max + 1) as f64 * r,
                        y_max: origin.y_max - clipped.y_min as f64 * r,
                    },
                    class_id,
                    confidence,
                }
            })
            .collect()
    }
}
