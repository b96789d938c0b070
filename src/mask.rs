//! Area mask construction and tile intersection queries

use crate::config::ProcessedAreaType;
use crate::error::{Result, TilingError};
use crate::extent::ProcessingExtents;
use crate::types::{Extent, PixelBoundingBox};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, instrument};

/// Closed ring of `[x, y]` vertices in layer coordinates
pub type Ring = Vec<[f64; 2]>;

/// Polygon with an exterior ring and optional holes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub exterior: Ring,
    #[serde(default)]
    pub holes: Vec<Ring>,
}

impl Polygon {
    #[must_use]
    pub fn new(exterior: Ring) -> Self {
        Self {
            exterior,
            holes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_hole(mut self, hole: Ring) -> Self {
        self.holes.push(hole);
        self
    }

    /// Axis-aligned rectangle as a polygon
    #[must_use]
    pub fn rectangle(extent: &Extent) -> Self {
        Self::new(vec![
            [extent.x_min, extent.y_min],
            [extent.x_max, extent.y_min],
            [extent.x_max, extent.y_max],
            [extent.x_min, extent.y_max],
        ])
    }

    fn rings(&self) -> impl Iterator<Item = &Ring> {
        std::iter::once(&self.exterior).chain(self.holes.iter())
    }
}

/// Polygon mask supplied by the mask layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaskGeometry {
    pub polygons: Vec<Polygon>,
}

impl MaskGeometry {
    #[must_use]
    pub fn new(polygons: Vec<Polygon>) -> Self {
        Self { polygons }
    }

    /// Reject empty geometries, short rings and non-finite coordinates
    pub fn validate(&self) -> Result<()> {
        if self.polygons.is_empty() {
            return Err(TilingError::invalid_area("Mask geometry has no polygons"));
        }
        for (i, polygon) in self.polygons.iter().enumerate() {
            if polygon.exterior.len() < 3 {
                return Err(TilingError::invalid_area(format!(
                    "Polygon {} exterior has {} vertices, need at least 3",
                    i,
                    polygon.exterior.len()
                )));
            }
            let finite = polygon
                .rings()
                .flatten()
                .all(|[x, y]| x.is_finite() && y.is_finite());
            if !finite {
                return Err(TilingError::invalid_area(format!(
                    "Polygon {} has non-finite coordinates",
                    i
                )));
            }
        }
        Ok(())
    }

    /// Bounding box of all exterior rings
    pub fn bounding_extent(&self) -> Result<Extent> {
        self.validate()?;
        Extent::from_points(
            self.polygons
                .iter()
                .flat_map(|p| p.exterior.iter().map(|[x, y]| (*x, *y))),
        )
    }

    /// Parse a geometry from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let geometry: Self = serde_json::from_str(json)?;
        geometry.validate()?;
        Ok(geometry)
    }

    /// Load a geometry from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }
}

/// Vector-to-raster primitive producing a boolean grid over an extent
pub trait MaskRasterizer: Send + Sync {
    /// Rasterize `geometry` onto a `(rows, cols)` grid whose top-left pixel
    /// starts at `(extent.x_min, extent.y_max)`
    fn rasterize(
        &self,
        geometry: &MaskGeometry,
        extent: &Extent,
        units_per_pixel: f64,
        shape: (usize, usize),
    ) -> Result<Array2<bool>>;
}

/// Even-odd scanline fill evaluated at pixel centres
///
/// Rings of one polygon are combined with the even-odd rule so holes cut
/// through; separate polygons are unioned.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanlineRasterizer;

impl ScanlineRasterizer {
    /// X positions where the ring's edges cross the horizontal line `y`
    fn crossings(ring: &Ring, y: f64, out: &mut Vec<f64>) {
        let n = ring.len();
        if n < 2 {
            return;
        }
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = ring[i];
            let [xj, yj] = ring[j];
            if (yi > y) != (yj > y) {
                out.push(xi + (y - yi) * (xj - xi) / (yj - yi));
            }
            j = i;
        }
    }
}

impl MaskRasterizer for ScanlineRasterizer {
    fn rasterize(
        &self,
        geometry: &MaskGeometry,
        extent: &Extent,
        units_per_pixel: f64,
        shape: (usize, usize),
    ) -> Result<Array2<bool>> {
        if !units_per_pixel.is_finite() || units_per_pixel <= 0.0 {
            return Err(TilingError::config_value_error(
                "resolution",
                units_per_pixel,
                "> 0 units per pixel",
            ));
        }
        let (rows, cols) = shape;
        let mut grid = Array2::from_elem((rows, cols), false);
        let mut xs = Vec::new();

        for polygon in &geometry.polygons {
            for row in 0..rows {
                let y = extent.y_max - (row as f64 + 0.5) * units_per_pixel;
                xs.clear();
                for ring in polygon.rings() {
                    Self::crossings(ring, y, &mut xs);
                }
                if xs.len() < 2 {
                    continue;
                }
                xs.sort_by(f64::total_cmp);

                for pair in xs.chunks_exact(2) {
                    // Centres in [left, right) are inside
                    let to_col = |x: f64| -> usize {
                        let col = ((x - extent.x_min) / units_per_pixel - 0.5).ceil();
                        col.clamp(0.0, cols as f64) as usize
                    };
                    let (start, end) = (to_col(pair[0]), to_col(pair[1]));
                    for col in start..end {
                        grid[[row, col]] = true;
                    }
                }
            }
        }
        Ok(grid)
    }
}

/// Boolean occupancy grid with a summed-area table for O(1) box queries
#[derive(Debug, Clone)]
pub struct MaskGrid {
    values: Array2<bool>,
    /// `(rows + 1, cols + 1)` prefix sums, first row and column are zero
    integral: Array2<u64>,
}

impl MaskGrid {
    #[must_use]
    pub fn new(values: Array2<bool>) -> Self {
        let (rows, cols) = values.dim();
        let mut integral = Array2::<u64>::zeros((rows + 1, cols + 1));
        for r in 0..rows {
            let mut row_sum = 0u64;
            for c in 0..cols {
                row_sum += u64::from(values[[r, c]]);
                integral[[r + 1, c + 1]] = integral[[r, c + 1]] + row_sum;
            }
        }
        Self { values, integral }
    }

    #[must_use]
    pub fn values(&self) -> &Array2<bool> {
        &self.values
    }

    /// Number of true pixels inside an inclusive box, clipped to the grid
    #[must_use]
    pub fn count_in(&self, bbox: &PixelBoundingBox) -> u64 {
        let (rows, cols) = self.values.dim();
        if bbox.x_min >= cols || bbox.y_min >= rows {
            return 0;
        }
        let x1 = (bbox.x_max + 1).min(cols);
        let y1 = (bbox.y_max + 1).min(rows);
        let (x0, y0) = (bbox.x_min, bbox.y_min);
        self.integral[[y1, x1]] + self.integral[[y0, x0]]
            - self.integral[[y0, x1]]
            - self.integral[[y1, x0]]
    }

    #[must_use]
    pub fn true_count(&self) -> u64 {
        let (rows, cols) = self.values.dim();
        self.integral[[rows, cols]]
    }
}

/// Which pixels of the extended extent should be processed
#[derive(Debug, Clone)]
pub enum AreaMask {
    /// No restriction, nothing allocated
    Absent,
    Grid(MaskGrid),
}

impl AreaMask {
    #[must_use]
    pub fn from_grid(values: Array2<bool>) -> Self {
        Self::Grid(MaskGrid::new(values))
    }

    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// True iff any mask pixel inside the box is set
    #[must_use]
    pub fn tile_intersects_mask(&self, bbox: &PixelBoundingBox) -> bool {
        match self {
            Self::Absent => true,
            Self::Grid(grid) => grid.count_in(bbox) > 0,
        }
    }

    /// Mask value at an extended-image pixel; out of range reads as false
    #[must_use]
    pub fn value_at(&self, row: usize, col: usize) -> bool {
        match self {
            Self::Absent => true,
            Self::Grid(grid) => grid.values.get([row, col]).copied().unwrap_or(false),
        }
    }

    #[must_use]
    pub fn grid(&self) -> Option<&Array2<bool>> {
        match self {
            Self::Absent => None,
            Self::Grid(grid) => Some(&grid.values),
        }
    }
}

/// Builds the area mask for a run
pub struct AreaMaskEngine<'a> {
    rasterizer: &'a dyn MaskRasterizer,
}

impl<'a> AreaMaskEngine<'a> {
    #[must_use]
    pub fn new(rasterizer: &'a dyn MaskRasterizer) -> Self {
        Self { rasterizer }
    }

    /// Build the mask over the extended extent
    ///
    /// Entire-layer and viewport modes return [`AreaMask::Absent`]. Polygon
    /// mode requires a geometry covering at least one pixel.
    #[instrument(skip(self, geometry, extents))]
    pub fn build(
        &self,
        area_type: ProcessedAreaType,
        geometry: Option<&MaskGeometry>,
        extents: &ProcessingExtents,
    ) -> Result<AreaMask> {
        match area_type {
            ProcessedAreaType::EntireLayer | ProcessedAreaType::VisiblePart => Ok(AreaMask::Absent),
            ProcessedAreaType::FromPolygons => {
                let geometry = geometry.ok_or_else(|| {
                    TilingError::invalid_parameter("Polygon area type requires a mask geometry")
                })?;
                geometry.validate()?;
                let shape = (extents.grid.img_size_y_px, extents.grid.img_size_x_px);
                let values = self.rasterizer.rasterize(
                    geometry,
                    &extents.extended_extent,
                    extents.units_per_pixel,
                    shape,
                )?;
                if values.dim() != shape {
                    return Err(TilingError::internal(format!(
                        "Rasterizer returned {:?}, expected {:?}",
                        values.dim(),
                        shape
                    )));
                }
                let grid = MaskGrid::new(values);
                if grid.true_count() == 0 {
                    return Err(TilingError::invalid_area(
                        "Mask geometry does not cover any pixel of the processed area",
                    ));
                }
                debug!(
                    true_pixels = grid.true_count(),
                    rows = shape.0,
                    cols = shape.1,
                    "Rasterized area mask"
                );
                Ok(AreaMask::Grid(grid))
            },
        }
    }
}
