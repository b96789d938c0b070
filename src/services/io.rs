//! Raster I/O operations service
//!
//! This module separates file I/O from the tiling logic: images are loaded
//! into an [`InMemoryRaster`] that implements [`RasterSampler`], and results
//! are written back as 8-bit PNG files with an ESRI world file sidecar.

use crate::{
    error::{Result, TilingError},
    inference::{RasterSampler, TileRequest},
    types::{Extent, GeoArray},
};
use image::{GrayImage, ImageBuffer, Luma, Pixel};
use ndarray::{Array2, Array3, ArrayView2};
use std::path::{Path, PathBuf};

/// Band-sequential raster held in memory
#[derive(Debug, Clone)]
pub struct InMemoryRaster {
    /// `(bands, rows, cols)` pixel values
    data: Array3<f32>,
    extent: Extent,
}

impl InMemoryRaster {
    /// Wrap band data covering an extent
    pub fn new(data: Array3<f32>, extent: Extent) -> Result<Self> {
        extent.validate()?;
        let (bands, rows, cols) = data.dim();
        if bands == 0 || rows == 0 || cols == 0 {
            return Err(TilingError::invalid_parameter(format!(
                "Raster must not be empty, got {}x{}x{}",
                bands, rows, cols
            )));
        }
        Ok(Self { data, extent })
    }

    #[must_use]
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Size in pixels (width, height)
    #[must_use]
    pub fn size_px(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (cols, rows)
    }

    /// Layer units per pixel along x and y
    #[must_use]
    pub fn pixel_size(&self) -> (f64, f64) {
        let (cols, rows) = self.size_px();
        (
            self.extent.width() / cols as f64,
            self.extent.height() / rows as f64,
        )
    }
}

impl RasterSampler for InMemoryRaster {
    /// Nearest-neighbour resampling at output pixel centres
    fn sample(&self, request: &TileRequest<'_>) -> Result<Array3<f32>> {
        let bands = self.data.dim().0;
        if let Some(&band) = request.channel_mapping.bands().iter().find(|&&b| b >= bands) {
            return Err(TilingError::invalid_parameter(format!(
                "band {} requested from a {}-band raster",
                band, bands
            )));
        }

        let (cols, rows) = self.size_px();
        let (px_w, px_h) = self.pixel_size();
        let r = request.units_per_pixel;

        // Source index per output column and row, None outside the layer
        let src_cols: Vec<Option<usize>> = (0..request.width_px)
            .map(|c| {
                let x = request.extent.x_min + (c as f64 + 0.5) * r;
                let col = ((x - self.extent.x_min) / px_w).floor();
                (col >= 0.0 && (col as usize) < cols).then_some(col as usize)
            })
            .collect();
        let src_rows: Vec<Option<usize>> = (0..request.height_px)
            .map(|row| {
                let y = request.extent.y_max - (row as f64 + 0.5) * r;
                let src = ((self.extent.y_max - y) / px_h).floor();
                (src >= 0.0 && (src as usize) < rows).then_some(src as usize)
            })
            .collect();

        let channels = request.channel_mapping.channel_count();
        let mut out = Array3::<f32>::zeros((channels, request.height_px, request.width_px));
        for (channel, &band) in request.channel_mapping.bands().iter().enumerate() {
            for (out_row, src_row) in src_rows.iter().enumerate() {
                let Some(src_row) = *src_row else { continue };
                for (out_col, src_col) in src_cols.iter().enumerate() {
                    if let Some(src_col) = *src_col {
                        out[[channel, out_row, out_col]] = self.data[[band, src_row, src_col]];
                    }
                }
            }
        }
        Ok(out)
    }

    fn layer_extent(&self) -> Extent {
        self.extent
    }

    fn band_count(&self) -> usize {
        self.data.dim().0
    }
}

/// Service for loading rasters and saving results
pub struct RasterIo;

impl RasterIo {
    /// Load an image as a raster covering `extent`
    ///
    /// When `extent` is `None` the extent is read from a world file next to the
    /// image (`.pgw`, `.tfw`, `.jgw` or `.wld`); without one the image is placed
    /// at the origin with one unit per pixel.
    ///
    /// # Examples
    /// ```rust,no_run
    /// use geotiler::services::RasterIo;
    ///
    /// let raster = RasterIo::load_raster("ortho.png", None)?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load_raster<P: AsRef<Path>>(path: P, extent: Option<Extent>) -> Result<InMemoryRaster> {
        let path_ref = path.as_ref();
        if !path_ref.exists() {
            return Err(TilingError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("raster file does not exist: {}", path_ref.display()),
            )));
        }

        let image = image::open(path_ref)?;
        let color = image.color();
        let wide = color.bytes_per_pixel() / color.channel_count() > 1;
        let data = match (color.channel_count(), wide) {
            (1 | 2, false) => planar(&image.to_luma8()),
            (1 | 2, true) => planar(&image.to_luma16()),
            (3, false) => planar(&image.to_rgb8()),
            (3, true) => planar(&image.to_rgb16()),
            (_, false) => planar(&image.to_rgba8()),
            (_, true) => planar(&image.to_rgba16()),
        };
        let (_, rows, cols) = data.dim();

        let extent = match extent {
            Some(extent) => extent,
            None => match Self::read_world_file(path_ref, cols, rows)? {
                Some(extent) => extent,
                None => {
                    log::debug!(
                        "No world file for {}, using pixel coordinates",
                        path_ref.display()
                    );
                    Extent::new(0.0, 0.0, cols as f64, rows as f64)?
                },
            },
        };
        log::debug!(
            "Loaded {}x{} raster with {} bands from {}",
            cols,
            rows,
            data.dim().0,
            path_ref.display()
        );
        InMemoryRaster::new(data, extent)
    }

    /// Candidate world file paths for an image
    fn world_file_candidates(image_path: &Path) -> Vec<PathBuf> {
        let ext = image_path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let mut candidates = Vec::new();
        if let (Some(first), Some(last)) = (ext.chars().next(), ext.chars().last()) {
            candidates.push(image_path.with_extension(format!("{}{}w", first, last)));
        }
        candidates.push(image_path.with_extension("wld"));
        candidates
    }

    /// Read the extent of a `cols` x `rows` image from its world file
    pub fn read_world_file(image_path: &Path, cols: usize, rows: usize) -> Result<Option<Extent>> {
        let Some(world) = Self::world_file_candidates(image_path)
            .into_iter()
            .find(|p| p.exists())
        else {
            return Ok(None);
        };
        let content = std::fs::read_to_string(&world)?;
        let values: Vec<f64> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.parse::<f64>().map_err(|e| {
                    TilingError::invalid_parameter(format!(
                        "Malformed world file {}: {}",
                        world.display(),
                        e
                    ))
                })
            })
            .collect::<Result<_>>()?;
        if values.len() != 6 {
            return Err(TilingError::invalid_parameter(format!(
                "World file {} has {} values, expected 6",
                world.display(),
                values.len()
            )));
        }
        let (px_w, rot_y, rot_x, px_h, x_centre, y_centre) =
            (values[0], values[1], values[2], values[3], values[4], values[5]);
        if rot_x != 0.0 || rot_y != 0.0 || px_w <= 0.0 || px_h >= 0.0 {
            return Err(TilingError::invalid_parameter(format!(
                "World file {} describes a rotated or flipped raster",
                world.display()
            )));
        }
        let x_min = x_centre - px_w / 2.0;
        let y_max = y_centre - px_h / 2.0;
        Extent::new(
            x_min,
            y_max + px_h * rows as f64,
            x_min + px_w * cols as f64,
            y_max,
        )
        .map(Some)
    }

    /// Write an ESRI world file next to an image
    pub fn write_world_file<T>(image_path: &Path, geo: &GeoArray<T>) -> Result<PathBuf> {
        let path = Self::world_file_candidates(image_path)
            .into_iter()
            .next()
            .unwrap_or_else(|| image_path.with_extension("wld"));
        let r = geo.units_per_pixel;
        let content = format!(
            "{}\n0\n0\n{}\n{}\n{}\n",
            r,
            -r,
            geo.extent.x_min + r / 2.0,
            geo.extent.y_max - r / 2.0
        );
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Save a class map as an 8-bit grayscale PNG plus world file
    pub fn save_class_map<P: AsRef<Path>>(map: &GeoArray<Array2<u8>>, path: P) -> Result<()> {
        let path_ref = path.as_ref();
        let image = gray_image(map.data.clone())?;
        Self::save_png(&image, path_ref)?;
        Self::write_world_file(path_ref, map)?;
        Ok(())
    }

    /// Save one band of a float raster, stretched linearly from its min..max to 0..255
    pub fn save_raster_band<P: AsRef<Path>>(
        raster: &GeoArray<Array3<f32>>,
        band: usize,
        path: P,
    ) -> Result<()> {
        let path_ref = path.as_ref();
        let bands = raster.data.dim().0;
        if band >= bands {
            return Err(TilingError::invalid_parameter(format!(
                "band {} requested from a {}-band raster",
                band, bands
            )));
        }
        let values = raster.data.index_axis(ndarray::Axis(0), band);
        let image = gray_image(stretch(values))?;
        Self::save_png(&image, path_ref)?;
        Self::write_world_file(path_ref, raster)?;
        Ok(())
    }

    fn save_png(image: &GrayImage, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        image.save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }
}

/// Convert an interleaved image buffer into band-sequential floats
fn planar<P>(buffer: &ImageBuffer<P, Vec<P::Subpixel>>) -> Array3<f32>
where
    P: Pixel,
    P::Subpixel: Into<f32>,
{
    let (width, height) = buffer.dimensions();
    let channels = usize::from(P::CHANNEL_COUNT);
    Array3::from_shape_fn(
        (channels, height as usize, width as usize),
        |(c, row, col)| buffer.get_pixel(col as u32, row as u32).channels()[c].into(),
    )
}

fn stretch(values: ArrayView2<'_, f32>) -> Array2<u8> {
    let (min, max) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    values.mapv(|v| {
        if !v.is_finite() || !range.is_finite() || range <= 0.0 {
            0
        } else {
            (((v - min) / range) * 255.0).round().clamp(0.0, 255.0) as u8
        }
    })
}

fn gray_image(values: Array2<u8>) -> Result<GrayImage> {
    let (rows, cols) = values.dim();
    let raw: Vec<u8> = values.iter().copied().collect();
    ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(cols as u32, rows as u32, raw)
        .ok_or_else(|| TilingError::internal("class map buffer size mismatch"))
}
