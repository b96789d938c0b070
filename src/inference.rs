//! Collaborator traits for raster sampling and per-tile inference

use crate::{
    config::ChannelMapping,
    error::Result,
    types::{Extent, TileOutput, TileParams},
};
use ndarray::{Array3, Axis};

/// Pixel data request for one tile
#[derive(Debug, Clone, Copy)]
pub struct TileRequest<'a> {
    /// Tile extent in layer coordinates
    pub extent: Extent,
    /// Layer units per output pixel
    pub units_per_pixel: f64,
    /// Bands to read, in model channel order
    pub channel_mapping: &'a ChannelMapping,
    pub width_px: usize,
    pub height_px: usize,
}

/// Raster sampling primitive returning pixel data for an arbitrary extent
///
/// Implementations return a channel-first `(channels, height, width)` array
/// and fill pixels outside the layer with zeros.
pub trait RasterSampler: Send + Sync {
    /// Sample the raster for a tile request
    ///
    /// # Errors
    /// - Requested band missing from the raster
    /// - Backing store read failures
    fn sample(&self, request: &TileRequest<'_>) -> Result<Array3<f32>>;

    /// Extent of the whole layer
    fn layer_extent(&self) -> Extent;

    /// Number of bands available
    fn band_count(&self) -> usize;
}

/// Per-tile inference callback, opaque to the tiling core
///
/// Any `FnMut(&Array3<f32>, &TileParams) -> Result<TileOutput> + Send`
/// closure implements this trait.
pub trait TileInference: Send {
    /// Run the model on one tile
    ///
    /// # Errors
    /// - Model execution failures
    /// - Unexpected input shape
    fn infer(&mut self, input: &Array3<f32>, tile: &TileParams) -> Result<TileOutput>;
}

impl<F> TileInference for F
where
    F: FnMut(&Array3<f32>, &TileParams) -> Result<TileOutput> + Send,
{
    fn infer(&mut self, input: &Array3<f32>, tile: &TileParams) -> Result<TileOutput> {
        self(input, tile)
    }
}

/// Two-class segmentation by thresholding one input channel
///
/// Emits `[1 - p, p]` probabilities where `p` is 1 for pixels whose channel
/// value is at least the threshold. Useful for smoke runs without a model.
#[derive(Debug, Clone, Copy)]
pub struct BandThreshold {
    pub channel: usize,
    pub threshold: f32,
}

impl BandThreshold {
    #[must_use]
    pub fn new(channel: usize, threshold: f32) -> Self {
        Self { channel, threshold }
    }
}

impl TileInference for BandThreshold {
    fn infer(&mut self, input: &Array3<f32>, _tile: &TileParams) -> Result<TileOutput> {
        let channels = input.dim().0;
        if self.channel >= channels {
            return Err(crate::error::TilingError::invalid_parameter(format!(
                "Threshold channel {} not present in {}-channel input",
                self.channel, channels
            )));
        }
        let band = input.index_axis(Axis(0), self.channel);
        let foreground = band.mapv(|v| if v >= self.threshold { 1.0f32 } else { 0.0 });
        let background = foreground.mapv(|p| 1.0 - p);
        let output = ndarray::stack(Axis(0), &[background.view(), foreground.view()])?;
        Ok(TileOutput::Raster(output))
    }
}
