//! Configuration types for tiled map processing

use crate::error::{Result, TilingError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which part of the raster layer should be processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedAreaType {
    /// The whole raster layer
    #[default]
    EntireLayer,
    /// The currently visible viewport, supplied by the caller
    VisiblePart,
    /// The area covered by the polygons of a mask layer
    FromPolygons,
}

/// Mapping of model input channels to raster bands
///
/// Entry `i` holds the zero-based band index fed into model channel `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelMapping(Vec<usize>);

impl ChannelMapping {
    #[must_use]
    pub fn new(bands: Vec<usize>) -> Self {
        Self(bands)
    }

    /// Channel `i` reads band `i`, for `count` channels
    #[must_use]
    pub fn identity(count: usize) -> Self {
        Self((0..count).collect())
    }

    /// Band read for a model channel
    #[must_use]
    pub fn band_for_channel(&self, channel: usize) -> Option<usize> {
        self.0.get(channel).copied()
    }

    /// Number of model input channels
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn bands(&self) -> &[usize] {
        &self.0
    }
}

impl Default for ChannelMapping {
    fn default() -> Self {
        // RGB
        Self::identity(3)
    }
}

/// Kind of model driving the processing, with its post-processing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelKind {
    /// Per-pixel class probabilities, reduced to a class map
    Segmentation {
        /// Minimum class probability; weaker pixels become class 0. 0 disables.
        #[serde(default)]
        probability_threshold: f32,
    },
    /// Per-pixel continuous values
    Regression {
        /// Multiplier applied to the model output
        #[serde(default = "default_output_scaling")]
        output_scaling: f32,
    },
    /// Object boxes per tile
    Detection {
        confidence: f32,
        iou_threshold: f32,
        /// Suppress overlapping detections across tile borders
        #[serde(default)]
        remove_overlapping: bool,
    },
    /// Upscaled raster output
    SuperResolution {
        scale_factor: usize,
        #[serde(default = "default_output_scaling")]
        output_scaling: f32,
    },
}

fn default_output_scaling() -> f32 {
    1.0
}

impl Default for ModelKind {
    fn default() -> Self {
        Self::Segmentation {
            probability_threshold: 0.0,
        }
    }
}

impl ModelKind {
    /// Display name of the model kind
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Segmentation { .. } => "segmentation",
            Self::Regression { .. } => "regression",
            Self::Detection { .. } => "detection",
            Self::SuperResolution { .. } => "super_resolution",
        }
    }

    /// Ratio between output pixels and input pixels along one axis
    #[must_use]
    pub fn output_scale(&self) -> usize {
        match self {
            Self::SuperResolution { scale_factor, .. } => *scale_factor,
            _ => 1,
        }
    }

    /// Validate the model specific parameters
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f32| -> Result<()> {
            if !(0.0..=1.0).contains(&value) {
                return Err(TilingError::config_value_error(name, value, "[0, 1]"));
            }
            Ok(())
        };
        match self {
            Self::Segmentation {
                probability_threshold,
            } => unit("probability threshold", *probability_threshold),
            Self::Regression { output_scaling } => {
                if output_scaling.is_finite() {
                    Ok(())
                } else {
                    Err(TilingError::config_value_error(
                        "output scaling",
                        output_scaling,
                        "finite",
                    ))
                }
            },
            Self::Detection {
                confidence,
                iou_threshold,
                ..
            } => {
                unit("confidence", *confidence)?;
                unit("IoU threshold", *iou_threshold)
            },
            Self::SuperResolution {
                scale_factor,
                output_scaling,
            } => {
                if *scale_factor == 0 {
                    return Err(TilingError::config_value_error("scale factor", 0, ">= 1"));
                }
                if !output_scaling.is_finite() {
                    return Err(TilingError::config_value_error(
                        "output scaling",
                        output_scaling,
                        "finite",
                    ));
                }
                Ok(())
            },
        }
    }
}

/// How overlapping tile outputs are combined into the full-size buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompositionPolicy {
    /// Copy each tile's core, dropping half the overlap on interior sides
    #[default]
    CenterCrop,
    /// Per-pixel maximum over all covering tiles
    Maximum,
    /// Per-pixel mean over all covering tiles
    Average,
    /// The tile enumerated last wins
    LastWrite,
}

impl CompositionPolicy {
    /// Whether the result is the same for any order tiles are composited in
    #[must_use]
    pub fn is_order_independent(&self) -> bool {
        matches!(self, Self::Maximum | Self::Average | Self::CenterCrop)
    }
}

/// Immutable parameter bundle for one processing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingParameters {
    /// Layer units per processed pixel
    pub resolution: f64,

    /// Edge length of the square model input, in pixels
    pub tile_size_px: usize,

    /// Fraction of a tile shared with its neighbour, in `[0, 1)`
    pub overlap_fraction: f64,

    #[serde(default)]
    pub processed_area_type: ProcessedAreaType,

    /// Identifier of the polygon mask source (area type `from_polygons`)
    #[serde(default)]
    pub mask_layer_id: Option<String>,

    /// Identifier of the raster being processed
    pub input_layer_id: String,

    #[serde(default)]
    pub input_channels_mapping: ChannelMapping,

    #[serde(default)]
    pub model: ModelKind,

    #[serde(default)]
    pub composition: CompositionPolicy,

    /// Margin added around the base extent; defaults to half a tile
    #[serde(default)]
    pub margin_px: Option<usize>,

    /// Pad areas smaller than one tile instead of failing
    #[serde(default)]
    pub pad_undersized_area: bool,

    /// Value written outside the area mask in raster outputs
    #[serde(default)]
    pub nodata_value: f32,
}

impl Default for ProcessingParameters {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            tile_size_px: 512,
            overlap_fraction: 0.15,
            processed_area_type: ProcessedAreaType::EntireLayer,
            mask_layer_id: None,
            input_layer_id: String::new(),
            input_channels_mapping: ChannelMapping::default(),
            model: ModelKind::default(),
            composition: CompositionPolicy::default(),
            margin_px: None,
            pad_undersized_area: false,
            nodata_value: 0.0,
        }
    }
}

impl ProcessingParameters {
    /// Create a new parameter builder
    #[must_use]
    pub fn builder() -> ProcessingParametersBuilder {
        ProcessingParametersBuilder::default()
    }

    /// Distance between consecutive tile origins, `floor(tile * (1 - overlap))`, at least 1
    pub fn stride_px(&self) -> Result<usize> {
        self.validate_tiling()?;
        // Guard against 0.6 * 256 style representation error before flooring
        let stride = (self.tile_size_px as f64 * (1.0 - self.overlap_fraction) + 1e-9).floor();
        Ok((stride as usize).max(1))
    }

    /// Overlap between neighbouring tiles in pixels
    pub fn overlap_px(&self) -> Result<usize> {
        Ok(self.tile_size_px - self.stride_px()?)
    }

    /// Margin grown around the base extent before tile alignment
    #[must_use]
    pub fn margin_px(&self) -> usize {
        self.margin_px.unwrap_or(self.tile_size_px / 2)
    }

    fn validate_tiling(&self) -> Result<()> {
        if self.tile_size_px == 0 {
            return Err(TilingError::config_value_error("tile size", 0, ">= 1 px"));
        }
        if !self.overlap_fraction.is_finite()
            || self.overlap_fraction < 0.0
            || self.overlap_fraction >= 1.0
        {
            return Err(TilingError::config_value_error(
                "overlap fraction",
                self.overlap_fraction,
                "[0, 1)",
            ));
        }
        Ok(())
    }

    /// Validate all parameters
    ///
    /// # Errors
    /// - Non-positive or non-finite resolution
    /// - Zero tile size or overlap outside `[0, 1)`
    /// - Empty channel mapping
    /// - Out of range model parameters
    pub fn validate(&self) -> Result<()> {
        if !self.resolution.is_finite() || self.resolution <= 0.0 {
            return Err(TilingError::config_value_error(
                "resolution",
                self.resolution,
                "> 0 units per pixel",
            ));
        }
        self.validate_tiling()?;
        if self.input_channels_mapping.channel_count() == 0 {
            return Err(TilingError::invalid_parameter(
                "channel mapping must contain at least one channel",
            ));
        }
        if !self.nodata_value.is_finite() {
            return Err(TilingError::config_value_error(
                "no-data value",
                self.nodata_value,
                "finite",
            ));
        }
        self.model.validate()
    }

    /// Parse and validate parameters from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// Load and validate parameters from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Builder for `ProcessingParameters`
#[derive(Debug, Default)]
pub struct ProcessingParametersBuilder {
    params: ProcessingParameters,
}

impl ProcessingParametersBuilder {
    #[must_use]
    pub fn resolution(mut self, units_per_pixel: f64) -> Self {
        self.params.resolution = units_per_pixel;
        self
    }

    #[must_use]
    pub fn tile_size_px(mut self, tile_size_px: usize) -> Self {
        self.params.tile_size_px = tile_size_px;
        self
    }

    #[must_use]
    pub fn overlap_fraction(mut self, overlap: f64) -> Self {
        self.params.overlap_fraction = overlap;
        self
    }

    /// Overlap given in percent, as the original plugin UI expresses it
    #[must_use]
    pub fn overlap_percentage(mut self, percent: f64) -> Self {
        self.params.overlap_fraction = percent / 100.0;
        self
    }

    #[must_use]
    pub fn processed_area_type(mut self, area_type: ProcessedAreaType) -> Self {
        self.params.processed_area_type = area_type;
        self
    }

    #[must_use]
    pub fn mask_layer_id<S: Into<String>>(mut self, id: S) -> Self {
        self.params.mask_layer_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn input_layer_id<S: Into<String>>(mut self, id: S) -> Self {
        self.params.input_layer_id = id.into();
        self
    }

    #[must_use]
    pub fn input_channels_mapping(mut self, mapping: ChannelMapping) -> Self {
        self.params.input_channels_mapping = mapping;
        self
    }

    #[must_use]
    pub fn model(mut self, model: ModelKind) -> Self {
        self.params.model = model;
        self
    }

    #[must_use]
    pub fn composition(mut self, policy: CompositionPolicy) -> Self {
        self.params.composition = policy;
        self
    }

    #[must_use]
    pub fn margin_px(mut self, margin: usize) -> Self {
        self.params.margin_px = Some(margin);
        self
    }

    #[must_use]
    pub fn pad_undersized_area(mut self, pad: bool) -> Self {
        self.params.pad_undersized_area = pad;
        self
    }

    #[must_use]
    pub fn nodata_value(mut self, value: f32) -> Self {
        self.params.nodata_value = value;
        self
    }

    /// Build and validate the parameters
    ///
    /// # Errors
    ///
    /// Returns `TilingError::InvalidParameter` for any value rejected by
    /// [`ProcessingParameters::validate`].
    pub fn build(self) -> Result<ProcessingParameters> {
        self.params.validate()?;
        Ok(self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_from_overlap() {
        let params = ProcessingParameters::builder()
            .tile_size_px(256)
            .overlap_fraction(0.5)
            .build()
            .unwrap();
        assert_eq!(params.stride_px().unwrap(), 128);
        assert_eq!(params.overlap_px().unwrap(), 128);

        let params = ProcessingParameters::builder()
            .tile_size_px(256)
            .overlap_percentage(60.0)
            .build()
            .unwrap();
        assert_eq!(params.stride_px().unwrap(), 102);

        let params = ProcessingParameters::builder()
            .tile_size_px(256)
            .overlap_fraction(0.0)
            .build()
            .unwrap();
        assert_eq!(params.stride_px().unwrap(), 256);
    }

    #[test]
    fn test_stride_never_zero() {
        let params = ProcessingParameters::builder()
            .tile_size_px(4)
            .overlap_fraction(0.99)
            .build()
            .unwrap();
        assert_eq!(params.stride_px().unwrap(), 1);
    }

    #[test]
    fn test_overlap_out_of_range_rejected() {
        for overlap in [1.0, 1.5, -0.1, f64::NAN] {
            let result = ProcessingParameters::builder()
                .overlap_fraction(overlap)
                .build();
            assert!(
                matches!(result, Err(TilingError::InvalidParameter(_))),
                "overlap {} should be rejected",
                overlap
            );
        }
    }

    #[test]
    fn test_invalid_resolution_and_tile_size() {
        assert!(ProcessingParameters::builder().resolution(0.0).build().is_err());
        assert!(ProcessingParameters::builder().resolution(-2.0).build().is_err());
        assert!(ProcessingParameters::builder().tile_size_px(0).build().is_err());
        assert!(ProcessingParameters::builder()
            .input_channels_mapping(ChannelMapping::new(vec![]))
            .build()
            .is_err());
    }

    #[test]
    fn test_model_kind_validation() {
        let detection = ModelKind::Detection {
            confidence: 1.2,
            iou_threshold: 0.4,
            remove_overlapping: true,
        };
        assert!(detection.validate().is_err());

        let sr = ModelKind::SuperResolution {
            scale_factor: 0,
            output_scaling: 1.0,
        };
        assert!(sr.validate().is_err());

        let sr = ModelKind::SuperResolution {
            scale_factor: 4,
            output_scaling: 255.0,
        };
        assert!(sr.validate().is_ok());
        assert_eq!(sr.output_scale(), 4);
        assert_eq!(ModelKind::default().output_scale(), 1);
    }

    #[test]
    fn test_margin_defaults_to_half_tile() {
        let params = ProcessingParameters::builder().tile_size_px(256).build().unwrap();
        assert_eq!(params.margin_px(), 128);
        let params = ProcessingParameters::builder()
            .tile_size_px(256)
            .margin_px(10)
            .build()
            .unwrap();
        assert_eq!(params.margin_px(), 10);
    }

    #[test]
    fn test_json_round_trip_with_defaults() {
        let json = r#"{
            "resolution": 0.7,
            "tile_size_px": 256,
            "overlap_fraction": 0.6,
            "input_layer_id": "planes",
            "model": { "type": "detection", "confidence": 0.5, "iou_threshold": 0.4 }
        }"#;
        let params = ProcessingParameters::from_json_str(json).unwrap();
        assert_eq!(params.processed_area_type, ProcessedAreaType::EntireLayer);
        assert_eq!(params.composition, CompositionPolicy::CenterCrop);
        assert_eq!(params.input_channels_mapping, ChannelMapping::identity(3));
        assert!(matches!(
            params.model,
            ModelKind::Detection {
                remove_overlapping: false,
                ..
            }
        ));

        let reparsed = ProcessingParameters::from_json_str(&params.to_json().unwrap()).unwrap();
        assert_eq!(reparsed, params);
    }

    #[test]
    fn test_json_invalid_values_rejected() {
        let json = r#"{
            "resolution": 1.0,
            "tile_size_px": 256,
            "overlap_fraction": 1.0,
            "input_layer_id": "x"
        }"#;
        assert!(matches!(
            ProcessingParameters::from_json_str(json),
            Err(TilingError::InvalidParameter(_))
        ));
        assert!(matches!(
            ProcessingParameters::from_json_str("{ not json"),
            Err(TilingError::Config(_))
        ));
    }

    #[test]
    fn test_composition_order_independence() {
        assert!(CompositionPolicy::Maximum.is_order_independent());
        assert!(CompositionPolicy::Average.is_order_independent());
        assert!(!CompositionPolicy::LastWrite.is_order_independent());
    }
}
