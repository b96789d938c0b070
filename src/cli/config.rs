//! Configuration conversion utilities for CLI arguments

use crate::cli::main_impl::{AreaArgs, CliAreaType, CliComposition, TilingArgs};
use crate::{
    config::{ChannelMapping, CompositionPolicy, ProcessedAreaType, ProcessingParameters},
    mask::MaskGeometry,
    types::Extent,
};
use anyhow::{Context, Result};
use std::path::Path;

/// Convert CLI arguments to `ProcessingParameters`
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build parameters from an optional JSON file plus command line overrides
    ///
    /// Without an explicit channel mapping every raster band is fed to the
    /// model in file order.
    pub(crate) fn from_cli(
        tiling: &TilingArgs,
        area: &AreaArgs,
        input: &Path,
        band_count: usize,
    ) -> Result<ProcessingParameters> {
        let mut params = match &tiling.params {
            Some(path) => ProcessingParameters::from_json_file(path)
                .with_context(|| format!("Failed to load parameters from {}", path.display()))?,
            None => ProcessingParameters {
                input_channels_mapping: ChannelMapping::identity(band_count),
                ..ProcessingParameters::default()
            },
        };

        if params.input_layer_id.is_empty() {
            params.input_layer_id = input.display().to_string();
        }
        if let Some(resolution) = tiling.resolution {
            params.resolution = resolution;
        }
        if let Some(tile_size) = tiling.tile_size {
            params.tile_size_px = tile_size;
        }
        if let Some(overlap) = tiling.overlap {
            params.overlap_fraction = overlap / 100.0;
        }
        if let Some(margin) = tiling.margin {
            params.margin_px = Some(margin);
        }
        if let Some(bands) = &tiling.bands {
            params.input_channels_mapping = ChannelMapping::new(bands.clone());
        }
        if let Some(composition) = tiling.composition {
            params.composition = composition.into();
        }
        if tiling.pad_undersized_area {
            params.pad_undersized_area = true;
        }
        if let Some(area_type) = area.area {
            params.processed_area_type = area_type.into();
        }
        if let Some(mask) = &area.mask {
            params.mask_layer_id = Some(mask.display().to_string());
            if area.area.is_none() {
                params.processed_area_type = ProcessedAreaType::FromPolygons;
            }
        }

        params.validate().context("Invalid processing parameters")?;
        Ok(params)
    }

    /// Check area arguments for consistency with the resolved area type
    pub(crate) fn validate_area(params: &ProcessingParameters, area: &AreaArgs) -> Result<()> {
        match params.processed_area_type {
            ProcessedAreaType::VisiblePart if area.viewport.is_none() => {
                anyhow::bail!("--viewport is required for the visible-part area type")
            },
            ProcessedAreaType::FromPolygons if area.mask.is_none() => {
                anyhow::bail!("--mask is required for the from-polygons area type")
            },
            _ => Ok(()),
        }
    }

    /// Load the mask geometry named on the command line, if any
    pub(crate) fn load_mask(area: &AreaArgs) -> Result<Option<MaskGeometry>> {
        area.mask
            .as_ref()
            .map(|path| {
                MaskGeometry::from_json_file(path)
                    .with_context(|| format!("Failed to load mask from {}", path.display()))
            })
            .transpose()
    }
}

impl From<CliAreaType> for ProcessedAreaType {
    fn from(value: CliAreaType) -> Self {
        match value {
            CliAreaType::EntireLayer => Self::EntireLayer,
            CliAreaType::VisiblePart => Self::VisiblePart,
            CliAreaType::FromPolygons => Self::FromPolygons,
        }
    }
}

impl From<CliComposition> for CompositionPolicy {
    fn from(value: CliComposition) -> Self {
        match value {
            CliComposition::CenterCrop => Self::CenterCrop,
            CliComposition::Maximum => Self::Maximum,
            CliComposition::Average => Self::Average,
            CliComposition::LastWrite => Self::LastWrite,
        }
    }
}

/// Parse `x_min,y_min,x_max,y_max` into an extent
pub(crate) fn parse_extent(value: &str) -> std::result::Result<Extent, String> {
    let parts: Vec<f64> = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| format!("invalid coordinate in '{}': {}", value, e))?;
    match parts.as_slice() {
        [x_min, y_min, x_max, y_max] => {
            Extent::new(*x_min, *y_min, *x_max, *y_max).map_err(|e| e.to_string())
        },
        _ => Err(format!(
            "expected x_min,y_min,x_max,y_max but got {} values",
            parts.len()
        )),
    }
}
