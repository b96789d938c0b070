//! Error types for tiled raster processing

use crate::types::TileParams;
use thiserror::Error;

/// Result type alias for tiling operations
pub type Result<T> = std::result::Result<T, TilingError>;

/// Error types raised while planning or running a tiled processing job
///
/// Cancellation is deliberately not represented here: a cancelled run is a
/// terminal state reported through [`crate::ProcessingResult::Cancelled`].
#[derive(Error, Debug)]
pub enum TilingError {
    /// Malformed overlap, stride, tile size or resolution
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Requested area lies outside the layer or has an empty intersection
    #[error("Invalid area: {0}")]
    InvalidArea(String),

    /// Extended extent is smaller than a single tile
    #[error("Insufficient area: {0}")]
    InsufficientArea(String),

    /// Raster sampling failed for a tile
    #[error("Data access error for tile {tile}: {message}")]
    DataAccess { tile: String, message: String },

    /// Inference callback failed for a tile
    #[error("Inference error for tile {tile}: {message}")]
    Inference { tile: String, message: String },

    /// Task lifecycle misuse (starting a busy or finished task)
    #[error("Task error: {0}")]
    Task(String),

    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or encoding errors
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Configuration (de)serialization errors
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// Array shape mismatches
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TilingError {
    /// Create a new invalid parameter error
    pub fn invalid_parameter<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create a new invalid area error
    pub fn invalid_area<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArea(msg.into())
    }

    /// Create a new insufficient area error
    pub fn insufficient_area<S: Into<String>>(msg: S) -> Self {
        Self::InsufficientArea(msg.into())
    }

    /// Create a new task lifecycle error
    pub fn task<S: Into<String>>(msg: S) -> Self {
        Self::Task(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
    ) -> Self {
        Self::InvalidParameter(format!(
            "Invalid {}: {} (valid range: {})",
            parameter, value, valid_range
        ))
    }

    /// Create a data access error naming the failing tile
    pub fn data_access_for_tile<E: std::fmt::Display>(tile: &TileParams, error: E) -> Self {
        Self::DataAccess {
            tile: tile.describe(),
            message: error.to_string(),
        }
    }

    /// Create an inference error naming the failing tile
    pub fn inference_for_tile<E: std::fmt::Display>(tile: &TileParams, error: E) -> Self {
        Self::Inference {
            tile: tile.describe(),
            message: error.to_string(),
        }
    }

    /// Whether this error was raised before any tile work started
    #[must_use]
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidParameter(_) | Self::InvalidArea(_) | Self::InsufficientArea(_)
        )
    }
}
