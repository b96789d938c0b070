//! Service layer
//!
//! This module contains services that separate infrastructure concerns
//! (file I/O, progress reporting) from the tiling logic.

pub mod io;
pub mod progress;

pub use io::{InMemoryRaster, RasterIo};
pub use progress::{
    CancellationToken, ConsoleProgressObserver, NoOpProgressObserver, ProcessingStage,
    ProgressObserver, ProgressTracker,
};
