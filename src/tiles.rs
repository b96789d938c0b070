//! Deterministic tile enumeration over the extended extent

use crate::config::ChannelMapping;
use crate::error::{Result, TilingError};
use crate::extent::ProcessingExtents;
use crate::inference::{RasterSampler, TileRequest};
use crate::mask::AreaMask;
use crate::services::progress::ProgressTracker;
use crate::types::{Extent, PixelOffset, TileParams};
use instant::Instant;
use ndarray::Array3;
use std::iter::FusedIterator;
use tracing::{debug, trace};

/// Tile layout of one run
#[derive(Debug, Clone, Copy)]
pub struct TileGrid<'a> {
    extents: &'a ProcessingExtents,
}

impl<'a> TileGrid<'a> {
    #[must_use]
    pub fn new(extents: &'a ProcessingExtents) -> Self {
        Self { extents }
    }

    #[must_use]
    pub fn extents(&self) -> &'a ProcessingExtents {
        self.extents
    }

    #[must_use]
    pub fn total_tiles(&self) -> usize {
        self.extents.grid.total_tiles()
    }

    /// Parameters of the tile at a bin
    #[must_use]
    pub fn tile_params(&self, x_bin: usize, y_bin: usize) -> TileParams {
        let e = self.extents;
        let r = e.units_per_pixel;
        let offset = PixelOffset {
            x: x_bin * e.stride_px,
            y: y_bin * e.stride_px,
        };
        let size = e.tile_size_px as f64 * r;
        let x_min = e.extended_extent.x_min + offset.x as f64 * r;
        let y_max = e.extended_extent.y_max - offset.y as f64 * r;

        TileParams {
            tile_no: y_bin * e.grid.x_bins_number + x_bin,
            x_bin,
            y_bin,
            x_bins_number: e.grid.x_bins_number,
            y_bins_number: e.grid.y_bins_number,
            tile_size_px: e.tile_size_px,
            stride_px: e.stride_px,
            extent: Extent {
                x_min,
                y_min: y_max - size,
                x_max: x_min + size,
                y_max,
            },
            pixel_offset: offset,
        }
    }

    /// Parameters of the tile with a row-major number
    #[must_use]
    pub fn tile_at(&self, tile_no: usize) -> Option<TileParams> {
        if tile_no >= self.total_tiles() {
            return None;
        }
        let x_bins = self.extents.grid.x_bins_number;
        Some(self.tile_params(tile_no % x_bins, tile_no / x_bins))
    }

    /// Fresh iterator over the tiles touching the mask
    #[must_use]
    pub fn tiles<'m>(&self, mask: &'m AreaMask) -> TileGridIterator<'a, 'm> {
        TileGridIterator::new(*self, mask, None)
    }

    /// Iterator that also reports progress and honours cancellation
    #[must_use]
    pub fn tiles_with_progress<'m>(
        &self,
        mask: &'m AreaMask,
        tracker: &ProgressTracker,
    ) -> TileGridIterator<'a, 'm> {
        TileGridIterator::new(*self, mask, Some(tracker.clone()))
    }
}

/// Lazy row-major iterator over tiles
///
/// Tiles that do not touch the area mask are skipped without any data
/// request. When a tracker is attached, progress is reported after every
/// computed tile and a cancellation request ends the iteration.
#[derive(Debug, Clone)]
pub struct TileGridIterator<'a, 'm> {
    grid: TileGrid<'a>,
    mask: &'m AreaMask,
    tracker: Option<ProgressTracker>,
    next_tile_no: usize,
    yielded: usize,
    skipped: usize,
    cancelled: bool,
}

impl<'a, 'm> TileGridIterator<'a, 'm> {
    fn new(grid: TileGrid<'a>, mask: &'m AreaMask, tracker: Option<ProgressTracker>) -> Self {
        Self {
            grid,
            mask,
            tracker,
            next_tile_no: 0,
            yielded: 0,
            skipped: 0,
            cancelled: false,
        }
    }

    /// Whether iteration stopped because cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    #[must_use]
    pub fn yielded_tiles(&self) -> usize {
        self.yielded
    }

    /// Tiles passed over because they do not touch the mask
    #[must_use]
    pub fn skipped_tiles(&self) -> usize {
        self.skipped
    }

    #[must_use]
    pub fn total_tiles(&self) -> usize {
        self.grid.total_tiles()
    }

    /// Rewind to the first tile, clearing counters and the cancelled flag
    pub fn restart(&mut self) {
        self.next_tile_no = 0;
        self.yielded = 0;
        self.skipped = 0;
        self.cancelled = false;
    }

    /// Pair every tile with its sampled pixel data
    #[must_use]
    pub fn sampled<'s>(
        self,
        sampler: &'s dyn RasterSampler,
        channel_mapping: &'s ChannelMapping,
    ) -> SampledTiles<'a, 'm, 's> {
        SampledTiles {
            tiles: self,
            sampler,
            channel_mapping,
            sampling_ms: 0,
            failed: false,
        }
    }
}

impl Iterator for TileGridIterator<'_, '_> {
    type Item = TileParams;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.grid.total_tiles();
        while !self.cancelled && self.next_tile_no < total {
            let tile = match self.grid.tile_at(self.next_tile_no) {
                Some(tile) => tile,
                None => break,
            };
            self.next_tile_no += 1;

            if let Some(tracker) = &self.tracker {
                tracker.report_tile(tile.tile_no, total);
                if tracker.is_cancelled() {
                    debug!(tile_no = tile.tile_no, "Cancellation observed, stopping tiling");
                    self.cancelled = true;
                    break;
                }
            }

            if !self.mask.tile_intersects_mask(&tile.pixel_box()) {
                trace!(tile_no = tile.tile_no, "Tile outside area mask, skipped");
                self.skipped += 1;
                continue;
            }

            self.yielded += 1;
            return Some(tile);
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.cancelled {
            return (0, Some(0));
        }
        (0, Some(self.grid.total_tiles() - self.next_tile_no))
    }
}

impl FusedIterator for TileGridIterator<'_, '_> {}

/// Tiles paired with pixel data fetched from a [`RasterSampler`]
///
/// The first sampling failure is yielded as an error and ends the iteration.
pub struct SampledTiles<'a, 'm, 's> {
    tiles: TileGridIterator<'a, 'm>,
    sampler: &'s dyn RasterSampler,
    channel_mapping: &'s ChannelMapping,
    sampling_ms: u64,
    failed: bool,
}

impl<'a, 'm> SampledTiles<'a, 'm, '_> {
    /// Underlying tile iterator, for counters and the cancelled flag
    #[must_use]
    pub fn tiles(&self) -> &TileGridIterator<'a, 'm> {
        &self.tiles
    }

    /// Time spent inside the sampler so far
    #[must_use]
    pub fn sampling_ms(&self) -> u64 {
        self.sampling_ms
    }

    fn sample(&mut self, tile: &TileParams) -> Result<Array3<f32>> {
        let request = TileRequest {
            extent: tile.extent,
            units_per_pixel: self.tiles.grid.extents().units_per_pixel,
            channel_mapping: self.channel_mapping,
            width_px: tile.tile_size_px,
            height_px: tile.tile_size_px,
        };
        let start = Instant::now();
        let data = self.sampler.sample(&request).map_err(|e| match e {
            TilingError::DataAccess { .. } => e,
            other => TilingError::data_access_for_tile(tile, other),
        })?;
        self.sampling_ms += start.elapsed().as_millis() as u64;

        let expected = (
            self.channel_mapping.channel_count(),
            tile.tile_size_px,
            tile.tile_size_px,
        );
        if data.dim() != expected {
            return Err(TilingError::data_access_for_tile(
                tile,
                format!("sampler returned {:?}, expected {:?}", data.dim(), expected),
            ));
        }
        Ok(data)
    }
}

impl Iterator for SampledTiles<'_, '_, '_> {
    type Item = Result<(Array3<f32>, TileParams)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let tile = self.tiles.next()?;
        match self.sample(&tile) {
            Ok(data) => Some(Ok((data, tile))),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingParameters;
    use crate::extent::ExtentCalculator;
    use crate::services::progress::{CancellationToken, ProgressObserver};
    use ndarray::Array2;
    use std::sync::{Arc, Mutex};

    fn extents_512() -> ProcessingExtents {
        let params = ProcessingParameters::builder()
            .resolution(1.0)
            .tile_size_px(256)
            .overlap_fraction(0.5)
            .build()
            .unwrap();
        let layer = Extent::new(1000.0, 2000.0, 1512.0, 2512.0).unwrap();
        ExtentCalculator::new(&params, layer)
            .unwrap()
            .compute(None)
            .unwrap()
    }

    #[test]
    fn test_row_major_order_and_extents() {
        let extents = extents_512();
        let grid = TileGrid::new(&extents);
        let tiles: Vec<TileParams> = grid.tiles(&AreaMask::Absent).collect();
        assert_eq!(tiles.len(), 9);
        for (i, tile) in tiles.iter().enumerate() {
            assert_eq!(tile.tile_no, i);
            assert_eq!(tile.x_bin, i % 3);
            assert_eq!(tile.y_bin, i / 3);
        }

        let t5 = &tiles[5];
        assert_eq!(t5.pixel_offset, PixelOffset { x: 256, y: 128 });
        assert_eq!(t5.extent, Extent::new(1256.0, 2128.0, 1512.0, 2384.0).unwrap());
        assert!(t5.is_last_column());
        assert!(!t5.is_first_row());
    }

    #[test]
    fn test_restartable_and_deterministic() {
        let extents = extents_512();
        let grid = TileGrid::new(&extents);
        let mask = AreaMask::Absent;
        let first: Vec<_> = grid.tiles(&mask).collect();
        let second: Vec<_> = grid.tiles(&mask).collect();
        assert_eq!(first, second);

        let mut iter = grid.tiles(&mask);
        let partial: Vec<_> = iter.by_ref().take(4).collect();
        iter.restart();
        let again: Vec<_> = iter.take(4).collect();
        assert_eq!(partial, again);
    }

    #[test]
    fn test_masked_tiles_are_skipped() {
        let extents = extents_512();
        let mut values = Array2::from_elem((512, 512), false);
        // Bottom-right corner only
        values[[500, 500]] = true;
        let mask = AreaMask::from_grid(values);
        let grid = TileGrid::new(&extents);
        let mut iter = grid.tiles(&mask);
        let tiles: Vec<_> = iter.by_ref().collect();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].tile_no, 8);
        assert_eq!(iter.skipped_tiles(), 8);
        assert!(!iter.is_cancelled());
    }

    struct Recording(Mutex<Vec<f64>>);

    impl ProgressObserver for Recording {
        fn report_progress(&self, percent: f64) {
            self.0.lock().unwrap().push(percent);
        }
    }

    #[test]
    fn test_progress_and_cancellation() {
        let extents = extents_512();
        let grid = TileGrid::new(&extents);
        let observer = Arc::new(Recording(Mutex::new(Vec::new())));
        let token = CancellationToken::new();
        let tracker = ProgressTracker::new(observer.clone(), token.clone());

        let mut iter = grid.tiles_with_progress(&AreaMask::Absent, &tracker);
        let mut seen = Vec::new();
        for tile in iter.by_ref() {
            seen.push(tile.tile_no);
            if seen.len() == 3 {
                token.cancel();
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(iter.is_cancelled());
        assert_eq!(iter.next(), None);

        let percents = observer.0.lock().unwrap().clone();
        assert_eq!(percents.len(), 4);
        assert!((percents[3] - 3.0 / 9.0 * 100.0).abs() < 1e-9);
    }

    struct ZeroSampler;

    impl RasterSampler for ZeroSampler {
        fn sample(&self, request: &TileRequest<'_>) -> Result<Array3<f32>> {
            if request.extent.x_min > 1200.0 {
                return Err(TilingError::internal("band read failed"));
            }
            Ok(Array3::zeros((
                request.channel_mapping.channel_count(),
                request.height_px,
                request.width_px,
            )))
        }

        fn layer_extent(&self) -> Extent {
            Extent::new(1000.0, 2000.0, 1512.0, 2512.0).unwrap()
        }

        fn band_count(&self) -> usize {
            3
        }
    }

    #[test]
    fn test_sampled_tiles_stop_at_first_failure() {
        let extents = extents_512();
        let grid = TileGrid::new(&extents);
        let mask = AreaMask::Absent;
        let mapping = ChannelMapping::identity(3);
        let results: Vec<_> = grid.tiles(&mask).sampled(&ZeroSampler, &mapping).collect();

        // Tiles 0 and 1 start left of x = 1200, tile 2 starts at 1256
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        let (data, _) = results[1].as_ref().unwrap();
        assert_eq!(data.dim(), (3, 256, 256));
        let err = results[2].as_ref().unwrap_err();
        assert!(matches!(err, TilingError::DataAccess { .. }));
        assert!(err.to_string().contains("x_bin=2"));
    }
}
