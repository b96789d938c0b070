//! End-to-end tiling scenarios
//!
//! Extent planning, tile enumeration with area masks and result assembly,
//! checked against hand-computed grids.

use geotiler::{
    error::Result, AreaMask, ChannelMapping, CompositionPolicy, Extent, ExtentCalculator,
    InMemoryRaster, MapProcessor, MaskGeometry, Polygon, ProcessedAreaType, ProcessingArtifact,
    ProcessingParameters, ResultAssembler, TileCompositor, TileGrid, TileInference, TileOutput,
    TileParams,
};
use ndarray::{s, Array2, Array3};
use std::sync::Arc;

fn params(tile_size_px: usize, overlap: f64) -> ProcessingParameters {
    ProcessingParameters::builder()
        .resolution(1.0)
        .tile_size_px(tile_size_px)
        .overlap_fraction(overlap)
        .input_channels_mapping(ChannelMapping::identity(1))
        .build()
        .unwrap()
}

fn layer(width: f64, height: f64) -> Extent {
    Extent::new(0.0, 0.0, width, height).unwrap()
}

fn gradient_raster(width: usize, height: usize) -> Arc<InMemoryRaster> {
    let data = Array3::from_shape_fn((1, height, width), |(_, r, c)| ((r * 7 + c * 3) % 255) as f32);
    Arc::new(InMemoryRaster::new(data, layer(width as f64, height as f64)).unwrap())
}

#[test]
fn test_extended_extent_is_tiled_exactly() -> Result<()> {
    let cases = [
        (1000.0, 700.0, 256, 0.15),
        (5000.0, 3000.0, 512, 0.5),
        (300.0, 300.0, 256, 0.0),
        (777.0, 1234.0, 128, 0.3),
        (2048.0, 2048.0, 256, 0.9),
    ];
    for (width, height, tile, overlap) in cases {
        let p = params(tile, overlap);
        let stride = p.stride_px()?;
        let extents = ExtentCalculator::new(&p, layer(width, height))?.compute(None)?;
        let grid = extents.grid;

        assert_eq!((grid.img_size_x_px - tile) % stride, 0, "case {}x{}", width, height);
        assert_eq!((grid.img_size_y_px - tile) % stride, 0, "case {}x{}", width, height);
        assert_eq!(grid.x_bins_number, (grid.img_size_x_px - tile) / stride + 1);
        assert_eq!(grid.y_bins_number, (grid.img_size_y_px - tile) / stride + 1);

        let bbox = extents.base_extent_bbox_in_full_image;
        assert!(bbox.x_max < grid.img_size_x_px);
        assert!(bbox.y_max < grid.img_size_y_px);
        assert_eq!(extents.base_size_px(), (width as usize, height as usize));
        assert_eq!(extents.base_extent, layer(width, height));
    }
    Ok(())
}

#[test]
fn test_square_layer_half_overlap_has_nine_tiles() -> Result<()> {
    let p = params(256, 0.5);
    let extents = ExtentCalculator::new(&p, layer(512.0, 512.0))?.compute(None)?;
    assert_eq!(extents.extended_extent, layer(512.0, 512.0));
    assert_eq!(extents.stride_px, 128);
    assert_eq!(extents.grid.x_bins_number, 3);
    assert_eq!(extents.grid.y_bins_number, 3);

    let grid = TileGrid::new(&extents);
    let tiles: Vec<TileParams> = grid.tiles(&AreaMask::Absent).collect();
    assert_eq!(tiles.len(), 9);

    let origins: Vec<(usize, usize)> = tiles
        .iter()
        .map(|t| (t.pixel_offset.x, t.pixel_offset.y))
        .collect();
    assert_eq!(origins[0], (0, 0));
    assert_eq!(origins[1], (128, 0));
    assert_eq!(origins[3], (0, 128));
    assert_eq!(origins[8], (256, 256));

    // Row 0 is the top of the map
    assert_eq!(tiles[0].extent, Extent::new(0.0, 256.0, 256.0, 512.0)?);
    assert_eq!(tiles[8].extent, Extent::new(256.0, 0.0, 512.0, 256.0)?);
    Ok(())
}

#[test]
fn test_viewport_is_snapped_outward() -> Result<()> {
    let p = params(256, 0.15);
    let viewport = Extent::new(100.3, 200.7, 612.2, 455.0)?;
    let extents = ExtentCalculator::new(&p, layer(2000.0, 2000.0))?.compute(Some(&viewport))?;
    assert_eq!(extents.base_extent, Extent::new(100.0, 200.0, 613.0, 455.0)?);
    assert_eq!(extents.base_size_px(), (513, 255));
    assert!(extents.extended_extent.x_min <= extents.base_extent.x_min);
    assert!(extents.extended_extent.y_max >= extents.base_extent.y_max);
    Ok(())
}

#[test]
fn test_corner_mask_selects_single_tile() -> Result<()> {
    let p = params(256, 0.5);
    let extents = ExtentCalculator::new(&p, layer(512.0, 512.0))?.compute(None)?;
    let mut values = Array2::from_elem((512, 512), false);
    values.slice_mut(s![0..10, 0..10]).fill(true);
    let mask = AreaMask::from_grid(values);

    let grid = TileGrid::new(&extents);
    let mut iter = grid.tiles(&mask);
    let tiles: Vec<TileParams> = iter.by_ref().collect();
    assert_eq!(tiles.len(), 1);
    assert_eq!((tiles[0].x_bin, tiles[0].y_bin), (0, 0));
    assert_eq!(iter.skipped_tiles(), 8);
    Ok(())
}

#[test]
fn test_corner_polygon_plans_one_tile() -> Result<()> {
    let p = ProcessingParameters::builder()
        .tile_size_px(256)
        .overlap_fraction(0.5)
        .processed_area_type(ProcessedAreaType::FromPolygons)
        .input_channels_mapping(ChannelMapping::identity(1))
        .build()?;
    let polygon = Polygon::rectangle(&Extent::new(0.0, 0.0, 50.0, 50.0)?);
    let processor = MapProcessor::new(p, gradient_raster(2048, 2048))?
        .with_mask(MaskGeometry::new(vec![polygon]));

    let plan = processor.plan()?;
    assert_eq!(plan.extents.base_extent, Extent::new(0.0, 0.0, 50.0, 50.0)?);
    assert_eq!(plan.extents.extended_extent, Extent::new(0.0, 0.0, 256.0, 256.0)?);
    assert_eq!(plan.extents.grid.x_bins_number, 1);
    assert_eq!(plan.extents.grid.y_bins_number, 1);

    let bbox = plan.extents.base_extent_bbox_in_full_image;
    assert_eq!((bbox.x_min, bbox.x_max), (0, 49));
    assert_eq!((bbox.y_min, bbox.y_max), (206, 255));

    assert_eq!(plan.tile_grid().tiles(&plan.mask).count(), 1);
    Ok(())
}

#[test]
fn test_polygon_outside_layer_is_rejected() {
    let p = ProcessingParameters::builder()
        .tile_size_px(64)
        .processed_area_type(ProcessedAreaType::FromPolygons)
        .input_channels_mapping(ChannelMapping::identity(1))
        .build()
        .unwrap();
    let polygon = Polygon::rectangle(&Extent::new(5000.0, 5000.0, 5100.0, 5100.0).unwrap());
    let processor = MapProcessor::new(p, gradient_raster(256, 256))
        .unwrap()
        .with_mask(MaskGeometry::new(vec![polygon]));
    let error = processor.plan().unwrap_err();
    assert!(error.is_setup_error());
}

#[test]
fn test_planning_is_deterministic() -> Result<()> {
    let p = params(128, 0.25);
    let calculator = ExtentCalculator::new(&p, layer(1000.0, 600.0))?;
    let first = calculator.compute(None)?;
    let second = calculator.compute(None)?;
    assert_eq!(first, second);

    let grid_a = TileGrid::new(&first);
    let grid_b = TileGrid::new(&second);
    let a: Vec<TileParams> = grid_a.tiles(&AreaMask::Absent).collect();
    let b: Vec<TileParams> = grid_b.tiles(&AreaMask::Absent).collect();
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn test_identity_model_reproduces_raster() -> Result<()> {
    let raster = gradient_raster(300, 200);
    let expected = raster.data().clone();
    let p = ProcessingParameters::builder()
        .tile_size_px(64)
        .overlap_fraction(0.25)
        .input_channels_mapping(ChannelMapping::identity(1))
        .model(geotiler::ModelKind::Regression { output_scaling: 1.0 })
        .build()?;

    for policy in [
        CompositionPolicy::CenterCrop,
        CompositionPolicy::Maximum,
        CompositionPolicy::Average,
        CompositionPolicy::LastWrite,
    ] {
        let mut p = p.clone();
        p.composition = policy;
        let mut identity = |input: &Array3<f32>, _tile: &TileParams| -> Result<TileOutput> {
            Ok(TileOutput::Raster(input.clone()))
        };
        let result = geotiler::process_map(p, raster.clone(), &mut identity)?;
        let Some(ProcessingArtifact::Raster(output)) = result.artifact() else {
            panic!("expected raster output for {:?}", policy);
        };
        assert_eq!(output.data, expected, "policy {:?}", policy);
        assert_eq!(output.extent, layer(300.0, 200.0));
    }
    Ok(())
}

#[test]
fn test_assembly_is_idempotent_and_cropped() -> Result<()> {
    let p = params(128, 0.25);
    let extents = ExtentCalculator::new(&p, layer(1000.0, 700.0))?.compute(None)?;
    let (rows, cols) = (extents.grid.img_size_y_px, extents.grid.img_size_x_px);

    let mut values = Array2::from_elem((rows, cols), false);
    values.slice_mut(s![..rows / 2, ..]).fill(true);
    let mask = AreaMask::from_grid(values);

    let data = Array3::from_elem((2, rows, cols), 5.0f32);
    let assembler = ResultAssembler::new(&extents, &mask, 1);
    let once = assembler.apply_mask(data.view(), -1.0)?;
    let twice = assembler.apply_mask(once.view(), -1.0)?;
    assert_eq!(once, twice);

    let assembled = assembler.assemble(data.view(), -1.0)?;
    assert_eq!(assembled.dim(), (2, 700, 1000));
    Ok(())
}

#[test]
fn test_compositor_covers_every_pixel() -> Result<()> {
    let p = params(64, 0.5);
    let extents = ExtentCalculator::new(&p, layer(200.0, 150.0))?.compute(None)?;
    let grid = TileGrid::new(&extents);
    let mut compositor = TileCompositor::new(CompositionPolicy::CenterCrop, extents.grid, 1);
    for tile in grid.tiles(&AreaMask::Absent) {
        let output = Array3::from_elem((1, 64, 64), tile.tile_no as f32 + 1.0);
        compositor.add_tile(&tile, output.view())?;
    }
    let full = compositor.finish().expect("tiles were added");
    assert_eq!(full.dim(), (1, extents.grid.img_size_y_px, extents.grid.img_size_x_px));
    assert!(full.iter().all(|v| *v > 0.0));
    Ok(())
}

struct CountingModel {
    calls: usize,
}

impl TileInference for CountingModel {
    fn infer(&mut self, input: &Array3<f32>, _tile: &TileParams) -> Result<TileOutput> {
        self.calls += 1;
        let (_, rows, cols) = input.dim();
        Ok(TileOutput::Raster(Array3::from_elem((2, rows, cols), 0.5)))
    }
}

#[test]
fn test_masked_tiles_are_not_inferred() -> Result<()> {
    let p = ProcessingParameters::builder()
        .tile_size_px(64)
        .overlap_fraction(0.0)
        .processed_area_type(ProcessedAreaType::FromPolygons)
        .input_channels_mapping(ChannelMapping::identity(1))
        .build()?;
    // Two disjoint squares in opposite corners of a 512 px layer
    let geometry = MaskGeometry::new(vec![
        Polygon::rectangle(&Extent::new(0.0, 0.0, 20.0, 20.0)?),
        Polygon::rectangle(&Extent::new(490.0, 490.0, 512.0, 512.0)?),
    ]);
    let processor = MapProcessor::new(p, gradient_raster(512, 512))?.with_mask(geometry);
    let plan = processor.plan()?;
    let total = plan.tile_grid().total_tiles();
    let selected = plan.tile_grid().tiles(&plan.mask).count();
    assert!(selected < total);

    let task = geotiler::ProcessingTask::new(processor);
    let mut model = CountingModel { calls: 0 };
    let result = task.run(&mut model)?;
    assert!(result.is_success());
    assert_eq!(model.calls, selected);
    let metadata = result.metadata().expect("success carries metadata");
    assert_eq!(metadata.processed_tiles, selected);
    assert_eq!(metadata.skipped_tiles, total - selected);
    Ok(())
}
