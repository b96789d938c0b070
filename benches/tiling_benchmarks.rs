use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use geotiler::{
    AreaMask, AreaMaskEngine, BandThreshold, ChannelMapping, CompositionPolicy, Extent,
    ExtentCalculator, InMemoryRaster, MaskGeometry, Polygon, ProcessedAreaType,
    ProcessingParameters, ScanlineRasterizer, TileCompositor, TileGrid,
};
use ndarray::Array3;
use std::sync::Arc;

fn params(tile_size_px: usize, overlap: f64) -> ProcessingParameters {
    ProcessingParameters::builder()
        .tile_size_px(tile_size_px)
        .overlap_fraction(overlap)
        .input_channels_mapping(ChannelMapping::identity(1))
        .build()
        .unwrap()
}

fn layer(size: f64) -> Extent {
    Extent::new(0.0, 0.0, size, size).unwrap()
}

/// Ring approximating a circle, to give the rasterizer many edges
fn circle(cx: f64, cy: f64, radius: f64, vertices: usize) -> Polygon {
    let ring = (0..vertices)
        .map(|i| {
            let angle = i as f64 / vertices as f64 * std::f64::consts::TAU;
            [cx + radius * angle.cos(), cy + radius * angle.sin()]
        })
        .collect();
    Polygon::new(ring)
}

fn benchmark_extent_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("extent_planning");
    for size in [2_048.0, 65_536.0] {
        let p = params(512, 0.15);
        let calculator = ExtentCalculator::new(&p, layer(size)).unwrap();
        let viewport = Extent::new(size * 0.1 + 0.3, size * 0.2 + 0.7, size * 0.6, size * 0.9).unwrap();
        group.bench_with_input(BenchmarkId::new("viewport", size as u64), &viewport, |b, v| {
            b.iter(|| black_box(calculator.compute(Some(v)).unwrap()));
        });
    }
    group.finish();
}

fn benchmark_mask_and_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("area_mask");
    group.sample_size(10);

    let p = params(256, 0.5);
    let extents = ExtentCalculator::new(&p, layer(8_192.0)).unwrap().compute(None).unwrap();
    let geometry = MaskGeometry::new(vec![
        circle(2_000.0, 2_000.0, 1_500.0, 256),
        circle(6_000.0, 5_000.0, 900.0, 128),
    ]);
    let rasterizer = ScanlineRasterizer;

    group.bench_function("rasterize_8192", |b| {
        b.iter(|| {
            black_box(
                AreaMaskEngine::new(&rasterizer)
                    .build(ProcessedAreaType::FromPolygons, Some(&geometry), &extents)
                    .unwrap(),
            )
        });
    });

    let mask = AreaMaskEngine::new(&rasterizer)
        .build(ProcessedAreaType::FromPolygons, Some(&geometry), &extents)
        .unwrap();
    let grid = TileGrid::new(&extents);
    group.bench_function("iterate_masked_tiles", |b| {
        b.iter(|| black_box(grid.tiles(&mask).count()));
    });
    group.bench_function("iterate_all_tiles", |b| {
        b.iter(|| black_box(grid.tiles(&AreaMask::Absent).count()));
    });
    group.finish();
}

fn benchmark_compositing(c: &mut Criterion) {
    let mut group = c.benchmark_group("compositing");
    group.sample_size(10);

    let p = params(256, 0.25);
    let extents = ExtentCalculator::new(&p, layer(2_048.0)).unwrap().compute(None).unwrap();
    let grid = TileGrid::new(&extents);
    let tile_output = Array3::from_elem((2, 256, 256), 0.5f32);

    for policy in [
        CompositionPolicy::CenterCrop,
        CompositionPolicy::Maximum,
        CompositionPolicy::Average,
    ] {
        group.bench_function(format!("{:?}", policy).to_lowercase(), |b| {
            b.iter(|| {
                let mut compositor = TileCompositor::new(policy, extents.grid, 1);
                for tile in grid.tiles(&AreaMask::Absent) {
                    compositor.add_tile(&tile, tile_output.view()).unwrap();
                }
                black_box(compositor.finish())
            });
        });
    }
    group.finish();
}

fn benchmark_end_to_end(c: &mut Criterion) {
    let mut group = c.benchmark_group("end_to_end");
    group.sample_size(10);

    let data = Array3::from_shape_fn((1, 1_024, 1_024), |(_, r, c)| ((r ^ c) & 0xff) as f32);
    let raster = Arc::new(InMemoryRaster::new(data, layer(1_024.0)).unwrap());
    group.bench_function("segmentation_1024", |b| {
        b.iter(|| {
            let mut model = BandThreshold::new(0, 128.0);
            black_box(geotiler::process_map(params(256, 0.15), raster.clone(), &mut model).unwrap())
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_extent_planning,
    benchmark_mask_and_iteration,
    benchmark_compositing,
    benchmark_end_to_end
);
criterion_main!(benches);
