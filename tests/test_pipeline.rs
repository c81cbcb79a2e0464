use approx::assert_abs_diff_eq;
use demprep::{
    BackendProfile, BoundingBox, Compression, DemError, DemNormalizer, GeoTransform,
    MosaicMode, MosaicPrecedence, NormalizationOptions, RasterIo, ResamplingMethod, TileId,
};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_raster(path: &Path, bounds: BoundingBox, size: (usize, usize), value: f32, nodata: f64) {
    let (width, height) = size;
    let grid = Array2::from_elem((height, width), value);
    let resolution = (
        bounds.width() / width as f64,
        bounds.height() / height as f64,
    );
    let transform = GeoTransform::north_up(&bounds, resolution);
    RasterIo::write_geotiff(path, &grid, &transform, "EPSG:4326", nodata, Compression::None)
        .expect("Failed to write test raster");
}

fn read_tile(path: &Path) -> Array2<f32> {
    let dataset = RasterIo::open(path).expect("Failed to open tile output");
    let (grid, _) = RasterIo::read_full(&dataset).expect("Failed to read tile output");
    grid
}

fn sequential_options() -> NormalizationOptions {
    let mut options = NormalizationOptions::default();
    options.tile_jobs = 1;
    options
}

#[test]
fn test_normalize_single_source_end_to_end() {
    let _ = env_logger::try_init();

    let dir = TempDir::new().expect("Failed to create temp directory");
    let source = dir.path().join("alps.tif");
    // Two degrees of longitude at 0.1 degree pixels.
    write_raster(
        &source,
        BoundingBox {
            min_lon: 7.0,
            max_lon: 9.0,
            min_lat: 46.0,
            max_lat: 47.0,
        },
        (20, 10),
        500.0,
        -32768.0,
    );

    let out_dir = dir.path().join("out");
    let normalizer = DemNormalizer::new(&out_dir)
        .expect("Failed to create normalizer")
        .with_options(sequential_options());

    let tiles: Vec<TileId> = vec!["+46+007".parse().unwrap(), "+46+008".parse().unwrap()];
    let run = normalizer
        .normalize(&[source.clone()], &tiles)
        .expect("Normalization failed");

    assert_eq!(run.tile_results.len(), 2);
    assert_eq!(run.cache_hits, 0);
    assert!(run.errors.is_empty());
    // A single source never materializes a mosaic artifact.
    assert!(run.mosaic_path.is_none());

    for (result, tile) in run.tile_results.iter().zip(&tiles) {
        assert_eq!(result.tile, *tile);
        let expected = out_dir
            .join(tile.to_string())
            .join(format!("{}.tif", tile));
        assert_eq!(result.output_path, expected);
        assert!(expected.exists(), "missing output for {}", tile);

        let profile = RasterIo::profile(&expected).expect("Failed to profile tile");
        assert_eq!(profile.width, 10);
        assert_eq!(profile.height, 10);
        assert_eq!(profile.crs.as_deref(), Some("EPSG:4326"));
        assert_eq!(profile.nodata, Some(-32768.0));

        let grid = read_tile(&expected);
        assert!(grid.iter().all(|&v| v == 500.0));

        let metrics = run.coverage.get(tile).expect("missing coverage entry");
        assert_eq!(metrics.total_pixels, 100);
        assert_eq!(metrics.nodata_after, 0);
        assert_eq!(metrics.coverage_after, 1.0);
    }
}

#[test]
fn test_second_run_is_served_from_cache() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let source = dir.path().join("dem.tif");
    write_raster(
        &source,
        BoundingBox {
            min_lon: 7.0,
            max_lon: 8.0,
            min_lat: 46.0,
            max_lat: 47.0,
        },
        (10, 10),
        321.0,
        -32768.0,
    );

    let out_dir = dir.path().join("out");
    let options = sequential_options();
    let tiles: Vec<TileId> = vec!["+46+007".parse().unwrap()];

    let first = DemNormalizer::new(&out_dir)
        .expect("Failed to create normalizer")
        .with_options(options.clone())
        .normalize(&[source.clone()], &tiles)
        .expect("First run failed");
    assert_eq!(first.cache_hits, 0);

    // A fresh normalizer with identical configuration must reuse everything.
    let second = DemNormalizer::new(&out_dir)
        .expect("Failed to create normalizer")
        .with_options(options)
        .normalize(&[source], &tiles)
        .expect("Second run failed");
    assert_eq!(second.cache_hits, 1);
    assert_eq!(second.tile_results.len(), 1);
    assert_eq!(second.tile_results[0].tile, tiles[0]);
}

#[test]
fn test_source_edit_invalidates_cache() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let source = dir.path().join("dem.tif");
    let bounds = BoundingBox {
        min_lon: 7.0,
        max_lon: 8.0,
        min_lat: 46.0,
        max_lat: 47.0,
    };
    write_raster(&source, bounds, (10, 10), 500.0, -32768.0);

    let out_dir = dir.path().join("out");
    let options = sequential_options();
    let tiles: Vec<TileId> = vec!["+46+007".parse().unwrap()];

    DemNormalizer::new(&out_dir)
        .expect("Failed to create normalizer")
        .with_options(options.clone())
        .normalize(&[source.clone()], &tiles)
        .expect("First run failed");

    // Rewriting the source bumps its mtime, so cached tiles must be redone.
    // The rewrite keeps the file size, so the mtime has to tick.
    std::thread::sleep(std::time::Duration::from_millis(20));
    write_raster(&source, bounds, (10, 10), 600.0, -32768.0);
    let rerun = DemNormalizer::new(&out_dir)
        .expect("Failed to create normalizer")
        .with_options(options)
        .normalize(&[source], &tiles)
        .expect("Second run failed");
    assert_eq!(rerun.cache_hits, 0);

    let grid = read_tile(&rerun.tile_results[0].output_path);
    assert!(grid.iter().all(|&v| v == 600.0));
}

#[test]
fn test_resampling_change_invalidates_cache() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let source = dir.path().join("dem.tif");
    write_raster(
        &source,
        BoundingBox {
            min_lon: 7.0,
            max_lon: 8.0,
            min_lat: 46.0,
            max_lat: 47.0,
        },
        (10, 10),
        500.0,
        -32768.0,
    );

    let out_dir = dir.path().join("out");
    let tiles: Vec<TileId> = vec!["+46+007".parse().unwrap()];

    let options = sequential_options();
    DemNormalizer::new(&out_dir)
        .expect("Failed to create normalizer")
        .with_options(options.clone())
        .normalize(&[source.clone()], &tiles)
        .expect("First run failed");

    let mut changed = options;
    changed.resampling = ResamplingMethod::Nearest;
    let rerun = DemNormalizer::new(&out_dir)
        .expect("Failed to create normalizer")
        .with_options(changed)
        .normalize(&[source], &tiles)
        .expect("Second run failed");
    assert_eq!(rerun.cache_hits, 0);
}

#[test]
fn test_mosaic_precedence_controls_overlap() {
    let _ = env_logger::try_init();

    let dir = TempDir::new().expect("Failed to create temp directory");
    let west = dir.path().join("west.tif");
    let east = dir.path().join("east.tif");
    write_raster(
        &west,
        BoundingBox {
            min_lon: 0.0,
            max_lon: 2.0,
            min_lat: 0.0,
            max_lat: 1.0,
        },
        (20, 10),
        100.0,
        -32768.0,
    );
    write_raster(
        &east,
        BoundingBox {
            min_lon: 1.0,
            max_lon: 3.0,
            min_lat: 0.0,
            max_lat: 1.0,
        },
        (20, 10),
        200.0,
        -32768.0,
    );
    let sources = vec![west, east];
    let tiles: Vec<TileId> = vec![
        "+00+000".parse().unwrap(),
        "+00+001".parse().unwrap(),
        "+00+002".parse().unwrap(),
    ];

    let run_with = |precedence: MosaicPrecedence, out_dir: PathBuf| {
        let mut options = sequential_options();
        options.mosaic_precedence = precedence;
        DemNormalizer::new(out_dir)
            .expect("Failed to create normalizer")
            .with_options(options)
            .normalize(&sources, &tiles)
            .expect("Normalization failed")
    };

    // First-wins: the earlier listed source keeps the overlap degree.
    let first = run_with(MosaicPrecedence::First, dir.path().join("first"));
    assert!(first.mosaic_path.is_some(), "full mosaic should be materialized");
    let values: Vec<f32> = first
        .tile_results
        .iter()
        .map(|r| read_tile(&r.output_path)[[5, 5]])
        .collect();
    assert_eq!(values, vec![100.0, 100.0, 200.0]);

    // Last-wins: the later source paints over the overlap.
    let last = run_with(MosaicPrecedence::Last, dir.path().join("last"));
    let values: Vec<f32> = last
        .tile_results
        .iter()
        .map(|r| read_tile(&r.output_path)[[5, 5]])
        .collect();
    assert_eq!(values, vec![100.0, 200.0, 200.0]);
}

#[test]
fn test_vrt_and_per_tile_strategies_match_full_mosaic() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let west = dir.path().join("west.tif");
    let east = dir.path().join("east.tif");
    write_raster(
        &west,
        BoundingBox {
            min_lon: 0.0,
            max_lon: 2.0,
            min_lat: 0.0,
            max_lat: 1.0,
        },
        (20, 10),
        100.0,
        -32768.0,
    );
    write_raster(
        &east,
        BoundingBox {
            min_lon: 1.0,
            max_lon: 3.0,
            min_lat: 0.0,
            max_lat: 1.0,
        },
        (20, 10),
        200.0,
        -32768.0,
    );
    let sources = vec![west, east];
    let tiles: Vec<TileId> = vec!["+00+001".parse().unwrap()];

    let run_with = |strategy: MosaicMode, out_dir: PathBuf| {
        let mut options = sequential_options();
        options.mosaic_strategy = strategy;
        DemNormalizer::new(out_dir)
            .expect("Failed to create normalizer")
            .with_options(options)
            .normalize(&sources, &tiles)
            .expect("Normalization failed")
    };

    let full = run_with(MosaicMode::Full, dir.path().join("full"));
    let vrt = run_with(MosaicMode::Vrt, dir.path().join("vrt"));
    let per_tile = run_with(MosaicMode::PerTile, dir.path().join("per_tile"));

    let vrt_path = vrt.mosaic_path.as_ref().expect("vrt strategy should record an artifact");
    assert_eq!(vrt_path.extension().and_then(|e| e.to_str()), Some("vrt"));
    assert!(per_tile.mosaic_path.is_none());

    let reference = read_tile(&full.tile_results[0].output_path);
    for run in [&vrt, &per_tile] {
        let grid = read_tile(&run.tile_results[0].output_path);
        assert_eq!(grid, reference);
    }
}

#[test]
fn test_reprojected_source_lands_on_target_grid() {
    let _ = env_logger::try_init();

    let dir = TempDir::new().expect("Failed to create temp directory");
    let source = dir.path().join("mercator.tif");

    // A web mercator source padded past the tile so warp edges stay valid.
    let geographic = BoundingBox {
        min_lon: 6.9,
        max_lon: 8.1,
        min_lat: 45.9,
        max_lat: 47.1,
    };
    let mercator = RasterIo::transform_bounds(&geographic, "EPSG:4326", "EPSG:3857")
        .expect("Failed to transform bounds");
    let grid = Array2::from_elem((120, 120), 500.0f32);
    let resolution = (mercator.width() / 120.0, mercator.height() / 120.0);
    let transform = GeoTransform::north_up(&mercator, resolution);
    RasterIo::write_geotiff(
        &source,
        &grid,
        &transform,
        "EPSG:3857",
        -32768.0,
        Compression::None,
    )
    .expect("Failed to write mercator raster");

    let mut options = sequential_options();
    options.resolution = Some((0.01, 0.01));
    let out_dir = dir.path().join("out");
    let run = DemNormalizer::new(&out_dir)
        .expect("Failed to create normalizer")
        .with_options(options)
        .normalize(&[source], &["+46+007".parse().unwrap()])
        .expect("Normalization failed");

    let result = &run.tile_results[0];
    let profile = RasterIo::profile(&result.output_path).expect("Failed to profile tile");
    assert_eq!(profile.crs.as_deref(), Some("EPSG:4326"));
    assert_eq!(profile.width, 100);
    assert_eq!(profile.height, 100);

    let tile = read_tile(&result.output_path);
    // A uniform plateau must survive the warp untouched.
    for v in tile.iter() {
        assert_abs_diff_eq!(*v, 500.0, epsilon = 1e-3);
    }
    let metrics = run.coverage.get(&result.tile).expect("missing coverage");
    assert_eq!(metrics.nodata_after, 0);
}

#[test]
fn test_coverage_profile_with_continue_on_error() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let source = dir.path().join("dem.tif");
    write_raster(
        &source,
        BoundingBox {
            min_lon: 7.0,
            max_lon: 8.0,
            min_lat: 46.0,
            max_lat: 47.0,
        },
        (10, 10),
        500.0,
        -32768.0,
    );

    let mut options = sequential_options();
    options.continue_on_error = true;
    let profile = BackendProfile {
        required_crs: "EPSG:4326".to_string(),
        required_nodata: None,
        require_full_coverage: true,
    };

    let out_dir = dir.path().join("out");
    let covered: TileId = "+46+007".parse().unwrap();
    let empty: TileId = "+46+008".parse().unwrap();
    let tiles = vec![covered, empty];

    let run = DemNormalizer::new(&out_dir)
        .expect("Failed to create normalizer")
        .with_options(options.clone())
        .with_profile(profile.clone())
        .normalize(&[source.clone()], &tiles)
        .expect("Run should isolate the failing tile");

    assert_eq!(run.tile_results.len(), 1);
    assert_eq!(run.tile_results[0].tile, covered);
    let message = run.errors.get(&empty).expect("empty tile should be recorded");
    assert!(message.contains("coverage"), "unexpected error: {}", message);

    // The good tile is cached; the failed one is attempted again.
    let rerun = DemNormalizer::new(&out_dir)
        .expect("Failed to create normalizer")
        .with_options(options)
        .with_profile(profile)
        .normalize(&[source], &tiles)
        .expect("Second run failed");
    assert_eq!(rerun.cache_hits, 1);
    assert_eq!(rerun.errors.len(), 1);
}

#[test]
fn test_full_coverage_violation_fails_fast() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let source = dir.path().join("dem.tif");
    write_raster(
        &source,
        BoundingBox {
            min_lon: 7.0,
            max_lon: 8.0,
            min_lat: 46.0,
            max_lat: 47.0,
        },
        (10, 10),
        500.0,
        -32768.0,
    );

    let profile = BackendProfile {
        required_crs: "EPSG:4326".to_string(),
        required_nodata: None,
        require_full_coverage: true,
    };
    let result = DemNormalizer::new(dir.path().join("out"))
        .expect("Failed to create normalizer")
        .with_options(sequential_options())
        .with_profile(profile)
        .normalize(&[source], &["+46+008".parse().unwrap()]);

    match result {
        Err(DemError::CoverageViolation(message)) => {
            assert!(message.contains("+46+008"));
        }
        other => panic!("expected a coverage violation, got {:?}", other),
    }
}

#[test]
fn test_empty_requests() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let source = dir.path().join("dem.tif");
    write_raster(
        &source,
        BoundingBox {
            min_lon: 7.0,
            max_lon: 8.0,
            min_lat: 46.0,
            max_lat: 47.0,
        },
        (10, 10),
        500.0,
        -32768.0,
    );

    let normalizer = DemNormalizer::new(dir.path().join("out"))
        .expect("Failed to create normalizer")
        .with_options(sequential_options());

    // No tiles: a successful no-op.
    let run = normalizer
        .normalize(&[source], &[])
        .expect("Empty tile request should succeed");
    assert!(run.tile_results.is_empty());
    assert!(run.errors.is_empty());

    // No sources: rejected up front.
    let tile: TileId = "+46+007".parse().unwrap();
    match normalizer.normalize(&[], &[tile]) {
        Err(DemError::Validation(_)) => {}
        other => panic!("expected a validation error, got {:?}", other),
    }
}

#[test]
fn test_duplicate_tiles_processed_once() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let source = dir.path().join("dem.tif");
    write_raster(
        &source,
        BoundingBox {
            min_lon: 7.0,
            max_lon: 8.0,
            min_lat: 46.0,
            max_lat: 47.0,
        },
        (10, 10),
        500.0,
        -32768.0,
    );

    let tile: TileId = "+46+007".parse().unwrap();
    let run = DemNormalizer::new(dir.path().join("out"))
        .expect("Failed to create normalizer")
        .with_options(sequential_options())
        .normalize(&[source], &[tile, tile, tile])
        .expect("Normalization failed");
    assert_eq!(run.tile_results.len(), 1);
}

#[test]
fn test_parallel_matches_sequential() {
    let _ = env_logger::try_init();

    let dir = TempDir::new().expect("Failed to create temp directory");
    let source = dir.path().join("wide.tif");
    write_raster(
        &source,
        BoundingBox {
            min_lon: 0.0,
            max_lon: 3.0,
            min_lat: 0.0,
            max_lat: 1.0,
        },
        (30, 10),
        250.0,
        -32768.0,
    );
    let tiles: Vec<TileId> = vec![
        "+00+000".parse().unwrap(),
        "+00+001".parse().unwrap(),
        "+00+002".parse().unwrap(),
    ];

    let mut sequential = sequential_options();
    sequential.tile_jobs = 1;
    let seq_run = DemNormalizer::new(dir.path().join("seq"))
        .expect("Failed to create normalizer")
        .with_options(sequential)
        .normalize(&[source.clone()], &tiles)
        .expect("Sequential run failed");

    let mut parallel = sequential_options();
    parallel.tile_jobs = 2;
    let par_run = DemNormalizer::new(dir.path().join("par"))
        .expect("Failed to create normalizer")
        .with_options(parallel)
        .normalize(&[source], &tiles)
        .expect("Parallel run failed");

    assert_eq!(seq_run.tile_results.len(), par_run.tile_results.len());
    for (seq, par) in seq_run.tile_results.iter().zip(&par_run.tile_results) {
        // Results come back in request order either way.
        assert_eq!(seq.tile, par.tile);
        assert_eq!(read_tile(&seq.output_path), read_tile(&par.output_path));
    }
}

#[test]
fn test_negative_resolution_is_rejected() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let source = dir.path().join("dem.tif");
    write_raster(
        &source,
        BoundingBox {
            min_lon: 7.0,
            max_lon: 8.0,
            min_lat: 46.0,
            max_lat: 47.0,
        },
        (10, 10),
        500.0,
        -32768.0,
    );

    let mut options = sequential_options();
    options.resolution = Some((-0.01, 0.01));
    let tile: TileId = "+46+007".parse().unwrap();
    match DemNormalizer::new(dir.path().join("out"))
        .expect("Failed to create normalizer")
        .with_options(options)
        .normalize(&[source], &[tile])
    {
        Err(DemError::Validation(message)) => {
            assert!(message.contains("resolution"), "unexpected message: {}", message)
        }
        other => panic!("expected a validation error, got {:?}", other),
    }
}
