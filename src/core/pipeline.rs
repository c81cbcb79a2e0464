use crate::core::coverage::{self, build_metrics, count_nodata};
use crate::core::extract::{extract_tile, tile_output_path, tile_window, TileWindow};
use crate::core::fill::apply_fill;
use crate::core::mosaic::{build_mosaic, Mosaic};
use crate::core::orchestrator;
use crate::core::prepare::{prepare_source, PreparedSource};
use crate::core::stack::{composite_layer, polygon_mask};
use crate::io::cache::{CacheLoad, CacheRecord, CachedTile};
use crate::io::fingerprint::Fingerprint;
use crate::io::raster::{RasterIo, RasterProfile};
use crate::types::{
    BackendProfile, CoverageMetrics, DemError, DemResult, DemStack, ElevationGrid, FillStrategy,
    NormalizationOptions, NormalizationRun, ResamplingMethod, TileId, TileResult, DEFAULT_NODATA,
};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Normalizes heterogeneous DEM sources into uniform per-degree tiles under
/// one output directory, reusing previous results where nothing changed.
pub struct DemNormalizer {
    output_dir: PathBuf,
    options: NormalizationOptions,
    profile: Option<BackendProfile>,
}

/// One stack layer ready for compositing: prepared raster, blend priority,
/// read-side nodata and AOI rings already in the target CRS.
struct PreparedLayer {
    prepared: PreparedSource,
    priority: i32,
    read_nodata: f64,
    rings: Option<Vec<Vec<(f64, f64)>>>,
}

/// What tiles are read from: a mosaic surface for plain source lists, an
/// ordered layer set for stack runs.
enum Surface {
    Mosaic(Mosaic),
    Stack(Vec<PreparedLayer>),
}

/// Everything a tile worker needs, shared read-only across the pool.
struct TileContext<'a> {
    options: &'a NormalizationOptions,
    profile: Option<&'a BackendProfile>,
    surface: &'a Surface,
    fallback: Option<&'a Mosaic>,
    output_nodata: f64,
    resolution: (f64, f64),
    output_dir: &'a Path,
}

impl DemNormalizer {
    /// Create a normalizer rooted at `output_dir` (created if missing).
    pub fn new<P: Into<PathBuf>>(output_dir: P) -> DemResult<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self {
            output_dir,
            options: NormalizationOptions::default(),
            profile: None,
        })
    }

    pub fn with_options(mut self, options: NormalizationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_profile(mut self, profile: BackendProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn options(&self) -> &NormalizationOptions {
        &self.options
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Normalize a plain, precedence-ordered list of sources.
    pub fn normalize(&self, sources: &[PathBuf], tiles: &[TileId]) -> DemResult<NormalizationRun> {
        self.run(sources, None, tiles)
    }

    /// Normalize a prioritized stack with optional per-layer AOIs and
    /// nodata overrides.
    pub fn normalize_stack(
        &self,
        stack: &DemStack,
        tiles: &[TileId],
    ) -> DemResult<NormalizationRun> {
        let sources = stack.source_paths();
        self.run(&sources, Some(stack), tiles)
    }

    fn run(
        &self,
        sources: &[PathBuf],
        stack: Option<&DemStack>,
        tiles: &[TileId],
    ) -> DemResult<NormalizationRun> {
        let started = Instant::now();
        let options = &self.options;

        log::info!(
            "🌍 Starting DEM normalization: {} source(s), {} tile(s)",
            sources.len(),
            tiles.len()
        );

        log::info!("📋 Step 1: Validating request");
        if sources.is_empty() {
            return Err(DemError::Validation(
                "at least one source is required".to_string(),
            ));
        }
        if options.fill_strategy == FillStrategy::Fallback && options.fallback_sources.is_empty() {
            return Err(DemError::Validation(
                "fill strategy 'fallback' requires fallback sources".to_string(),
            ));
        }
        if let Some((x, y)) = options.resolution {
            if x <= 0.0 || y <= 0.0 {
                return Err(DemError::Validation(format!(
                    "resolution must be positive, got ({}, {})",
                    x, y
                )));
            }
        }
        if let Some(profile) = &self.profile {
            if !RasterIo::crs_equivalent(&profile.required_crs, &options.target_crs) {
                return Err(DemError::Validation(format!(
                    "backend profile requires {} but the target CRS is {}",
                    profile.required_crs, options.target_crs
                )));
            }
        }

        let request = dedup_tiles(tiles);
        if request.len() != tiles.len() {
            log::debug!("Dropped {} duplicate tile id(s)", tiles.len() - request.len());
        }
        if request.is_empty() {
            log::warn!("No tiles requested, nothing to do");
            return Ok(NormalizationRun {
                sources: sources.to_vec(),
                target_crs: options.target_crs.clone(),
                ..Default::default()
            });
        }

        let source_profiles: Vec<RasterProfile> = sources
            .iter()
            .map(RasterIo::profile)
            .collect::<DemResult<_>>()?;
        if let Some(stack) = stack {
            for (layer, source_profile) in stack.layers.iter().zip(&source_profiles) {
                let resolvable = resolve_layer_nodata(
                    options,
                    layer.nodata_override,
                    self.profile.as_ref(),
                    source_profile.nodata,
                );
                if layer.aoi.is_some() && resolvable.is_none() {
                    return Err(DemError::Validation(format!(
                        "layer '{}' has an AOI but no resolvable nodata value",
                        layer.source.display()
                    )));
                }
            }
        }
        let output_nodata = resolve_output_nodata(
            options,
            self.profile.as_ref(),
            source_profiles.first().and_then(|p| p.nodata),
        );

        log::info!("🗂  Step 2: Consulting incremental cache");
        let sidecar = CacheRecord::path_for(&self.output_dir);
        let previous = match CacheRecord::load(&sidecar) {
            CacheLoad::Found(record)
                if record.compatible_with(sources, stack, options) && record.inputs_valid() =>
            {
                Some(record)
            }
            CacheLoad::Found(_) => {
                log::info!("Cached configuration or inputs changed, recomputing");
                None
            }
            CacheLoad::Absent | CacheLoad::Corrupt => None,
        };

        let mut hits: BTreeMap<TileId, CachedTile> = BTreeMap::new();
        let mut misses: Vec<TileId> = Vec::new();
        for tile in &request {
            match previous.as_deref().and_then(|r| r.valid_tile(tile)) {
                Some(entry) => {
                    hits.insert(*tile, entry.clone());
                }
                None => misses.push(*tile),
            }
        }
        let cache_hits = hits.len();
        if cache_hits > 0 {
            log::info!(
                "⚡ {} of {} tile(s) served from cache",
                cache_hits,
                request.len()
            );
        }

        if misses.is_empty() {
            if let Some(previous) = previous.as_deref() {
                if previous.mosaic_valid() {
                    let mut run = NormalizationRun {
                        sources: sources.to_vec(),
                        target_crs: options.target_crs.clone(),
                        mosaic_path: previous.mosaic_path.clone(),
                        cache_hits,
                        ..Default::default()
                    };
                    for tile in &request {
                        if let Some(entry) = hits.get(tile) {
                            run.tile_results.push(entry.result.clone());
                            if options.coverage_metrics {
                                if let Some(metrics) = &entry.coverage {
                                    run.coverage.insert(*tile, metrics.clone());
                                }
                            }
                        }
                    }
                    log::info!("✅ All {} requested tile(s) are up to date", cache_hits);
                    return Ok(run);
                }
                log::info!("Mosaic artifact changed, rebuilding the surface");
            }
        }

        log::info!("🔧 Step 3: Preparing {} source(s)", sources.len());
        let workdir = self.output_dir.join("work");
        std::fs::create_dir_all(&workdir)?;
        let prepared: Vec<PreparedSource> = sources
            .iter()
            .enumerate()
            .map(|(index, source)| {
                // Stack layers may carry their own nodata convention.
                let effective_nodata = match stack {
                    Some(stack) => resolve_layer_nodata(
                        options,
                        stack.layers[index].nodata_override,
                        self.profile.as_ref(),
                        source_profiles[index].nodata,
                    )
                    .unwrap_or(DEFAULT_NODATA),
                    None => output_nodata,
                };
                prepare_source(
                    source,
                    index,
                    &options.target_crs,
                    effective_nodata,
                    options,
                    &workdir,
                )
            })
            .collect::<DemResult<_>>()?;
        let resolution = match options.resolution {
            Some(resolution) => resolution,
            None => prepared[0].resolution,
        };

        let surface = match stack {
            Some(stack) => {
                log::info!("🗻 Step 4: Preparing {} stack layer(s)", stack.layers.len());
                Surface::Stack(prepare_layers(stack, &prepared, &options.target_crs)?)
            }
            None => {
                log::info!("🗺  Step 4: Building mosaic surface");
                Surface::Mosaic(build_mosaic(
                    &prepared,
                    options,
                    output_nodata,
                    resolution,
                    &options.target_crs,
                    &workdir,
                )?)
            }
        };

        let fallback_surface = if options.fill_strategy == FillStrategy::Fallback {
            log::info!(
                "🛟 Step 5: Preparing fallback surface from {} source(s)",
                options.fallback_sources.len()
            );
            let fallback_dir = workdir.join("fallback");
            std::fs::create_dir_all(&fallback_dir)?;
            let prepared_fallback: Vec<PreparedSource> = options
                .fallback_sources
                .iter()
                .enumerate()
                .map(|(index, source)| {
                    prepare_source(
                        source,
                        index,
                        &options.target_crs,
                        output_nodata,
                        options,
                        &fallback_dir,
                    )
                })
                .collect::<DemResult<_>>()?;
            Some(build_mosaic(
                &prepared_fallback,
                options,
                output_nodata,
                resolution,
                &options.target_crs,
                &fallback_dir,
            )?)
        } else {
            None
        };

        log::info!("⚙️  Step 6: Processing {} tile(s)", misses.len());
        let ctx = TileContext {
            options,
            profile: self.profile.as_ref(),
            surface: &surface,
            fallback: fallback_surface.as_ref(),
            output_nodata,
            resolution,
            output_dir: &self.output_dir,
        };
        let outcomes =
            orchestrator::run_tile_jobs(options.tile_jobs, &misses, |tile| {
                process_tile(tile, &ctx)
            })?;

        let mut errors: BTreeMap<TileId, String> = BTreeMap::new();
        let mut fresh: BTreeMap<TileId, (TileResult, CoverageMetrics)> = BTreeMap::new();
        for (tile, outcome) in misses.iter().zip(outcomes) {
            match outcome {
                Ok(pair) => {
                    fresh.insert(*tile, pair);
                }
                Err(e) if options.continue_on_error => {
                    log::warn!("Tile {} failed: {}", tile, e);
                    errors.insert(*tile, e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        log::info!("🗂  Step 7: Recording results in cache sidecar");
        let mut record = CacheRecord::new(sources.to_vec(), stack.cloned(), options.clone());
        record.requested_tiles = request.clone();
        if let Some(previous) = &previous {
            // Union with earlier results; entries are revalidated on use.
            record.tiles = previous.tiles.clone();
        }
        for (tile, (result, metrics)) in &fresh {
            let fingerprint = Fingerprint::capture(&result.output_path, options.cache_validation)?;
            record.tiles.insert(
                *tile,
                CachedTile {
                    result: result.clone(),
                    fingerprint,
                    coverage: options.coverage_metrics.then(|| metrics.clone()),
                },
            );
        }
        // Fallback files count as inputs only when the strategy reads them.
        let fallback_inputs: &[PathBuf] = if options.fill_strategy == FillStrategy::Fallback {
            &options.fallback_sources
        } else {
            &[]
        };
        for path in sources.iter().chain(fallback_inputs) {
            record
                .input_fingerprints
                .insert(path.clone(), Fingerprint::capture(path, options.cache_validation)?);
        }
        if let Surface::Mosaic(mosaic) = &surface {
            if let Some(path) = mosaic.artifact_path() {
                record.mosaic_path = Some(path.to_path_buf());
                record.mosaic_fingerprint =
                    Some(Fingerprint::capture(path, options.cache_validation)?);
            }
        }
        record.store(&sidecar)?;

        let mut run = NormalizationRun {
            sources: sources.to_vec(),
            target_crs: options.target_crs.clone(),
            mosaic_path: match &surface {
                Surface::Mosaic(mosaic) => mosaic.artifact_path().map(Path::to_path_buf),
                Surface::Stack(_) => None,
            },
            tile_results: Vec::new(),
            coverage: BTreeMap::new(),
            errors,
            cache_hits,
        };
        for tile in &request {
            if let Some((result, metrics)) = fresh.get(tile) {
                run.tile_results.push(result.clone());
                if options.coverage_metrics {
                    run.coverage.insert(*tile, metrics.clone());
                }
            } else if let Some(entry) = hits.get(tile) {
                run.tile_results.push(entry.result.clone());
                if options.coverage_metrics {
                    if let Some(metrics) = &entry.coverage {
                        run.coverage.insert(*tile, metrics.clone());
                    }
                }
            }
        }

        log::info!(
            "🎉 Normalization complete: {} tile(s) written, {} from cache, {} failed in {:.2}s",
            fresh.len(),
            cache_hits,
            run.errors.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(run)
    }
}

/// Output nodata resolution order: explicit option, then backend profile,
/// then the first source's declared value, then the SRTM convention.
fn resolve_output_nodata(
    options: &NormalizationOptions,
    profile: Option<&BackendProfile>,
    first_source_nodata: Option<f64>,
) -> f64 {
    options
        .dst_nodata
        .or_else(|| profile.and_then(|p| p.required_nodata))
        .or(first_source_nodata)
        .unwrap_or(DEFAULT_NODATA)
}

/// Per-layer variant of the chain: the layer's own nodata ranks just below
/// an explicit option override. `None` when nothing supplies a value.
fn resolve_layer_nodata(
    options: &NormalizationOptions,
    layer_override: Option<f64>,
    profile: Option<&BackendProfile>,
    declared: Option<f64>,
) -> Option<f64> {
    options
        .dst_nodata
        .or(layer_override)
        .or_else(|| profile.and_then(|p| p.required_nodata))
        .or(declared)
}

fn dedup_tiles(tiles: &[TileId]) -> Vec<TileId> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::with_capacity(tiles.len());
    for tile in tiles {
        if seen.insert(*tile) {
            out.push(*tile);
        }
    }
    out
}

fn prepare_layers(
    stack: &DemStack,
    prepared: &[PreparedSource],
    target_crs: &str,
) -> DemResult<Vec<PreparedLayer>> {
    let mut layers = Vec::with_capacity(prepared.len());
    for (layer, source) in stack.layers.iter().zip(prepared.iter()) {
        let rings = match &layer.aoi {
            Some(aoi) => {
                let mut rings = aoi.rings.clone();
                if !RasterIo::crs_equivalent(&aoi.crs, target_crs) {
                    for ring in &mut rings {
                        RasterIo::transform_points(ring, &aoi.crs, target_crs)?;
                    }
                }
                Some(rings)
            }
            None => None,
        };
        // A warped copy already carries the layer's effective nodata; the
        // override only redefines how the original file is read.
        let read_nodata = if source.reprojected {
            source.read_nodata
        } else {
            layer.nodata_override.unwrap_or(source.read_nodata)
        };
        layers.push(PreparedLayer {
            prepared: source.clone(),
            priority: layer.priority,
            read_nodata,
            rings,
        });
    }
    // Stable, so declaration order breaks priority ties.
    layers.sort_by_key(|layer| layer.priority);
    Ok(layers)
}

fn process_tile(tile: &TileId, ctx: &TileContext) -> DemResult<(TileResult, CoverageMetrics)> {
    let started = Instant::now();
    let window = tile_window(tile, &ctx.options.target_crs, ctx.resolution)?;

    let mut grid = match ctx.surface {
        Surface::Mosaic(mosaic) => extract_tile(
            mosaic,
            &window,
            ctx.output_nodata,
            ctx.options.mosaic_precedence,
            ctx.options.resampling,
        )?,
        Surface::Stack(layers) => {
            composite_stack_tile(layers, &window, ctx.output_nodata, ctx.options.resampling)?
        }
    };

    let total = grid.len() as u64;
    let nodata_before = count_nodata(&grid, ctx.output_nodata);

    // A gapless tile skips filling entirely, including the fallback read.
    if nodata_before > 0 {
        let fallback_grid = match (ctx.options.fill_strategy, ctx.fallback) {
            (FillStrategy::Fallback, Some(surface)) => Some(extract_tile(
                surface,
                &window,
                ctx.output_nodata,
                ctx.options.mosaic_precedence,
                ctx.options.resampling,
            )?),
            _ => None,
        };
        apply_fill(
            &mut grid,
            ctx.options.fill_strategy,
            ctx.output_nodata,
            ctx.options.fill_value,
            fallback_grid.as_ref().map(|grid| (grid, ctx.output_nodata)),
        )?;
    }

    let nodata_after = count_nodata(&grid, ctx.output_nodata);
    let metrics = build_metrics(
        total,
        nodata_before,
        nodata_after,
        ctx.options.fill_strategy,
        started.elapsed().as_secs_f64(),
    );
    if let Some(profile) = ctx.profile {
        if profile.require_full_coverage {
            coverage::require_full_coverage(tile, &metrics)?;
        }
    }

    let output_path = tile_output_path(ctx.output_dir, tile);
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    RasterIo::write_geotiff(
        &output_path,
        &grid,
        &window.transform,
        &ctx.options.target_crs,
        ctx.output_nodata,
        ctx.options.compression,
    )?;
    log::debug!(
        "Tile {} written ({:.1}% coverage)",
        tile,
        metrics.coverage_after * 100.0
    );

    Ok((
        TileResult {
            tile: *tile,
            output_path,
            bounds: window.bounds,
            resolution: ctx.resolution,
            nodata: ctx.output_nodata,
        },
        metrics,
    ))
}

/// Blend stack layers over a tile window in ascending priority order.
fn composite_stack_tile(
    layers: &[PreparedLayer],
    window: &TileWindow,
    output_nodata: f64,
    resampling: ResamplingMethod,
) -> DemResult<ElevationGrid> {
    let (width, height) = window.size;
    let mut grid = Array2::from_elem((height, width), output_nodata as f32);
    for layer in layers {
        if layer.prepared.bounds.intersection(&window.bounds).is_none() {
            continue;
        }
        let dataset = RasterIo::open(&layer.prepared.path)?;
        let patch = RasterIo::read_bounds_resampled(
            &dataset,
            &window.bounds,
            window.size,
            layer.read_nodata,
            resampling,
        )?;
        let mask = layer
            .rings
            .as_ref()
            .map(|rings| polygon_mask(rings, &window.transform, grid.dim()));
        composite_layer(&mut grid, &patch, layer.read_nodata, mask.as_ref())?;
    }
    Ok(grid)
}
