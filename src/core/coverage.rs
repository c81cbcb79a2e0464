use crate::types::{CoverageMetrics, DemError, DemResult, ElevationGrid, FillStrategy, TileId};

/// Whether a sample counts as nodata. NaN is always nodata, whatever the
/// declared sentinel is.
pub fn is_nodata(value: f32, nodata: f64) -> bool {
    value.is_nan() || value as f64 == nodata
}

/// Number of nodata samples in a grid.
pub fn count_nodata(grid: &ElevationGrid, nodata: f64) -> u64 {
    grid.iter().filter(|&&v| is_nodata(v, nodata)).count() as u64
}

/// Valid fraction of a grid; an empty grid counts as fully covered.
pub fn coverage_ratio(nodata_count: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        (total - nodata_count) as f64 / total as f64
    }
}

/// Rewrite every sample matching one nodata convention to another.
pub fn remap_nodata(grid: &mut ElevationGrid, from: f64, to: f64) {
    if from == to {
        return;
    }
    for value in grid.iter_mut() {
        if is_nodata(*value, from) {
            *value = to as f32;
        }
    }
}

/// Assemble the per-tile accounting from before/after nodata counts.
pub fn build_metrics(
    total_pixels: u64,
    nodata_before: u64,
    nodata_after: u64,
    strategy: FillStrategy,
    elapsed_seconds: f64,
) -> CoverageMetrics {
    CoverageMetrics {
        total_pixels,
        nodata_before,
        nodata_after,
        coverage_before: coverage_ratio(nodata_before, total_pixels),
        coverage_after: coverage_ratio(nodata_after, total_pixels),
        filled_pixels: nodata_before.saturating_sub(nodata_after),
        strategy,
        elapsed_seconds,
    }
}

/// Enforce a consumer's full-coverage requirement for one tile.
pub fn require_full_coverage(tile: &TileId, metrics: &CoverageMetrics) -> DemResult<()> {
    if metrics.nodata_after > 0 {
        return Err(DemError::CoverageViolation(format!(
            "tile {} has {} nodata pixel(s) of {} after filling ({:.2}% coverage)",
            tile,
            metrics.nodata_after,
            metrics.total_pixels,
            metrics.coverage_after * 100.0
        )));
    }
    Ok(())
}
