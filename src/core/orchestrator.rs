use crate::types::{DemError, DemResult, TileId};
use rayon::prelude::*;

/// Worker count for a run: 0 means one per available core, and there is
/// never a point in more workers than tiles.
pub fn resolve_jobs(requested: usize, tile_count: usize) -> usize {
    let cap = tile_count.max(1);
    match requested {
        0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(cap),
        n => n.min(cap),
    }
}

/// Run one task per tile on a dedicated pool, returning per-tile outcomes
/// in request order regardless of completion order. A single worker runs
/// inline without spawning a pool.
pub fn run_tile_jobs<T, F>(jobs: usize, tiles: &[TileId], task: F) -> DemResult<Vec<DemResult<T>>>
where
    T: Send,
    F: Fn(&TileId) -> DemResult<T> + Sync,
{
    let workers = resolve_jobs(jobs, tiles.len());
    if workers <= 1 {
        log::debug!("Processing {} tile(s) sequentially", tiles.len());
        return Ok(tiles.iter().map(&task).collect());
    }

    log::info!(
        "Processing {} tile(s) on {} worker(s)",
        tiles.len(),
        workers
    );
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| DemError::Processing(format!("failed to build worker pool: {}", e)))?;

    let mut indexed: Vec<(usize, DemResult<T>)> = pool.install(|| {
        tiles
            .par_iter()
            .enumerate()
            .map(|(index, tile)| (index, task(tile)))
            .collect()
    });
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, result)| result).collect())
}
