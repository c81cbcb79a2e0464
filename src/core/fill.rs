use crate::core::coverage::is_nodata;
use crate::types::{DemError, DemResult, ElevationGrid, FillStrategy};
use ndarray::Array2;

/// Replace every nodata sample with a constant. Returns the number of
/// samples written.
pub fn fill_constant(grid: &mut ElevationGrid, nodata: f64, fill_value: f64) -> u64 {
    let mut filled = 0;
    for value in grid.iter_mut() {
        if is_nodata(*value, nodata) {
            *value = fill_value as f32;
            filled += 1;
        }
    }
    filled
}

/// Grow values into gaps by iterative neighbor averaging.
///
/// A gap pixel takes the mean of its valid 8-neighbors once at least three
/// of them are valid. Each sweep reads only the state the previous sweep
/// left, so fresh fills start contributing one sweep later; sweeps repeat
/// until nothing changes or the iteration cap is hit. Gaps the growth never
/// reaches, and gaps on the grid border, stay nodata; valid samples are
/// never rewritten.
pub fn fill_interpolate(grid: &mut ElevationGrid, nodata: f64) -> u64 {
    let (height, width) = grid.dim();
    if height < 3 || width < 3 {
        return 0;
    }

    let mut void_mask = Array2::from_elem((height, width), false);
    let mut void_count = 0u64;
    for i in 0..height {
        for j in 0..width {
            if is_nodata(grid[[i, j]], nodata) {
                void_mask[[i, j]] = true;
                void_count += 1;
            }
        }
    }
    log::debug!(
        "Found {} void pixels ({:.2}%)",
        void_count,
        void_count as f64 / (height * width) as f64 * 100.0
    );
    if void_count == 0 {
        return 0;
    }

    let mut filled_count = 0u64;
    let max_iterations = 10;
    for iteration in 0..max_iterations {
        let mut new_grid = grid.clone();
        let mut filled: Vec<(usize, usize)> = Vec::new();

        for i in 1..height - 1 {
            for j in 1..width - 1 {
                if !void_mask[[i, j]] {
                    continue;
                }
                let mut sum = 0.0f32;
                let mut count = 0u32;
                for di in -1i32..=1 {
                    for dj in -1i32..=1 {
                        if di == 0 && dj == 0 {
                            continue;
                        }
                        let ni = (i as i32 + di) as usize;
                        let nj = (j as i32 + dj) as usize;
                        if !void_mask[[ni, nj]] {
                            sum += grid[[ni, nj]];
                            count += 1;
                        }
                    }
                }
                // Need at least 3 valid neighbors
                if count >= 3 {
                    new_grid[[i, j]] = sum / count as f32;
                    filled.push((i, j));
                }
            }
        }

        *grid = new_grid;
        // Masks flip only between sweeps; the neighbor reads above never
        // observe a value written during their own sweep.
        for &(i, j) in &filled {
            void_mask[[i, j]] = false;
        }
        filled_count += filled.len() as u64;
        if filled.is_empty() {
            break;
        }
        log::debug!("Iteration {}: filled {} pixels", iteration + 1, filled_count);
    }

    filled_count
}

/// Overlay fallback elevations onto nodata samples.
///
/// Valid samples keep their exact values; a gap is only written where the
/// fallback itself has data. Grids must share dimensions.
pub fn fill_from_fallback(
    grid: &mut ElevationGrid,
    nodata: f64,
    fallback: &ElevationGrid,
    fallback_nodata: f64,
) -> DemResult<u64> {
    if grid.dim() != fallback.dim() {
        return Err(DemError::Processing(format!(
            "fallback grid is {:?} but tile grid is {:?}",
            fallback.dim(),
            grid.dim()
        )));
    }
    let mut filled = 0;
    for (value, &candidate) in grid.iter_mut().zip(fallback.iter()) {
        if is_nodata(*value, nodata) && !is_nodata(candidate, fallback_nodata) {
            *value = candidate;
            filled += 1;
        }
    }
    Ok(filled)
}

/// Dispatch on the configured strategy. `fallback` must be present for
/// `FillStrategy::Fallback` and carries its own nodata convention.
pub fn apply_fill(
    grid: &mut ElevationGrid,
    strategy: FillStrategy,
    nodata: f64,
    fill_value: f64,
    fallback: Option<(&ElevationGrid, f64)>,
) -> DemResult<u64> {
    match strategy {
        FillStrategy::None => Ok(0),
        FillStrategy::Constant => Ok(fill_constant(grid, nodata, fill_value)),
        FillStrategy::Interpolate => Ok(fill_interpolate(grid, nodata)),
        FillStrategy::Fallback => {
            let (fallback_grid, fallback_nodata) = fallback.ok_or_else(|| {
                DemError::Validation(
                    "fill strategy 'fallback' requires fallback sources".to_string(),
                )
            })?;
            fill_from_fallback(grid, nodata, fallback_grid, fallback_nodata)
        }
    }
}
