use crate::core::coverage::is_nodata;
use crate::types::{DemError, DemResult, ElevationGrid, GeoTransform};
use ndarray::Array2;

/// Rasterize polygon rings onto a grid using the even-odd rule, testing each
/// pixel center. `grid_dim` is `(rows, cols)` as returned by `Array2::dim`.
///
/// Ring vertices must already be in the grid's coordinate system.
pub fn polygon_mask(
    rings: &[Vec<(f64, f64)>],
    transform: &GeoTransform,
    grid_dim: (usize, usize),
) -> Array2<bool> {
    let (height, width) = grid_dim;
    let mut mask = Array2::from_elem((height, width), false);
    for row in 0..height {
        for col in 0..width {
            let (x, y) = transform.pixel_to_geo(col as f64 + 0.5, row as f64 + 0.5);
            mask[[row, col]] = point_in_rings(x, y, rings);
        }
    }
    mask
}

fn point_in_rings(x: f64, y: f64, rings: &[Vec<(f64, f64)>]) -> bool {
    let mut inside = false;
    for ring in rings {
        let n = ring.len();
        if n < 3 {
            continue;
        }
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = ring[i];
            let (xj, yj) = ring[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
    }
    inside
}

/// Paint a layer's valid samples over the base grid, optionally restricted
/// by a mask. Nodata in the layer never erases base data. Returns the number
/// of samples painted.
pub fn composite_layer(
    base: &mut ElevationGrid,
    layer: &ElevationGrid,
    layer_nodata: f64,
    mask: Option<&Array2<bool>>,
) -> DemResult<u64> {
    if base.dim() != layer.dim() {
        return Err(DemError::Processing(format!(
            "layer grid is {:?} but base grid is {:?}",
            layer.dim(),
            base.dim()
        )));
    }
    if let Some(mask) = mask {
        if mask.dim() != base.dim() {
            return Err(DemError::Processing(format!(
                "mask grid is {:?} but base grid is {:?}",
                mask.dim(),
                base.dim()
            )));
        }
    }

    let mut painted = 0;
    for ((idx, value), &candidate) in base.indexed_iter_mut().zip(layer.iter()) {
        if is_nodata(candidate, layer_nodata) {
            continue;
        }
        if let Some(mask) = mask {
            if !mask[idx] {
                continue;
            }
        }
        *value = candidate;
        painted += 1;
    }
    Ok(painted)
}
