use crate::core::mosaic::{self, Mosaic};
use crate::io::raster::{grid_size_for, RasterIo};
use crate::types::{
    BoundingBox, DemResult, ElevationGrid, GeoTransform, MosaicPrecedence, ResamplingMethod,
    TileId,
};
use std::path::{Path, PathBuf};

/// A tile's footprint on the target grid.
#[derive(Debug, Clone)]
pub struct TileWindow {
    pub tile: TileId,
    /// Cell bounds in the target CRS.
    pub bounds: BoundingBox,
    pub transform: GeoTransform,
    /// `(width, height)` in pixels.
    pub size: (usize, usize),
}

/// Compute where a whole-degree cell lands in the target CRS.
///
/// Cells are half-open, so adjacent windows share an edge but never a pixel
/// column or row.
pub fn tile_window(
    tile: &TileId,
    target_crs: &str,
    resolution: (f64, f64),
) -> DemResult<TileWindow> {
    let geographic = tile.bounds();
    let bounds = if RasterIo::crs_equivalent(target_crs, "EPSG:4326") {
        geographic
    } else {
        RasterIo::transform_bounds(&geographic, "EPSG:4326", target_crs)?
    };
    Ok(TileWindow {
        tile: *tile,
        bounds,
        transform: GeoTransform::north_up(&bounds, resolution),
        size: grid_size_for(&bounds, resolution),
    })
}

/// Pull one tile's pixels out of the mosaic surface.
pub fn extract_tile(
    mosaic: &Mosaic,
    window: &TileWindow,
    output_nodata: f64,
    precedence: MosaicPrecedence,
    resampling: ResamplingMethod,
) -> DemResult<ElevationGrid> {
    log::debug!(
        "Extracting tile {} ({}x{} pixels)",
        window.tile,
        window.size.0,
        window.size.1
    );
    mosaic::read_window(
        mosaic,
        &window.bounds,
        window.size,
        output_nodata,
        precedence,
        resampling,
    )
}

/// Canonical on-disk location of a tile: `<output_dir>/<id>/<id>.tif`.
pub fn tile_output_path(output_dir: &Path, tile: &TileId) -> PathBuf {
    output_dir.join(tile.to_string()).join(format!("{}.tif", tile))
}
