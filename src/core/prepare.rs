use crate::io::raster::{grid_size_for, RasterIo};
use crate::types::{
    BoundingBox, DemError, DemResult, GeoTransform, NormalizationOptions,
};
use std::path::{Path, PathBuf};

/// A source raster brought into the target coordinate system.
///
/// `path` is the original file when no work was needed, otherwise a warped
/// copy under the run's work directory.
#[derive(Debug, Clone)]
pub struct PreparedSource {
    pub original: PathBuf,
    pub path: PathBuf,
    /// Extent in the target CRS.
    pub bounds: BoundingBox,
    /// Pixel size in target CRS units.
    pub resolution: (f64, f64),
    /// Nodata convention of the file at `path`.
    pub read_nodata: f64,
    pub reprojected: bool,
}

/// Bring one source into the target CRS (and requested resolution, if any).
///
/// A source that already matches is passed through untouched; otherwise it
/// is warped into `workdir`. Sources without a CRS are rejected rather than
/// assumed to be geographic.
pub fn prepare_source(
    source: &Path,
    index: usize,
    target_crs: &str,
    output_nodata: f64,
    options: &NormalizationOptions,
    workdir: &Path,
) -> DemResult<PreparedSource> {
    let profile = RasterIo::profile(source)?;
    let source_crs = profile.crs.clone().ok_or_else(|| {
        DemError::Source(format!(
            "'{}' has no coordinate reference system",
            source.display()
        ))
    })?;

    let native_resolution = profile.transform.resolution();
    let crs_matches = RasterIo::crs_equivalent(&source_crs, target_crs);
    let resolution_matches = match options.resolution {
        Some(requested) => {
            close(native_resolution.0, requested.0) && close(native_resolution.1, requested.1)
        }
        None => true,
    };

    if crs_matches && resolution_matches {
        log::debug!(
            "Source '{}' already matches {}, no reprojection needed",
            source.display(),
            target_crs
        );
        return Ok(PreparedSource {
            original: source.to_path_buf(),
            path: source.to_path_buf(),
            bounds: profile.bounds,
            resolution: native_resolution,
            read_nodata: profile.nodata.unwrap_or(output_nodata),
            reprojected: false,
        });
    }

    let dst_bounds = if crs_matches {
        profile.bounds
    } else {
        RasterIo::transform_bounds(&profile.bounds, &source_crs, target_crs)?
    };
    // Without an explicit target resolution, keep the source's pixel count.
    let dst_resolution = options.resolution.unwrap_or((
        dst_bounds.width() / profile.width as f64,
        dst_bounds.height() / profile.height as f64,
    ));
    let dst_size = grid_size_for(&dst_bounds, dst_resolution);
    let dst_transform = GeoTransform::north_up(&dst_bounds, dst_resolution);

    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("source_{}", index));
    let dst_path = workdir.join(format!("prepared_{:02}_{}.tif", index, stem));

    log::info!(
        "Reprojecting '{}' from {} to {} ({}x{} pixels)",
        source.display(),
        source_crs,
        target_crs,
        dst_size.0,
        dst_size.1
    );
    let dataset = RasterIo::open(source)?;
    RasterIo::warp_to_file(
        &dataset,
        &dst_path,
        target_crs,
        &dst_transform,
        dst_size,
        output_nodata,
        options.resampling,
        options.compression,
    )?;

    Ok(PreparedSource {
        original: source.to_path_buf(),
        path: dst_path,
        bounds: dst_bounds,
        resolution: dst_resolution,
        read_nodata: output_nodata,
        reprojected: true,
    })
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}
