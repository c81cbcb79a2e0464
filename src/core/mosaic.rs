use crate::core::coverage::{is_nodata, remap_nodata};
use crate::core::prepare::PreparedSource;
use crate::core::stack::composite_layer;
use crate::io::raster::{grid_size_for, RasterIo};
use crate::types::{
    BoundingBox, DemError, DemResult, ElevationGrid, GeoTransform, MosaicMode, MosaicPrecedence,
    NormalizationOptions, ResamplingMethod,
};
use ndarray::{s, Array2};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// The addressable elevation surface tiles are extracted from.
#[derive(Debug, Clone)]
pub enum Mosaic {
    /// One prepared source used directly, no composite artifact.
    Single { path: PathBuf, read_nodata: f64 },
    /// Composite raster materialized under the work directory.
    Materialized { path: PathBuf, read_nodata: f64 },
    /// VRT description referencing the prepared sources.
    Virtual { path: PathBuf, read_nodata: f64 },
    /// No surface on disk; overlapping sources are merged per tile window.
    PerTile { sources: Vec<PreparedSource> },
}

impl Mosaic {
    /// Path of the composite artifact, when one was produced.
    pub fn artifact_path(&self) -> Option<&Path> {
        match self {
            Mosaic::Materialized { path, .. } | Mosaic::Virtual { path, .. } => Some(path),
            Mosaic::Single { .. } | Mosaic::PerTile { .. } => None,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Mosaic::Single { .. } => "single source",
            Mosaic::Materialized { .. } => "materialized",
            Mosaic::Virtual { .. } => "virtual",
            Mosaic::PerTile { .. } => "per-tile",
        }
    }
}

/// Combine prepared sources into the surface tiles will read from.
///
/// A single source is always used directly. Otherwise the options'
/// `mosaic_strategy` picks between a materialized composite, a VRT and
/// deferred per-tile merging.
pub fn build_mosaic(
    prepared: &[PreparedSource],
    options: &NormalizationOptions,
    output_nodata: f64,
    resolution: (f64, f64),
    target_crs: &str,
    workdir: &Path,
) -> DemResult<Mosaic> {
    let first = prepared
        .first()
        .ok_or_else(|| DemError::Validation("no sources to mosaic".to_string()))?;

    let mosaic = if prepared.len() == 1 {
        Mosaic::Single {
            path: first.path.clone(),
            read_nodata: first.read_nodata,
        }
    } else {
        match options.mosaic_strategy {
            MosaicMode::Full => materialize_mosaic(
                prepared,
                output_nodata,
                resolution,
                target_crs,
                options,
                workdir,
            )?,
            MosaicMode::Vrt => write_vrt_mosaic(
                prepared,
                output_nodata,
                resolution,
                target_crs,
                options.mosaic_precedence,
                workdir,
            )?,
            MosaicMode::PerTile => Mosaic::PerTile {
                sources: prepared.to_vec(),
            },
        }
    };

    log::info!(
        "Mosaic surface ready ({}, {} source(s))",
        mosaic.describe(),
        prepared.len()
    );
    Ok(mosaic)
}

/// Union extent of a set of prepared sources.
pub fn union_bounds(prepared: &[PreparedSource]) -> Option<BoundingBox> {
    let mut iter = prepared.iter();
    let mut bounds = iter.next()?.bounds;
    for source in iter {
        bounds = bounds.union(&source.bounds);
    }
    Some(bounds)
}

/// Read a window of the mosaic surface onto an `(width, height)` grid in the
/// output nodata convention.
pub fn read_window(
    mosaic: &Mosaic,
    bounds: &BoundingBox,
    out_size: (usize, usize),
    output_nodata: f64,
    precedence: MosaicPrecedence,
    resampling: ResamplingMethod,
) -> DemResult<ElevationGrid> {
    match mosaic {
        Mosaic::Single { path, read_nodata }
        | Mosaic::Materialized { path, read_nodata }
        | Mosaic::Virtual { path, read_nodata } => {
            let dataset = RasterIo::open(path)?;
            let mut grid =
                RasterIo::read_bounds_resampled(&dataset, bounds, out_size, *read_nodata, resampling)?;
            remap_nodata(&mut grid, *read_nodata, output_nodata);
            Ok(grid)
        }
        Mosaic::PerTile { sources } => merge_window(
            sources,
            bounds,
            out_size,
            output_nodata,
            precedence,
            resampling,
        ),
    }
}

/// Merge the sources overlapping a window, honoring precedence: valid
/// samples overwrite, nodata never erases data.
pub fn merge_window(
    sources: &[PreparedSource],
    bounds: &BoundingBox,
    out_size: (usize, usize),
    output_nodata: f64,
    precedence: MosaicPrecedence,
    resampling: ResamplingMethod,
) -> DemResult<ElevationGrid> {
    let (out_width, out_height) = out_size;
    let mut grid = Array2::from_elem((out_height, out_width), output_nodata as f32);

    for source in precedence_order(sources, precedence) {
        if source.bounds.intersection(bounds).is_none() {
            continue;
        }
        let dataset = RasterIo::open(&source.path)?;
        let patch = RasterIo::read_bounds_resampled(
            &dataset,
            bounds,
            out_size,
            source.read_nodata,
            resampling,
        )?;
        composite_layer(&mut grid, &patch, source.read_nodata, None)?;
    }
    Ok(grid)
}

/// Iteration order that makes "valid overwrites" realize the precedence:
/// for first-wins the earliest source is painted last.
fn precedence_order(
    sources: &[PreparedSource],
    precedence: MosaicPrecedence,
) -> Vec<&PreparedSource> {
    match precedence {
        MosaicPrecedence::Last => sources.iter().collect(),
        MosaicPrecedence::First => sources.iter().rev().collect(),
    }
}

fn materialize_mosaic(
    prepared: &[PreparedSource],
    output_nodata: f64,
    resolution: (f64, f64),
    target_crs: &str,
    options: &NormalizationOptions,
    workdir: &Path,
) -> DemResult<Mosaic> {
    let bounds = union_bounds(prepared)
        .ok_or_else(|| DemError::Validation("no sources to mosaic".to_string()))?;
    let (width, height) = grid_size_for(&bounds, resolution);
    let transform = GeoTransform::north_up(&bounds, resolution);
    log::info!(
        "Materializing {}x{} mosaic spanning {:.4}..{:.4} lon, {:.4}..{:.4} lat",
        width,
        height,
        bounds.min_lon,
        bounds.max_lon,
        bounds.min_lat,
        bounds.max_lat
    );

    let mut grid = Array2::from_elem((height, width), output_nodata as f32);
    for source in precedence_order(prepared, options.mosaic_precedence) {
        let (src_width, src_height) = grid_size_for(&source.bounds, resolution);
        let dataset = RasterIo::open(&source.path)?;
        let patch = RasterIo::read_bounds_resampled(
            &dataset,
            &source.bounds,
            (src_width, src_height),
            source.read_nodata,
            options.resampling,
        )?;

        // Sub-rectangle of the mosaic this source lands in.
        let x0 = (((source.bounds.min_lon - bounds.min_lon) / resolution.0).round() as usize)
            .min(width);
        let y0 = (((bounds.max_lat - source.bounds.max_lat) / resolution.1).round() as usize)
            .min(height);
        let w = src_width.min(width - x0);
        let h = src_height.min(height - y0);
        if w == 0 || h == 0 {
            continue;
        }

        let mut view = grid.slice_mut(s![y0..y0 + h, x0..x0 + w]);
        for (value, &candidate) in view.iter_mut().zip(patch.slice(s![..h, ..w]).iter()) {
            if !is_nodata(candidate, source.read_nodata) {
                *value = candidate;
            }
        }
    }

    let path = workdir.join("mosaic.tif");
    RasterIo::write_geotiff(
        &path,
        &grid,
        &transform,
        target_crs,
        output_nodata,
        options.compression,
    )?;
    Ok(Mosaic::Materialized {
        path,
        read_nodata: output_nodata,
    })
}

#[derive(Serialize)]
struct VrtDataset {
    #[serde(rename = "@rasterXSize")]
    raster_x_size: usize,
    #[serde(rename = "@rasterYSize")]
    raster_y_size: usize,
    #[serde(rename = "SRS")]
    srs: String,
    #[serde(rename = "GeoTransform")]
    geo_transform: String,
    #[serde(rename = "VRTRasterBand")]
    band: VrtRasterBand,
}

#[derive(Serialize)]
struct VrtRasterBand {
    #[serde(rename = "@dataType")]
    data_type: &'static str,
    #[serde(rename = "@band")]
    band: u32,
    #[serde(rename = "NoDataValue")]
    no_data_value: f64,
    #[serde(rename = "ComplexSource")]
    sources: Vec<VrtComplexSource>,
}

#[derive(Serialize)]
struct VrtComplexSource {
    #[serde(rename = "SourceFilename")]
    source_filename: VrtSourceFilename,
    #[serde(rename = "SourceBand")]
    source_band: u32,
    #[serde(rename = "SrcRect")]
    src_rect: VrtRect,
    #[serde(rename = "DstRect")]
    dst_rect: VrtRect,
    #[serde(rename = "NODATA")]
    nodata: f64,
}

#[derive(Serialize)]
struct VrtSourceFilename {
    #[serde(rename = "@relativeToVRT")]
    relative_to_vrt: u8,
    #[serde(rename = "$text")]
    path: String,
}

#[derive(Serialize)]
struct VrtRect {
    #[serde(rename = "@xOff")]
    x_off: f64,
    #[serde(rename = "@yOff")]
    y_off: f64,
    #[serde(rename = "@xSize")]
    x_size: f64,
    #[serde(rename = "@ySize")]
    y_size: f64,
}

/// Write a GDAL VRT over the prepared sources instead of copying pixels.
///
/// VRT sources are painted in document order with nodata masked out, so the
/// precedence is realized by source ordering, exactly like the materialized
/// path.
fn write_vrt_mosaic(
    prepared: &[PreparedSource],
    output_nodata: f64,
    resolution: (f64, f64),
    target_crs: &str,
    precedence: MosaicPrecedence,
    workdir: &Path,
) -> DemResult<Mosaic> {
    let bounds = union_bounds(prepared)
        .ok_or_else(|| DemError::Validation("no sources to mosaic".to_string()))?;
    let (width, height) = grid_size_for(&bounds, resolution);
    let transform = GeoTransform::north_up(&bounds, resolution);

    let sources = precedence_order(prepared, precedence)
        .into_iter()
        .map(|source| {
            let (src_width, src_height) = grid_size_for(&source.bounds, source.resolution);
            VrtComplexSource {
                source_filename: VrtSourceFilename {
                    relative_to_vrt: 0,
                    path: source.path.display().to_string(),
                },
                source_band: 1,
                src_rect: VrtRect {
                    x_off: 0.0,
                    y_off: 0.0,
                    x_size: src_width as f64,
                    y_size: src_height as f64,
                },
                dst_rect: VrtRect {
                    x_off: (source.bounds.min_lon - bounds.min_lon) / resolution.0,
                    y_off: (bounds.max_lat - source.bounds.max_lat) / resolution.1,
                    x_size: source.bounds.width() / resolution.0,
                    y_size: source.bounds.height() / resolution.1,
                },
                nodata: source.read_nodata,
            }
        })
        .collect();

    let gt = transform.to_gdal();
    let vrt = VrtDataset {
        raster_x_size: width,
        raster_y_size: height,
        srs: target_crs.to_string(),
        geo_transform: format!(
            "{}, {}, {}, {}, {}, {}",
            gt[0], gt[1], gt[2], gt[3], gt[4], gt[5]
        ),
        band: VrtRasterBand {
            data_type: "Float32",
            band: 1,
            no_data_value: output_nodata,
            sources,
        },
    };

    let xml = quick_xml::se::to_string_with_root("VRTDataset", &vrt)
        .map_err(|e| DemError::Processing(format!("failed to serialize VRT: {}", e)))?;
    let path = workdir.join("mosaic.vrt");
    std::fs::write(&path, xml)?;
    log::info!("Wrote virtual mosaic: {}", path.display());

    Ok(Mosaic::Virtual {
        path,
        read_nodata: output_nodata,
    })
}
