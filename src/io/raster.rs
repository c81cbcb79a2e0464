use crate::types::{
    BoundingBox, Compression, DemError, DemResult, ElevationGrid, GeoTransform, ResamplingMethod,
};
use gdal::raster::{Buffer, RasterCreationOption, ResampleAlg};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::{Dataset, DriverManager};
use gdal_sys::{CPLErr, GDALResampleAlg, OSRAxisMappingStrategy};
use ndarray::{s, Array2};
use std::path::{Path, PathBuf};

/// Georeferencing summary of a raster source.
#[derive(Debug, Clone)]
pub struct RasterProfile {
    pub path: PathBuf,
    /// `AUTH:code` when the CRS resolves to an authority id, raw WKT
    /// otherwise, `None` when the file carries no CRS at all.
    pub crs: Option<String>,
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
    pub bounds: BoundingBox,
}

/// All GDAL access routed through one place.
pub struct RasterIo;

impl RasterIo {
    pub fn open<P: AsRef<Path>>(path: P) -> DemResult<Dataset> {
        Dataset::open(path.as_ref()).map_err(|e| {
            DemError::Source(format!("cannot open '{}': {}", path.as_ref().display(), e))
        })
    }

    /// Inspect a raster without reading pixel data.
    pub fn profile<P: AsRef<Path>>(path: P) -> DemResult<RasterProfile> {
        let path = path.as_ref();
        let dataset = Self::open(path)?;
        let geo_transform = dataset.geo_transform().map_err(|_| {
            DemError::Source(format!("'{}' has no geotransform", path.display()))
        })?;
        let transform = GeoTransform::from_gdal(geo_transform);
        if transform.rotation_x != 0.0 || transform.rotation_y != 0.0 {
            return Err(DemError::Source(format!(
                "'{}' is rotated; only axis-aligned rasters are supported",
                path.display()
            )));
        }

        let (width, height) = dataset.raster_size();
        let nodata = dataset.rasterband(1)?.no_data_value();

        Ok(RasterProfile {
            path: path.to_path_buf(),
            crs: Self::dataset_crs(&dataset),
            width,
            height,
            transform,
            nodata,
            bounds: transform.grid_bounds(width, height),
        })
    }

    /// Read the whole first band into an elevation grid.
    pub fn read_full(dataset: &Dataset) -> DemResult<(ElevationGrid, GeoTransform)> {
        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let (width, height) = dataset.raster_size();
        let rasterband = dataset.rasterband(1)?;
        let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
        let grid = Array2::from_shape_vec((height, width), band_data.data)
            .map_err(|e| DemError::Processing(format!("failed to reshape raster data: {}", e)))?;
        Ok((grid, transform))
    }

    /// Read the part of a raster covering `bounds`, resampled onto an
    /// `out_size` grid (`(width, height)`).
    ///
    /// Pixels outside the raster extent come back as `read_nodata`, so a
    /// window hanging off the edge of the source is not an error.
    pub fn read_bounds_resampled(
        dataset: &Dataset,
        bounds: &BoundingBox,
        out_size: (usize, usize),
        read_nodata: f64,
        resampling: ResamplingMethod,
    ) -> DemResult<ElevationGrid> {
        let (out_width, out_height) = out_size;
        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let (raster_width, raster_height) = dataset.raster_size();

        let mut grid = Array2::from_elem((out_height, out_width), read_nodata as f32);

        // Requested window in fractional source pixels.
        let (ca, ra) = transform.geo_to_pixel(bounds.min_lon, bounds.max_lat);
        let (cb, rb) = transform.geo_to_pixel(bounds.max_lon, bounds.min_lat);
        let (col0, col1) = (ca.min(cb), ca.max(cb));
        let (row0, row1) = (ra.min(rb), ra.max(rb));
        let (win_w, win_h) = (col1 - col0, row1 - row0);
        if win_w <= 0.0 || win_h <= 0.0 {
            return Ok(grid);
        }

        // Clamp to the raster extent, on whole pixels.
        let c0 = col0.max(0.0).floor();
        let r0 = row0.max(0.0).floor();
        let c1 = col1.min(raster_width as f64).ceil();
        let r1 = row1.min(raster_height as f64).ceil();
        if c1 <= c0 || r1 <= r0 {
            return Ok(grid);
        }

        // Output sub-rectangle the clamped window maps onto.
        let scale_x = out_width as f64 / win_w;
        let scale_y = out_height as f64 / win_h;
        let dst_x0 = (((c0 - col0) * scale_x).round().max(0.0) as usize).min(out_width);
        let dst_y0 = (((r0 - row0) * scale_y).round().max(0.0) as usize).min(out_height);
        let dst_x1 = (((c1 - col0) * scale_x).round().max(0.0) as usize).min(out_width);
        let dst_y1 = (((r1 - row0) * scale_y).round().max(0.0) as usize).min(out_height);
        if dst_x1 <= dst_x0 || dst_y1 <= dst_y0 {
            return Ok(grid);
        }
        let (dst_w, dst_h) = (dst_x1 - dst_x0, dst_y1 - dst_y0);

        let rasterband = dataset.rasterband(1)?;
        let buffer = rasterband.read_as::<f32>(
            (c0 as isize, r0 as isize),
            ((c1 - c0) as usize, (r1 - r0) as usize),
            (dst_w, dst_h),
            Some(Self::resample_alg(resampling)),
        )?;
        let patch = Array2::from_shape_vec((dst_h, dst_w), buffer.data)
            .map_err(|e| DemError::Processing(format!("failed to reshape window data: {}", e)))?;
        grid.slice_mut(s![dst_y0..dst_y0 + dst_h, dst_x0..dst_x0 + dst_w])
            .assign(&patch);
        Ok(grid)
    }

    /// Write an elevation grid as a single-band GeoTIFF.
    pub fn write_geotiff<P: AsRef<Path>>(
        path: P,
        grid: &ElevationGrid,
        transform: &GeoTransform,
        crs: &str,
        nodata: f64,
        compression: Compression,
    ) -> DemResult<()> {
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let (height, width) = grid.dim();

        let mut dataset = match compression.gdal_name() {
            Some(name) => {
                let options = [RasterCreationOption {
                    key: "COMPRESS",
                    value: name,
                }];
                driver.create_with_band_type_with_options::<f32, _>(
                    path.as_ref(),
                    width as isize,
                    height as isize,
                    1,
                    &options,
                )?
            }
            None => driver.create_with_band_type::<f32, _>(
                path.as_ref(),
                width as isize,
                height as isize,
                1,
            )?,
        };

        dataset.set_geo_transform(&transform.to_gdal())?;
        dataset.set_spatial_ref(&Self::spatial_ref(crs)?)?;

        let mut rasterband = dataset.rasterband(1)?;
        let flat_data: Vec<f32> = grid.iter().cloned().collect();
        let buffer = Buffer::new((width, height), flat_data);
        rasterband.write((0, 0), (width, height), &buffer)?;
        rasterband.set_no_data_value(Some(nodata))?;

        Ok(())
    }

    /// Reproject a source dataset onto a fixed target grid, writing the
    /// result as a GeoTIFF at `dst_path`.
    ///
    /// The destination is pre-filled with `nodata` so target pixels with no
    /// source counterpart stay nodata. Nodata declared on the source band is
    /// masked by the warp rather than resampled into the output.
    #[allow(clippy::too_many_arguments)]
    pub fn warp_to_file(
        src: &Dataset,
        dst_path: &Path,
        dst_crs: &str,
        dst_transform: &GeoTransform,
        dst_size: (usize, usize),
        nodata: f64,
        resampling: ResamplingMethod,
        compression: Compression,
    ) -> DemResult<()> {
        let (width, height) = dst_size;
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dst = match compression.gdal_name() {
            Some(name) => {
                let options = [RasterCreationOption {
                    key: "COMPRESS",
                    value: name,
                }];
                driver.create_with_band_type_with_options::<f32, _>(
                    dst_path,
                    width as isize,
                    height as isize,
                    1,
                    &options,
                )?
            }
            None => {
                driver.create_with_band_type::<f32, _>(dst_path, width as isize, height as isize, 1)?
            }
        };

        dst.set_geo_transform(&dst_transform.to_gdal())?;
        dst.set_spatial_ref(&Self::spatial_ref(dst_crs)?)?;
        {
            let mut band = dst.rasterband(1)?;
            band.set_no_data_value(Some(nodata))?;
            let fill = vec![nodata as f32; width * height];
            let buffer = Buffer::new((width, height), fill);
            band.write((0, 0), (width, height), &buffer)?;
        }

        let rv = unsafe {
            gdal_sys::GDALReprojectImage(
                src.c_dataset(),
                std::ptr::null(),
                dst.c_dataset(),
                std::ptr::null(),
                Self::warp_alg(resampling),
                0.0,
                0.0,
                None,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if rv != CPLErr::CE_None {
            return Err(DemError::Processing(format!(
                "reprojection to {} failed for '{}'",
                dst_crs,
                dst_path.display()
            )));
        }

        Ok(())
    }

    /// Parse a CRS given as `EPSG:code`, WKT or any other definition GDAL
    /// understands, with lon/lat (x, y) axis order.
    pub fn spatial_ref(crs: &str) -> DemResult<SpatialRef> {
        let trimmed = crs.trim();
        let code = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"));
        let sr = match code {
            Some(code) => {
                let code: u32 = code.trim().parse().map_err(|_| {
                    DemError::Validation(format!("invalid EPSG code in '{}'", crs))
                })?;
                SpatialRef::from_epsg(code)?
            }
            None => SpatialRef::from_definition(trimmed)?,
        };
        sr.set_axis_mapping_strategy(OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        Ok(sr)
    }

    /// Compact textual CRS of a dataset, `AUTH:code` when resolvable.
    pub fn dataset_crs(dataset: &Dataset) -> Option<String> {
        let wkt = dataset.projection();
        if wkt.is_empty() {
            return None;
        }
        if let Ok(sr) = SpatialRef::from_wkt(&wkt) {
            if let (Ok(auth), Ok(code)) = (sr.auth_name(), sr.auth_code()) {
                return Some(format!("{}:{}", auth, code));
            }
        }
        Some(wkt)
    }

    /// Whether two CRS descriptions name the same reference system.
    pub fn crs_equivalent(a: &str, b: &str) -> bool {
        if a.trim().eq_ignore_ascii_case(b.trim()) {
            return true;
        }
        let (sa, sb) = match (Self::spatial_ref(a), Self::spatial_ref(b)) {
            (Ok(sa), Ok(sb)) => (sa, sb),
            _ => return false,
        };
        match (sa.auth_name(), sa.auth_code(), sb.auth_name(), sb.auth_code()) {
            (Ok(an), Ok(ac), Ok(bn), Ok(bc)) => an == bn && ac == bc,
            _ => matches!((sa.to_wkt(), sb.to_wkt()), (Ok(wa), Ok(wb)) if wa == wb),
        }
    }

    /// Reproject a bounding box between coordinate systems.
    ///
    /// The box edges are densified before transforming so curvature near
    /// poles or projection boundaries cannot shrink the result.
    pub fn transform_bounds(
        bounds: &BoundingBox,
        src_crs: &str,
        dst_crs: &str,
    ) -> DemResult<BoundingBox> {
        const EDGE_POINTS: usize = 21;

        let src = Self::spatial_ref(src_crs)?;
        let dst = Self::spatial_ref(dst_crs)?;
        let transform = CoordTransform::new(&src, &dst)?;

        let mut xs = Vec::with_capacity(EDGE_POINTS * 4);
        let mut ys = Vec::with_capacity(EDGE_POINTS * 4);
        for i in 0..EDGE_POINTS {
            let t = i as f64 / (EDGE_POINTS - 1) as f64;
            let x = bounds.min_lon + t * bounds.width();
            let y = bounds.min_lat + t * bounds.height();
            xs.push(x);
            ys.push(bounds.min_lat);
            xs.push(x);
            ys.push(bounds.max_lat);
            xs.push(bounds.min_lon);
            ys.push(y);
            xs.push(bounds.max_lon);
            ys.push(y);
        }
        let mut zs = vec![0.0; xs.len()];
        transform.transform_coords(&mut xs, &mut ys, &mut zs)?;

        let mut out: Option<BoundingBox> = None;
        for (&x, &y) in xs.iter().zip(ys.iter()) {
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            out = Some(match out {
                None => BoundingBox {
                    min_lon: x,
                    max_lon: x,
                    min_lat: y,
                    max_lat: y,
                },
                Some(b) => BoundingBox {
                    min_lon: b.min_lon.min(x),
                    max_lon: b.max_lon.max(x),
                    min_lat: b.min_lat.min(y),
                    max_lat: b.max_lat.max(y),
                },
            });
        }
        out.ok_or_else(|| {
            DemError::Processing(format!(
                "bounds could not be transformed from {} to {}",
                src_crs, dst_crs
            ))
        })
    }

    /// Reproject a set of `(x, y)` vertices in place.
    pub fn transform_points(
        points: &mut [(f64, f64)],
        src_crs: &str,
        dst_crs: &str,
    ) -> DemResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let src = Self::spatial_ref(src_crs)?;
        let dst = Self::spatial_ref(dst_crs)?;
        let transform = CoordTransform::new(&src, &dst)?;

        let mut xs: Vec<f64> = points.iter().map(|p| p.0).collect();
        let mut ys: Vec<f64> = points.iter().map(|p| p.1).collect();
        let mut zs = vec![0.0; points.len()];
        transform.transform_coords(&mut xs, &mut ys, &mut zs)?;
        for (point, (x, y)) in points.iter_mut().zip(xs.into_iter().zip(ys)) {
            *point = (x, y);
        }
        Ok(())
    }

    pub fn resample_alg(method: ResamplingMethod) -> ResampleAlg {
        match method {
            ResamplingMethod::Nearest => ResampleAlg::NearestNeighbour,
            ResamplingMethod::Bilinear => ResampleAlg::Bilinear,
            ResamplingMethod::Cubic => ResampleAlg::Cubic,
            ResamplingMethod::CubicSpline => ResampleAlg::CubicSpline,
            ResamplingMethod::Lanczos => ResampleAlg::Lanczos,
            ResamplingMethod::Average => ResampleAlg::Average,
        }
    }

    fn warp_alg(method: ResamplingMethod) -> GDALResampleAlg::Type {
        match method {
            ResamplingMethod::Nearest => GDALResampleAlg::GRA_NearestNeighbour,
            ResamplingMethod::Bilinear => GDALResampleAlg::GRA_Bilinear,
            ResamplingMethod::Cubic => GDALResampleAlg::GRA_Cubic,
            ResamplingMethod::CubicSpline => GDALResampleAlg::GRA_CubicSpline,
            ResamplingMethod::Lanczos => GDALResampleAlg::GRA_Lanczos,
            ResamplingMethod::Average => GDALResampleAlg::GRA_Average,
        }
    }
}

/// Grid dimensions covering `bounds` at an `(x, y)` resolution.
pub fn grid_size_for(bounds: &BoundingBox, resolution: (f64, f64)) -> (usize, usize) {
    let width = (bounds.width() / resolution.0).round().max(1.0) as usize;
    let height = (bounds.height() / resolution.1).round().max(1.0) as usize;
    (width, height)
}
