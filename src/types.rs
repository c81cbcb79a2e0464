use ndarray::Array2;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

/// Real-valued elevation samples
pub type Elevation = f32;

/// 2D elevation grid (row-major, row 0 = northernmost)
pub type ElevationGrid = Array2<Elevation>;

/// Nodata sentinel used when neither the options, a layer, a backend profile
/// nor the source itself declares one (SRTM convention).
pub const DEFAULT_NODATA: f64 = -32768.0;

/// Identifier of one whole-degree geographic cell, e.g. `+47+008` or `-12-077`.
///
/// The textual form is `±LL±LLL` (2-digit signed latitude, 3-digit signed
/// longitude) and denotes the half-open cell `[lon, lon+1) × [lat, lat+1)`.
/// Parsing and formatting round-trip byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TileId {
    lat: i32,
    lon: i32,
}

fn tile_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([+-]\d{2})([+-]\d{3})$").expect("valid tile id pattern"))
}

impl TileId {
    /// Create a tile id from whole-degree cell coordinates.
    ///
    /// `lat` is the southern edge (-90..=89), `lon` the western edge
    /// (-180..=179) of the cell.
    pub fn new(lat: i32, lon: i32) -> DemResult<Self> {
        if !(-90..=89).contains(&lat) || !(-180..=179).contains(&lon) {
            return Err(DemError::Validation(format!(
                "tile cell ({}, {}) outside the valid latitude/longitude range",
                lat, lon
            )));
        }
        Ok(Self { lat, lon })
    }

    /// Southern edge latitude of the cell in degrees.
    pub fn lat(&self) -> i32 {
        self.lat
    }

    /// Western edge longitude of the cell in degrees.
    pub fn lon(&self) -> i32 {
        self.lon
    }

    /// Geographic bounds of the cell (WGS84 degrees).
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox {
            min_lon: self.lon as f64,
            max_lon: (self.lon + 1) as f64,
            min_lat: self.lat as f64,
            max_lat: (self.lat + 1) as f64,
        }
    }

    /// All cells intersecting the given geographic bounding box.
    pub fn covering(bbox: &BoundingBox) -> Vec<TileId> {
        let min_lat = (bbox.min_lat.floor() as i32).max(-90);
        let max_lat = (bbox.max_lat.ceil() as i32).min(90);
        let min_lon = (bbox.min_lon.floor() as i32).max(-180);
        let max_lon = (bbox.max_lon.ceil() as i32).min(180);

        let mut tiles = Vec::new();
        for lat in min_lat..max_lat {
            for lon in min_lon..max_lon {
                if let Ok(tile) = TileId::new(lat, lon) {
                    tiles.push(tile);
                }
            }
        }
        tiles
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lat_sign = if self.lat < 0 { '-' } else { '+' };
        let lon_sign = if self.lon < 0 { '-' } else { '+' };
        write!(
            f,
            "{}{:02}{}{:03}",
            lat_sign,
            self.lat.abs(),
            lon_sign,
            self.lon.abs()
        )
    }
}

impl FromStr for TileId {
    type Err = DemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = tile_id_pattern()
            .captures(s)
            .ok_or_else(|| DemError::Validation(format!("invalid tile id '{}'", s)))?;
        let lat: i32 = caps[1]
            .parse()
            .map_err(|_| DemError::Validation(format!("invalid tile id '{}'", s)))?;
        let lon: i32 = caps[2]
            .parse()
            .map_err(|_| DemError::Validation(format!("invalid tile id '{}'", s)))?;
        TileId::new(lat, lon)
    }
}

impl TryFrom<String> for TileId {
    type Error = DemError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TileId> for String {
    fn from(tile: TileId) -> Self {
        tile.to_string()
    }
}

/// Geospatial bounding box.
///
/// Field names follow geographic usage; for projected coordinate systems the
/// `lon` fields carry x and the `lat` fields carry y.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Union of two boxes.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_lon: self.min_lon.min(other.min_lon),
            max_lon: self.max_lon.max(other.max_lon),
            min_lat: self.min_lat.min(other.min_lat),
            max_lat: self.max_lat.max(other.max_lat),
        }
    }

    /// Intersection of two boxes, `None` when they do not overlap.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let min_lon = self.min_lon.max(other.min_lon);
        let max_lon = self.max_lon.min(other.max_lon);
        let min_lat = self.min_lat.max(other.min_lat);
        let max_lat = self.max_lat.min(other.max_lat);
        if min_lon < max_lon && min_lat < max_lat {
            Some(BoundingBox {
                min_lon,
                max_lon,
                min_lat,
                max_lat,
            })
        } else {
            None
        }
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }
}

/// Affine geotransform in GDAL order.
///
/// Rotation terms are carried for GDAL fidelity but all grids produced by this
/// crate are axis-aligned (rotation 0, negative `pixel_height` for north-up).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform covering `bounds` at the given `(x, y)` resolution.
    pub fn north_up(bounds: &BoundingBox, resolution: (f64, f64)) -> Self {
        Self {
            top_left_x: bounds.min_lon,
            pixel_width: resolution.0,
            rotation_x: 0.0,
            top_left_y: bounds.max_lat,
            rotation_y: 0.0,
            pixel_height: -resolution.1,
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Bounds of a `width`x`height` grid under this transform.
    pub fn grid_bounds(&self, width: usize, height: usize) -> BoundingBox {
        let x0 = self.top_left_x;
        let x1 = self.top_left_x + width as f64 * self.pixel_width;
        let y0 = self.top_left_y;
        let y1 = self.top_left_y + height as f64 * self.pixel_height;
        BoundingBox {
            min_lon: x0.min(x1),
            max_lon: x0.max(x1),
            min_lat: y0.min(y1),
            max_lat: y0.max(y1),
        }
    }

    /// Fractional pixel (col, row) of a geographic coordinate.
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.top_left_x) / self.pixel_width,
            (y - self.top_left_y) / self.pixel_height,
        )
    }

    /// Geographic coordinate of a pixel's top-left corner.
    pub fn pixel_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width,
            self.top_left_y + row * self.pixel_height,
        )
    }

    /// Absolute `(x, y)` pixel size.
    pub fn resolution(&self) -> (f64, f64) {
        (self.pixel_width.abs(), self.pixel_height.abs())
    }
}

/// Resampling method handed to the raster backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResamplingMethod {
    Nearest,
    #[default]
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
    Average,
}

impl fmt::Display for ResamplingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResamplingMethod::Nearest => write!(f, "nearest"),
            ResamplingMethod::Bilinear => write!(f, "bilinear"),
            ResamplingMethod::Cubic => write!(f, "cubic"),
            ResamplingMethod::CubicSpline => write!(f, "cubic-spline"),
            ResamplingMethod::Lanczos => write!(f, "lanczos"),
            ResamplingMethod::Average => write!(f, "average"),
        }
    }
}

/// How nodata gaps in an extracted tile are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FillStrategy {
    /// Leave gaps untouched.
    #[default]
    None,
    /// Replace every nodata pixel with `fill_value`.
    Constant,
    /// Grow values into gaps from valid neighbors; unreachable pixels stay
    /// nodata.
    Interpolate,
    /// Overwrite nodata positions with values extracted from the configured
    /// fallback sources.
    Fallback,
}

impl fmt::Display for FillStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillStrategy::None => write!(f, "none"),
            FillStrategy::Constant => write!(f, "constant"),
            FillStrategy::Interpolate => write!(f, "interpolate"),
            FillStrategy::Fallback => write!(f, "fallback"),
        }
    }
}

/// How multiple prepared sources are combined into one addressable surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MosaicMode {
    /// Materialize one composite raster spanning the union of all sources.
    #[default]
    Full,
    /// Merge only the sources overlapping each tile window, on demand.
    PerTile,
    /// Write a virtual (VRT) description instead of copying pixels.
    Vrt,
}

impl fmt::Display for MosaicMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MosaicMode::Full => write!(f, "full"),
            MosaicMode::PerTile => write!(f, "per-tile"),
            MosaicMode::Vrt => write!(f, "vrt"),
        }
    }
}

/// Which source's pixel wins where prepared sources overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MosaicPrecedence {
    /// The earliest listed source keeps its valid pixels.
    #[default]
    First,
    /// A later source's valid pixels overwrite earlier ones.
    Last,
}

/// GeoTIFF compression for all rasters this crate writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Compression {
    None,
    #[default]
    Lzw,
    Deflate,
}

impl Compression {
    /// GDAL `COMPRESS=` creation-option value, `None` when uncompressed.
    pub fn gdal_name(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Lzw => Some("LZW"),
            Compression::Deflate => Some("DEFLATE"),
        }
    }
}

/// How cached tile entries are validated against the files on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FingerprintMode {
    /// Size + modification time (cheap, the default).
    #[default]
    MtimeSize,
    /// Size + modification time + SHA-256 content digest.
    Sha256,
}

/// Complete, cache-comparable configuration of one normalization run.
///
/// The struct serializes with a fixed field order; together with `BTreeMap`
/// collections in the cache record this makes the persisted snapshot
/// deterministic regardless of how the options were assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationOptions {
    /// Target coordinate reference system, e.g. `"EPSG:4326"`.
    pub target_crs: String,
    /// Resampling used for reprojection and tile extraction.
    pub resampling: ResamplingMethod,
    /// Explicit output nodata; see the effective-nodata resolution order.
    pub dst_nodata: Option<f64>,
    /// Target `(x, y)` resolution in target CRS units; `None` keeps each
    /// source's native resolution.
    pub resolution: Option<(f64, f64)>,
    pub fill_strategy: FillStrategy,
    /// Value written by `FillStrategy::Constant`.
    pub fill_value: f64,
    /// Fallback elevation sources for `FillStrategy::Fallback`.
    pub fallback_sources: Vec<PathBuf>,
    pub mosaic_strategy: MosaicMode,
    pub mosaic_precedence: MosaicPrecedence,
    pub compression: Compression,
    /// Worker threads for tile processing: 0 = auto, 1 = sequential, N = pool.
    pub tile_jobs: usize,
    /// Capture per-tile errors instead of aborting the run.
    pub continue_on_error: bool,
    /// Record per-tile coverage statistics in the run result.
    pub coverage_metrics: bool,
    /// Strictness of cached-entry validation.
    pub cache_validation: FingerprintMode,
}

impl Default for NormalizationOptions {
    fn default() -> Self {
        Self {
            target_crs: "EPSG:4326".to_string(),
            resampling: ResamplingMethod::default(),
            dst_nodata: None,
            resolution: None,
            fill_strategy: FillStrategy::default(),
            fill_value: 0.0,
            fallback_sources: Vec::new(),
            mosaic_strategy: MosaicMode::default(),
            mosaic_precedence: MosaicPrecedence::default(),
            compression: Compression::default(),
            tile_jobs: 0,
            continue_on_error: false,
            coverage_metrics: true,
            cache_validation: FingerprintMode::default(),
        }
    }
}

/// Already-parsed area-of-interest polygon set plus the CRS its vertices are
/// expressed in. Rings follow the even-odd rule, so holes are inner rings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AoiGeometry {
    pub rings: Vec<Vec<(f64, f64)>>,
    pub crs: String,
}

/// One layer of a DEM stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemLayer {
    pub source: PathBuf,
    /// Layers are blended in ascending priority; higher wins on overlap.
    pub priority: i32,
    /// Restricts where this layer's data applies.
    pub aoi: Option<AoiGeometry>,
    /// Overrides the source's own nodata for this layer.
    pub nodata_override: Option<f64>,
}

impl DemLayer {
    pub fn new<P: Into<PathBuf>>(source: P, priority: i32) -> Self {
        Self {
            source: source.into(),
            priority,
            aoi: None,
            nodata_override: None,
        }
    }
}

/// An ordered set of prioritized elevation layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DemStack {
    pub layers: Vec<DemLayer>,
}

impl DemStack {
    pub fn new(layers: Vec<DemLayer>) -> Self {
        Self { layers }
    }

    /// Layers sorted by ascending priority (stable, so declaration order
    /// breaks ties).
    pub fn sorted_layers(&self) -> Vec<&DemLayer> {
        let mut layers: Vec<&DemLayer> = self.layers.iter().collect();
        layers.sort_by_key(|layer| layer.priority);
        layers
    }

    pub fn source_paths(&self) -> Vec<PathBuf> {
        self.layers.iter().map(|l| l.source.clone()).collect()
    }
}

/// Constraints a downstream consumer imposes on normalized output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendProfile {
    pub required_crs: String,
    pub required_nodata: Option<f64>,
    pub require_full_coverage: bool,
}

/// Before/after nodata accounting for one processed tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageMetrics {
    pub total_pixels: u64,
    pub nodata_before: u64,
    pub nodata_after: u64,
    /// Valid fraction before filling; 1.0 for an empty grid.
    pub coverage_before: f64,
    /// Valid fraction after filling; never below `coverage_before`.
    pub coverage_after: f64,
    pub filled_pixels: u64,
    pub strategy: FillStrategy,
    pub elapsed_seconds: f64,
}

/// One successfully normalized tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileResult {
    pub tile: TileId,
    pub output_path: PathBuf,
    pub bounds: BoundingBox,
    pub resolution: (f64, f64),
    pub nodata: f64,
}

/// Outcome of a whole normalization run.
///
/// `tile_results` is ordered exactly like the requested tile list. `errors`
/// is only populated when the run was configured with `continue_on_error`.
#[derive(Debug, Clone, Default)]
pub struct NormalizationRun {
    pub sources: Vec<PathBuf>,
    pub target_crs: String,
    pub mosaic_path: Option<PathBuf>,
    pub tile_results: Vec<TileResult>,
    pub coverage: BTreeMap<TileId, CoverageMetrics>,
    pub errors: BTreeMap<TileId, String>,
    /// Number of requested tiles served from the incremental cache.
    pub cache_hits: usize,
}

/// Error types for DEM normalization
#[derive(Debug, thiserror::Error)]
pub enum DemError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("coverage violation: {0}")]
    CoverageViolation(String),

    #[error("processing error: {0}")]
    Processing(String),
}

/// Result type for DEM normalization operations
pub type DemResult<T> = Result<T, DemError>;
