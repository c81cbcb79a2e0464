//! demprep: A Fast, Incremental DEM Normalization & Tiling Pipeline
//!
//! This library turns heterogeneous elevation rasters into analysis-ready,
//! uniformly gridded one-degree tiles: conditional reprojection, mosaicking,
//! prioritized stacking, gap filling and a fingerprint-based cache so
//! repeated runs only redo what changed.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    AoiGeometry, BackendProfile, BoundingBox, Compression, CoverageMetrics, DemError, DemLayer,
    DemResult, DemStack, FillStrategy, FingerprintMode, GeoTransform, MosaicMode,
    MosaicPrecedence, NormalizationOptions, NormalizationRun, ResamplingMethod, TileId,
    TileResult,
};

pub use core::DemNormalizer;
pub use io::{RasterIo, SrtmFetcher};
