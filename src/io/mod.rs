//! Raster access, fingerprinting, caching and tile acquisition

pub mod cache;
pub mod fingerprint;
pub mod raster;
pub mod srtm;

// Re-export main types
pub use cache::{CacheLoad, CacheRecord, CachedTile, CACHE_FILE_NAME, CACHE_SCHEMA_VERSION};
pub use fingerprint::Fingerprint;
pub use raster::{grid_size_for, RasterIo, RasterProfile};
pub use srtm::SrtmFetcher;
