//! Core DEM normalization modules

pub mod coverage;
pub mod extract;
pub mod fill;
pub mod mosaic;
pub mod orchestrator;
pub mod pipeline;
pub mod prepare;
pub mod stack;

// Re-export main types
pub use coverage::{build_metrics, count_nodata, coverage_ratio, is_nodata, remap_nodata};
pub use extract::{extract_tile, tile_output_path, tile_window, TileWindow};
pub use fill::{apply_fill, fill_constant, fill_from_fallback, fill_interpolate};
pub use mosaic::{build_mosaic, Mosaic};
pub use orchestrator::{resolve_jobs, run_tile_jobs};
pub use pipeline::DemNormalizer;
pub use prepare::{prepare_source, PreparedSource};
pub use stack::{composite_layer, polygon_mask};
