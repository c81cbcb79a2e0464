use crate::io::fingerprint::Fingerprint;
use crate::types::{
    CoverageMetrics, DemError, DemResult, DemStack, NormalizationOptions, TileId, TileResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Bumped whenever the sidecar layout changes; older sidecars are ignored.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// File name of the sidecar within the output directory.
pub const CACHE_FILE_NAME: &str = "normalization_cache.json";

/// One tile's cached outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTile {
    pub result: TileResult,
    /// Fingerprint of the tile GeoTIFF at the time it was cached.
    pub fingerprint: Fingerprint,
    pub coverage: Option<CoverageMetrics>,
}

/// Persisted state of a completed (possibly partial) normalization run.
///
/// Collections are `BTreeMap`s and the options struct has a fixed field
/// order, so serializing the same state always produces the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub schema_version: u32,
    /// Sources in request order; order matters for mosaic precedence.
    pub sources: Vec<PathBuf>,
    /// Present when the run was driven by a prioritized stack.
    pub stack: Option<DemStack>,
    pub options: NormalizationOptions,
    /// Tile set of the run that last wrote this record.
    pub requested_tiles: Vec<TileId>,
    /// Fingerprints of every input that influenced pixels, including
    /// fallback sources.
    pub input_fingerprints: BTreeMap<PathBuf, Fingerprint>,
    pub mosaic_path: Option<PathBuf>,
    pub mosaic_fingerprint: Option<Fingerprint>,
    pub tiles: BTreeMap<TileId, CachedTile>,
    pub written_at: DateTime<Utc>,
}

/// Result of reading a sidecar. Anything but `Found` is a cache miss,
/// never a failed run.
#[derive(Debug)]
pub enum CacheLoad {
    Found(Box<CacheRecord>),
    Absent,
    Corrupt,
}

impl CacheRecord {
    pub fn new(
        sources: Vec<PathBuf>,
        stack: Option<DemStack>,
        options: NormalizationOptions,
    ) -> Self {
        Self {
            schema_version: CACHE_SCHEMA_VERSION,
            sources,
            stack,
            options,
            requested_tiles: Vec::new(),
            input_fingerprints: BTreeMap::new(),
            mosaic_path: None,
            mosaic_fingerprint: None,
            tiles: BTreeMap::new(),
            written_at: Utc::now(),
        }
    }

    /// Sidecar location for a given output directory.
    pub fn path_for(output_dir: &Path) -> PathBuf {
        output_dir.join(CACHE_FILE_NAME)
    }

    /// Read a sidecar leniently.
    pub fn load(path: &Path) -> CacheLoad {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheLoad::Absent,
            Err(e) => {
                log::warn!("cache sidecar '{}' unreadable: {}", path.display(), e);
                return CacheLoad::Corrupt;
            }
        };
        match serde_json::from_str::<CacheRecord>(&text) {
            Ok(record) if record.schema_version == CACHE_SCHEMA_VERSION => {
                CacheLoad::Found(Box::new(record))
            }
            Ok(record) => {
                log::warn!(
                    "cache sidecar '{}' has schema version {} (expected {}), ignoring",
                    path.display(),
                    record.schema_version,
                    CACHE_SCHEMA_VERSION
                );
                CacheLoad::Corrupt
            }
            Err(e) => {
                log::warn!("cache sidecar '{}' corrupt, ignoring: {}", path.display(), e);
                CacheLoad::Corrupt
            }
        }
    }

    /// Write the sidecar atomically: serialize to a temporary file in the
    /// same directory, then rename over the final path.
    pub fn store(&self, path: &Path) -> DemResult<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, self)
            .map_err(|e| DemError::Processing(format!("cannot serialize cache record: {}", e)))?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| DemError::Io(e.error))?;
        Ok(())
    }

    /// Whether this record describes the same request: same sources in the
    /// same order, same stack and an identical options snapshot.
    pub fn compatible_with(
        &self,
        sources: &[PathBuf],
        stack: Option<&DemStack>,
        options: &NormalizationOptions,
    ) -> bool {
        self.sources == sources && self.stack.as_ref() == stack && &self.options == options
    }

    /// Whether every fingerprinted input still matches the file on disk.
    pub fn inputs_valid(&self) -> bool {
        let mode = self.options.cache_validation;
        self.input_fingerprints.iter().all(|(path, stored)| {
            match Fingerprint::capture(path, mode) {
                Ok(current) => stored.matches(&current, mode),
                Err(_) => false,
            }
        })
    }

    /// Whether the recorded mosaic (if any) is still the one on disk.
    pub fn mosaic_valid(&self) -> bool {
        let mode = self.options.cache_validation;
        match (&self.mosaic_path, &self.mosaic_fingerprint) {
            (Some(path), Some(stored)) => match Fingerprint::capture(path, mode) {
                Ok(current) => stored.matches(&current, mode),
                Err(_) => false,
            },
            (None, None) => true,
            _ => false,
        }
    }

    /// The cached entry for `tile`, provided its output file is unchanged.
    pub fn valid_tile(&self, tile: &TileId) -> Option<&CachedTile> {
        let entry = self.tiles.get(tile)?;
        let mode = self.options.cache_validation;
        let current = Fingerprint::capture(&entry.result.output_path, mode).ok()?;
        entry
            .fingerprint
            .matches(&current, mode)
            .then_some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use tempfile::TempDir;

    fn sample_record(dir: &Path) -> CacheRecord {
        let tile: TileId = "+46+007".parse().unwrap();
        let tile_path = dir.join("+46+007").join("+46+007.tif");
        fs::create_dir_all(tile_path.parent().unwrap()).unwrap();
        fs::write(&tile_path, b"tile bytes").unwrap();

        let mut record = CacheRecord::new(
            vec![dir.join("source.tif")],
            None,
            NormalizationOptions::default(),
        );
        record.tiles.insert(
            tile,
            CachedTile {
                result: TileResult {
                    tile,
                    output_path: tile_path.clone(),
                    bounds: tile.bounds(),
                    resolution: (0.001, 0.001),
                    nodata: -32768.0,
                },
                fingerprint: Fingerprint::capture(&tile_path, record.options.cache_validation)
                    .unwrap(),
                coverage: None,
            },
        );
        record
    }

    #[test]
    fn test_store_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let record = sample_record(dir.path());
        let sidecar = CacheRecord::path_for(dir.path());
        record.store(&sidecar).unwrap();

        match CacheRecord::load(&sidecar) {
            CacheLoad::Found(loaded) => assert_eq!(*loaded, record),
            other => panic!("expected Found, got {:?}", other),
        }
    }

    #[test]
    fn test_absent_sidecar() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            CacheRecord::load(&CacheRecord::path_for(dir.path())),
            CacheLoad::Absent
        ));
    }

    #[test]
    fn test_corrupt_sidecar_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let sidecar = CacheRecord::path_for(dir.path());
        fs::write(&sidecar, b"{ not json").unwrap();
        assert!(matches!(CacheRecord::load(&sidecar), CacheLoad::Corrupt));
    }

    #[test]
    fn test_schema_version_mismatch_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let record = sample_record(dir.path());
        let mut value = serde_json::to_value(&record).unwrap();
        value["schema_version"] = serde_json::json!(99);
        let sidecar = CacheRecord::path_for(dir.path());
        fs::write(&sidecar, serde_json::to_string(&value).unwrap()).unwrap();
        assert!(matches!(CacheRecord::load(&sidecar), CacheLoad::Corrupt));
    }

    #[test]
    fn test_tile_validity_follows_output_file() {
        let dir = TempDir::new().unwrap();
        let record = sample_record(dir.path());
        let tile: TileId = "+46+007".parse().unwrap();
        assert!(record.valid_tile(&tile).is_some());

        // Growing the file invalidates the entry.
        let tile_path = &record.tiles[&tile].result.output_path;
        fs::write(tile_path, b"tile bytes plus more").unwrap();
        assert!(record.valid_tile(&tile).is_none());

        // So does deleting it.
        fs::remove_file(tile_path).unwrap();
        assert!(record.valid_tile(&tile).is_none());
    }

    #[test]
    fn test_options_change_breaks_compatibility() {
        let dir = TempDir::new().unwrap();
        let record = sample_record(dir.path());
        let sources = record.sources.clone();
        assert!(record.compatible_with(&sources, None, &record.options));

        let mut changed = record.options.clone();
        changed.resampling = crate::types::ResamplingMethod::Cubic;
        assert!(!record.compatible_with(&sources, None, &changed));

        let reordered: Vec<PathBuf> = sources.iter().rev().cloned().collect();
        if reordered != sources {
            assert!(!record.compatible_with(&reordered, None, &record.options));
        }
    }

    #[test]
    fn test_input_fingerprints_gate_validity() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.tif");
        fs::write(&source, b"source v1").unwrap();

        let mut record = sample_record(dir.path());
        record.input_fingerprints.insert(
            source.clone(),
            Fingerprint::capture(&source, record.options.cache_validation).unwrap(),
        );
        assert!(record.inputs_valid());

        fs::write(&source, b"source v2 with different length").unwrap();
        assert!(!record.inputs_valid());
    }

    // Bounds kept in the record should survive the JSON round trip exactly.
    #[test]
    fn test_bounds_precision_survives_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut record = sample_record(dir.path());
        let tile: TileId = "+46+007".parse().unwrap();
        let entry = record.tiles.get_mut(&tile).unwrap();
        entry.result.bounds = BoundingBox {
            min_lon: 7.000000000000001,
            max_lon: 8.0,
            min_lat: 46.0,
            max_lat: 47.0,
        };
        let sidecar = CacheRecord::path_for(dir.path());
        record.store(&sidecar).unwrap();
        match CacheRecord::load(&sidecar) {
            CacheLoad::Found(loaded) => {
                assert_eq!(loaded.tiles[&tile].result.bounds, record.tiles[&tile].result.bounds)
            }
            other => panic!("expected Found, got {:?}", other),
        }
    }
}
