use crate::types::{BoundingBox, DemError, DemResult, TileId};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zip::ZipArchive;

/// Downloads public 1x1 degree elevation tiles into a local cache so they can
/// be fed into normalization as ordinary sources.
pub struct SrtmFetcher {
    cache_dir: PathBuf,
}

/// One candidate download location for a tile.
struct TileSource {
    url: String,
    file_name: String,
}

impl SrtmFetcher {
    /// Fetcher rooted at the platform cache directory.
    pub fn new() -> Self {
        let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            cache_dir: base.join("demprep").join("srtm"),
        }
    }

    pub fn with_cache_dir<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// SRTM-convention name of a cell, e.g. `N46E007` or `S12W077`.
    pub fn srtm_tile_name(tile: &TileId) -> String {
        let lat_prefix = if tile.lat() >= 0 { "N" } else { "S" };
        let lon_prefix = if tile.lon() >= 0 { "E" } else { "W" };
        format!(
            "{}{:02}{}{:03}",
            lat_prefix,
            tile.lat().abs(),
            lon_prefix,
            tile.lon().abs()
        )
    }

    /// Fetch every tile covering `bbox`; see [`SrtmFetcher::fetch`].
    pub fn fetch_bounds(&self, bbox: &BoundingBox) -> DemResult<Vec<PathBuf>> {
        self.fetch(&TileId::covering(bbox))
    }

    /// Download the given tiles into the cache, skipping ones already there.
    ///
    /// Returns the local paths of the tiles that are now available. Tiles
    /// that fail on every source are logged and skipped; only a fully empty
    /// result is an error.
    pub fn fetch(&self, tiles: &[TileId]) -> DemResult<Vec<PathBuf>> {
        log::info!("Fetching {} elevation tile(s) into cache", tiles.len());
        std::fs::create_dir_all(&self.cache_dir)?;

        let mut available = Vec::new();
        for tile in tiles {
            let name = Self::srtm_tile_name(tile);

            // A tile may already be cached in either delivered format.
            if let Some(existing) = self.cached_file(&name) {
                log::info!("Tile {} already cached, skipping download", name);
                available.push(existing);
                continue;
            }

            match self.try_sources(tile, &name) {
                Some(path) => {
                    log::info!("Successfully downloaded {}", name);
                    available.push(path);
                }
                None => log::warn!("Failed to download {} from all sources", name),
            }
        }

        if available.is_empty() && !tiles.is_empty() {
            return Err(DemError::Processing(
                "failed to download any elevation tiles from available sources; \
                 check internet connectivity or provide DEM files manually"
                    .to_string(),
            ));
        }
        Ok(available)
    }

    fn cached_file(&self, name: &str) -> Option<PathBuf> {
        for ext in ["hgt", "tif"] {
            let candidate = self.cache_dir.join(format!("{}.{}", name, ext));
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    fn try_sources(&self, tile: &TileId, name: &str) -> Option<PathBuf> {
        let sources = Self::tile_sources(tile);
        for (i, source) in sources.iter().enumerate() {
            log::info!(
                "Attempting download from source {} of {}: {}",
                i + 1,
                sources.len(),
                source.url
            );
            let output_path = self.cache_dir.join(&source.file_name);
            match Self::download_and_extract(&source.url, &output_path) {
                Ok(()) => return Some(output_path),
                Err(e) => log::warn!("Source {} failed: {}", i + 1, e),
            }
        }
        log::error!("All download sources failed for tile {}", name);
        None
    }

    /// Candidate sources in order of preference. AWS-hosted sets come first
    /// since they need no authentication.
    fn tile_sources(tile: &TileId) -> Vec<TileSource> {
        let name = Self::srtm_tile_name(tile);
        let lat_dir = &name[0..3];
        let lat_str = format!(
            "{}{:02}",
            if tile.lat() >= 0 { "N" } else { "S" },
            tile.lat().abs()
        );
        let lon_str = format!(
            "{}{:03}",
            if tile.lon() >= 0 { "E" } else { "W" },
            tile.lon().abs()
        );

        vec![
            TileSource {
                url: format!(
                    "https://s3.amazonaws.com/elevation-tiles-prod/skadi/{}/{}.hgt.gz",
                    lat_dir, name
                ),
                file_name: format!("{}.hgt", name),
            },
            TileSource {
                url: format!(
                    "https://copernicus-dem-30m.s3.amazonaws.com/DEM/Copernicus_DSM_COG_10_{}_00_{}_00_DEM.tif",
                    lat_str, lon_str
                ),
                file_name: format!("{}.tif", name),
            },
            TileSource {
                url: format!(
                    "https://copernicus-dem-90m.s3.amazonaws.com/DEM/Copernicus_DSM_COG_30_{}_00_{}_00_DEM.tif",
                    lat_str, lon_str
                ),
                file_name: format!("{}.tif", name),
            },
            TileSource {
                url: format!(
                    "https://e4ftl01.cr.usgs.gov/MEASURES/SRTMGL1.003/2000.02.11/{}.SRTMGL1.hgt.zip",
                    name
                ),
                file_name: format!("{}.hgt", name),
            },
            TileSource {
                url: format!(
                    "https://dds.cr.usgs.gov/srtm/version2_1/SRTM1/{}/{}.hgt.zip",
                    Self::srtm_continent(tile),
                    name
                ),
                file_name: format!("{}.hgt", name),
            },
        ]
    }

    /// Continent directory used by the USGS archive layout. Coarse mapping,
    /// good enough for a last-resort mirror.
    fn srtm_continent(tile: &TileId) -> &'static str {
        if tile.lat() >= 0 {
            if tile.lon() < 0 {
                "North_America"
            } else {
                "Eurasia"
            }
        } else if tile.lon() < 0 {
            "South_America"
        } else if tile.lat() >= -19 {
            "Africa"
        } else {
            "Australia"
        }
    }

    fn download_and_extract(url: &str, output_path: &Path) -> DemResult<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .user_agent("demprep/0.3.0 (DEM preparation tool)")
            .build()
            .map_err(|e| DemError::Processing(format!("failed to create HTTP client: {}", e)))?;

        let max_retries = 3;
        let mut last_error = None;
        for attempt in 1..=max_retries {
            log::debug!("Download attempt {} of {}", attempt, max_retries);
            match Self::download_once(&client, url, output_path) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < max_retries {
                        log::warn!("Download attempt {} failed, retrying...", attempt);
                        std::thread::sleep(Duration::from_secs(2));
                    }
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| DemError::Processing("download failed after all retries".into())))
    }

    fn download_once(
        client: &reqwest::blocking::Client,
        url: &str,
        output_path: &Path,
    ) -> DemResult<()> {
        let response = client
            .get(url)
            .send()
            .map_err(|e| DemError::Processing(format!("HTTP request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(DemError::Processing(format!(
                "HTTP {} {}: {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or(""),
                url
            )));
        }

        let content = response
            .bytes()
            .map_err(|e| DemError::Processing(format!("failed to read response body: {}", e)))?;

        // Anything this small is an error page, not elevation data.
        if content.len() < 1024 {
            return Err(DemError::Processing(format!(
                "downloaded file too small ({} bytes), likely an error page",
                content.len()
            )));
        }
        log::debug!("Downloaded {} bytes", content.len());

        if is_gzip(&content) {
            extract_gzip(&content, output_path)?;
        } else if is_zip(&content) {
            extract_hgt_from_zip(&content, output_path)?;
        } else {
            std::fs::write(output_path, &content)?;
        }

        let metadata = std::fs::metadata(output_path)?;
        if metadata.len() == 0 {
            return Err(DemError::Processing("output file is empty".to_string()));
        }
        log::debug!("Output file size: {} bytes", metadata.len());
        Ok(())
    }
}

impl Default for SrtmFetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn is_gzip(content: &[u8]) -> bool {
    content.len() >= 2 && content[0] == 0x1F && content[1] == 0x8B
}

fn is_zip(content: &[u8]) -> bool {
    content.len() >= 4 && content[0..4] == [0x50, 0x4B, 0x03, 0x04]
}

fn extract_gzip(gzip_data: &[u8], output_path: &Path) -> DemResult<()> {
    log::debug!("Decompressing gzipped tile");
    let mut decoder = flate2::read::GzDecoder::new(gzip_data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| DemError::Processing(format!("failed to decompress gzip data: {}", e)))?;
    if decompressed.is_empty() {
        return Err(DemError::Processing("decompressed tile is empty".to_string()));
    }
    std::fs::write(output_path, decompressed)?;
    Ok(())
}

fn extract_hgt_from_zip(zip_data: &[u8], output_path: &Path) -> DemResult<()> {
    let reader = Cursor::new(zip_data);
    let mut archive = ZipArchive::new(reader)
        .map_err(|e| DemError::Processing(format!("failed to open ZIP archive: {}", e)))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| DemError::Processing(format!("failed to read ZIP entry {}: {}", i, e)))?;
        if file.name().ends_with(".hgt") {
            log::debug!("Extracting HGT file: {}", file.name());
            let mut buffer = Vec::new();
            std::io::copy(&mut file, &mut buffer)?;
            std::fs::write(output_path, buffer)?;
            return Ok(());
        }
    }
    Err(DemError::Processing(
        "no HGT file found in ZIP archive".to_string(),
    ))
}
