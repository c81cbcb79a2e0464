use crate::types::{DemResult, FingerprintMode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Identity of a file at a point in time, used to decide whether cached
/// outputs are still valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    /// Only captured under `FingerprintMode::Sha256`.
    pub sha256: Option<String>,
}

impl Fingerprint {
    /// Capture the fingerprint of `path` under the given validation mode.
    pub fn capture<P: AsRef<Path>>(path: P, mode: FingerprintMode) -> DemResult<Self> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)?;
        let (mtime_secs, mtime_nanos) = match metadata.modified()?.duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
            // Pre-epoch mtimes exist on some filesystems.
            Err(e) => (-(e.duration().as_secs() as i64), e.duration().subsec_nanos()),
        };

        let sha256 = match mode {
            FingerprintMode::MtimeSize => None,
            FingerprintMode::Sha256 => Some(digest_file(path)?),
        };

        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            mtime_secs,
            mtime_nanos,
            sha256,
        })
    }

    /// Whether a stored fingerprint still describes the file on disk.
    ///
    /// `current` must have been captured with the same `mode`. Under
    /// `Sha256` a stored entry without a digest never matches, so tightening
    /// the validation mode invalidates older entries.
    pub fn matches(&self, current: &Fingerprint, mode: FingerprintMode) -> bool {
        if self.size != current.size
            || self.mtime_secs != current.mtime_secs
            || self.mtime_nanos != current.mtime_nanos
        {
            return false;
        }
        match mode {
            FingerprintMode::MtimeSize => true,
            FingerprintMode::Sha256 => match (&self.sha256, &current.sha256) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

fn digest_file(path: &Path) -> DemResult<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
