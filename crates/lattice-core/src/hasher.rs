//! BLAKE3 Snapshot Hasher
//!
//! Features:
//! - Directory resources are walked recursively
//! - Glob resources are expanded relative to the build root
//! - Files of one resource are hashed in parallel with Rayon
//! - Content is normalized before hashing (e.g. line endings)

use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::SnapshotError;
use crate::snapshot::{
    ContentHash, Fingerprint, NormalizationStrategy, NormalizedSnapshot, ResourceLocation, ResourceSpec,
    SnapshotHasher,
};

/// Default file-system snapshot hasher
#[derive(Debug, Clone, Default)]
pub struct Blake3Hasher;

impl Blake3Hasher {
    pub fn new() -> Self {
        Self
    }

    /// Hash one file after content normalization
    pub fn hash_file(&self, path: &Path, normalization: &NormalizationStrategy) -> Result<ContentHash, SnapshotError> {
        let content = fs::read(path).map_err(|source| SnapshotError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let hash = blake3::hash(&normalization.normalize_content(&content));
        Ok(ContentHash(hash.to_hex().to_string()))
    }

    fn walk(path: &Path) -> Result<Vec<PathBuf>, SnapshotError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(path).follow_links(true) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(path).to_path_buf();
                SnapshotError::Unreadable {
                    path,
                    source: e.into(),
                }
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }
}

impl SnapshotHasher for Blake3Hasher {
    fn resolve(&self, root: &Path, resource: &ResourceSpec) -> Result<Vec<PathBuf>, SnapshotError> {
        let mut files = match &resource.location {
            ResourceLocation::Path(path) => {
                let full = root.join(path);
                if full.is_dir() {
                    Self::walk(&full)?
                } else if full.is_file() {
                    vec![full]
                } else {
                    // Missing is a valid state (e.g. an output not built yet)
                    Vec::new()
                }
            }
            ResourceLocation::Glob(pattern) => {
                let full = root.join(pattern);
                let full = full.to_string_lossy();
                let paths = glob::glob(&full).map_err(|e| SnapshotError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: e.msg.to_string(),
                })?;
                let mut files = Vec::new();
                for entry in paths {
                    let path = entry.map_err(|e| SnapshotError::Unreadable {
                        path: e.path().to_path_buf(),
                        source: e.into_error(),
                    })?;
                    if path.is_file() {
                        files.push(path);
                    }
                }
                files
            }
        };
        // Sort for deterministic output
        files.sort();
        Ok(files)
    }

    fn hash(&self, root: &Path, resource: &ResourceSpec) -> Result<Vec<NormalizedSnapshot>, SnapshotError> {
        let files = self.resolve(root, resource)?;
        let normalization = resource.normalization;

        // Parallel hashing with Rayon
        let snapshots = files
            .par_iter()
            .map(|file| {
                let hash = self.hash_file(file, &normalization)?;
                Ok(NormalizedSnapshot::new(normalization.normalize_path(root, file), hash))
            })
            .collect::<Result<Vec<_>, SnapshotError>>()?;

        debug!(resource = ?resource.location, files = snapshots.len(), "hashed resource");
        Ok(snapshots)
    }

    fn fingerprint(&self, path: &Path) -> Result<Option<Fingerprint>, SnapshotError> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(Fingerprint::from_metadata(&meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SnapshotError::Unreadable {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
