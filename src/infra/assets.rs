//! Filesystem-backed stylesheet resolution for the output transformer.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::cache::AssetResolver;

/// Resolves site URL paths against a document root on disk.
#[derive(Debug, Clone)]
pub struct FsAssetResolver {
    root: PathBuf,
}

impl FsAssetResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, url_path: &str) -> Option<PathBuf> {
        let candidate = url_path.trim_start_matches('/');
        if candidate.is_empty() || candidate.ends_with('/') || candidate.contains('\\') {
            return None;
        }

        // Avoid directory traversal and absolute escapes.
        let relative = Path::new(candidate);
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return None;
        }

        Some(self.root.join(relative))
    }
}

impl AssetResolver for FsAssetResolver {
    fn open(&self, url_path: &str) -> std::io::Result<Option<Vec<u8>>> {
        let Some(path) = self.resolve(url_path) else {
            return Ok(None);
        };

        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
