//! On-disk page store.
//!
//! A single flat directory holds one file per cache key plus a placeholder
//! `index.html`. Entries are written to a temp file in the same directory and
//! persisted by rename, so readers never observe a partial page.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinError;
use tracing::{debug, warn};

use super::keys::CacheKey;

const TARGET: &str = "quire::cache::store";

/// Placeholder document that discourages directory listing.
pub const PLACEHOLDER_FILE: &str = "index.html";
const PLACEHOLDER_BODY: &str = "<!DOCTYPE html><html><head></head><body></body></html>";

/// Prefix of in-flight temp files; never matches a valid key prefix.
const PENDING_PREFIX: &str = ".pending-";
/// Temp files older than this are leftovers of an interrupted write.
const PENDING_GRACE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create cache directory `{path}`: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read cache entry `{key}`: {source}")]
    Read {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write cache entry `{key}`: {source}")]
    Write {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to list cache directory `{path}`: {source}")]
    Clear {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache store task failed: {0}")]
    Task(#[from] JoinError),
}

/// Outcome of a [`PageStore::clear`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub removed: usize,
    pub failed: usize,
    /// Abandoned temp files swept alongside the entries.
    pub stale_pending: usize,
}

/// Keyed blob store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct PageStore {
    root: PathBuf,
    prefix: String,
}

impl PageStore {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    pub async fn exists(&self, key: &CacheKey) -> bool {
        fs::metadata(self.entry_path(key))
            .await
            .is_ok_and(|meta| meta.is_file())
    }

    /// Stored bytes for `key`, or `None` when no entry exists.
    pub async fn read(&self, key: &CacheKey) -> Result<Option<Bytes>, StoreError> {
        match fs::read(self.entry_path(key)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Atomically replace the entry for `key` with `body`.
    pub async fn write(&self, key: &CacheKey, body: Bytes) -> Result<(), StoreError> {
        self.ensure_root().await?;

        let root = self.root.clone();
        let target = self.entry_path(key);
        let key_name = key.to_string();

        tokio::task::spawn_blocking(move || persist_entry(&root, &target, &body, &key_name))
            .await??;

        debug!(target = TARGET, op = "write", key = %key, "Stored cache entry");
        Ok(())
    }

    /// Remove every entry carrying the key prefix.
    ///
    /// The placeholder and unrelated files survive, as do temp files of writes
    /// still in flight. Individual removal failures are logged and counted
    /// rather than aborting the sweep.
    pub async fn clear(&self) -> Result<ClearReport, StoreError> {
        let mut report = ClearReport::default();

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(report),
            Err(source) => {
                return Err(StoreError::Clear {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(StoreError::Clear {
                        path: self.root.clone(),
                        source,
                    });
                }
            };

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let stale = name.starts_with(PENDING_PREFIX) && is_stale_pending(&entry).await;
            if !stale && !self.owns(name) {
                continue;
            }
            if !entry.file_type().await.is_ok_and(|kind| kind.is_file()) {
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) if stale => report.stale_pending += 1,
                Ok(()) => report.removed += 1,
                // Lost a race with another sweep.
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target = TARGET,
                        op = "clear",
                        file = name,
                        error = %err,
                        "Failed to remove cache entry"
                    );
                }
            }
        }

        debug!(
            target = TARGET,
            op = "clear",
            removed = report.removed,
            failed = report.failed,
            stale_pending = report.stale_pending,
            "Cleared cache directory"
        );
        Ok(report)
    }

    /// Number of entries currently on disk.
    pub async fn entry_count(&self) -> Result<usize, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(StoreError::Clear {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut count = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StoreError::Clear {
                path: self.root.clone(),
                source,
            })?
        {
            if entry.file_name().to_str().is_some_and(|name| self.owns(name)) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn owns(&self, name: &str) -> bool {
        name != PLACEHOLDER_FILE && name.starts_with(&self.prefix)
    }

    async fn ensure_root(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::CreateDir {
                path: self.root.clone(),
                source,
            })?;

        let placeholder = self.root.join(PLACEHOLDER_FILE);
        if fs::try_exists(&placeholder).await.unwrap_or(false) {
            return Ok(());
        }
        if let Err(err) = fs::write(&placeholder, PLACEHOLDER_BODY).await {
            warn!(
                target = TARGET,
                op = "ensure_root",
                error = %err,
                "Failed to write placeholder index"
            );
        }
        Ok(())
    }
}

async fn is_stale_pending(entry: &fs::DirEntry) -> bool {
    entry
        .metadata()
        .await
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age >= PENDING_GRACE)
}

fn persist_entry(root: &Path, target: &Path, body: &[u8], key: &str) -> Result<(), StoreError> {
    let write_err = |source: std::io::Error| StoreError::Write {
        key: key.to_string(),
        source,
    };

    let mut temp = tempfile::Builder::new()
        .prefix(PENDING_PREFIX)
        .suffix(".tmp")
        .tempfile_in(root)
        .map_err(write_err)?;
    temp.write_all(body).map_err(write_err)?;
    temp.flush().map_err(write_err)?;
    temp.persist(target).map_err(|err| write_err(err.error))?;
    Ok(())
}
