//! Freshness watermarks backed by file modification times.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::fs;

use crate::cache::{ContentQueryError, Watermarks};

/// Reads the content watermark from a marker file and the template watermark
/// from the template root directory.
#[derive(Debug, Clone)]
pub struct FsWatermarks {
    content_marker: PathBuf,
    template_root: PathBuf,
}

impl FsWatermarks {
    pub fn new(content_marker: impl Into<PathBuf>, template_root: impl Into<PathBuf>) -> Self {
        Self {
            content_marker: content_marker.into(),
            template_root: template_root.into(),
        }
    }

    /// Create the content marker if it does not exist yet.
    pub async fn ensure_content_marker(&self) -> std::io::Result<()> {
        if fs::try_exists(&self.content_marker).await? {
            return Ok(());
        }
        self.touch_content().await
    }

    /// Advance the content watermark to now.
    pub async fn touch_content(&self) -> std::io::Result<()> {
        let marker = self.content_marker.clone();
        tokio::task::spawn_blocking(move || touch(&marker))
            .await
            .map_err(std::io::Error::other)?
    }
}

fn touch(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.set_modified(SystemTime::now())
}

async fn modified_at(path: &Path) -> Result<OffsetDateTime, ContentQueryError> {
    let modified = fs::metadata(path).await?.modified()?;
    Ok(OffsetDateTime::from(modified))
}

#[async_trait]
impl Watermarks for FsWatermarks {
    async fn content_modified(&self) -> Result<OffsetDateTime, ContentQueryError> {
        modified_at(&self.content_marker).await
    }

    async fn template_modified(&self) -> Result<OffsetDateTime, ContentQueryError> {
        modified_at(&self.template_root).await
    }
}

/// In-memory watermarks set explicitly, in unix seconds.
#[derive(Debug, Default)]
pub struct ManualWatermarks {
    content: AtomicI64,
    template: AtomicI64,
}

impl ManualWatermarks {
    pub fn new(content: i64, template: i64) -> Self {
        Self {
            content: AtomicI64::new(content),
            template: AtomicI64::new(template),
        }
    }

    pub fn set_content(&self, unix_seconds: i64) {
        self.content.store(unix_seconds, Ordering::SeqCst);
    }

    pub fn set_template(&self, unix_seconds: i64) {
        self.template.store(unix_seconds, Ordering::SeqCst);
    }
}

fn from_unix(seconds: i64) -> Result<OffsetDateTime, ContentQueryError> {
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|err| ContentQueryError::Unavailable(err.to_string()))
}

#[async_trait]
impl Watermarks for ManualWatermarks {
    async fn content_modified(&self) -> Result<OffsetDateTime, ContentQueryError> {
        from_unix(self.content.load(Ordering::SeqCst))
    }

    async fn template_modified(&self) -> Result<OffsetDateTime, ContentQueryError> {
        from_unix(self.template.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn missing_marker_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let watermarks = FsWatermarks::new(dir.path().join("stamp"), dir.path());

        assert!(watermarks.content_modified().await.is_err());
        assert!(watermarks.template_modified().await.is_ok());
    }

    #[tokio::test]
    async fn touch_advances_content_watermark() {
        let dir = TempDir::new().expect("tempdir");
        let marker = dir.path().join("nested/stamp");
        let watermarks = FsWatermarks::new(&marker, dir.path());

        watermarks.ensure_content_marker().await.expect("create marker");
        let old = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .append(true)
            .open(&marker)
            .unwrap()
            .set_modified(old)
            .unwrap();
        let before = watermarks.content_modified().await.unwrap();

        watermarks.touch_content().await.expect("touch");
        let after = watermarks.content_modified().await.unwrap();

        assert!(after.unix_timestamp() >= before.unix_timestamp() + 3000);
    }

    #[tokio::test]
    async fn ensure_keeps_existing_marker_time() {
        let dir = TempDir::new().expect("tempdir");
        let marker = dir.path().join("stamp");
        std::fs::write(&marker, "").unwrap();
        let old = SystemTime::now() - Duration::from_secs(7200);
        std::fs::File::options()
            .append(true)
            .open(&marker)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let watermarks = FsWatermarks::new(&marker, dir.path());
        watermarks.ensure_content_marker().await.unwrap();

        let stamp = watermarks.content_modified().await.unwrap();
        assert!(stamp.unix_timestamp() <= OffsetDateTime::from(old).unix_timestamp() + 1);
    }

    #[tokio::test]
    async fn manual_watermarks_report_set_values() {
        let watermarks = ManualWatermarks::new(1000, 2000);
        watermarks.set_content(1050);
        assert_eq!(watermarks.content_modified().await.unwrap().unix_timestamp(), 1050);
        assert_eq!(watermarks.template_modified().await.unwrap().unix_timestamp(), 2000);
    }
}
