//! Invalidation coordinator.
//!
//! Clears the page store when site content changes and on a recurring
//! cleanup timer that sweeps entries orphaned by key changes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{ContentEvent, Invalidation, InvalidationCause};
use super::lock::mutex_lock;
use super::store::{ClearReport, PageStore, StoreError};

const SOURCE: &str = "cache::trigger";
const TARGET: &str = "quire::cache::trigger";

pub struct InvalidationCoordinator {
    store: Arc<PageStore>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationCoordinator {
    pub fn new(store: Arc<PageStore>) -> Self {
        Self {
            store,
            cleanup: Mutex::new(None),
        }
    }

    /// Clear every stored page after a content change.
    pub async fn on_content_changed(&self, event: ContentEvent) -> Result<ClearReport, StoreError> {
        invalidate(&self.store, Invalidation::new(InvalidationCause::Content(event))).await
    }

    /// Periodic sweep; identical to a content invalidation.
    pub async fn on_scheduled_cleanup(&self) -> Result<ClearReport, StoreError> {
        invalidate(&self.store, Invalidation::new(InvalidationCause::ScheduledCleanup)).await
    }

    /// Operator-requested purge.
    pub async fn purge(&self) -> Result<ClearReport, StoreError> {
        invalidate(&self.store, Invalidation::new(InvalidationCause::ManualPurge)).await
    }

    /// Register the recurring cleanup task.
    ///
    /// Returns `false` without spawning anything when a cleanup task is
    /// already registered or `interval` is zero. Must be called from within a
    /// tokio runtime.
    pub fn schedule_cleanup(&self, interval: Duration) -> bool {
        if interval.is_zero() {
            warn!(target = TARGET, "Refusing to schedule cleanup with a zero interval");
            return false;
        }

        let mut slot = mutex_lock(&self.cleanup, SOURCE, "schedule_cleanup");
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!(target = TARGET, "Cleanup already scheduled");
            return false;
        }

        let store = Arc::clone(&self.store);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let _ = invalidate(&store, Invalidation::new(InvalidationCause::ScheduledCleanup)).await;
            }
        }));

        info!(
            target = TARGET,
            interval_secs = interval.as_secs(),
            "Scheduled recurring cache cleanup"
        );
        true
    }

    pub fn is_cleanup_scheduled(&self) -> bool {
        mutex_lock(&self.cleanup, SOURCE, "is_cleanup_scheduled")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the recurring cleanup. Returns whether a task was running.
    pub fn cancel_cleanup(&self) -> bool {
        match mutex_lock(&self.cleanup, SOURCE, "cancel_cleanup").take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for InvalidationCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = mutex_lock(&self.cleanup, SOURCE, "drop").take() {
            handle.abort();
        }
    }
}

async fn invalidate(store: &PageStore, invalidation: Invalidation) -> Result<ClearReport, StoreError> {
    let cause = invalidation.cause.as_str();
    match store.clear().await {
        Ok(report) => {
            metrics::counter!("quire_cache_clear_total", "cause" => cause).increment(1);
            info!(
                target = TARGET,
                invalidation_id = %invalidation.id,
                received_at = %invalidation.received_at,
                cause,
                removed = report.removed,
                failed = report.failed,
                stale_pending = report.stale_pending,
                "Cleared page cache"
            );
            Ok(report)
        }
        Err(err) => {
            warn!(
                target = TARGET,
                invalidation_id = %invalidation.id,
                received_at = %invalidation.received_at,
                cause,
                error = %err,
                "Failed to clear page cache"
            );
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::keys::compose_key;

    async fn seeded_store(dir: &TempDir) -> Arc<PageStore> {
        let store = Arc::new(PageStore::new(dir.path().join("quire-cache"), "quire_page_"));
        for url in ["/", "/about", "/blog?page=2"] {
            store
                .write(&compose_key("quire_page_", url, 1, 2), Bytes::from_static(b"<html></html>"))
                .await
                .expect("seed");
        }
        store
    }

    #[tokio::test]
    async fn every_content_event_clears_the_store() {
        let events = [
            ContentEvent::ContentSaved,
            ContentEvent::ContentDeleted,
            ContentEvent::TermUpdated,
            ContentEvent::TermDeleted,
            ContentEvent::SettingsSaved,
            ContentEvent::NavigationUpdated,
            ContentEvent::FieldGroupSaved,
            ContentEvent::OptionsPageSaved,
            ContentEvent::Deactivated,
        ];

        for event in events {
            let dir = TempDir::new().expect("tempdir");
            let store = seeded_store(&dir).await;
            let coordinator = InvalidationCoordinator::new(store.clone());

            let report = coordinator.on_content_changed(event).await.expect("clear");
            assert_eq!(report.removed, 3, "{event:?}");
            assert_eq!(store.entry_count().await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn scheduled_cleanup_clears_the_store() {
        let dir = TempDir::new().expect("tempdir");
        let store = seeded_store(&dir).await;
        let coordinator = InvalidationCoordinator::new(store.clone());

        coordinator.on_scheduled_cleanup().await.expect("clear");
        assert_eq!(store.entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn schedule_cleanup_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let coordinator = InvalidationCoordinator::new(seeded_store(&dir).await);

        assert!(coordinator.schedule_cleanup(Duration::from_secs(3600)));
        assert!(!coordinator.schedule_cleanup(Duration::from_secs(3600)));
        assert!(!coordinator.schedule_cleanup(Duration::from_secs(60)));
        assert!(coordinator.is_cleanup_scheduled());

        assert!(coordinator.cancel_cleanup());
        assert!(!coordinator.is_cleanup_scheduled());
        assert!(coordinator.schedule_cleanup(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let coordinator = InvalidationCoordinator::new(seeded_store(&dir).await);
        assert!(!coordinator.schedule_cleanup(Duration::ZERO));
        assert!(!coordinator.is_cleanup_scheduled());
    }

    #[tokio::test]
    async fn scheduled_task_sweeps_on_each_tick() {
        let dir = TempDir::new().expect("tempdir");
        let store = seeded_store(&dir).await;
        let coordinator = InvalidationCoordinator::new(store.clone());

        assert!(coordinator.schedule_cleanup(Duration::from_millis(20)));

        let mut remaining = usize::MAX;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remaining = store.entry_count().await.unwrap();
            if remaining == 0 {
                break;
            }
        }
        assert_eq!(remaining, 0);
    }
}
