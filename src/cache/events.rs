//! Content events that invalidate the page cache.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Site changes after which every stored page may be stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentEvent {
    /// A content item was created or updated.
    ContentSaved,
    ContentDeleted,
    /// A taxonomy term was edited.
    TermUpdated,
    TermDeleted,
    SettingsSaved,
    NavigationUpdated,
    /// A custom field group definition was saved.
    FieldGroupSaved,
    OptionsPageSaved,
    /// Caching is being switched off; stored pages must not outlive it.
    Deactivated,
}

impl ContentEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentEvent::ContentSaved => "content_saved",
            ContentEvent::ContentDeleted => "content_deleted",
            ContentEvent::TermUpdated => "term_updated",
            ContentEvent::TermDeleted => "term_deleted",
            ContentEvent::SettingsSaved => "settings_saved",
            ContentEvent::NavigationUpdated => "navigation_updated",
            ContentEvent::FieldGroupSaved => "field_group_saved",
            ContentEvent::OptionsPageSaved => "options_page_saved",
            ContentEvent::Deactivated => "deactivated",
        }
    }
}

/// Why the store is being cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationCause {
    Content(ContentEvent),
    ScheduledCleanup,
    ManualPurge,
}

impl InvalidationCause {
    pub fn as_str(self) -> &'static str {
        match self {
            InvalidationCause::Content(event) => event.as_str(),
            InvalidationCause::ScheduledCleanup => "scheduled_cleanup",
            InvalidationCause::ManualPurge => "manual_purge",
        }
    }
}

/// A received invalidation, identified for log correlation.
#[derive(Debug, Clone)]
pub struct Invalidation {
    pub id: Uuid,
    pub cause: InvalidationCause,
    pub received_at: OffsetDateTime,
}

impl Invalidation {
    pub fn new(cause: InvalidationCause) -> Self {
        Self {
            id: Uuid::new_v4(),
            cause,
            received_at: OffsetDateTime::now_utc(),
        }
    }
}
