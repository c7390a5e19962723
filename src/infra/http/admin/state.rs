use std::sync::Arc;

use crate::cache::{InvalidationCoordinator, PageStore};
use crate::infra::watermarks::FsWatermarks;

#[derive(Clone)]
pub struct AdminState {
    pub coordinator: Arc<InvalidationCoordinator>,
    pub store: Arc<PageStore>,
    /// Advanced on every content event so keys derived afterwards differ.
    pub watermarks: Option<Arc<FsWatermarks>>,
}
