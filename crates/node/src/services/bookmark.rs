use std::sync::Arc;

use protocol::Bookmark;

use super::ServiceContext;
use crate::permissions::{normalize_path, Action};

/// Configured bookmarks, filtered to what the caller may read.
#[derive(Clone)]
pub struct BookmarkService {
    context: Arc<ServiceContext>,
}

impl BookmarkService {
    pub(super) fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    pub fn get_bookmarks(&self, token: &str) -> Vec<Bookmark> {
        self.context
            .bookmarks
            .iter()
            .filter(|b| {
                normalize_path(&b.path)
                    .map(|p| self.context.can(token, &p, Action::Read))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}
