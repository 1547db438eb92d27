use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use protocol::{FileEntry, TraverseBatch};
use tokio::sync::mpsc;

use super::{ServiceContext, ServiceError};
use crate::permissions::{normalize_path, Action};

/// Batches buffered ahead of a slow consumer.
const TRAVERSE_QUEUE_DEPTH: usize = 4;

/// Receiving end of a traversal. Ends when the walk is finished.
pub type TraverseStream = mpsc::Receiver<TraverseBatch>;

/// Root paths, listings and recursive traversal.
#[derive(Clone)]
pub struct PathService {
    context: Arc<ServiceContext>,
}

impl PathService {
    pub(super) fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    /// Configured roots the caller may read. Roots that no longer exist are
    /// skipped.
    pub fn get_root_paths(&self, token: &str) -> Vec<FileEntry> {
        self.context
            .root_paths
            .iter()
            .filter_map(|root| {
                let normalized = normalize_path(&root.display().to_string())?;
                if !self.context.can(token, &normalized, Action::Read) {
                    return None;
                }
                match self.context.fs.stat(&PathBuf::from(&normalized)) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::debug!("Skipping root {:?}: {}", root, e);
                        None
                    }
                }
            })
            .collect()
    }

    pub fn get_list(&self, token: &str, path: &str) -> Result<Vec<FileEntry>, ServiceError> {
        let path = self.context.authorize(token, path, Action::Read)?;
        Ok(self.context.fs.list(&path)?)
    }

    /// Walk `path` breadth-first, emitting batches of at most
    /// `traverse_batch_size` entries.
    ///
    /// Subdirectories the caller cannot read are not descended into, and
    /// directories that fail to list are skipped. The walk stops early if the
    /// receiver is dropped.
    pub fn traverse(&self, token: &str, path: &str) -> Result<TraverseStream, ServiceError> {
        let root = self.context.authorize(token, path, Action::Read)?;
        // Fail fast on a bad root instead of returning an empty stream.
        self.context.fs.list(&root)?;

        let (tx, rx) = mpsc::channel(TRAVERSE_QUEUE_DEPTH);
        let context = self.context.clone();
        let token = token.to_string();

        tokio::task::spawn_blocking(move || {
            let batch_size = context.traverse_batch_size.max(1);
            let mut queue = VecDeque::from([root]);
            let mut batch = TraverseBatch::default();
            let mut in_batch = 0usize;

            while let Some(dir) = queue.pop_front() {
                let entries = match context.fs.list(&dir) {
                    Ok(entries) => entries,
                    Err(e) => {
                        tracing::debug!("Traverse skipping {:?}: {}", dir, e);
                        continue;
                    }
                };
                let key = dir.display().to_string();
                // Empty directories still appear in the result.
                batch.directories.entry(key.clone()).or_default();

                for entry in entries {
                    if entry.is_dir() && context.can(&token, &entry.path, Action::Read) {
                        queue.push_back(PathBuf::from(&entry.path));
                    }
                    batch.directories.entry(key.clone()).or_default().push(entry);
                    in_batch += 1;

                    if in_batch >= batch_size {
                        if tx.blocking_send(std::mem::take(&mut batch)).is_err() {
                            tracing::debug!("Traverse receiver dropped, stopping walk");
                            return;
                        }
                        in_batch = 0;
                    }
                }
            }

            if !batch.is_empty() {
                let _ = tx.blocking_send(batch);
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;

    use tempfile::TempDir;

    use super::super::test_support::{path_str, services, TOKEN};
    use super::*;
    use crate::permissions::PermissionRule;

    fn tree() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("a/deep/deeper")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        for (i, dir) in ["", "a", "a/deep", "a/deep/deeper", "b"].iter().enumerate() {
            for j in 0..3 {
                fs::write(root.join(dir).join(format!("f{}_{}.txt", i, j)), b"x").unwrap();
            }
        }
        temp
    }

    fn read_all(root: &std::path::Path) -> PermissionRule {
        PermissionRule::new(1, 1, path_str(root)).recursive().grant(Action::Read)
    }

    async fn collect(mut rx: TraverseStream) -> Vec<TraverseBatch> {
        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch);
        }
        batches
    }

    #[test]
    fn test_root_paths_filtered() {
        let temp = tree();
        let granted = services(temp.path(), vec![read_all(temp.path())]);
        assert_eq!(granted.path.get_root_paths(TOKEN).len(), 1);

        let denied = services(temp.path(), vec![]);
        assert!(denied.path.get_root_paths(TOKEN).is_empty());
    }

    #[test]
    fn test_get_list() {
        let temp = tree();
        let services = services(temp.path(), vec![read_all(temp.path())]);
        let entries = services.path.get_list(TOKEN, &path_str(temp.path())).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "f0_0.txt", "f0_1.txt", "f0_2.txt"]);

        assert!(matches!(
            services.path.get_list("nobody", &path_str(temp.path())),
            Err(ServiceError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_traverse_batches_cover_tree() {
        let temp = tree();
        let services = services(temp.path(), vec![read_all(temp.path())]);
        let batches = collect(services.path.traverse(TOKEN, &path_str(temp.path())).unwrap()).await;

        assert!(batches.len() > 1, "expected incremental batches");
        assert!(batches.iter().all(|b| b.entry_count() <= 4));

        let total: usize = batches.iter().map(TraverseBatch::entry_count).sum();
        // 15 files plus the a, a/deep, a/deep/deeper and b directories.
        assert_eq!(total, 19);

        let dirs: BTreeSet<String> = batches
            .iter()
            .flat_map(|b| b.directories.keys().cloned())
            .collect();
        assert!(dirs.contains(&path_str(&temp.path().join("a/deep/deeper"))));
    }

    #[tokio::test]
    async fn test_traverse_skips_unreadable_subtrees() {
        let temp = tree();
        let services = services(
            temp.path(),
            vec![
                PermissionRule::new(1, 1, path_str(temp.path())).grant(Action::Read),
                PermissionRule::new(2, 1, path_str(&temp.path().join("b")))
                    .recursive()
                    .grant(Action::Read),
            ],
        );
        let batches = collect(services.path.traverse(TOKEN, &path_str(temp.path())).unwrap()).await;
        let dirs: BTreeSet<String> = batches
            .iter()
            .flat_map(|b| b.directories.keys().cloned())
            .collect();

        assert!(dirs.contains(&path_str(&temp.path().join("b"))));
        assert!(!dirs.contains(&path_str(&temp.path().join("a"))));
    }

    #[tokio::test]
    async fn test_traverse_rejects_bad_root() {
        let temp = tree();
        let services = services(temp.path(), vec![read_all(temp.path())]);
        assert!(services
            .path
            .traverse(TOKEN, &path_str(&temp.path().join("missing")))
            .is_err());
        assert!(services.path.traverse("nobody", &path_str(temp.path())).is_err());
    }
}
