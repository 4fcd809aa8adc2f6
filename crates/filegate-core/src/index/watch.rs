//! Live reconciliation of out-of-band filesystem changes.

use std::path::Path;
use std::sync::{Arc, Weak};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use super::PathIndex;
use crate::error::{FsError, Result};

/// Keeps a recursive watcher on the index root alive.
///
/// Dropping the guard stops watching.
pub struct IndexWatcher {
    _watcher: RecommendedWatcher,
}

impl PathIndex {
    /// Starts watching the root and mirrors changes into the index.
    ///
    /// Creations and rename targets are added; removals and rename sources
    /// drop the whole subtree. Updates take the same lock as every other
    /// mutation.
    pub fn watch(self: &Arc<Self>) -> Result<IndexWatcher> {
        let index: Weak<PathIndex> = Arc::downgrade(self);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Some(index) = index.upgrade() else {
                return;
            };
            match res {
                Ok(event) => index.reconcile(&event),
                Err(e) => warn!(error = %e, "index watcher error"),
            }
        })
        .map_err(|e| FsError::collaborator("filesystem watcher", e))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| FsError::collaborator("filesystem watcher", e))?;
        debug!(root = %self.root.display(), "watching for filesystem changes");
        Ok(IndexWatcher { _watcher: watcher })
    }

    fn reconcile(&self, event: &Event) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    self.reconcile_added(path);
                }
            }
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in &event.paths {
                    self.reconcile_removed(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [from, to] = event.paths.as_slice() {
                    self.reconcile_removed(from);
                    self.reconcile_added(to);
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                // Backends that cannot tell the direction report the path only
                for path in &event.paths {
                    if path.exists() {
                        self.reconcile_added(path);
                    } else {
                        self.reconcile_removed(path);
                    }
                }
            }
            _ => {}
        }
    }

    fn reconcile_added(&self, path: &Path) {
        if self.is_storage_path(path) {
            return;
        }
        if let Err(e) = self.add_resource(path) {
            // The entry may already be gone again
            debug!(path = %path.display(), error = %e, "watcher add skipped");
        }
    }

    fn reconcile_removed(&self, path: &Path) {
        if self.is_storage_path(path) {
            return;
        }
        self.del_tree(path);
    }
}
