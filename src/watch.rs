//! Directory watcher for read-only storage instances.
//!
//! Read-only instances never take the writer lock; instead they watch the
//! data directory so they notice partitions and indexes the writer has
//! grown or created. `*.branch` sidecars are reserved and filtered out.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, TryRecvError};

use notify::{RecursiveMode, Watcher};

use crate::error::{Result, StoreError};

pub struct DirectoryWatcher {
    _watcher: notify::RecommendedWatcher,
    events: Receiver<PathBuf>,
}

impl DirectoryWatcher {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                for path in event.paths {
                    if !is_branch_sidecar(&path) {
                        let _ = tx.send(path);
                    }
                }
            }
        })
        .map_err(|e| StoreError::InvalidArgument(format!("failed to start directory watcher: {e}")))?;

        watcher
            .watch(data_dir.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| StoreError::InvalidArgument(format!("failed to watch {:?}: {e}", data_dir.as_ref())))?;

        Ok(Self { _watcher: watcher, events: rx })
    }

    /// Drains pending change notifications without blocking.
    pub fn drain(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(path) => out.push(path),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        out
    }
}

fn is_branch_sidecar(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "branch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_sidecars_are_filtered() {
        assert!(is_branch_sidecar(Path::new("storage.orders.branch")));
        assert!(!is_branch_sidecar(Path::new("storage.orders.index")));
    }
}
