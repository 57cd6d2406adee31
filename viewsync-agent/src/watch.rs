use std::path::{Path, PathBuf};

use notify::{
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use tokio::sync::mpsc;
use tracing::warn;

use crate::storage::{StorageEvent, relative_path};

pub fn translate_event(root: &Path, event: &Event) -> Vec<StorageEvent> {
    let relative = |path: &PathBuf| relative_path(root, path);

    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            match (event.paths.first(), event.paths.get(1)) {
                (Some(from), Some(to)) => match (relative(from), relative(to)) {
                    (Some(from), Some(to)) => vec![StorageEvent::Renamed { from, to }],
                    // Moved in from outside the root: the destination is new content.
                    (None, Some(to)) => vec![StorageEvent::Modified(to)],
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            }
        }
        // The source half of a rename carries nothing to apply.
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .filter_map(relative)
            .map(StorageEvent::Modified)
            .collect(),
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .filter(|path| path.is_file())
            .filter_map(relative)
            .map(StorageEvent::Modified)
            .collect(),
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(relative)
            .map(StorageEvent::Modified)
            .collect(),
        _ => Vec::new(),
    }
}

/// The returned watcher must be kept alive for events to keep flowing.
pub fn watch_storage(
    root: PathBuf,
    tx: mpsc::UnboundedSender<StorageEvent>,
) -> notify::Result<RecommendedWatcher> {
    let callback_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for storage_event in translate_event(&callback_root, &event) {
                if tx.send(storage_event).is_err() {
                    return;
                }
            }
        }
        Err(err) => warn!("storage watch error: {err}"),
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    Ok(watcher)
}
