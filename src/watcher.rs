//! File watcher (§4.10, §5) — recursive, debounced, ignores `node_modules`,
//! VCS metadata and the output root. Emits `added | changed | deleted` per
//! path; a changed `.env`/`.env.local` file emits a distinct `env:changed`
//! event instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Event as NotifyEvent, EventKind as NotifyEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::event_bus::{Event, EventBus, EventKind};

pub const DEFAULT_STABILITY_WINDOW: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Added,
    Changed,
    Removed,
}

fn is_ignored(path: &Path, output_root: &Path) -> bool {
    if path.starts_with(output_root) {
        return true;
    }
    path.components().any(|c| {
        let s = c.as_os_str().to_string_lossy();
        s == "node_modules" || s == ".git" || s == ".hg" || s == ".svn"
    })
}

fn is_env_file(path: &Path) -> bool {
    matches!(path.file_name().and_then(|n| n.to_str()), Some(".env") | Some(".env.local"))
}

/// Owns the underlying OS watcher; dropping this stops watching.
pub struct FileWatcher {
    _inner: RecommendedWatcher,
}

/// Start watching `watch_root` (typically the project root, so `.env`
/// changes are seen alongside route sources), publishing debounced
/// `file:*` / `env:changed` events to `event_bus`.
pub fn start(
    watch_root: PathBuf,
    output_root: PathBuf,
    stability_window: Duration,
    event_bus: Arc<EventBus>,
) -> notify::Result<FileWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel::<NotifyEvent>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;
    watcher.watch(&watch_root, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, (Change, Instant)> = HashMap::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(50));

        loop {
            tokio::select! {
                maybe_event = rx.recv() => {
                    let Some(event) = maybe_event else { break };
                    let change = match event.kind {
                        NotifyEventKind::Create(_) => Change::Added,
                        NotifyEventKind::Modify(_) => Change::Changed,
                        NotifyEventKind::Remove(_) => Change::Removed,
                        _ => continue,
                    };
                    for path in event.paths {
                        if is_ignored(&path, &output_root) {
                            continue;
                        }
                        pending.insert(path, (change, Instant::now()));
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let stable: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, (_, seen))| now.duration_since(*seen) >= stability_window)
                        .map(|(path, _)| path.clone())
                        .collect();

                    for path in stable {
                        if let Some((change, _)) = pending.remove(&path) {
                            emit_for(&event_bus, &path, change).await;
                        }
                    }
                }
            }
        }
    });

    Ok(FileWatcher { _inner: watcher })
}

async fn emit_for(event_bus: &EventBus, path: &Path, change: Change) {
    if is_env_file(path) {
        event_bus
            .emit(Event {
                kind: EventKind::EnvChanged,
                payload: serde_json::json!({ "path": path.to_string_lossy() }),
            })
            .await;
        return;
    }

    let kind = match change {
        Change::Added => EventKind::FileAdded,
        Change::Changed => EventKind::FileChanged,
        Change::Removed => EventKind::FileDeleted,
    };
    event_bus
        .emit(Event { kind, payload: serde_json::json!({ "path": path.to_string_lossy() }) })
        .await;
}
