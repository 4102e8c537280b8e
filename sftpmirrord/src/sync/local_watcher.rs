use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// A local file that should be pushed to the given remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEvent {
    pub local: PathBuf,
    pub remote: String,
}

/// Watches `root` recursively and emits an upload event for every
/// created or modified file, mapped under `remote_root`. Deletes and
/// renames are ignored: this is one-directional push, nothing is ever
/// removed remotely.
pub fn start_notify_watcher(
    root: &Path,
    remote_root: &str,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<UploadEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let remote_root = remote_root.to_string();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for upload in map_event(&watch_root, &remote_root, event) {
                // Directory events share the Create kind; only files
                // are pushed.
                if upload.local.is_file() {
                    let _ = tx.send(upload);
                }
            }
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, remote_root: &str, event: Event) -> Vec<UploadEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => Vec::new(),
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter_map(|path| to_upload(root, remote_root, path))
            .collect(),
        _ => Vec::new(),
    }
}

fn to_upload(root: &Path, remote_root: &str, path: PathBuf) -> Option<UploadEvent> {
    let relative = path.strip_prefix(root).ok()?;
    let remote = format!(
        "{}/{}",
        remote_root.trim_end_matches('/'),
        relative.to_string_lossy().replace('\\', "/")
    );
    Some(UploadEvent {
        local: path,
        remote,
    })
}
