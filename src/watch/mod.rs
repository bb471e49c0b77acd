//! Filesystem watcher.
//!
//! Watches the project root recursively and forwards one
//! [`SupervisorMsg::Changed`] per changed path. Excluded paths, editor
//! artifacts, access events and metadata-only changes never reach the
//! supervisor.

mod rules;

pub use rules::{DEFAULT_IGNORE, WatchRules};

use std::path::{Path, PathBuf};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;

use crate::supervisor::SupervisorMsg;
use crate::utils::path::unix_slashes;
use crate::log;

/// Check if path is a temp/backup file (editor artifacts)
///
/// Other dotfiles (`.env`) are real inputs and pass through.
fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "swx" | "tmp")
        || name.ends_with('~')
        || name.starts_with(".#")
}

/// Recursive watcher on the project root. Dropping it stops watching.
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
}

impl FsWatcher {
    /// Start watching `rules.root()` right away; events are sent to `tx`.
    pub fn new(rules: WatchRules, tx: UnboundedSender<SupervisorMsg>) -> notify::Result<Self> {
        let root = rules.root().to_path_buf();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in changes(&event, &rules) {
                    if tx.send(SupervisorMsg::Changed(change)).is_err() {
                        return; // supervisor gone
                    }
                }
            }
            Err(e) => log!("watch"; "notify error: {}", e),
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        log!("watch"; "watching {}", unix_slashes(&root));
        Ok(Self { _watcher: watcher })
    }
}

/// Changes worth reporting in one raw event.
///
/// A path-less event yields a single `None`.
fn changes(event: &Event, rules: &WatchRules) -> Vec<Option<PathBuf>> {
    match event.kind {
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        _ => {}
    }
    if event.paths.is_empty() {
        return vec![None];
    }

    event
        .paths
        .iter()
        .filter(|path| !is_temp_file(path) && !rules.is_excluded(path))
        .map(|path| Some(PathBuf::from(unix_slashes(path))))
        .collect()
}
