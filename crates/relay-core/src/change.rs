//! `ChangeSource` contract (§4.2) and its default `notify`-backed
//! implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// The kind of filesystem change observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Modify,
    Remove,
    VersionUpdate,
    DependencyChange,
}

/// One observed change.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Emits a lazy stream of change events for a set of watched paths, filtering
/// out vendor directories. Consumers cancel the stream to release resources.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Start watching; events are pushed onto `tx` until `cancel` fires.
    async fn watch(
        &self,
        paths: Vec<PathBuf>,
        tx: mpsc::Sender<ChangeEvent>,
        cancel: CancellationToken,
    ) -> Result<(), crate::error::SupervisorError>;
}

/// Default `notify`-backed implementation.
///
/// Grounded on `watch_inboxes` in `atm-daemon/src/daemon/watcher.rs`: a
/// `notify::RecommendedWatcher` feeding a synchronous `std::sync::mpsc`
/// receiver drained on a `spawn_blocking` task, forwarding onto the async
/// channel, with a `CancellationToken` checked on each poll.
pub struct NotifyChangeSource {
    ignore: globset::GlobSet,
}

impl NotifyChangeSource {
    pub fn new(ignore: globset::GlobSet) -> Self {
        Self { ignore }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        self.ignore.is_match(path)
    }
}

#[async_trait]
impl ChangeSource for NotifyChangeSource {
    async fn watch(
        &self,
        paths: Vec<PathBuf>,
        tx: mpsc::Sender<ChangeEvent>,
        cancel: CancellationToken,
    ) -> Result<(), crate::error::SupervisorError> {
        use notify::{RecursiveMode, Watcher};

        let (sync_tx, sync_rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if sync_tx.send(event).is_err() {
                        // receiver dropped; watcher will be torn down shortly.
                    }
                }
                Err(err) => error!("file watcher error: {err}"),
            }
        })
        .map_err(|err| crate::error::SupervisorError::ConfigError(err.to_string()))?;

        for path in &paths {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|err| crate::error::SupervisorError::ConfigError(err.to_string()))?;
        }

        let ignore = self.ignore.clone();
        tokio::task::spawn_blocking(move || loop {
            if cancel.is_cancelled() {
                debug!("change source watcher cancelled");
                break;
            }
            match sync_rx.recv_timeout(std::time::Duration::from_millis(100)) {
                Ok(event) => {
                    for change in decode_event(&ignore, event) {
                        if tx.blocking_send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    warn!("file watcher channel disconnected");
                    break;
                }
            }
        })
        .await
        .map_err(|err| crate::error::SupervisorError::Fatal(format!("watcher task panicked: {err}")))?;

        // keep the watcher alive for the duration of the blocking loop above.
        drop(watcher);
        Ok(())
    }
}

fn decode_event(ignore: &globset::GlobSet, event: notify::Event) -> Vec<ChangeEvent> {
    let kind = match event.kind {
        notify::EventKind::Create(_) => ChangeKind::Create,
        notify::EventKind::Modify(_) => ChangeKind::Modify,
        notify::EventKind::Remove(_) => ChangeKind::Remove,
        _ => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .filter(|path| !ignore.is_match(path))
        .map(|path| ChangeEvent { path, kind })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_filters_ignored_paths() {
        let mut builder = globset::GlobSetBuilder::new();
        builder.add(globset::Glob::new("**/node_modules/**").unwrap());
        let set = builder.build().unwrap();

        let event = notify::Event {
            kind: notify::EventKind::Modify(notify::event::ModifyKind::Any),
            paths: vec![
                PathBuf::from("project/node_modules/pkg/index.js"),
                PathBuf::from("project/src/lib.rs"),
            ],
            attrs: Default::default(),
        };

        let changes = decode_event(&set, event);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, PathBuf::from("project/src/lib.rs"));
    }

    #[test]
    fn decode_ignores_unrelated_event_kinds() {
        let set = globset::GlobSetBuilder::new().build().unwrap();
        let event = notify::Event {
            kind: notify::EventKind::Access(notify::event::AccessKind::Any),
            paths: vec![PathBuf::from("src/lib.rs")],
            attrs: Default::default(),
        };
        assert!(decode_event(&set, event).is_empty());
    }
}
