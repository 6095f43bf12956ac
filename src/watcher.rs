//! Config file watcher for hot reload
//!
//! Watches the config file's directory (editors often replace the file
//! rather than write in place), debounces bursts of events, re-reads the
//! file and hands `(old, new)` to a [`ConfigListener`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, GatewayConfig};

/// Quiet period after the last event before reloading
const DEBOUNCE: Duration = Duration::from_millis(300);

/// Receives each successfully reloaded, changed configuration.
#[async_trait]
pub trait ConfigListener: Send + Sync {
    async fn on_config_changed(&self, old: Arc<GatewayConfig>, new: Arc<GatewayConfig>);
}

/// Only content events on the config file itself matter.
fn is_config_event(event: &notify::Event, file_name: &std::ffi::OsStr) -> bool {
    let relevant = matches!(
        event.kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_) | notify::EventKind::Remove(_)
    );
    relevant
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name))
}

/// Re-read the store and notify `listener` if the content changed.
///
/// A file that fails to parse is logged and the previous snapshot stays.
pub async fn apply_reload(store: &ConfigStore, listener: &dyn ConfigListener) -> bool {
    match store.reload() {
        Ok(Some((old, new))) => {
            info!("config changed, applying");
            listener.on_config_changed(old, new).await;
            true
        }
        Ok(None) => {
            debug!("config unchanged");
            false
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "config reload failed, keeping previous config");
            false
        }
    }
}

/// Start watching the store's file.
///
/// Returns a handle that keeps the watcher alive. Drop it to stop watching.
pub fn start_watcher(
    store: Arc<ConfigStore>,
    listener: Arc<dyn ConfigListener>,
) -> Result<WatcherHandle> {
    let path = store
        .path()
        .map(Path::to_path_buf)
        .context("config store has no file to watch")?;
    let file_name = path
        .file_name()
        .map(ToOwned::to_owned)
        .context("config path has no file name")?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = Config::default().with_poll_interval(Duration::from_millis(500));
    let mut watcher: RecommendedWatcher = Watcher::new(
        move |result: notify::Result<notify::Event>| {
            let _ = tx.send(result);
        },
        config,
    )
    .context("failed to create filesystem watcher")?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch: {}", dir.display()))?;

    info!("watching config for changes: {}", path.display());

    let task = tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            match result {
                Ok(event) if is_config_event(&event, &file_name) => {
                    // Swallow the rest of the burst
                    loop {
                        match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                            Ok(Some(_)) => continue,
                            Ok(None) => return,
                            Err(_) => break,
                        }
                    }
                    apply_reload(&store, listener.as_ref()).await;
                }
                Ok(_) => {}
                Err(e) => warn!("filesystem watcher error: {}", e),
            }
        }
        debug!("config watcher stopped");
    });

    Ok(WatcherHandle {
        _watcher: watcher,
        task,
        path,
    })
}

/// Handle that keeps the watcher alive
///
/// Drop this to stop watching.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
    path: PathBuf,
}

impl WatcherHandle {
    /// Get the file being watched
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
