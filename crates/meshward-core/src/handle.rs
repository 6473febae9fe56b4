//! Live configuration handle and file watcher.
//!
//! Long-running loops hold a `ConfigHandle` and call `current()` once at
//! the start of each iteration, so a reload never changes parameters in
//! the middle of an operation.
//!
//! Command-line overrides are registered on the handle and re-applied to
//! every reloaded file, so an edit to the file never undoes them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ServerConfig};
use crate::error::ConfigResult;

/// A configuration type that can be reloaded from disk.
pub trait Reloadable: Clone + PartialEq + Send + Sync + 'static {
    fn load(path: &Path) -> ConfigResult<Self>;
    fn validate(&self) -> Vec<String>;
}

impl Reloadable for ServerConfig {
    fn load(path: &Path) -> ConfigResult<Self> {
        ServerConfig::from_file(path)
    }

    fn validate(&self) -> Vec<String> {
        ServerConfig::validate(self)
    }
}

impl Reloadable for ClientConfig {
    fn load(path: &Path) -> ConfigResult<Self> {
        ClientConfig::from_file(path)
    }

    fn validate(&self) -> Vec<String> {
        ClientConfig::validate(self)
    }
}

type Overrides<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

/// Shared, atomically swappable configuration.
pub struct ConfigHandle<T> {
    tx: Arc<watch::Sender<T>>,
    rx: watch::Receiver<T>,
    overrides: Option<Overrides<T>>,
}

impl<T> Clone for ConfigHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
            rx: self.rx.clone(),
            overrides: self.overrides.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ConfigHandle<T> {
    pub fn new(initial: T) -> Self {
        let (tx, rx) = watch::channel(initial);
        Self {
            tx: Arc::new(tx),
            rx,
            overrides: None,
        }
    }

    /// Like `new`, but `overrides` is applied to `initial` and again to
    /// every configuration loaded by `reload`.
    pub fn with_overrides(mut initial: T, overrides: impl Fn(&mut T) + Send + Sync + 'static) -> Self {
        overrides(&mut initial);
        let (tx, rx) = watch::channel(initial);
        Self {
            tx: Arc::new(tx),
            rx,
            overrides: Some(Arc::new(overrides)),
        }
    }

    /// Snapshot of the configuration as of now.
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Publish a new configuration to every holder of this handle.
    pub fn replace(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Apply an in-place edit and publish the result.
    pub fn update(&self, edit: impl FnOnce(&mut T)) {
        self.tx.send_modify(edit);
    }

    /// Receiver that wakes whenever a new configuration is published.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Reloadable> ConfigHandle<T> {
    /// Poll `path` every `every` and publish valid changes until shutdown.
    ///
    /// Unparseable or invalid files are logged and skipped; the previous
    /// configuration stays in effect.
    pub async fn watch_file(
        &self,
        path: PathBuf,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_modified = modified_at(&path).await;
        info!(path = %path.display(), ?every, "config watcher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(every) => {
                    let modified = modified_at(&path).await;
                    if modified.is_none() || modified == last_modified {
                        continue;
                    }
                    last_modified = modified;
                    self.reload(&path);
                }
                _ = shutdown.changed() => {
                    debug!("config watcher shutting down");
                    break;
                }
            }
        }
    }

    /// Load `path`, apply the registered overrides, validate and publish.
    /// Returns true if a new configuration took effect.
    pub fn reload(&self, path: &Path) -> bool {
        let mut next = match T::load(path) {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "config reload failed, keeping previous config");
                return false;
            }
        };
        if let Some(apply) = &self.overrides {
            apply(&mut next);
        }
        let errors = next.validate();
        if !errors.is_empty() {
            warn!(errors = ?errors, "reloaded config is invalid, keeping previous config");
            return false;
        }
        if next == self.current() {
            debug!("config file touched without changes");
            return false;
        }
        self.replace(next);
        info!(path = %path.display(), "config reloaded");
        true
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}
