//! Live sender -> target mapping with lock-free reads and hot reload.
//!
//! # Data Flow
//! ```text
//! mapping document (YAML)
//!     → MappingSource::load (read + parse + validate, off to the side)
//!     → AddressMapping (validated, immutable)
//!     → ArcSwap::store (single atomic publish)
//!     → readers call current_snapshot() and hold an Arc for one message
//!
//! On change notification (file watcher, SIGHUP):
//!     → reload(): compare-and-set on the reload flag
//!     → loser returns Skipped immediately, winner loads and publishes
//! ```

use crate::address_map::{load_mapping, AddressMapping, MappingError};
use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Where candidate mappings come from.
pub trait MappingSource: Send + Sync {
    fn load(&self) -> Result<AddressMapping, MappingError>;

    /// Backing file, if any. Only file-backed sources can be watched.
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Mapping document on disk.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MappingSource for FileSource {
    fn load(&self) -> Result<AddressMapping, MappingError> {
        load_mapping(&self.path)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[derive(Debug)]
pub enum ReloadOutcome {
    Accepted { entries: usize },
    Rejected(MappingError),
    /// Another reload was in flight; nothing was done.
    Skipped,
}

impl ReloadOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReloadOutcome::Accepted { .. })
    }
}

#[derive(Debug, Default)]
struct ReloadStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadCounts {
    pub accepted: u64,
    pub rejected: u64,
    pub skipped: u64,
}

/// Clears the reload flag when the winning reload finishes, on every path.
struct ReloadGuard<'a>(&'a AtomicBool);

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ConfigStore {
    source: Box<dyn MappingSource>,
    current: ArcSwap<AddressMapping>,
    reloading: AtomicBool,
    stats: ReloadStats,
}

impl ConfigStore {
    /// Store backed by the mapping document at `path`. Starts empty; call
    /// [`ConfigStore::reload`] to perform the initial load.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_source(Box::new(FileSource::new(path)))
    }

    pub fn with_source(source: Box<dyn MappingSource>) -> Self {
        Self {
            source,
            current: ArcSwap::from_pointee(AddressMapping::empty()),
            reloading: AtomicBool::new(false),
            stats: ReloadStats::default(),
        }
    }

    /// The mapping currently in effect. Never blocks, even during a reload.
    pub fn current_snapshot(&self) -> Arc<AddressMapping> {
        self.current.load_full()
    }

    pub fn path(&self) -> Option<&Path> {
        self.source.path()
    }

    pub fn reload_counts(&self) -> ReloadCounts {
        ReloadCounts {
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
        }
    }

    /// Load, validate and publish a new mapping.
    ///
    /// At most one reload runs at a time; a call that arrives while another
    /// is in flight returns [`ReloadOutcome::Skipped`] without waiting. On
    /// any failure the previous mapping stays in effect.
    pub fn reload(&self) -> ReloadOutcome {
        if self
            .reloading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Mapping reload already in progress, ignoring request");
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return ReloadOutcome::Skipped;
        }
        let _guard = ReloadGuard(&self.reloading);

        match self.source.load() {
            Ok(mapping) => {
                let entries = mapping.len();
                self.current.store(Arc::new(mapping));
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                log::info!("Accepted mapping configuration ({entries} entries)");
                ReloadOutcome::Accepted { entries }
            }
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                let live = self.current.load().len();
                match &e {
                    MappingError::Missing(_) => {
                        log::warn!("{e}; keeping current mapping ({live} entries)")
                    }
                    _ if e.is_validation_failure() => {
                        log::error!("Rejected mapping configuration, {e}; keeping current mapping ({live} entries)")
                    }
                    _ => log::error!("{e}; keeping current mapping ({live} entries)"),
                }
                ReloadOutcome::Rejected(e)
            }
        }
    }

    /// Watch the mapping document and reload whenever it changes.
    ///
    /// The parent directory is watched so that editors which save by
    /// replacing the file are noticed. The returned watcher stops on drop.
    pub fn watch(self: &Arc<Self>, poll_interval: Duration) -> anyhow::Result<RecommendedWatcher> {
        let path = self
            .path()
            .ok_or_else(|| anyhow::anyhow!("mapping source is not backed by a file"))?
            .to_path_buf();
        let file_name: OsString = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("mapping path has no file name: {}", path.display()))?
            .to_os_string();
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let store = Arc::clone(self);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }
                    let relevant = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if relevant {
                        log::info!("Mapping document change detected, reloading...");
                        store.reload();
                    }
                }
                Err(e) => log::error!("Mapping watch error: {e:?}"),
            },
            Config::default().with_poll_interval(poll_interval),
        )?;

        watcher.watch(&directory, RecursiveMode::NonRecursive)?;
        log::info!("Watching mapping document {}", path.display());
        Ok(watcher)
    }
}
