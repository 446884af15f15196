//! # Watch Service
//!
//! [`WatchService`] keeps a [`Vault`] in sync with its directory while the process runs.
//!
//! ## Pipeline
//!
//! 1. **File watcher** (`notify-debouncer-full`) watches the vault root recursively and
//!    debounces bursts of file system events. Hidden paths and files without a registered
//!    parser are dropped here.
//! 2. **[`ChangeBatcher`]** coalesces the surviving paths into a set. A path changed many times
//!    before the next flush is scanned once. When more than `batchCapacity` distinct paths pile
//!    up, the batch degrades into a single full-rescan request.
//! 3. **Flush task** wakes when the batcher has work, waits `flushIntervalMs` for the burst to
//!    settle, and hands the change-set to [`Vault::scan_incremental`] (or [`Vault::scan`] after
//!    an overflow). Scans queue on the vault's writer lock like any other scan.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vaultgraph_core::{config::VaultConfig, template::TEMPLATES, vault::Vault, watch::WatchService};
//!
//! # async fn example() -> Result<(), vaultgraph_core::VaultError> {
//! let config = VaultConfig::default();
//! let vault = Arc::new(Vault::from_config("./world", &config, TEMPLATES.clone(), None).await?);
//! vault.scan().await?;
//! let service = WatchService::start(vault.clone(), &config.watch)?;
//! // ... edits under ./world are indexed until `service` is dropped
//! drop(service);
//! # Ok(())
//! # }
//! ```
//!
//! Dropping the service stops the watcher and aborts the flush task. A scan already running
//! finishes its current document transaction before the task is torn down.

use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};
use parking_lot::Mutex;
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle, time::sleep};

use crate::{codec::ParserMap, config::WatchConfig, error::VaultError, vault::Vault};

/// A file system watcher with debouncing for a vault root
type VaultWatcher = Debouncer<RecommendedWatcher, FileIdMap>;

/// What the flush task should scan next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSet {
    Paths(Vec<PathBuf>),
    /// Too many distinct paths changed; rescan everything
    Rescan,
}

#[derive(Debug, Default)]
struct PendingChanges {
    paths: BTreeSet<PathBuf>,
    overflowed: bool,
}

/// Coalescing, bounded set of changed paths shared by the watcher callback and the flush task.
#[derive(Debug)]
pub struct ChangeBatcher {
    pending: Mutex<PendingChanges>,
    capacity: usize,
    notify: Notify,
}

impl ChangeBatcher {
    pub fn new(capacity: usize) -> Self {
        ChangeBatcher {
            pending: Mutex::new(PendingChanges::default()),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Queues `paths` and wakes the flush task. Returns how many paths were new to the batch.
    pub fn push<I: IntoIterator<Item = PathBuf>>(&self, paths: I) -> usize {
        let added = {
            let mut pending = self.pending.lock();
            let mut added = 0;
            for path in paths {
                if pending.overflowed {
                    break;
                }
                if pending.paths.insert(path) {
                    added += 1;
                }
                if pending.paths.len() > self.capacity {
                    tracing::warn!(
                        "[ChangeBatcher::push] more than {} pending paths, degrading to a full rescan",
                        self.capacity
                    );
                    pending.paths.clear();
                    pending.overflowed = true;
                }
            }
            added
        };
        self.notify.notify_one();
        added
    }

    /// Drains the batch.
    pub fn take(&self) -> Option<ChangeSet> {
        let mut pending = self.pending.lock();
        if pending.overflowed {
            pending.overflowed = false;
            pending.paths.clear();
            return Some(ChangeSet::Rescan);
        }
        if pending.paths.is_empty() {
            return None;
        }
        let paths = std::mem::take(&mut pending.paths);
        Some(ChangeSet::Paths(paths.into_iter().collect()))
    }

    pub fn len(&self) -> usize {
        self.pending.lock().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        let pending = self.pending.lock();
        pending.paths.is_empty() && !pending.overflowed
    }

    /// Resolves once something was pushed since the last wake-up.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Whether a watcher path can matter to the index: not hidden below `root`, and either a
/// parsable document or an extension-less path (possibly a removed directory).
fn is_relevant(root: &Path, path: &Path, parsers: &ParserMap) -> bool {
    let Ok(rel) = path.strip_prefix(root) else {
        return false;
    };
    let hidden = rel
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
    if hidden {
        return false;
    }
    match path.extension() {
        Some(_) => parsers.supports(path),
        None => true,
    }
}

pub struct WatchService {
    debouncer: VaultWatcher,
    flush_handle: JoinHandle<()>,
    batcher: Arc<ChangeBatcher>,
    root: PathBuf,
}

impl WatchService {
    /// Starts watching `vault`'s root. Must be called from within a tokio runtime.
    pub fn start(vault: Arc<Vault>, config: &WatchConfig) -> Result<Self, VaultError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            VaultError::Configuration(format!("the watch service needs a tokio runtime: {e}"))
        })?;
        let root = vault.root().to_path_buf();
        let batcher = Arc::new(ChangeBatcher::new(config.batch_capacity));

        let debouncer_batcher = batcher.clone();
        let debouncer_root = root.clone();
        let debouncer_parsers = vault.parsers().clone();
        let mut debouncer = new_debouncer(
            Duration::from_millis(config.debounce_ms),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let mut changed = Vec::new();
                    for event in events.iter() {
                        if !matches!(
                            event.event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) {
                            continue;
                        }
                        changed.extend(
                            event
                                .paths
                                .iter()
                                .filter(|p| {
                                    is_relevant(&debouncer_root, p, &debouncer_parsers)
                                })
                                .cloned(),
                        );
                    }
                    if !changed.is_empty() {
                        let added = debouncer_batcher.push(changed);
                        tracing::debug!("[WatchService] {} paths queued", added);
                    }
                }
                Err(errors) => {
                    tracing::error!("[WatchService] notify debouncer returned errors: {:?}", errors);
                }
            },
        )?;
        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        let flush_batcher = batcher.clone();
        let flush_interval = Duration::from_millis(config.flush_interval_ms);
        let flush_handle = runtime.spawn(async move {
            tracing::info!("[WatchService] flush task started");
            loop {
                flush_batcher.notified().await;
                sleep(flush_interval).await;
                let Some(changes) = flush_batcher.take() else {
                    continue;
                };
                let result = match changes {
                    ChangeSet::Paths(paths) => {
                        tracing::info!("[WatchService] flushing {} changed paths", paths.len());
                        vault.scan_incremental(paths).await
                    }
                    ChangeSet::Rescan => {
                        tracing::info!("[WatchService] flushing as a full rescan");
                        vault.scan().await
                    }
                };
                match result {
                    Ok(report) => tracing::info!("[WatchService] {}", report.summary()),
                    Err(e) => tracing::error!("[WatchService] scan failed: {}", e),
                }
            }
        });

        tracing::info!("[WatchService::start] watching {:?}", root);
        Ok(WatchService {
            debouncer,
            flush_handle,
            batcher,
            root,
        })
    }

    pub fn batcher(&self) -> &Arc<ChangeBatcher> {
        &self.batcher
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        let unwatch_res = self.debouncer.watcher().unwatch(&self.root);
        tracing::debug!("[WatchService::drop] unwatch({:?}) = {:?}", self.root, unwatch_res);
        self.flush_handle.abort();
    }
}
