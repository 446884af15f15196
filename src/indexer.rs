//! The single writer of a vault.
//!
//! A scan walks documents in path order and commits each one in its own transaction: the node,
//! the references it holds, and the edge delta of every node pair the change can affect. A
//! document that fails (unreadable, malformed, invalid, untyped, conflicting, or refused by
//! storage) is recorded in the [`ScanReport`] and the scan moves on. Only configuration problems
//! and an unreadable index abort a scan, and they do so before any document is touched.
//!
//! Scans queue on a fair async mutex, and each one captures a [`TemplateSnapshot`] after it
//! acquires the lock, so a template activated mid-scan only affects the next scan.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
};
use sqlx::SqliteConnection;
use tokio::sync::Mutex as AsyncMutex;
use walkdir::WalkDir;

use crate::{
    codec::{frontmatter::RELATIONS_KEY, slugify, ParserMap},
    config::IndexOptions,
    db::{self, DbConnection, UpsertOutcome},
    error::{FieldError, VaultError},
    event::VaultEvent,
    folders::{normalize_path, Confidence, FolderResolver},
    graph::{self, EdgeDelta, Endpoint},
    properties::{Edge, Node, NodeStatus, Reference},
    template::{SchemaFactory, TemplateRegistry, TemplateSnapshot},
};

/// Frontmatter keys that feed node columns instead of schema fields.
pub const RESERVED_KEYS: [&str; 4] = ["id", "type", "status", RELATIONS_KEY];

/// Cooperative cancellation, checked between documents. Documents committed before the flag was
/// raised stay committed.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        CancellationFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Full,
    Incremental,
}

/// What a scan should cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanRequest {
    Full,
    /// Changed paths, absolute or vault-relative. Vanished paths remove their nodes; directories
    /// are walked.
    Paths(Vec<PathBuf>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: String,
    pub path: String,
    pub entity_type: String,
    pub outcome: UpsertOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnindexedDocument {
    pub path: String,
    pub reason: String,
    /// Candidate types when folder resolution was ambiguous
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentFailure {
    Unreadable(String),
    TooLarge { size: u64, limit: u64 },
    Parse(String),
    Validation(Vec<FieldError>),
    Storage(String),
}

impl Display for DocumentFailure {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            DocumentFailure::Unreadable(msg) => write!(f, "unreadable: {msg}"),
            DocumentFailure::TooLarge { size, limit } => {
                write!(f, "document is {size} bytes, the limit is {limit}")
            }
            DocumentFailure::Parse(msg) => write!(f, "parse error: {msg}"),
            DocumentFailure::Validation(errors) => write!(
                f,
                "validation failed: {}",
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<String>>()
                    .join("; ")
            ),
            DocumentFailure::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidDocument {
    pub path: String,
    pub failure: DocumentFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingDocument {
    pub path: String,
    pub id: String,
    /// Path of the document that holds the id
    pub existing_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedDocument {
    pub id: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceIssue {
    /// The link text cannot be turned into a node id
    Unnameable,
    /// The target id is not indexed (yet); the edge appears once it is
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedReference {
    pub source_id: String,
    pub target: String,
    pub issue: ReferenceIssue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub mode: ScanMode,
    pub template_id: String,
    pub template_generation: u64,
    pub indexed: Vec<IndexedDocument>,
    pub unindexed_no_type: Vec<UnindexedDocument>,
    pub invalid: Vec<InvalidDocument>,
    pub conflicting: Vec<ConflictingDocument>,
    pub removed: Vec<RemovedDocument>,
    pub unresolved_references: Vec<UnresolvedReference>,
    pub cancelled: bool,
}

impl ScanReport {
    fn new(mode: ScanMode, snapshot: &TemplateSnapshot) -> Self {
        ScanReport {
            mode,
            template_id: snapshot.id.clone(),
            template_generation: snapshot.generation,
            indexed: Vec::new(),
            unindexed_no_type: Vec::new(),
            invalid: Vec::new(),
            conflicting: Vec::new(),
            removed: Vec::new(),
            unresolved_references: Vec::new(),
            cancelled: false,
        }
    }

    pub fn summary(&self) -> ScanSummary {
        ScanSummary {
            mode: self.mode,
            indexed: self.indexed.len(),
            unindexed_no_type: self.unindexed_no_type.len(),
            invalid: self.invalid.len(),
            conflicting: self.conflicting.len(),
            removed: self.removed.len(),
            unresolved_references: self.unresolved_references.len(),
            cancelled: self.cancelled,
        }
    }

    /// Every document problem of the scan as a [`VaultError`], for callers that surface
    /// failures through error statuses. A cancelled scan contributes a trailing
    /// [`VaultError::Cancelled`].
    pub fn errors(&self) -> Vec<VaultError> {
        let mut errors = Vec::new();
        for unindexed in self.unindexed_no_type.iter() {
            errors.push(VaultError::UnresolvedType {
                path: unindexed.path.clone(),
                reason: unindexed.reason.clone(),
            });
        }
        for invalid in self.invalid.iter() {
            errors.push(match &invalid.failure {
                DocumentFailure::Validation(field_errors) => VaultError::Validation {
                    path: invalid.path.clone(),
                    errors: field_errors.clone(),
                },
                DocumentFailure::Unreadable(_) | DocumentFailure::TooLarge { .. } => {
                    VaultError::Io(format!("{}: {}", invalid.path, invalid.failure))
                }
                DocumentFailure::Parse(_) => {
                    VaultError::Serialization(format!("{}: {}", invalid.path, invalid.failure))
                }
                DocumentFailure::Storage(_) => {
                    VaultError::Database(format!("{}: {}", invalid.path, invalid.failure))
                }
            });
        }
        for conflict in self.conflicting.iter() {
            errors.push(VaultError::Conflict(format!(
                "'{}' declares id '{}' already held by '{}'",
                conflict.path, conflict.id, conflict.existing_path
            )));
        }
        if self.cancelled {
            errors.push(VaultError::Cancelled);
        }
        errors
    }

    /// Ids indexed by this scan whose content actually changed.
    pub fn changed_ids(&self) -> Vec<&str> {
        self.indexed
            .iter()
            .filter(|d| d.outcome != UpsertOutcome::Unchanged)
            .map(|d| d.id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub mode: ScanMode,
    pub indexed: usize,
    pub unindexed_no_type: usize,
    pub invalid: usize,
    pub conflicting: usize,
    pub removed: usize,
    pub unresolved_references: usize,
    pub cancelled: bool,
}

impl Display for ScanSummary {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:?}: indexed {}, unindexed {}, invalid {}, conflicting {}, removed {}{}",
            self.mode,
            self.indexed,
            self.unindexed_no_type,
            self.invalid,
            self.conflicting,
            self.removed,
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}

/// A document that passed every check and is ready to be written.
#[derive(Debug, Clone)]
struct PreparedDocument {
    node: Node,
    references: BTreeSet<Reference>,
    unnameable: Vec<String>,
}

enum Prepared {
    Ready(Box<PreparedDocument>),
    Unindexed(UnindexedDocument),
    Invalid(DocumentFailure),
    /// The file is gone; its node (if any) must be removed
    Vanished,
}

enum Committed {
    Indexed(IndexedDocument),
    Conflict(ConflictingDocument),
}

/// Mutable state of one scan.
struct ScanState {
    snapshot: TemplateSnapshot,
    report: ScanReport,
    /// id -> path claimed during this scan
    claimed: BTreeMap<String, String>,
    deferred: Vec<(String, Box<PreparedDocument>, ConflictingDocument)>,
    /// sources indexed by this scan, for pending reference reporting
    sources: BTreeSet<String>,
}

pub struct Indexer {
    root: PathBuf,
    db: DbConnection,
    registry: TemplateRegistry,
    schemas: SchemaFactory,
    folders: Arc<FolderResolver>,
    parsers: ParserMap,
    options: IndexOptions,
    events: Option<Sender<VaultEvent>>,
    writer: AsyncMutex<()>,
    /// Flag of the scan holding `writer`
    running: parking_lot::Mutex<Option<CancellationFlag>>,
}

impl Indexer {
    pub fn new(
        root: PathBuf,
        db: DbConnection,
        registry: TemplateRegistry,
        folders: Arc<FolderResolver>,
        parsers: ParserMap,
        options: IndexOptions,
        events: Option<Sender<VaultEvent>>,
    ) -> Self {
        let schemas = registry.schema_factory();
        Indexer {
            root,
            db,
            registry,
            schemas,
            folders,
            parsers,
            options,
            events,
            writer: AsyncMutex::new(()),
            running: parking_lot::Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn emit(&self, event: VaultEvent) {
        if let Some(tx) = self.events.as_ref() {
            if let Err(e) = tx.send(event) {
                tracing::debug!("[Indexer::emit] event receiver dropped: {}", e);
            }
        }
    }

    /// Runs one scan to completion (or cancellation). Waits for any scan already running.
    pub async fn scan(
        &self,
        request: ScanRequest,
        cancel: &CancellationFlag,
    ) -> Result<ScanReport, VaultError> {
        let _guard = self.writer.lock().await;
        *self.running.lock() = Some(cancel.clone());
        let result = self.run_scan(request, cancel).await;
        *self.running.lock() = None;
        result
    }

    /// Raises the flag of the scan currently holding the writer. Scans still queued, and scans
    /// started later, are unaffected. Returns whether a scan was running.
    pub fn cancel_running(&self) -> bool {
        match self.running.lock().as_ref() {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_scan(
        &self,
        request: ScanRequest,
        cancel: &CancellationFlag,
    ) -> Result<ScanReport, VaultError> {
        let snapshot = self.registry.get_active().ok_or_else(|| {
            VaultError::Configuration("no active template; activate one before scanning".into())
        })?;
        let mode = match request {
            ScanRequest::Full => ScanMode::Full,
            ScanRequest::Paths(_) => ScanMode::Incremental,
        };
        tracing::info!(
            "[Indexer::run_scan] {:?} scan of {:?} under template '{}' (generation {})",
            mode,
            self.root,
            snapshot.id,
            snapshot.generation
        );
        self.emit(VaultEvent::ScanStarted {
            mode,
            template_id: snapshot.id.clone(),
            generation: snapshot.generation,
        });

        self.sync_edge_rules(&snapshot).await?;

        let mut state = ScanState {
            report: ScanReport::new(mode, &snapshot),
            snapshot,
            claimed: BTreeMap::new(),
            deferred: Vec::new(),
            sources: BTreeSet::new(),
        };

        let paths = match request {
            ScanRequest::Full => {
                let paths = self.walk(&self.root)?;
                self.prune_vanished(&paths, &mut state).await?;
                paths
            }
            ScanRequest::Paths(changed) => self.expand_changes(changed, &mut state).await?,
        };

        for path in paths.iter() {
            if cancel.is_cancelled() {
                tracing::info!("[Indexer::run_scan] cancelled before '{}'", path);
                state.report.cancelled = true;
                break;
            }
            self.process(path, &mut state).await;
        }

        if !state.report.cancelled {
            self.retry_deferred(&mut state).await;
        } else {
            for (_, _, conflict) in state.deferred.drain(..) {
                state.report.conflicting.push(conflict);
            }
        }
        if let Err(e) = self.report_pending(&mut state).await {
            tracing::warn!("[Indexer::run_scan] could not list pending references: {}", e);
        }

        let report = state.report;
        tracing::info!("[Indexer::run_scan] finished: {}", report.summary());
        self.emit(VaultEvent::ScanFinished(report.summary()));
        Ok(report)
    }

    fn is_hidden(name: &str) -> bool {
        name.starts_with('.')
    }

    /// Vault-relative, `/` separated path of `abs`.
    pub fn relative(&self, abs: &Path) -> Result<String, VaultError> {
        let rel = abs.strip_prefix(&self.root)?;
        Ok(normalize_path(&rel.to_string_lossy()))
    }

    /// Vault-relative path of `abs`, resolving symlinked ancestors (e.g. a temp dir behind a
    /// link) through the deepest ancestor that still exists. `None` when outside the vault.
    fn anchor(&self, abs: &Path) -> Option<String> {
        if let Ok(rel) = self.relative(abs) {
            return Some(rel);
        }
        let mut existing = abs;
        let mut tail = Vec::new();
        while !existing.exists() {
            tail.push(existing.file_name()?);
            existing = existing.parent()?;
        }
        let mut canonical = std::fs::canonicalize(existing).ok()?;
        for component in tail.iter().rev() {
            canonical.push(component);
        }
        self.relative(&canonical).ok()
    }

    /// Whether a vault-relative path may hold a document: no hidden component and a registered
    /// extension.
    pub fn is_candidate(&self, rel: &str) -> bool {
        !rel.is_empty()
            && !rel.split('/').any(Self::is_hidden)
            && self.parsers.supports(rel)
    }

    /// Sorted vault-relative paths of candidate documents under `dir`.
    fn walk(&self, dir: &Path) -> Result<Vec<String>, VaultError> {
        let mut paths = Vec::new();
        let walker = WalkDir::new(dir)
            .follow_links(self.options.follow_links)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !Self::is_hidden(&entry.file_name().to_string_lossy())
            });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("[Indexer::walk] skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = self.relative(entry.path())?;
            if self.is_candidate(&rel) {
                paths.push(rel);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn prune_vanished(
        &self,
        present: &[String],
        state: &mut ScanState,
    ) -> Result<(), VaultError> {
        let present: BTreeSet<&str> = present.iter().map(String::as_str).collect();
        let stored = {
            let mut conn = self.db.0.acquire().await?;
            db::node_paths(&mut conn).await?
        };
        for (path, id) in stored {
            if !present.contains(path.as_str()) {
                self.remove(&id, &path, state).await;
            }
        }
        Ok(())
    }

    /// Turns watcher paths into the sorted list of documents to process, removing the nodes of
    /// paths that no longer exist.
    async fn expand_changes(
        &self,
        changed: Vec<PathBuf>,
        state: &mut ScanState,
    ) -> Result<Vec<String>, VaultError> {
        let mut paths = BTreeSet::new();
        for path in changed {
            let abs = if path.is_absolute() {
                path
            } else {
                self.root.join(path)
            };
            let rel = match self.anchor(&abs) {
                Some(rel) => rel,
                None => {
                    tracing::debug!(
                        "[Indexer::expand_changes] ignoring path outside the vault: {:?}",
                        abs
                    );
                    continue;
                }
            };
            if rel.split('/').any(Self::is_hidden) {
                continue;
            }
            match tokio::fs::metadata(&abs).await {
                Ok(meta) if meta.is_dir() => paths.extend(self.walk(&self.root.join(&rel))?),
                Ok(_) => {
                    if self.is_candidate(&rel) {
                        paths.insert(rel);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    match self.stored_under(&rel).await {
                        Ok(stored) => {
                            for (path, id) in stored {
                                self.remove(&id, &path, state).await;
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                "[Indexer::expand_changes] failed to look up '{}': {}",
                                rel,
                                e
                            );
                            Self::record_storage_failure(&rel, &e, state);
                        }
                    }
                }
                Err(e) => state.report.invalid.push(InvalidDocument {
                    path: rel,
                    failure: DocumentFailure::Unreadable(e.to_string()),
                }),
            }
        }
        Ok(paths.into_iter().collect())
    }

    /// Removes the node of a vanished document. A storage failure is recorded against the path
    /// and the node stays until a later scan.
    async fn remove(&self, id: &str, path: &str, state: &mut ScanState) {
        let removed_edges = match self.delete(id).await {
            Ok(removed_edges) => removed_edges,
            Err(e) => {
                tracing::error!("[Indexer::remove] failed to remove '{}' ({}): {}", id, path, e);
                Self::record_storage_failure(path, &e, state);
                return;
            }
        };
        tracing::debug!(
            "[Indexer::remove] removed '{}' ({}) and {} edges",
            id,
            path,
            removed_edges.len()
        );
        state.report.removed.push(RemovedDocument {
            id: id.to_string(),
            path: path.to_string(),
        });
        self.emit(VaultEvent::NodeRemoved {
            id: id.to_string(),
            path: path.to_string(),
        });
        if !removed_edges.is_empty() {
            self.emit(VaultEvent::EdgesChanged(EdgeDelta {
                added: Vec::new(),
                removed: removed_edges,
            }));
        }
    }

    async fn delete(&self, id: &str) -> Result<Vec<Edge>, VaultError> {
        let mut tx = self.db.0.begin().await?;
        let removed_edges = db::delete_node(&mut tx, id).await?;
        tx.commit().await?;
        Ok(removed_edges)
    }

    fn record_storage_failure(path: &str, error: &VaultError, state: &mut ScanState) {
        state.report.invalid.push(InvalidDocument {
            path: path.to_string(),
            failure: DocumentFailure::Storage(error.to_string()),
        });
    }

    async fn process(&self, path: &str, state: &mut ScanState) {
        match self.prepare(path, &state.snapshot).await {
            Prepared::Ready(doc) => match self.commit(path, *doc.clone(), state).await {
                Ok(Committed::Indexed(indexed)) => state.report.indexed.push(indexed),
                Ok(Committed::Conflict(conflict)) => {
                    tracing::warn!(
                        "[Indexer::process] '{}' declares id '{}' already held by '{}'",
                        conflict.path,
                        conflict.id,
                        conflict.existing_path
                    );
                    state.deferred.push((path.to_string(), doc, conflict));
                }
                // The transaction rolled back; the document is retried by the next scan.
                Err(e) => {
                    tracing::error!("[Indexer::process] failed to store '{}': {}", path, e);
                    Self::record_storage_failure(path, &e, state);
                }
            },
            Prepared::Unindexed(unindexed) => {
                tracing::info!(
                    "[Indexer::process] '{}' left unindexed: {}",
                    unindexed.path,
                    unindexed.reason
                );
                state.report.unindexed_no_type.push(unindexed);
            }
            Prepared::Invalid(failure) => {
                tracing::warn!("[Indexer::process] '{}' is invalid: {}", path, failure);
                state.report.invalid.push(InvalidDocument {
                    path: path.to_string(),
                    failure,
                });
            }
            Prepared::Vanished => match self.stored_at(path).await {
                Ok(Some(node)) => self.remove(&node.id, &node.path, state).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("[Indexer::process] failed to look up '{}': {}", path, e);
                    Self::record_storage_failure(path, &e, state);
                }
            },
        }
    }

    async fn stored_under(&self, rel: &str) -> Result<BTreeMap<String, String>, VaultError> {
        let mut conn = self.db.0.acquire().await?;
        db::node_paths_under(&mut conn, rel).await
    }

    async fn stored_at(&self, path: &str) -> Result<Option<Node>, VaultError> {
        let mut conn = self.db.0.acquire().await?;
        db::node_by_path(&mut conn, path).await
    }

    /// Conflicts whose contested id was released later in the same scan get one more attempt.
    async fn retry_deferred(&self, state: &mut ScanState) {
        let deferred = std::mem::take(&mut state.deferred);
        for (path, doc, conflict) in deferred {
            match self.commit(&path, *doc, state).await {
                Ok(Committed::Indexed(indexed)) => {
                    tracing::info!(
                        "[Indexer::retry_deferred] '{}' took over released id '{}'",
                        path,
                        indexed.id
                    );
                    state.report.indexed.push(indexed);
                }
                Ok(Committed::Conflict(_)) => state.report.conflicting.push(conflict),
                Err(e) => {
                    tracing::error!("[Indexer::retry_deferred] failed to store '{}': {}", path, e);
                    Self::record_storage_failure(&path, &e, state);
                }
            }
        }
    }

    async fn report_pending(&self, state: &mut ScanState) -> Result<(), VaultError> {
        if state.sources.is_empty() {
            return Ok(());
        }
        let mut conn = self.db.0.acquire().await?;
        let known = db::all_node_types(&mut conn).await?;
        for source in state.sources.iter() {
            for reference in db::refs_for_source(&mut conn, source).await? {
                if !known.contains_key(&reference.target_id) {
                    state.report.unresolved_references.push(UnresolvedReference {
                        source_id: reference.source_id,
                        target: reference.target_id,
                        issue: ReferenceIssue::Pending,
                    });
                }
            }
        }
        Ok(())
    }

    /// Reads, parses, types and validates one document. Touches no storage.
    async fn prepare(&self, path: &str, snapshot: &TemplateSnapshot) -> Prepared {
        let abs = self.root.join(path);
        let size = match tokio::fs::metadata(&abs).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Prepared::Vanished,
            Err(e) => return Prepared::Invalid(DocumentFailure::Unreadable(e.to_string())),
        };
        if size > self.options.max_document_bytes {
            return Prepared::Invalid(DocumentFailure::TooLarge {
                size,
                limit: self.options.max_document_bytes,
            });
        }
        let content = match tokio::fs::read(&abs).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Prepared::Vanished,
            Err(e) => return Prepared::Invalid(DocumentFailure::Unreadable(e.to_string())),
        };
        let Some(parser) = self.parsers.for_path(path) else {
            return Prepared::Invalid(DocumentFailure::Parse(format!(
                "no parser registered for '{path}'"
            )));
        };
        let parsed = match parser.parse(path, &content) {
            Ok(parsed) => parsed,
            Err(e) => return Prepared::Invalid(DocumentFailure::Parse(e.to_string())),
        };

        let mut fields = parsed.frontmatter.unwrap_or_default();
        let reserved: BTreeMap<&str, Value> = RESERVED_KEYS
            .iter()
            .filter_map(|key| fields.remove(*key).map(|value| (*key, value)))
            .collect();
        let mut errors = Vec::new();

        let id = match reserved.get("id") {
            None | Some(Value::Null) => {
                let stem = Path::new(path)
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                slugify(&stem)
            }
            Some(Value::String(raw)) => slugify(raw),
            Some(Value::Number(n)) => slugify(&n.to_string()),
            Some(other) => {
                errors.push(FieldError::new("id", format!("expected a string, found {other}")));
                String::new()
            }
        };
        if id.is_empty() && errors.is_empty() {
            errors.push(FieldError::new("id", "does not yield a usable node id"));
        }

        let entity_type = match self.resolve_type(path, reserved.get("type"), snapshot) {
            Ok(entity_type) => entity_type,
            Err(unindexed) => return Prepared::Unindexed(unindexed),
        };

        let status = match reserved.get("status") {
            None | Some(Value::Null) => NodeStatus::default(),
            Some(Value::String(raw)) => match NodeStatus::from_str(raw) {
                Ok(status) => status,
                Err(e) => {
                    errors.push(FieldError::new("status", e.to_string()));
                    NodeStatus::default()
                }
            },
            Some(other) => {
                errors.push(FieldError::new(
                    "status",
                    format!("expected a string, found {other}"),
                ));
                NodeStatus::default()
            }
        };

        let validator = match self.schemas.get_validator(snapshot, &entity_type) {
            Ok(validator) => validator,
            Err(e) => return Prepared::Invalid(DocumentFailure::Parse(e.to_string())),
        };
        let fields = match validator.validate(&fields) {
            Ok(normalized) => normalized,
            Err(field_errors) => {
                errors.extend(field_errors);
                Map::new()
            }
        };
        if !errors.is_empty() {
            return Prepared::Invalid(DocumentFailure::Validation(errors));
        }

        let title = ["name", "title"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| id.clone());

        let mut references = BTreeSet::new();
        let mut unnameable = Vec::new();
        for cross_ref in parsed.cross_references {
            match cross_ref.resolved_id {
                Some(target) if target == id => {}
                Some(target) => {
                    references.insert(Reference::new(&id, target, cross_ref.relationship));
                }
                None => unnameable.push(cross_ref.display_target),
            }
        }

        let mut node = Node {
            id,
            entity_type,
            status,
            title,
            path: path.to_string(),
            body: parsed.body,
            fields,
            template_id: snapshot.id.clone(),
            content_hash: String::new(),
            updated_at: db::now_micros(),
        };
        node.content_hash = node.compute_hash();
        Prepared::Ready(Box::new(PreparedDocument {
            node,
            references,
            unnameable,
        }))
    }

    /// Explicit `type` wins; otherwise the folder conventions decide.
    fn resolve_type(
        &self,
        path: &str,
        explicit: Option<&Value>,
        snapshot: &TemplateSnapshot,
    ) -> Result<String, UnindexedDocument> {
        let unindexed = |reason: String, candidates: Vec<String>| UnindexedDocument {
            path: path.to_string(),
            reason,
            candidates,
        };
        match explicit {
            Some(Value::String(ty)) => {
                return if snapshot.has_entity_type(ty) {
                    Ok(ty.clone())
                } else {
                    Err(unindexed(
                        format!(
                            "type '{ty}' is not declared by template '{}'",
                            snapshot.id
                        ),
                        Vec::new(),
                    ))
                };
            }
            Some(Value::Null) | None => {}
            Some(other) => {
                return Err(unindexed(
                    format!("type must be a string, found {other}"),
                    Vec::new(),
                ))
            }
        }

        let resolution = self.folders.resolve_type(path);
        match resolution.confidence {
            Confidence::Exact | Confidence::Fallback => {
                let ty = resolution.types.first().cloned().unwrap_or_default();
                if snapshot.has_entity_type(&ty) {
                    Ok(ty)
                } else {
                    Err(unindexed(
                        format!(
                            "folder type '{ty}' is not declared by template '{}'",
                            snapshot.id
                        ),
                        resolution.types,
                    ))
                }
            }
            Confidence::Ambiguous => Err(unindexed(
                format!(
                    "folder pattern '{}' is ambiguous: {}",
                    resolution.matched_pattern.unwrap_or_default(),
                    resolution.types.join(", ")
                ),
                resolution.types,
            )),
            Confidence::None => Err(unindexed(
                "no explicit type and no folder mapping matches".to_string(),
                Vec::new(),
            )),
        }
    }

    /// Writes one prepared document in a single transaction, or reports the conflict that
    /// prevents it.
    async fn commit(
        &self,
        path: &str,
        doc: PreparedDocument,
        state: &mut ScanState,
    ) -> Result<Committed, VaultError> {
        let PreparedDocument {
            node,
            references,
            unnameable,
        } = doc;

        if let Some(claimed_path) = state.claimed.get(&node.id) {
            if claimed_path != path {
                return Ok(Committed::Conflict(ConflictingDocument {
                    path: path.to_string(),
                    id: node.id.clone(),
                    existing_path: claimed_path.clone(),
                }));
            }
        }

        let mut tx = self.db.0.begin().await?;
        if let Some(holder) = db::node_by_id(&mut tx, &node.id).await? {
            if holder.path != path {
                tx.rollback().await?;
                return Ok(Committed::Conflict(ConflictingDocument {
                    path: path.to_string(),
                    id: node.id.clone(),
                    existing_path: holder.path,
                }));
            }
        }

        let mut delta = EdgeDelta::default();
        let mut released = None;
        if let Some(previous) = db::node_by_path(&mut tx, path).await? {
            if previous.id != node.id {
                // The document now declares a different id; its old node goes first.
                let removed = db::delete_node(&mut tx, &previous.id).await?;
                delta.removed.extend(removed);
                released = Some(previous);
            }
        }

        let old_refs = db::refs_for_source(&mut tx, &node.id).await?;
        let outcome = db::upsert_node(&mut tx, &node).await?;
        if outcome != UpsertOutcome::Unchanged || old_refs != references {
            db::replace_refs(&mut tx, &node.id, &references).await?;

            let mut counterparts = graph::diff_references(&old_refs, &references).touched_targets();
            counterparts.extend(references.iter().map(|r| r.target_id.clone()));
            if outcome != UpsertOutcome::Unchanged {
                counterparts.extend(db::sources_referencing(&mut tx, &node.id).await?);
            }
            counterparts.remove(&node.id);

            let types = db::node_types(&mut tx, &counterparts).await?;
            let me = Endpoint::new(&node.id, &node.entity_type);
            for other in counterparts.iter() {
                let current = db::edges_between(&mut tx, &node.id, other).await?;
                let desired = match types.get(other) {
                    Some(other_type) => {
                        let refs = db::refs_between(&mut tx, &node.id, other).await?;
                        graph::pair_edges(
                            me,
                            Endpoint::new(other, other_type),
                            refs.iter(),
                            &state.snapshot,
                        )
                    }
                    None => BTreeSet::new(),
                };
                delta.extend(graph::reconcile(&current, &desired));
            }
            db::apply_edge_delta(&mut tx, &delta).await?;
        }
        tx.commit().await?;

        if let Some(previous) = released {
            state.claimed.remove(&previous.id);
            state.report.removed.push(RemovedDocument {
                id: previous.id.clone(),
                path: previous.path.clone(),
            });
            self.emit(VaultEvent::NodeRemoved {
                id: previous.id,
                path: previous.path,
            });
        }
        state.claimed.insert(node.id.clone(), path.to_string());
        state.sources.insert(node.id.clone());
        for target in unnameable {
            state.report.unresolved_references.push(UnresolvedReference {
                source_id: node.id.clone(),
                target,
                issue: ReferenceIssue::Unnameable,
            });
        }

        tracing::debug!(
            "[Indexer::commit] {} '{}' ({:?}), edges +{} -{}",
            node.entity_type,
            node.id,
            outcome,
            delta.added.len(),
            delta.removed.len()
        );
        self.emit(VaultEvent::NodeUpserted {
            id: node.id.clone(),
            path: path.to_string(),
            outcome,
        });
        if !delta.is_empty() {
            self.emit(VaultEvent::EdgesChanged(delta));
        }
        Ok(Committed::Indexed(IndexedDocument {
            id: node.id,
            path: path.to_string(),
            entity_type: node.entity_type,
            outcome,
        }))
    }

    /// Re-derives every edge from stored references under the active template.
    pub async fn rebuild_edges(&self) -> Result<EdgeDelta, VaultError> {
        let _guard = self.writer.lock().await;
        let snapshot = self.registry.get_active().ok_or_else(|| {
            VaultError::Configuration("no active template; cannot derive edges".into())
        })?;
        let fingerprint = snapshot.edge_fingerprint()?;
        let mut tx = self.db.0.begin().await?;
        let delta = Self::rederive_edges(&mut tx, &snapshot).await?;
        db::set_meta_value(&mut tx, db::EDGE_RULES_KEY, &fingerprint).await?;
        tx.commit().await?;
        if !delta.is_empty() {
            self.emit(VaultEvent::EdgesChanged(delta.clone()));
        }
        Ok(delta)
    }

    /// Stored edges stay derivable from stored references only while the relationship rules they
    /// were derived under hold. When the active template changes those rules (another template,
    /// or the same id re-registered), every edge is re-derived before any document is processed,
    /// since unchanged documents skip reconciliation.
    async fn sync_edge_rules(&self, snapshot: &TemplateSnapshot) -> Result<(), VaultError> {
        let fingerprint = snapshot.edge_fingerprint()?;
        let mut tx = self.db.0.begin().await?;
        let stored = db::meta_value(&mut tx, db::EDGE_RULES_KEY).await?;
        if stored.as_deref() == Some(fingerprint.as_str()) {
            return Ok(());
        }
        let delta = Self::rederive_edges(&mut tx, snapshot).await?;
        db::set_meta_value(&mut tx, db::EDGE_RULES_KEY, &fingerprint).await?;
        tx.commit().await?;
        tracing::info!(
            "[Indexer::sync_edge_rules] relationship rules of '{}' changed, edges +{} -{}",
            snapshot.id,
            delta.added.len(),
            delta.removed.len()
        );
        if !delta.is_empty() {
            self.emit(VaultEvent::EdgesChanged(delta));
        }
        Ok(())
    }

    async fn rederive_edges(
        conn: &mut SqliteConnection,
        snapshot: &TemplateSnapshot,
    ) -> Result<EdgeDelta, VaultError> {
        let nodes = db::all_node_types(conn).await?;
        let refs = db::all_refs(conn).await?;
        let current = db::all_edges(conn).await?;
        let desired = graph::rebuild(&nodes, refs.iter(), snapshot);
        let delta = graph::reconcile(&current, &desired);
        db::apply_edge_delta(conn, &delta).await?;
        tracing::info!(
            "[Indexer::rederive_edges] {} edges (+{} -{})",
            desired.len(),
            delta.added.len(),
            delta.removed.len()
        );
        Ok(delta)
    }
}
