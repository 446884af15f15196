//! The [`Vault`] ties a document root to its index: it owns the single writer, answers queries
//! against committed state, and dispatches [`Op`]s from transport façades.
//!
//! ```rust,no_run
//! use vaultgraph_core::{
//!     config::{TomlConfigProvider, VaultConfigProvider},
//!     query::SearchFilters,
//!     template::TEMPLATES,
//!     vault::Vault,
//! };
//!
//! # async fn example() -> Result<(), vaultgraph_core::VaultError> {
//! let config = TomlConfigProvider::new("./world/vaultgraph.toml").load()?;
//! let vault = Vault::from_config("./world", &config, TEMPLATES.clone(), None).await?;
//! let report = vault.scan().await?;
//! println!("{}", report.summary());
//! let hits = vault.search("storm", &SearchFilters::default()).await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::{mpsc::Sender, Arc},
};

use crate::{
    codec::ParserMap,
    commands::{Op, OpResult},
    config::{apply_template_config, IndexOptions, VaultConfig},
    db::{self, db_init, DbConnection, VAULT_DB},
    error::VaultError,
    event::VaultEvent,
    folders::{FolderMappingConfig, FolderResolver},
    graph::{ConsistencyReport, EdgeDelta, KnowledgeGraph},
    indexer::{CancellationFlag, Indexer, ScanReport, ScanRequest},
    properties::{Edge, Node, NodeSummary},
    query::{Neighborhood, SearchFilters, SearchResults, MAX_TRAVERSAL_DEPTH},
    template::{TemplateDefinition, TemplateRegistry, TemplateSnapshot, TemplateSource},
};

/// Whole-graph dump restricted to the active template's types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphExport {
    pub template_id: String,
    pub nodes: Vec<NodeSummary>,
    pub edges: Vec<Edge>,
}

pub struct Vault {
    root: PathBuf,
    db: DbConnection,
    registry: TemplateRegistry,
    folders: Arc<FolderResolver>,
    parsers: ParserMap,
    indexer: Indexer,
}

impl Vault {
    /// Opens a vault over an initialized database. The folder mapping must only name types the
    /// active template declares.
    pub fn open<P: AsRef<Path>>(
        root: P,
        db: DbConnection,
        registry: TemplateRegistry,
        folders: &FolderMappingConfig,
        parsers: ParserMap,
        options: IndexOptions,
        events: Option<Sender<VaultEvent>>,
    ) -> Result<Self, VaultError> {
        let root = std::fs::canonicalize(root.as_ref()).map_err(|e| {
            VaultError::Configuration(format!("vault root {:?}: {e}", root.as_ref()))
        })?;
        if !root.is_dir() {
            return Err(VaultError::Configuration(format!(
                "vault root {root:?} is not a directory"
            )));
        }
        let folders = Arc::new(FolderResolver::new(folders)?);
        match registry.get_active() {
            Some(snapshot) => folders.validate_against(&snapshot)?,
            None => tracing::warn!(
                "[Vault::open] no active template; scans fail until one is activated"
            ),
        }
        let indexer = Indexer::new(
            root.clone(),
            db.clone(),
            registry.clone(),
            folders.clone(),
            parsers.clone(),
            options,
            events,
        );
        tracing::info!("[Vault::open] opened vault at {:?}", root);
        Ok(Vault {
            root,
            db,
            registry,
            folders,
            parsers,
            indexer,
        })
    }

    /// Applies `config` to `registry`, initializes the database (`dbPath`, by default
    /// `.vaultgraph.db` inside the root) and opens the vault with the builtin parsers.
    pub async fn from_config<P: AsRef<Path>>(
        root: P,
        config: &VaultConfig,
        registry: TemplateRegistry,
        events: Option<Sender<VaultEvent>>,
    ) -> Result<Self, VaultError> {
        apply_template_config(&registry, &config.template)?;
        let db_path = match config.db_path.as_ref() {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => root.as_ref().join(path),
            None => root.as_ref().join(VAULT_DB),
        };
        let db = db_init(db_path).await?;
        Vault::open(
            root,
            db,
            registry,
            &config.folders,
            ParserMap::create(),
            config.index.clone(),
            events,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db(&self) -> &DbConnection {
        &self.db
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    pub fn parsers(&self) -> &ParserMap {
        &self.parsers
    }

    /// Whether a vault-relative path could hold a document.
    pub fn is_candidate(&self, rel: &str) -> bool {
        self.indexer.is_candidate(rel)
    }

    fn active(&self) -> Result<TemplateSnapshot, VaultError> {
        self.registry
            .get_active()
            .ok_or_else(|| VaultError::Configuration("no active template".to_string()))
    }

    pub async fn scan(&self) -> Result<ScanReport, VaultError> {
        self.scan_with(ScanRequest::Full).await
    }

    pub async fn scan_incremental(&self, paths: Vec<PathBuf>) -> Result<ScanReport, VaultError> {
        self.scan_with(ScanRequest::Paths(paths)).await
    }

    /// Each scan gets its own flag, so a cancellation only reaches the scan running when it was
    /// requested.
    pub async fn scan_with(&self, request: ScanRequest) -> Result<ScanReport, VaultError> {
        self.indexer.scan(request, &CancellationFlag::new()).await
    }

    /// Asks the running scan to stop after its current document. Documents already committed
    /// stay committed. Without a running scan this does nothing.
    pub fn cancel_scan(&self) {
        if self.indexer.cancel_running() {
            tracing::info!("[Vault::cancel_scan] cancellation requested");
        } else {
            tracing::debug!("[Vault::cancel_scan] no scan is running");
        }
    }

    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<SearchResults, VaultError> {
        let snapshot = self.active()?;
        let types = snapshot.entity_type_names();
        self.db.search(query, filters, Some(types.as_slice())).await
    }

    pub async fn neighbors(
        &self,
        id: &str,
        relationship: Option<&str>,
        depth: usize,
    ) -> Result<Neighborhood, VaultError> {
        let snapshot = self.active()?;
        let types = snapshot.entity_type_names();
        self.db
            .neighbors(id, relationship, depth.min(MAX_TRAVERSAL_DEPTH), Some(types.as_slice()))
            .await
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<Node>, VaultError> {
        self.db.get_node(id).await
    }

    /// Registers `template` at runtime precedence.
    pub fn register_template(&self, template: TemplateDefinition) -> Result<(), VaultError> {
        self.registry.register(template, TemplateSource::Runtime)
    }

    /// Activates a registered template after checking the folder mapping against it. Scans
    /// already running keep their snapshot.
    pub fn activate_template(&self, id: &str) -> Result<TemplateSnapshot, VaultError> {
        let definition = self
            .registry
            .get(id)
            .ok_or_else(|| VaultError::NotFound(format!("template '{id}' is not registered")))?;
        self.folders.validate_against(&definition)?;
        self.registry.activate(id)
    }

    /// Checks stored edges against stored references under the active template.
    pub async fn validate_consistency(&self) -> Result<ConsistencyReport, VaultError> {
        let snapshot = self.active()?;
        let (nodes, edges, refs) = {
            let mut conn = self.db.0.acquire().await?;
            (
                db::all_node_types(&mut conn).await?,
                db::all_edges(&mut conn).await?,
                db::all_refs(&mut conn).await?,
            )
        };
        let graph = KnowledgeGraph::from_parts(nodes, edges);
        let report = graph.check_consistency(&snapshot, Some(refs.iter()));
        tracing::info!(
            "[Vault::validate_consistency] {} nodes, {} edges, {} issues",
            report.nodes_checked,
            report.edges_checked,
            report.issues.len()
        );
        Ok(report)
    }

    pub async fn rebuild_edges(&self) -> Result<EdgeDelta, VaultError> {
        self.indexer.rebuild_edges().await
    }

    pub async fn export_graph(&self) -> Result<GraphExport, VaultError> {
        let snapshot = self.active()?;
        let (nodes, edges) = {
            let mut conn = self.db.0.acquire().await?;
            (db::all_nodes(&mut conn).await?, db::all_edges(&mut conn).await?)
        };
        let nodes: Vec<NodeSummary> = nodes
            .iter()
            .filter(|node| snapshot.has_entity_type(&node.entity_type))
            .map(Node::summary)
            .collect();
        let visible: std::collections::BTreeSet<&str> =
            nodes.iter().map(|n| n.id.as_str()).collect();
        let edges = edges
            .into_iter()
            .filter(|e| {
                visible.contains(e.source_id.as_str()) && visible.contains(e.target_id.as_str())
            })
            .collect();
        Ok(GraphExport {
            template_id: snapshot.id.clone(),
            nodes,
            edges,
        })
    }

    pub async fn dispatch(&self, op: Op) -> Result<OpResult, VaultError> {
        tracing::debug!("[Vault::dispatch] {}", op);
        let result = match op {
            Op::Scan(request) => OpResult::Scan(self.scan_with(request).await?),
            Op::CancelScan => {
                self.cancel_scan();
                OpResult::Ok
            }
            Op::Search { query, filters } => {
                OpResult::Search(self.search(&query, &filters).await?)
            }
            Op::Neighbors {
                id,
                relationship,
                depth,
            } => OpResult::Neighbors(self.neighbors(&id, relationship.as_deref(), depth).await?),
            Op::GetNode(id) => match self.get_node(&id).await? {
                Some(node) => OpResult::Node(Box::new(node)),
                None => return Err(VaultError::NotFound(format!("node '{id}'"))),
            },
            Op::ListTemplates => OpResult::Templates(self.registry.list()),
            Op::RegisterTemplate(template) => {
                self.register_template(template)?;
                OpResult::Ok
            }
            Op::ActivateTemplate(id) => {
                let snapshot = self.activate_template(&id)?;
                OpResult::Activated {
                    id: snapshot.id.clone(),
                    generation: snapshot.generation,
                }
            }
            Op::ValidateConsistency => OpResult::Consistency(self.validate_consistency().await?),
            Op::RebuildEdges => OpResult::Edges(self.rebuild_edges().await?),
            Op::ExportGraph => OpResult::Graph(self.export_graph().await?),
        };
        tracing::debug!("[Vault::dispatch] -> {}", result);
        Ok(result)
    }
}
