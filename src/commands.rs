use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{
    graph::{ConsistencyReport, EdgeDelta},
    indexer::{ScanReport, ScanRequest},
    properties::Node,
    query::{Neighborhood, SearchFilters, SearchResults},
    template::{registry::TemplateInfo, TemplateDefinition},
    vault::GraphExport,
};

/// Command interface between a transport façade (HTTP, IPC, CLI) and a [`Vault`](crate::vault::Vault)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Run a full or path-limited scan and wait for its report
    Scan(ScanRequest),
    /// Ask the running scan to stop after its current document
    CancelScan,
    Search {
        query: String,
        #[serde(default)]
        filters: SearchFilters,
    },
    Neighbors {
        id: String,
        relationship: Option<String>,
        depth: usize,
    },
    GetNode(String),
    ListTemplates,
    /// Register a template at runtime precedence
    RegisterTemplate(TemplateDefinition),
    ActivateTemplate(String),
    ValidateConsistency,
    RebuildEdges,
    ExportGraph,
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Op::Scan(ScanRequest::Full) => write!(f, "Scan(full)"),
            Op::Scan(ScanRequest::Paths(paths)) => write!(f, "Scan({} paths)", paths.len()),
            Op::CancelScan => write!(f, "CancelScan"),
            Op::Search { query, filters } => write!(
                f,
                "Search({query:?}, types: [{}], limit: {:?})",
                filters.types.join(", "),
                filters.limit
            ),
            Op::Neighbors {
                id,
                relationship,
                depth,
            } => write!(
                f,
                "Neighbors({id}, {}, depth {depth})",
                relationship.as_deref().unwrap_or("*")
            ),
            Op::GetNode(id) => write!(f, "GetNode({id})"),
            Op::ListTemplates => write!(f, "ListTemplates"),
            Op::RegisterTemplate(t) => write!(f, "RegisterTemplate({}@{})", t.id, t.version),
            Op::ActivateTemplate(id) => write!(f, "ActivateTemplate({id})"),
            Op::ValidateConsistency => write!(f, "ValidateConsistency"),
            Op::RebuildEdges => write!(f, "RebuildEdges"),
            Op::ExportGraph => write!(f, "ExportGraph"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpResult {
    Ok,
    Scan(ScanReport),
    Search(SearchResults),
    Neighbors(Neighborhood),
    Node(Box<Node>),
    Templates(Vec<TemplateInfo>),
    /// The template now active and the snapshot generation it was activated under
    Activated { id: String, generation: u64 },
    Consistency(ConsistencyReport),
    Edges(EdgeDelta),
    Graph(GraphExport),
}

impl Display for OpResult {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            OpResult::Ok => write!(f, "Ok"),
            OpResult::Scan(report) => write!(f, "Scan({})", report.summary()),
            OpResult::Search(results) => {
                write!(f, "Search({:?}, {} hits)", results.plan, results.hits.len())
            }
            OpResult::Neighbors(n) => write!(
                f,
                "Neighbors({}: {} nodes, {} edges)",
                n.origin.id,
                n.nodes.len(),
                n.edges.len()
            ),
            OpResult::Node(node) => write!(f, "Node({})", node.id),
            OpResult::Templates(v) => write!(
                f,
                "Templates({})",
                v.iter()
                    .map(|t| t.id.clone())
                    .collect::<Vec<String>>()
                    .join(", ")
            ),
            OpResult::Activated { id, generation } => write!(f, "Activated({id}@{generation})"),
            OpResult::Consistency(report) => write!(
                f,
                "Consistency({} nodes, {} edges, {} issues)",
                report.nodes_checked,
                report.edges_checked,
                report.issues.len()
            ),
            OpResult::Edges(delta) => {
                write!(f, "Edges(+{}, -{})", delta.added.len(), delta.removed.len())
            }
            OpResult::Graph(g) => {
                write!(f, "Graph({} nodes, {} edges)", g.nodes.len(), g.edges.len())
            }
        }
    }
}
