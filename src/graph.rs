//! Derivation of typed edges from node references.
//!
//! Edges are a materialized view: the edges between two nodes are a pure function of the
//! references in both directions between them, their entity types, and the template. The indexer
//! calls [`pair_edges`] for every pair a document change can affect and applies the
//! [`reconcile`]d delta, so a single document never triggers a full rebuild. [`rebuild`] derives
//! the complete set for repair and verification.

use petgraph::{graph::NodeIndex, Graph};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter},
};

use crate::{
    error::VaultError,
    properties::{Edge, Reference, RELATED},
    template::TemplateDefinition,
};

/// An indexed node as the graph sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint<'a> {
    pub id: &'a str,
    pub entity_type: &'a str,
}

impl<'a> Endpoint<'a> {
    pub fn new(id: &'a str, entity_type: &'a str) -> Self {
        Endpoint { id, entity_type }
    }
}

/// Relationship a reference from `source_type` to `target_type` materializes as.
///
/// An explicit relationship is honored when the template declares it. Untyped references use the
/// template's default for the type pair, and everything else lands on [`RELATED`].
pub fn relationship_for(
    source_type: &str,
    target_type: &str,
    explicit: Option<&str>,
    template: &TemplateDefinition,
) -> String {
    if let Some(explicit) = explicit {
        if template.relationship(explicit).is_some() {
            return explicit.to_string();
        }
        tracing::warn!(
            "[graph::relationship_for] relationship '{}' is not declared by template '{}', \
             recording {} -> {} as '{}'",
            explicit,
            template.id,
            source_type,
            target_type,
            RELATED
        );
    }
    template
        .default_relationship(source_type, target_type)
        .unwrap_or(RELATED)
        .to_string()
}

/// Edges one reference produces: the forward edge plus its mirror when bidirectional.
pub fn reference_edges(
    source: Endpoint<'_>,
    target: Endpoint<'_>,
    explicit: Option<&str>,
    template: &TemplateDefinition,
) -> Vec<Edge> {
    if source.id == target.id {
        return Vec::new();
    }
    let relationship = relationship_for(source.entity_type, target.entity_type, explicit, template);
    let mut edges = Vec::with_capacity(2);
    if let Some(config) = template.relationship(&relationship) {
        if config.bidirectional {
            if let Some(reverse_id) = config.reverse_id.as_deref() {
                edges.push(Edge::new(target.id, reverse_id, source.id));
            }
        }
    }
    edges.push(Edge::new(source.id, relationship, target.id));
    edges
}

/// Every edge the references between `a` and `b` (in either direction) sustain.
pub fn pair_edges<'r, I>(
    a: Endpoint<'_>,
    b: Endpoint<'_>,
    references: I,
    template: &TemplateDefinition,
) -> BTreeSet<Edge>
where
    I: IntoIterator<Item = &'r Reference>,
{
    let mut edges = BTreeSet::new();
    for reference in references {
        let (source, target) = if reference.source_id == a.id && reference.target_id == b.id {
            (a, b)
        } else if reference.source_id == b.id && reference.target_id == a.id {
            (b, a)
        } else {
            continue;
        };
        edges.extend(reference_edges(
            source,
            target,
            reference.relationship.as_deref(),
            template,
        ));
    }
    edges
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDelta {
    pub added: Vec<Edge>,
    pub removed: Vec<Edge>,
}

impl EdgeDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn extend(&mut self, other: EdgeDelta) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
    }
}

pub fn reconcile(current: &BTreeSet<Edge>, desired: &BTreeSet<Edge>) -> EdgeDelta {
    EdgeDelta {
        added: desired.difference(current).cloned().collect(),
        removed: current.difference(desired).cloned().collect(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceDelta {
    pub added: BTreeSet<Reference>,
    pub removed: BTreeSet<Reference>,
}

impl ReferenceDelta {
    /// Ids on the far side of any added or removed reference.
    pub fn touched_targets(&self) -> BTreeSet<String> {
        self.added
            .iter()
            .chain(self.removed.iter())
            .map(|r| r.target_id.clone())
            .collect()
    }
}

pub fn diff_references(old: &BTreeSet<Reference>, new: &BTreeSet<Reference>) -> ReferenceDelta {
    ReferenceDelta {
        added: new.difference(old).cloned().collect(),
        removed: old.difference(new).cloned().collect(),
    }
}

/// Complete edge set for `nodes` (id, entity type) and all stored references. References whose
/// target is not indexed stay pending and contribute nothing.
pub fn rebuild<'r, I>(
    nodes: &BTreeMap<String, String>,
    references: I,
    template: &TemplateDefinition,
) -> BTreeSet<Edge>
where
    I: IntoIterator<Item = &'r Reference>,
{
    let mut edges = BTreeSet::new();
    for reference in references {
        let (Some(source_type), Some(target_type)) = (
            nodes.get(&reference.source_id),
            nodes.get(&reference.target_id),
        ) else {
            continue;
        };
        edges.extend(reference_edges(
            Endpoint::new(&reference.source_id, source_type),
            Endpoint::new(&reference.target_id, target_type),
            reference.relationship.as_deref(),
            template,
        ));
    }
    edges
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyIssue {
    /// An edge endpoint that is not an indexed node
    DanglingEdge { edge: Edge, missing_id: String },
    /// A bidirectional edge whose mirror is absent
    AsymmetricPair { edge: Edge, missing_mirror: Edge },
    /// Stored edge the references do not sustain
    UnsustainedEdge { edge: Edge },
    /// Edge the references sustain but storage lacks
    MissingEdge { edge: Edge },
}

impl Display for ConsistencyIssue {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ConsistencyIssue::DanglingEdge { edge, missing_id } => {
                write!(f, "edge {edge} references missing node '{missing_id}'")
            }
            ConsistencyIssue::AsymmetricPair {
                edge,
                missing_mirror,
            } => write!(f, "edge {edge} has no mirror {missing_mirror}"),
            ConsistencyIssue::UnsustainedEdge { edge } => {
                write!(f, "edge {edge} is not sustained by any reference")
            }
            ConsistencyIssue::MissingEdge { edge } => {
                write!(f, "edge {edge} is sustained by references but not stored")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub template_id: String,
    pub nodes_checked: usize,
    pub edges_checked: usize,
    pub issues: Vec<ConsistencyIssue>,
    /// Nodes whose type the checked template does not declare. Informational: such nodes were
    /// valid when written and are only hidden from queries.
    pub stale_nodes: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn into_result(self) -> Result<ConsistencyReport, VaultError> {
        if self.is_consistent() {
            Ok(self)
        } else {
            Err(VaultError::Integrity(
                self.issues
                    .iter()
                    .map(|issue| issue.to_string())
                    .collect::<Vec<String>>()
                    .join("; "),
            ))
        }
    }
}

/// Arena view of stored nodes and edges, used for whole-graph checks and export.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    graph: Graph<String, String>,
    index: BTreeMap<String, NodeIndex>,
    types: BTreeMap<String, String>,
}

impl KnowledgeGraph {
    /// `nodes` are (id, entity type). Edge endpoints without a node entry still get an arena
    /// slot so dangling edges can be reported.
    pub fn from_parts<N, E>(nodes: N, edges: E) -> Self
    where
        N: IntoIterator<Item = (String, String)>,
        E: IntoIterator<Item = Edge>,
    {
        let mut graph = Graph::new();
        let mut index = BTreeMap::new();
        let mut types = BTreeMap::new();
        for (id, entity_type) in nodes {
            if !index.contains_key(&id) {
                index.insert(id.clone(), graph.add_node(id.clone()));
            }
            types.insert(id, entity_type);
        }
        for edge in edges {
            let mut endpoint = |id: &String| -> NodeIndex {
                *index
                    .entry(id.clone())
                    .or_insert_with(|| graph.add_node(id.clone()))
            };
            let source_idx = endpoint(&edge.source_id);
            let target_idx = endpoint(&edge.target_id);
            graph.add_edge(source_idx, target_idx, edge.relationship_id);
        }
        KnowledgeGraph {
            graph,
            index,
            types,
        }
    }

    pub fn node_count(&self) -> usize {
        self.types.len()
    }

    pub fn edges(&self) -> BTreeSet<Edge> {
        self.graph
            .raw_edges()
            .iter()
            .map(|e| {
                Edge::new(
                    self.graph[e.source()].clone(),
                    e.weight.clone(),
                    self.graph[e.target()].clone(),
                )
            })
            .collect()
    }

    pub fn has_edge(&self, edge: &Edge) -> bool {
        let (Some(source), Some(target)) = (
            self.index.get(&edge.source_id),
            self.index.get(&edge.target_id),
        ) else {
            return false;
        };
        self.graph
            .edges_connecting(*source, *target)
            .any(|e| *e.weight() == edge.relationship_id)
    }

    /// Checks that no edge dangles and that every bidirectional edge has its mirror. When
    /// `references` is given, the stored edges are also compared with the derived set.
    pub fn check_consistency<'r, I>(
        &self,
        template: &TemplateDefinition,
        references: Option<I>,
    ) -> ConsistencyReport
    where
        I: IntoIterator<Item = &'r Reference>,
    {
        let mut issues = Vec::new();
        let stored = self.edges();
        for edge in stored.iter() {
            for id in [&edge.source_id, &edge.target_id] {
                if !self.types.contains_key(id) {
                    issues.push(ConsistencyIssue::DanglingEdge {
                        edge: edge.clone(),
                        missing_id: id.clone(),
                    });
                }
            }
            let Some(config) = template.relationship(&edge.relationship_id) else {
                continue;
            };
            if !config.bidirectional {
                continue;
            }
            if let Some(reverse_id) = config.reverse_id.as_deref() {
                let mirror = Edge::new(&edge.target_id, reverse_id, &edge.source_id);
                if !self.has_edge(&mirror) {
                    issues.push(ConsistencyIssue::AsymmetricPair {
                        edge: edge.clone(),
                        missing_mirror: mirror,
                    });
                }
            }
        }

        if let Some(references) = references {
            let derived = rebuild(&self.types, references, template);
            for edge in stored.difference(&derived) {
                issues.push(ConsistencyIssue::UnsustainedEdge { edge: edge.clone() });
            }
            for edge in derived.difference(&stored) {
                issues.push(ConsistencyIssue::MissingEdge { edge: edge.clone() });
            }
        }

        for issue in issues.iter() {
            tracing::error!("[KnowledgeGraph::check_consistency] {}", issue);
        }

        ConsistencyReport {
            template_id: template.id.clone(),
            nodes_checked: self.node_count(),
            edges_checked: stored.len(),
            issues,
            stale_nodes: self
                .types
                .iter()
                .filter(|(_, ty)| !template.has_entity_type(ty))
                .map(|(id, _)| id.clone())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::builtin;
    use test_log::test;

    fn nodes() -> BTreeMap<String, String> {
        [
            ("aria", "character"),
            ("harbor", "location"),
            ("guild", "faction"),
            ("codex", "lore"),
        ]
        .into_iter()
        .map(|(id, ty)| (id.to_string(), ty.to_string()))
        .collect()
    }

    #[test]
    fn test_default_relationship_with_mirror() {
        let template = builtin::worldbuilding();
        let edges = reference_edges(
            Endpoint::new("aria", "character"),
            Endpoint::new("harbor", "location"),
            None,
            &template,
        );
        let edges: BTreeSet<Edge> = edges.into_iter().collect();
        assert_eq!(
            edges,
            BTreeSet::from([
                Edge::new("aria", "located_in", "harbor"),
                Edge::new("harbor", "has_inhabitant", "aria"),
            ])
        );
    }

    #[test]
    fn test_fallback_and_unknown_explicit() {
        let template = builtin::worldbuilding();
        assert_eq!(relationship_for("lore", "faction", None, &template), RELATED);
        assert_eq!(
            relationship_for("character", "item", Some("teleports"), &template),
            RELATED
        );
        assert_eq!(
            relationship_for("character", "item", Some("member_of"), &template),
            "member_of"
        );
        // `related` is its own reverse.
        let edges = reference_edges(
            Endpoint::new("codex", "lore"),
            Endpoint::new("guild", "faction"),
            None,
            &template,
        );
        assert_eq!(edges.len(), 2);
        assert!(edges.contains(&Edge::new("guild", RELATED, "codex")));
    }

    #[test]
    fn test_self_reference_has_no_edge() {
        let template = builtin::worldbuilding();
        let aria = Endpoint::new("aria", "character");
        assert!(reference_edges(aria, aria, None, &template).is_empty());
    }

    #[test]
    fn test_mirror_survives_while_sustained() {
        let template = builtin::worldbuilding();
        let aria = Endpoint::new("aria", "character");
        let harbor = Endpoint::new("harbor", "location");
        let both = vec![
            Reference::new("aria", "harbor", None),
            Reference::new("harbor", "aria", None),
        ];
        let current = pair_edges(aria, harbor, both.iter(), &template);
        assert_eq!(current.len(), 2);

        // Aria drops the link; the harbor's own link still sustains the same pair.
        let remaining = vec![Reference::new("harbor", "aria", None)];
        let desired = pair_edges(aria, harbor, remaining.iter(), &template);
        assert!(reconcile(&current, &desired).is_empty());

        let desired = pair_edges(aria, harbor, std::iter::empty(), &template);
        let delta = reconcile(&current, &desired);
        assert!(delta.added.is_empty());
        assert_eq!(delta.removed.len(), 2);
    }

    #[test]
    fn test_rebuild_skips_pending_references() {
        let template = builtin::worldbuilding();
        let refs = vec![
            Reference::new("aria", "harbor", None),
            Reference::new("aria", "guild", None),
            Reference::new("aria", "nowhere", None),
        ];
        let edges = rebuild(&nodes(), refs.iter(), &template);
        assert_eq!(edges.len(), 4);
        assert!(edges.contains(&Edge::new("guild", "has_member", "aria")));
    }

    #[test]
    fn test_reference_delta() {
        let old = BTreeSet::from([
            Reference::new("aria", "harbor", None),
            Reference::new("aria", "guild", None),
        ]);
        let new = BTreeSet::from([
            Reference::new("aria", "harbor", None),
            Reference::new("aria", "codex", None),
        ]);
        let delta = diff_references(&old, &new);
        assert_eq!(
            delta.touched_targets(),
            BTreeSet::from(["codex".to_string(), "guild".to_string()])
        );
    }

    #[test]
    fn test_consistency_check() {
        let template = builtin::worldbuilding();
        let refs = vec![Reference::new("aria", "harbor", None)];
        let good = rebuild(&nodes(), refs.iter(), &template);
        let graph = KnowledgeGraph::from_parts(nodes(), good.clone());
        let report = graph.check_consistency(&template, Some(refs.iter()));
        assert!(report.is_consistent(), "{report:?}");
        assert_eq!(report.edges_checked, 2);

        let mut broken: Vec<Edge> = good.into_iter().collect();
        broken.retain(|e| e.relationship_id != "has_inhabitant");
        broken.push(Edge::new("aria", "owns", "ghost"));
        let graph = KnowledgeGraph::from_parts(nodes(), broken);
        let report = graph.check_consistency(&template, None::<std::slice::Iter<'_, Reference>>);
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, ConsistencyIssue::DanglingEdge { missing_id, .. } if missing_id == "ghost")));
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, ConsistencyIssue::AsymmetricPair { edge, .. } if edge.relationship_id == "located_in")));
        assert!(matches!(report.into_result(), Err(VaultError::Integrity(_))));
    }
}
