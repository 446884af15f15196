//! Read side of the vault: filtered listings, ranked full-text search, and bounded graph
//! traversal.
//!
//! Every query is restricted to the entity types of the active template (when one is given), so
//! nodes written under a previous template stay stored but drop out of results.

use enumset::EnumSet;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, QueryBuilder, Row, Sqlite};
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    db::{DbConnection, SQLITE_LIMIT_VARIABLE_NUMBER},
    error::VaultError,
    properties::{Edge, NodeStatus, NodeSummary},
};

pub const MAX_TRAVERSAL_DEPTH: usize = 10;

const SUMMARY_COLUMNS: &str = "n.id, n.entity_type, n.status, n.title, n.path, n.updated_at";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Entity types to keep; empty keeps every active type
    #[serde(default)]
    pub types: Vec<String>,
    /// Statuses to keep; empty keeps every status
    #[serde(default)]
    pub statuses: EnumSet<NodeStatus>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: u32,
}

impl SearchFilters {
    pub fn with_types<I: IntoIterator<Item = S>, S: Into<String>>(mut self, types: I) -> Self {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.statuses.insert(status);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }
}

/// How a search was answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchPlan {
    /// Blank query: plain listing ordered by id, the full-text index is not consulted
    Listing,
    /// bm25-ranked full-text match of the quoted expression
    Ranked { expression: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub node: NodeSummary,
    /// bm25 score, lower is better. `None` for listings.
    pub score: Option<f64>,
    pub snippet: Option<String>,
}

impl FromRow<'_, SqliteRow> for SearchHit {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(SearchHit {
            node: NodeSummary::from_row(row)?,
            score: row.try_get("score")?,
            snippet: row.try_get("snippet")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub plan: SearchPlan,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub node: NodeSummary,
    /// Hops from the origin
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighborhood {
    pub origin: NodeSummary,
    /// Reachable nodes in breadth-first order, each listed once
    pub nodes: Vec<Neighbor>,
    /// Every edge followed during the traversal
    pub edges: Vec<Edge>,
}

/// Quotes each whitespace-separated term so user input can never be read as FTS5 syntax.
/// Terms are implicitly AND-ed. `None` for a blank query.
pub fn fts_expression(query: &str) -> Option<String> {
    let terms = query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<String>>();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// Types a query may return: the requested ones intersected with the active ones.
fn effective_types(requested: &[String], active: Option<&[String]>) -> Option<Vec<String>> {
    match (requested.is_empty(), active) {
        (true, None) => None,
        (true, Some(active)) => Some(active.to_vec()),
        (false, None) => Some(requested.to_vec()),
        (false, Some(active)) => Some(
            requested
                .iter()
                .filter(|ty| active.contains(ty))
                .cloned()
                .collect(),
        ),
    }
}

fn push_in_list<'a>(qb: &mut QueryBuilder<'a, Sqlite>, column: &str, values: &'a [String]) {
    qb.push(format!(" AND {column} IN ("));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value.as_str());
    }
    separated.push_unseparated(")");
}

fn push_filters<'a>(
    qb: &mut QueryBuilder<'a, Sqlite>,
    types: Option<&'a [String]>,
    statuses: &'a [String],
) {
    if let Some(types) = types {
        push_in_list(qb, "n.entity_type", types);
    }
    if !statuses.is_empty() {
        push_in_list(qb, "n.status", statuses);
    }
}

impl DbConnection {
    /// Blank queries list nodes ordered by id; anything else is a ranked full-text match
    /// ordered by bm25, then most recent update, then id.
    #[tracing::instrument(skip(self))]
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        active_types: Option<&[String]>,
    ) -> Result<SearchResults, VaultError> {
        let expression = fts_expression(query);
        let plan = match expression.as_ref() {
            None => SearchPlan::Listing,
            Some(expression) => SearchPlan::Ranked {
                expression: expression.clone(),
            },
        };

        let types = effective_types(&filters.types, active_types);
        if types.as_ref().is_some_and(|t| t.is_empty()) {
            return Ok(SearchResults {
                plan,
                hits: Vec::new(),
            });
        }
        let statuses = filters
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect::<Vec<String>>();
        let limit = filters.limit.map_or(-1, i64::from);

        let mut qb = match expression.as_ref() {
            None => {
                let mut qb = QueryBuilder::<Sqlite>::new(format!(
                    "SELECT {SUMMARY_COLUMNS}, NULL AS score, NULL AS snippet \
                     FROM nodes n WHERE 1 = 1"
                ));
                push_filters(&mut qb, types.as_deref(), &statuses);
                qb.push(" ORDER BY n.id ASC");
                qb
            }
            Some(expression) => {
                let mut qb = QueryBuilder::<Sqlite>::new(format!(
                    "SELECT {SUMMARY_COLUMNS}, bm25(nodes_fts) AS score, \
                     snippet(nodes_fts, 4, '[', ']', '...', 12) AS snippet \
                     FROM nodes_fts JOIN nodes n ON n.id = nodes_fts.id \
                     WHERE nodes_fts MATCH "
                ));
                qb.push_bind(expression.as_str());
                push_filters(&mut qb, types.as_deref(), &statuses);
                qb.push(" ORDER BY score ASC, n.updated_at DESC, n.id ASC");
                qb
            }
        };
        qb.push(" LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(filters.offset));

        let hits = qb
            .build_query_as::<SearchHit>()
            .fetch_all(&self.0)
            .await
            .map_err(|e| {
                tracing::error!(
                    "[DbConnection::search] SQL error for query {:?}\n\terror: {}",
                    query,
                    e
                );
                e
            })?;
        tracing::debug!(
            "[DbConnection::search] {:?} returned {} hits",
            plan,
            hits.len()
        );
        Ok(SearchResults { plan, hits })
    }

    /// Breadth-first traversal over outgoing edges, optionally restricted to one relationship.
    /// `depth` is capped at [`MAX_TRAVERSAL_DEPTH`]; cycles are cut by a visited set.
    #[tracing::instrument(skip(self))]
    pub async fn neighbors(
        &self,
        id: &str,
        relationship: Option<&str>,
        depth: usize,
        active_types: Option<&[String]>,
    ) -> Result<Neighborhood, VaultError> {
        let origin = sqlx::query_as::<_, NodeSummary>(
            "SELECT id, entity_type, status, title, path, updated_at FROM nodes WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.0)
        .await?
        .filter(|n| active_types.is_none_or(|types| types.contains(&n.entity_type)))
        .ok_or_else(|| VaultError::NotFound(format!("node '{id}'")))?;

        let depth = depth.min(MAX_TRAVERSAL_DEPTH);
        // The frontier shares the statement's bind budget with the relationship and type filters.
        let chunk_size = SQLITE_LIMIT_VARIABLE_NUMBER
            .saturating_sub(1 + active_types.map_or(0, |types| types.len()))
            .max(1);
        let mut visited = BTreeSet::from([origin.id.clone()]);
        let mut frontier = vec![origin.id.clone()];
        let mut nodes = Vec::new();
        let mut edges = BTreeSet::new();

        for level in 1..=depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = BTreeMap::new();
            for chunk in frontier.chunks(chunk_size) {
                let mut qb = QueryBuilder::<Sqlite>::new(format!(
                    "SELECT e.source_id, e.relationship_id, e.target_id, {SUMMARY_COLUMNS} \
                     FROM edges e JOIN nodes n ON n.id = e.target_id WHERE 1 = 1"
                ));
                push_in_list(&mut qb, "e.source_id", chunk);
                if let Some(relationship) = relationship {
                    qb.push(" AND e.relationship_id = ");
                    qb.push_bind(relationship);
                }
                if let Some(types) = active_types {
                    push_in_list(&mut qb, "n.entity_type", types);
                }
                qb.push(" ORDER BY e.source_id, e.relationship_id, e.target_id");
                for row in qb.build().fetch_all(&self.0).await?.iter() {
                    let edge = Edge::from_row(row)?;
                    let target = NodeSummary::from_row(row)?;
                    if visited.insert(target.id.clone()) {
                        next.insert(target.id.clone(), target);
                    }
                    edges.insert(edge);
                }
            }
            frontier = next.keys().cloned().collect();
            nodes.extend(next.into_values().map(|node| Neighbor { node, depth: level }));
        }

        Ok(Neighborhood {
            origin,
            nodes,
            edges: edges.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{self, db_init_memory, now_micros},
        graph::EdgeDelta,
        properties::Node,
    };
    use serde_json::Map;
    use test_log::test;

    async fn seed(db: &DbConnection, nodes: &[(&str, &str, &str)], edges: &[(&str, &str, &str)]) {
        let mut conn = db.0.acquire().await.unwrap();
        for (id, entity_type, body) in nodes {
            let mut node = Node {
                id: id.to_string(),
                entity_type: entity_type.to_string(),
                status: NodeStatus::Draft,
                title: id.to_string(),
                path: format!("{entity_type}/{id}.md"),
                body: body.to_string(),
                fields: Map::new(),
                template_id: "worldbuilding".to_string(),
                content_hash: String::new(),
                updated_at: now_micros(),
            };
            node.content_hash = node.compute_hash();
            db::upsert_node(&mut conn, &node).await.unwrap();
        }
        let delta = EdgeDelta {
            added: edges.iter().map(|(s, r, t)| Edge::new(*s, *r, *t)).collect(),
            removed: Vec::new(),
        };
        db::apply_edge_delta(&mut conn, &delta).await.unwrap();
    }

    #[test]
    fn test_fts_expression_quotes_terms() {
        assert_eq!(fts_expression("   \t"), None);
        assert_eq!(
            fts_expression("harbor OR \"docks"),
            Some("\"harbor\" \"OR\" \"\"\"docks\"".to_string())
        );
    }

    #[test(tokio::test)]
    async fn test_blank_query_lists_by_id() {
        let db = db_init_memory().await.unwrap();
        seed(
            &db,
            &[("zed", "character", ""), ("aria", "character", ""), ("mid", "lore", "")],
            &[],
        )
        .await;
        let results = db.search("  ", &SearchFilters::default(), None).await.unwrap();
        assert_eq!(results.plan, SearchPlan::Listing);
        let ids: Vec<&str> = results.hits.iter().map(|h| h.node.id.as_str()).collect();
        assert_eq!(ids, vec!["aria", "mid", "zed"]);
        assert!(results.hits.iter().all(|h| h.score.is_none()));

        let active = vec!["character".to_string()];
        let results = db
            .search("", &SearchFilters::default().with_limit(1).with_offset(1), Some(active.as_slice()))
            .await
            .unwrap();
        let ids: Vec<&str> = results.hits.iter().map(|h| h.node.id.as_str()).collect();
        assert_eq!(ids, vec!["zed"]);
    }

    #[test(tokio::test)]
    async fn test_ranked_search() {
        let db = db_init_memory().await.unwrap();
        seed(
            &db,
            &[
                ("aria", "character", "A sailor of the [[Old Harbor]]. Harbor, harbor, harbor."),
                ("bren", "character", "Once visited a harbor."),
                ("harbor-lore", "lore", "Stories of the harbor."),
            ],
            &[],
        )
        .await;
        let results = db
            .search("harbor", &SearchFilters::default().with_types(["character"]), None)
            .await
            .unwrap();
        assert!(matches!(results.plan, SearchPlan::Ranked { .. }));
        let ids: Vec<&str> = results.hits.iter().map(|h| h.node.id.as_str()).collect();
        assert_eq!(ids, vec!["aria", "bren"]);
        assert!(results.hits[0].snippet.as_deref().unwrap_or("").contains("[Harbor]")
            || results.hits[0].snippet.as_deref().unwrap_or("").contains("[harbor]"));

        // Unbalanced quotes are data, not syntax.
        let odd = db.search("\"harbor", &SearchFilters::default(), None).await;
        assert!(odd.is_ok());

        let statuses = db
            .search("harbor", &SearchFilters::default().with_status(NodeStatus::Canon), None)
            .await
            .unwrap();
        assert!(statuses.hits.is_empty());
    }

    #[test(tokio::test)]
    async fn test_neighbors_cycle_terminates() {
        let db = db_init_memory().await.unwrap();
        seed(
            &db,
            &[("a", "character", ""), ("b", "location", ""), ("c", "faction", "")],
            &[
                ("a", "located_in", "b"),
                ("b", "has_inhabitant", "a"),
                ("b", "related", "c"),
            ],
        )
        .await;
        let hood = db.neighbors("a", None, 2, None).await.unwrap();
        let reached: Vec<(&str, usize)> = hood
            .nodes
            .iter()
            .map(|n| (n.node.id.as_str(), n.depth))
            .collect();
        assert_eq!(reached, vec![("b", 1), ("c", 2)]);
        assert_eq!(hood.edges.len(), 3);

        let only = db.neighbors("a", Some("located_in"), 5, None).await.unwrap();
        assert_eq!(only.nodes.len(), 1);

        let deep = db.neighbors("a", None, 1_000, None).await.unwrap();
        assert_eq!(deep.nodes.len(), 2);

        assert!(matches!(
            db.neighbors("ghost", None, 1, None).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[test(tokio::test)]
    async fn test_wide_frontier_is_chunked() {
        let db = db_init_memory().await.unwrap();
        seed(&db, &[("hub", "location", ""), ("sink", "location", "")], &[]).await;
        let leaves = SQLITE_LIMIT_VARIABLE_NUMBER + 200;
        for sql in [
            "WITH RECURSIVE seq(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM seq WHERE i < ?) \
             INSERT INTO nodes (id, entity_type, status, path, title, template_id, content_hash, \
                                updated_at) \
             SELECT 'leaf' || i, 'character', 'draft', 'character/leaf' || i || '.md', \
                    'leaf' || i, 'worldbuilding', '', 0 FROM seq",
            "WITH RECURSIVE seq(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM seq WHERE i < ?) \
             INSERT INTO edges (source_id, relationship_id, target_id) \
             SELECT 'hub', 'has_inhabitant', 'leaf' || i FROM seq",
            "WITH RECURSIVE seq(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM seq WHERE i < ?) \
             INSERT INTO edges (source_id, relationship_id, target_id) \
             SELECT 'leaf' || i, 'located_in', 'sink' FROM seq",
        ] {
            sqlx::query(sql)
                .bind(leaves as i64)
                .execute(&db.0)
                .await
                .unwrap();
        }

        let active = vec!["character".to_string(), "location".to_string()];
        let hood = db
            .neighbors("hub", None, 2, Some(active.as_slice()))
            .await
            .unwrap();
        assert_eq!(hood.nodes.len(), leaves + 1);
        assert_eq!(hood.edges.len(), leaves * 2);
        let sink = hood.nodes.iter().find(|n| n.node.id == "sink").unwrap();
        assert_eq!(sink.depth, 2);
    }
}
