//! SQLite persistence for nodes, references, edges, and the full-text index.
//!
//! Writes go through the free functions of this module with a `&mut SqliteConnection`, which is
//! how the indexer runs one transaction per document. Reads that do not need a transaction use
//! the pooled [`DbConnection`] helpers. `nodes_fts` is maintained exclusively by triggers on
//! `nodes`, so a node is never visible in one and missing from the other.

use chrono::Utc;
use futures_core::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::{
    error::BoxDynError,
    migrate::{Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    pool::PoolOptions,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous},
    ConnectOptions, Pool, QueryBuilder, Row, SqliteConnection,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    str::FromStr,
    time::Duration,
};

use crate::{
    error::VaultError,
    graph::EdgeDelta,
    properties::{Edge, Node, Reference},
};

/// Default database file, relative to the vault root.
pub const VAULT_DB: &str = ".vaultgraph.db";

/// `vault_meta` key holding the edge fingerprint of the template the stored edges were derived
/// under.
pub const EDGE_RULES_KEY: &str = "edge_rules";

/// <https://www.sqlite.org/limits.html#max_variable_number>
pub const SQLITE_LIMIT_VARIABLE_NUMBER: usize = 32766;

static WIKI_MARKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[([^\[\]|#]*)(?:#[^\[\]|]*)?(?:\|([^\[\]]*))?\]\]")
        .unwrap_or_else(|e| panic!("invalid wiki markup regex: {e}"))
});

/// Text fed to the full-text index: links reduced to their display text, whitespace collapsed.
pub fn flatten_text(body: &str) -> String {
    let without_links = WIKI_MARKUP.replace_all(body, |caps: &regex::Captures| {
        caps.get(2)
            .filter(|label| !label.as_str().trim().is_empty())
            .or_else(|| caps.get(1))
            .map_or(String::new(), |m| m.as_str().trim().to_string())
    });
    without_links.split_whitespace().collect::<Vec<&str>>().join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Same content hash as the stored row; nothing was written
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct DbConnection(pub Pool<Sqlite>);

impl DbConnection {
    pub async fn get_node(&self, id: &str) -> Result<Option<Node>, VaultError> {
        let mut conn = self.0.acquire().await?;
        node_by_id(&mut conn, id).await
    }

    /// (node count, edge count, pending reference count)
    pub async fn counts(&self) -> Result<(u64, u64, u64), VaultError> {
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM nodes), (SELECT COUNT(*) FROM edges), \
             (SELECT COUNT(*) FROM node_refs r WHERE NOT EXISTS \
                (SELECT 1 FROM nodes n WHERE n.id = r.target_id))",
        )
        .fetch_one(&self.0)
        .await?;
        Ok((
            row.try_get::<i64, usize>(0)? as u64,
            row.try_get::<i64, usize>(1)? as u64,
            row.try_get::<i64, usize>(2)? as u64,
        ))
    }

    /// Row count of the full-text index; equals the node count while triggers are intact.
    pub async fn fts_count(&self) -> Result<u64, VaultError> {
        let row = sqlx::query("SELECT COUNT(*) FROM nodes_fts")
            .fetch_one(&self.0)
            .await?;
        Ok(row.try_get::<i64, usize>(0)? as u64)
    }

    pub async fn close(&self) {
        self.0.close().await;
    }
}

#[tracing::instrument(skip(conn))]
pub async fn node_by_id(conn: &mut SqliteConnection, id: &str) -> Result<Option<Node>, VaultError> {
    Ok(sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
}

#[tracing::instrument(skip(conn))]
pub async fn node_by_path(
    conn: &mut SqliteConnection,
    path: &str,
) -> Result<Option<Node>, VaultError> {
    Ok(sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE path = ?")
        .bind(path)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Entity types of whichever of `ids` are indexed.
pub async fn node_types(
    conn: &mut SqliteConnection,
    ids: &BTreeSet<String>,
) -> Result<BTreeMap<String, String>, VaultError> {
    let mut types = BTreeMap::new();
    let ids = ids.iter().collect::<Vec<&String>>();
    for chunk in ids.chunks(SQLITE_LIMIT_VARIABLE_NUMBER) {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, entity_type FROM nodes WHERE id IN (");
        let mut separated = qb.separated(", ");
        for id in chunk {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");
        let rows = qb
            .build_query_as::<(String, String)>()
            .fetch_all(&mut *conn)
            .await?;
        types.extend(rows);
    }
    Ok(types)
}

/// Writes `node` unless the stored row carries the same content hash. `updated_at` only moves
/// when content does.
#[tracing::instrument(skip(conn, node), fields(id = %node.id))]
pub async fn upsert_node(
    conn: &mut SqliteConnection,
    node: &Node,
) -> Result<UpsertOutcome, VaultError> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT content_hash FROM nodes WHERE id = ?")
            .bind(&node.id)
            .fetch_optional(&mut *conn)
            .await?;
    let outcome = match existing {
        None => UpsertOutcome::Inserted,
        Some(hash) if hash == node.content_hash => return Ok(UpsertOutcome::Unchanged),
        Some(_) => UpsertOutcome::Updated,
    };

    let fields = serde_json::to_string(&node.fields)?;
    sqlx::query(
        "INSERT INTO nodes (id, entity_type, status, path, title, body, search_text, fields, \
                            template_id, content_hash, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
            entity_type = excluded.entity_type, \
            status = excluded.status, \
            path = excluded.path, \
            title = excluded.title, \
            body = excluded.body, \
            search_text = excluded.search_text, \
            fields = excluded.fields, \
            template_id = excluded.template_id, \
            content_hash = excluded.content_hash, \
            updated_at = excluded.updated_at \
         WHERE nodes.content_hash != excluded.content_hash",
    )
    .bind(&node.id)
    .bind(&node.entity_type)
    .bind(node.status.as_str())
    .bind(&node.path)
    .bind(&node.title)
    .bind(&node.body)
    .bind(flatten_text(&node.body))
    .bind(fields)
    .bind(&node.template_id)
    .bind(&node.content_hash)
    .bind(node.updated_at.timestamp_micros())
    .execute(&mut *conn)
    .await?;
    Ok(outcome)
}

/// Deletes the node, the references it holds, and every edge touching it. References other nodes
/// hold to it stay behind as pending. Returns the removed edges.
#[tracing::instrument(skip(conn))]
pub async fn delete_node(conn: &mut SqliteConnection, id: &str) -> Result<Vec<Edge>, VaultError> {
    let edges = sqlx::query_as::<_, Edge>(
        "SELECT source_id, relationship_id, target_id FROM edges \
         WHERE source_id = ?1 OR target_id = ?1 ORDER BY source_id, relationship_id, target_id",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM edges WHERE source_id = ?1 OR target_id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM node_refs WHERE source_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM nodes WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(edges)
}

/// Every indexed (path, id).
pub async fn node_paths(conn: &mut SqliteConnection) -> Result<BTreeMap<String, String>, VaultError> {
    let rows = sqlx::query_as::<_, (String, String)>("SELECT path, id FROM nodes")
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().collect())
}

/// (path, id) of nodes at `dir` or anywhere below it.
pub async fn node_paths_under(
    conn: &mut SqliteConnection,
    dir: &str,
) -> Result<BTreeMap<String, String>, VaultError> {
    let dir = dir.trim_end_matches('/');
    let escaped = dir
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    let rows = sqlx::query_as::<_, (String, String)>(
        "SELECT path, id FROM nodes WHERE path = ? OR path LIKE ? ESCAPE '\\'",
    )
    .bind(dir)
    .bind(format!("{escaped}/%"))
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().collect())
}

pub async fn refs_for_source(
    conn: &mut SqliteConnection,
    source_id: &str,
) -> Result<BTreeSet<Reference>, VaultError> {
    Ok(sqlx::query_as::<_, Reference>(
        "SELECT source_id, target_id, relationship_id FROM node_refs WHERE source_id = ?",
    )
    .bind(source_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .collect())
}

pub async fn replace_refs(
    conn: &mut SqliteConnection,
    source_id: &str,
    refs: &BTreeSet<Reference>,
) -> Result<(), VaultError> {
    sqlx::query("DELETE FROM node_refs WHERE source_id = ?")
        .bind(source_id)
        .execute(&mut *conn)
        .await?;
    let refs = refs.iter().collect::<Vec<&Reference>>();
    for chunk in refs.chunks(SQLITE_LIMIT_VARIABLE_NUMBER / 3) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT OR IGNORE INTO node_refs (source_id, target_id, relationship_id) ",
        );
        qb.push_values(chunk.iter(), |mut b, r| {
            b.push_bind(r.source_id.as_str())
                .push_bind(r.target_id.as_str())
                .push_bind(r.relationship_column());
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Ids of nodes holding a reference to `target_id`.
pub async fn sources_referencing(
    conn: &mut SqliteConnection,
    target_id: &str,
) -> Result<BTreeSet<String>, VaultError> {
    let rows: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT source_id FROM node_refs WHERE target_id = ?")
            .bind(target_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().collect())
}

/// References in both directions between `a` and `b`.
pub async fn refs_between(
    conn: &mut SqliteConnection,
    a: &str,
    b: &str,
) -> Result<Vec<Reference>, VaultError> {
    Ok(sqlx::query_as::<_, Reference>(
        "SELECT source_id, target_id, relationship_id FROM node_refs \
         WHERE (source_id = ?1 AND target_id = ?2) OR (source_id = ?2 AND target_id = ?1)",
    )
    .bind(a)
    .bind(b)
    .fetch_all(&mut *conn)
    .await?)
}

/// Edges in both directions between `a` and `b`.
pub async fn edges_between(
    conn: &mut SqliteConnection,
    a: &str,
    b: &str,
) -> Result<BTreeSet<Edge>, VaultError> {
    Ok(sqlx::query_as::<_, Edge>(
        "SELECT source_id, relationship_id, target_id FROM edges \
         WHERE (source_id = ?1 AND target_id = ?2) OR (source_id = ?2 AND target_id = ?1)",
    )
    .bind(a)
    .bind(b)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .collect())
}

pub async fn apply_edge_delta(
    conn: &mut SqliteConnection,
    delta: &EdgeDelta,
) -> Result<(), VaultError> {
    for edge in delta.removed.iter() {
        sqlx::query(
            "DELETE FROM edges WHERE source_id = ? AND relationship_id = ? AND target_id = ?",
        )
        .bind(&edge.source_id)
        .bind(&edge.relationship_id)
        .bind(&edge.target_id)
        .execute(&mut *conn)
        .await?;
    }
    insert_edges(conn, &delta.added).await
}

async fn insert_edges(conn: &mut SqliteConnection, edges: &[Edge]) -> Result<(), VaultError> {
    for chunk in edges.chunks(SQLITE_LIMIT_VARIABLE_NUMBER / 3) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT OR IGNORE INTO edges (source_id, relationship_id, target_id) ",
        );
        qb.push_values(chunk.iter(), |mut b, edge| {
            b.push_bind(edge.source_id.as_str())
                .push_bind(edge.relationship_id.as_str())
                .push_bind(edge.target_id.as_str());
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// (id, entity type) of every node.
pub async fn all_node_types(
    conn: &mut SqliteConnection,
) -> Result<BTreeMap<String, String>, VaultError> {
    let rows = sqlx::query_as::<_, (String, String)>("SELECT id, entity_type FROM nodes")
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().collect())
}

pub async fn all_nodes(conn: &mut SqliteConnection) -> Result<Vec<Node>, VaultError> {
    Ok(sqlx::query_as::<_, Node>("SELECT * FROM nodes ORDER BY id")
        .fetch_all(&mut *conn)
        .await?)
}

pub async fn all_edges(conn: &mut SqliteConnection) -> Result<BTreeSet<Edge>, VaultError> {
    Ok(sqlx::query_as::<_, Edge>(
        "SELECT source_id, relationship_id, target_id FROM edges",
    )
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .collect())
}

pub async fn all_refs(conn: &mut SqliteConnection) -> Result<Vec<Reference>, VaultError> {
    Ok(sqlx::query_as::<_, Reference>(
        "SELECT source_id, target_id, relationship_id FROM node_refs \
         ORDER BY source_id, target_id, relationship_id",
    )
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn meta_value(
    conn: &mut SqliteConnection,
    key: &str,
) -> Result<Option<String>, VaultError> {
    Ok(sqlx::query_scalar("SELECT value FROM vault_meta WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn set_meta_value(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
) -> Result<(), VaultError> {
    sqlx::query(
        "INSERT INTO vault_meta (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Current time with the microsecond precision the `updated_at` column stores.
pub fn now_micros() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    chrono::DateTime::<Utc>::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![
        Migration {
            version: 1,
            description: "create_vault_tables",
            sql: "\
        CREATE TABLE nodes ( \
            id TEXT PRIMARY KEY NOT NULL, \
            entity_type TEXT NOT NULL, \
            status TEXT NOT NULL DEFAULT 'draft', \
            path TEXT NOT NULL UNIQUE, \
            title TEXT NOT NULL, \
            body TEXT NOT NULL DEFAULT '', \
            search_text TEXT NOT NULL DEFAULT '', \
            fields TEXT NOT NULL DEFAULT '{}', \
            template_id TEXT NOT NULL, \
            content_hash TEXT NOT NULL, \
            updated_at INTEGER NOT NULL); \
        CREATE INDEX nodes_entity_type ON nodes(entity_type); \
        CREATE TABLE edges ( \
            source_id TEXT NOT NULL, \
            relationship_id TEXT NOT NULL, \
            target_id TEXT NOT NULL, \
            PRIMARY KEY (source_id, relationship_id, target_id)); \
        CREATE INDEX edges_target ON edges(target_id); \
        CREATE TABLE node_refs ( \
            source_id TEXT NOT NULL, \
            target_id TEXT NOT NULL, \
            relationship_id TEXT NOT NULL DEFAULT '', \
            PRIMARY KEY (source_id, target_id, relationship_id)); \
        CREATE INDEX node_refs_target ON node_refs(target_id); \
        CREATE VIRTUAL TABLE nodes_fts USING fts5( \
            id UNINDEXED, entity_type, status, title, body); \
        CREATE TRIGGER nodes_ai AFTER INSERT ON nodes BEGIN \
            INSERT INTO nodes_fts (id, entity_type, status, title, body) \
            VALUES (new.id, new.entity_type, new.status, new.title, new.search_text); \
        END; \
        CREATE TRIGGER nodes_au AFTER UPDATE ON nodes BEGIN \
            DELETE FROM nodes_fts WHERE id = old.id; \
            INSERT INTO nodes_fts (id, entity_type, status, title, body) \
            VALUES (new.id, new.entity_type, new.status, new.title, new.search_text); \
        END; \
        CREATE TRIGGER nodes_ad AFTER DELETE ON nodes BEGIN \
            DELETE FROM nodes_fts WHERE id = old.id; \
        END;",
            kind: MigrationType::ReversibleUp,
        },
        Migration {
            version: 2,
            description: "index_ids_and_track_edge_rules",
            sql: "\
        CREATE TABLE vault_meta ( \
            key TEXT PRIMARY KEY NOT NULL, \
            value TEXT NOT NULL); \
        DROP TABLE nodes_fts; \
        CREATE VIRTUAL TABLE nodes_fts USING fts5( \
            id, entity_type, status, title, body); \
        INSERT INTO nodes_fts (id, entity_type, status, title, body) \
            SELECT id, entity_type, status, title, search_text FROM nodes;",
            kind: MigrationType::ReversibleUp,
        },
    ])
}

async fn run_migrations(pool: &Pool<Sqlite>) -> Result<(), VaultError> {
    let migrator = Migrator::new(migrations()).await?;
    migrator.run(pool).await?;

    let row = sqlx::query("SELECT (SELECT COUNT(*) FROM nodes), (SELECT COUNT(*) FROM edges)")
        .fetch_one(pool)
        .await?;
    tracing::info!(
        "DB Connection initialized.\n \
         \tIndexed node count:\t{:?} \n \
         \tStored edge count:\t{:?}",
        row.try_get::<i64, usize>(0)?,
        row.try_get::<i64, usize>(1)?
    );
    Ok(())
}

/// Opens (creating if needed) the vault database at `db_path` in WAL mode and applies migrations.
pub async fn db_init<P: AsRef<Path>>(db_path: P) -> Result<DbConnection, VaultError> {
    let db_path = db_path.as_ref();
    tracing::debug!("Initializing vault db from file: {:?}", db_path);
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .disable_statement_logging();
    let pool = PoolOptions::<Sqlite>::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(DbConnection(pool))
}

/// Private in-memory database. A single pooled connection keeps the database alive.
pub async fn db_init_memory() -> Result<DbConnection, VaultError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.disable_statement_logging();
    let pool = PoolOptions::<Sqlite>::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(DbConnection(pool))
}
