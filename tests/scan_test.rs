//! Integration tests for scanning: typing, validation, conflicts, edge derivation and
//! incremental maintenance, observed through the public `Vault` API.

mod common;

use common::*;
use std::sync::mpsc::channel;
use tempfile::TempDir;
use vaultgraph_core::{
    commands::Op,
    db::UpsertOutcome,
    event::VaultEvent,
    folders::FolderMappingConfig,
    indexer::{DocumentFailure, ReferenceIssue, ScanMode},
    query::SearchFilters,
    template::{
        builtin, EntityTypeConfig, FieldConfig, FieldKind, RelationshipTypeConfig,
        TemplateDefinition,
    },
    VaultError,
};

const ARIA: &str = "---
name: Aria Stormborn
age: 31
---
Aria keeps watch over [[Harbor Town]] from the lighthouse.
";

const HARBOR: &str = "---
name: Harbor Town
kind: city
---
A fishing town on the northern coast.
";

#[tokio::test]
async fn test_character_located_in_location() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(temp_dir.path(), "characters/aria.md", ARIA);
    write_doc(temp_dir.path(), "places/Harbor Town.md", HARBOR);
    let vault = worldbuilding_vault(&temp_dir).await;

    let report = vault.scan().await.unwrap();
    assert_eq!(report.mode, ScanMode::Full);
    assert_eq!(report.indexed.len(), 2, "{report:?}");
    assert!(report.unresolved_references.is_empty());

    assert_eq!(
        edge_strings(&vault).await,
        vec![
            "aria -[located_in]-> harbor-town",
            "harbor-town -[has_inhabitant]-> aria",
        ]
    );
    let (nodes, edges, pending) = vault.db().counts().await.unwrap();
    assert_eq!((nodes, edges, pending), (2, 2, 0));
}

#[tokio::test]
async fn test_three_document_scan() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(temp_dir.path(), "characters/aria.md", ARIA);
    write_doc(
        temp_dir.path(),
        "characters/broken.md",
        "---\nage: unknown\n---\nNo name here.\n",
    );
    write_doc(
        temp_dir.path(),
        "characters/copy.md",
        "---\nid: aria\nname: Impostor\n---\n",
    );
    let vault = worldbuilding_vault(&temp_dir).await;

    let report = vault.scan().await.unwrap();
    assert_eq!(report.indexed.len(), 1);
    assert_eq!(report.invalid.len(), 1);
    assert_eq!(report.conflicting.len(), 1);
    assert!(report.unindexed_no_type.is_empty());

    let invalid = &report.invalid[0];
    assert_eq!(invalid.path, "characters/broken.md");
    let DocumentFailure::Validation(errors) = &invalid.failure else {
        panic!("expected a validation failure, got {:?}", invalid.failure);
    };
    let fields: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(fields, vec!["name", "age"]);

    let conflict = &report.conflicting[0];
    assert_eq!(conflict.path, "characters/copy.md");
    assert_eq!(conflict.id, "aria");
    assert_eq!(conflict.existing_path, "characters/aria.md");

    let results = vault
        .search("lighthouse", &SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(results.hits.len(), 1);
    assert_eq!(results.hits[0].node.id, "aria");
    assert_eq!(results.hits[0].node.title, "Aria Stormborn");
}

#[tokio::test]
async fn test_malformed_frontmatter_next_to_valid_documents() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(temp_dir.path(), "characters/aria.md", ARIA);
    write_doc(
        temp_dir.path(),
        "characters/unclosed.md",
        "---\nname: Unclosed\nThe fence never closes.\n",
    );
    write_doc(
        temp_dir.path(),
        "characters/garbled.md",
        "---\nname: [Garbled\n---\nSee [[Harbor Town]].\n",
    );
    write_doc(temp_dir.path(), "places/Harbor Town.md", HARBOR);
    let vault = worldbuilding_vault(&temp_dir).await;

    let report = vault.scan().await.unwrap();
    let indexed: Vec<&str> = report.indexed.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(indexed, vec!["aria", "harbor-town"]);
    let invalid: Vec<&str> = report.invalid.iter().map(|i| i.path.as_str()).collect();
    assert_eq!(invalid, vec!["characters/garbled.md", "characters/unclosed.md"]);
    assert!(report
        .invalid
        .iter()
        .all(|i| matches!(i.failure, DocumentFailure::Parse(_))));
    assert!(matches!(
        &report.invalid[1].failure,
        DocumentFailure::Parse(msg) if msg.contains("not closed")
    ));
    assert!(report
        .errors()
        .iter()
        .all(|e| matches!(e, VaultError::Serialization(_))));

    assert!(vault.get_node("garbled").await.unwrap().is_none());
    assert!(vault.get_node("unclosed").await.unwrap().is_none());
    assert_eq!(
        edge_strings(&vault).await,
        vec![
            "aria -[located_in]-> harbor-town",
            "harbor-town -[has_inhabitant]-> aria",
        ]
    );
}

#[tokio::test]
async fn test_idle_cancel_does_not_reach_later_scans() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(temp_dir.path(), "characters/aria.md", ARIA);
    let vault = worldbuilding_vault(&temp_dir).await;

    vault.cancel_scan();
    let report = vault.scan().await.unwrap();
    assert!(!report.cancelled);
    assert_eq!(report.indexed.len(), 1);

    vault.dispatch(Op::CancelScan).await.unwrap();
    let report = vault
        .scan_incremental(vec!["characters/aria.md".into()])
        .await
        .unwrap();
    assert!(!report.cancelled);
    assert_eq!(report.indexed.len(), 1);
}

#[tokio::test]
async fn test_reregistered_template_rederives_edges_on_rescan() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(temp_dir.path(), "characters/aria.md", ARIA);
    write_doc(temp_dir.path(), "places/Harbor Town.md", HARBOR);
    let vault = worldbuilding_vault(&temp_dir).await;
    vault.scan().await.unwrap();
    assert_eq!(
        edge_strings(&vault).await,
        vec![
            "aria -[located_in]-> harbor-town",
            "harbor-town -[has_inhabitant]-> aria",
        ]
    );

    let mut template = builtin::worldbuilding();
    template
        .relationship_defaults
        .retain(|d| !(d.source_type == "character" && d.target_type == "location"));
    vault.register_template(template).unwrap();

    let report = vault.scan().await.unwrap();
    assert!(report.changed_ids().is_empty(), "{report:?}");
    assert_eq!(
        edge_strings(&vault).await,
        vec![
            "aria -[related]-> harbor-town",
            "harbor-town -[related]-> aria",
        ]
    );
    let consistency = vault.validate_consistency().await.unwrap();
    assert!(consistency.is_consistent(), "{:?}", consistency.issues);

    let report = vault.scan().await.unwrap();
    assert!(report.changed_ids().is_empty());
    assert_eq!(edge_strings(&vault).await.len(), 2);
}

#[tokio::test]
async fn test_non_latin_file_stems_become_ids() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(
        temp_dir.path(),
        "characters/Москва.md",
        "---\nname: Москва\n---\nWinters in [[北京]].\n",
    );
    write_doc(temp_dir.path(), "places/北京.md", "---\nname: 北京\n---\n");
    let vault = worldbuilding_vault(&temp_dir).await;

    let report = vault.scan().await.unwrap();
    assert!(report.invalid.is_empty(), "{:?}", report.invalid);
    let indexed: Vec<&str> = report.indexed.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(indexed, vec!["москва", "北京"]);
    assert_eq!(
        edge_strings(&vault).await,
        vec!["москва -[located_in]-> 北京", "北京 -[has_inhabitant]-> москва"]
    );
}

#[tokio::test]
async fn test_rescan_is_idempotent() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(temp_dir.path(), "characters/aria.md", ARIA);
    write_doc(temp_dir.path(), "places/Harbor Town.md", HARBOR);
    let vault = worldbuilding_vault(&temp_dir).await;

    vault.scan().await.unwrap();
    let before = vault.get_node("aria").await.unwrap().unwrap();
    let edges_before = edge_strings(&vault).await;

    let report = vault.scan().await.unwrap();
    assert!(report
        .indexed
        .iter()
        .all(|d| d.outcome == UpsertOutcome::Unchanged));
    assert!(report.changed_ids().is_empty());

    let after = vault.get_node("aria").await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(edges_before, edge_strings(&vault).await);
    assert_eq!(vault.db().fts_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_mirror_removed_only_when_unsustained() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(temp_dir.path(), "characters/aria.md", ARIA);
    write_doc(
        temp_dir.path(),
        "places/Harbor Town.md",
        "---\nname: Harbor Town\n---\nHome of [[aria]].\n",
    );
    let vault = worldbuilding_vault(&temp_dir).await;
    vault.scan().await.unwrap();
    assert_eq!(edge_strings(&vault).await.len(), 2);

    // Aria drops her link; Harbor Town's reference still sustains both edges.
    write_doc(
        temp_dir.path(),
        "characters/aria.md",
        "---\nname: Aria Stormborn\n---\nGone to sea.\n",
    );
    let report = vault.scan().await.unwrap();
    assert_eq!(report.changed_ids(), vec!["aria"]);
    assert_eq!(
        edge_strings(&vault).await,
        vec![
            "aria -[located_in]-> harbor-town",
            "harbor-town -[has_inhabitant]-> aria",
        ]
    );

    write_doc(
        temp_dir.path(),
        "places/Harbor Town.md",
        "---\nname: Harbor Town\n---\nEmpty now.\n",
    );
    vault.scan().await.unwrap();
    assert!(edge_strings(&vault).await.is_empty());
    assert!(vault.validate_consistency().await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_typed_relations_and_fallback() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(
        temp_dir.path(),
        "characters/aria.md",
        "---\nname: Aria\nrelations:\n  member_of: [Storm Wardens]\n  befriends: [bram]\n---\n",
    );
    write_doc(
        temp_dir.path(),
        "factions/Storm Wardens.md",
        "---\nname: Storm Wardens\n---\n",
    );
    write_doc(temp_dir.path(), "characters/bram.md", "---\nname: Bram\n---\n");
    let vault = worldbuilding_vault(&temp_dir).await;
    vault.scan().await.unwrap();

    assert_eq!(
        edge_strings(&vault).await,
        vec![
            "aria -[member_of]-> storm-wardens",
            "aria -[related]-> bram",
            "bram -[related]-> aria",
            "storm-wardens -[has_member]-> aria",
        ]
    );
}

#[tokio::test]
async fn test_pending_reference_resolves_later() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(temp_dir.path(), "characters/aria.md", ARIA);
    let vault = worldbuilding_vault(&temp_dir).await;

    let report = vault.scan().await.unwrap();
    assert_eq!(report.unresolved_references.len(), 1);
    assert_eq!(report.unresolved_references[0].target, "harbor-town");
    assert_eq!(
        report.unresolved_references[0].issue,
        ReferenceIssue::Pending
    );
    assert!(edge_strings(&vault).await.is_empty());

    write_doc(temp_dir.path(), "places/Harbor Town.md", HARBOR);
    let report = vault
        .scan_incremental(vec![temp_dir.path().join("places/Harbor Town.md")])
        .await
        .unwrap();
    assert_eq!(report.mode, ScanMode::Incremental);
    assert_eq!(report.indexed.len(), 1);
    assert_eq!(edge_strings(&vault).await.len(), 2);
}

#[tokio::test]
async fn test_incremental_removal() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(temp_dir.path(), "characters/aria.md", ARIA);
    write_doc(temp_dir.path(), "places/Harbor Town.md", HARBOR);
    write_doc(temp_dir.path(), "places/east/Cliffs.md", "---\nname: Cliffs\n---\n");
    let vault = worldbuilding_vault(&temp_dir).await;
    vault.scan().await.unwrap();

    std::fs::remove_file(temp_dir.path().join("places/Harbor Town.md")).unwrap();
    let report = vault
        .scan_incremental(vec!["places/Harbor Town.md".into()])
        .await
        .unwrap();
    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.removed[0].id, "harbor-town");
    assert!(edge_strings(&vault).await.is_empty());
    // Aria's reference stays behind, pending again
    let (_, _, pending) = vault.db().counts().await.unwrap();
    assert_eq!(pending, 1);

    std::fs::remove_dir_all(temp_dir.path().join("places/east")).unwrap();
    let report = vault
        .scan_incremental(vec![temp_dir.path().join("places/east")])
        .await
        .unwrap();
    assert_eq!(report.removed.len(), 1);
    assert!(vault.get_node("cliffs").await.unwrap().is_none());
    assert!(vault.get_node("aria").await.unwrap().is_some());
}

#[tokio::test]
async fn test_full_scan_prunes_vanished_files() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(temp_dir.path(), "characters/aria.md", ARIA);
    write_doc(temp_dir.path(), "places/Harbor Town.md", HARBOR);
    let vault = worldbuilding_vault(&temp_dir).await;
    vault.scan().await.unwrap();

    std::fs::remove_file(temp_dir.path().join("characters/aria.md")).unwrap();
    let report = vault.scan().await.unwrap();
    assert_eq!(report.removed.len(), 1);
    assert_eq!(vault.db().counts().await.unwrap(), (1, 0, 0));
}

#[tokio::test]
async fn test_hidden_and_unsupported_files_are_skipped() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(temp_dir.path(), "characters/aria.md", ARIA);
    write_doc(temp_dir.path(), "characters/.draft.md", "---\nname: Draft\n---\n");
    write_doc(temp_dir.path(), ".obsidian/characters/x.md", "---\nname: X\n---\n");
    write_doc(temp_dir.path(), "characters/portrait.png", "not an image");
    let vault = worldbuilding_vault(&temp_dir).await;
    let report = vault.scan().await.unwrap();
    assert_eq!(report.indexed.len(), 1);
    assert!(report.invalid.is_empty());
    assert!(report.unindexed_no_type.is_empty());
}

#[tokio::test]
async fn test_events_are_streamed() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(temp_dir.path(), "characters/aria.md", ARIA);
    write_doc(temp_dir.path(), "places/Harbor Town.md", HARBOR);
    let (tx, rx) = channel::<VaultEvent>();
    let vault = open_vault(
        &temp_dir,
        worldbuilding_registry(),
        &worldbuilding_folders(),
        Some(tx),
    )
    .await;
    vault.scan().await.unwrap();

    let events: Vec<VaultEvent> = rx.try_iter().collect();
    assert!(matches!(
        events.first(),
        Some(VaultEvent::ScanStarted {
            mode: ScanMode::Full,
            ..
        })
    ));
    let Some(VaultEvent::ScanFinished(summary)) = events.last() else {
        panic!("scan should end with ScanFinished: {events:?}");
    };
    assert_eq!(summary.indexed, 2);
    let upserted: Vec<&str> = events.iter().filter_map(|e| e.node_id()).collect();
    assert_eq!(upserted, vec!["aria", "harbor-town"]);
    assert!(events
        .iter()
        .any(|e| matches!(e, VaultEvent::EdgesChanged(delta) if delta.added.len() == 2)));
}

fn archive_template() -> TemplateDefinition {
    TemplateDefinition {
        id: "archive".to_string(),
        name: "Archive".to_string(),
        version: "0.1.0".to_string(),
        entity_types: vec![EntityTypeConfig::new("location", "Location", "Locations")
            .with_field(FieldConfig::new("name", FieldKind::String).required())],
        relationship_types: vec![RelationshipTypeConfig::bidirectional("related", "related")],
        relationship_defaults: vec![],
    }
}

#[tokio::test]
async fn test_template_switch_hides_undeclared_types() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_doc(
        temp_dir.path(),
        "notes/aria.md",
        "---\ntype: character\nname: Aria\n---\nSee [[harbor]].\n",
    );
    write_doc(
        temp_dir.path(),
        "notes/harbor.md",
        "---\ntype: location\nname: Harbor\n---\n",
    );
    let vault = open_vault(
        &temp_dir,
        worldbuilding_registry(),
        &FolderMappingConfig::default(),
        None,
    )
    .await;
    let first = vault.scan().await.unwrap();
    assert_eq!(first.indexed.len(), 2);

    vault.register_template(archive_template()).unwrap();
    let snapshot = vault.activate_template("archive").unwrap();
    assert!(snapshot.generation > first.template_generation);

    let listing = vault.search("", &SearchFilters::default()).await.unwrap();
    let ids: Vec<&str> = listing.hits.iter().map(|h| h.node.id.as_str()).collect();
    assert_eq!(ids, vec!["harbor"]);
    assert!(matches!(
        vault.neighbors("aria", None, 1).await,
        Err(VaultError::NotFound(_))
    ));

    // The character no longer types under the new template and is left unindexed
    let second = vault.scan().await.unwrap();
    assert_eq!(second.template_id, "archive");
    assert_eq!(second.unindexed_no_type.len(), 1);
    assert_eq!(second.unindexed_no_type[0].path, "notes/aria.md");
}

#[tokio::test]
async fn test_activation_rejects_incompatible_folder_mapping() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let vault = worldbuilding_vault(&temp_dir).await;
    vault.register_template(archive_template()).unwrap();
    assert!(matches!(
        vault.activate_template("archive"),
        Err(VaultError::Configuration(_))
    ));
    assert_eq!(vault.registry().get_active().unwrap().id, "worldbuilding");
}
