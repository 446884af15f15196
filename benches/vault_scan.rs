//! Performance benchmarks for indexing and querying a vault
//!
//! The corpus is generated: characters spread over locations and factions, each linking to a
//! few others so edge derivation has real work to do.
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use std::path::Path;
use tempfile::TempDir;
use vaultgraph_core::{
    codec::ParserMap,
    config::IndexOptions,
    db::db_init_memory,
    folders::{FolderMapping, FolderMappingConfig},
    query::SearchFilters,
    template::{builtin, TemplateRegistry, TemplateSource},
    vault::Vault,
};

const CHARACTERS: usize = 200;
const LOCATIONS: usize = 20;
const FACTIONS: usize = 10;

fn write(root: &Path, rel: &str, content: String) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn generate_corpus(root: &Path) {
    for l in 0..LOCATIONS {
        write(
            root,
            &format!("places/location-{l}.md"),
            format!("---\nname: Location {l}\nkind: town\n---\nA town by the river.\n"),
        );
    }
    for f in 0..FACTIONS {
        write(
            root,
            &format!("factions/faction-{f}.md"),
            format!("---\nname: Faction {f}\n---\nSworn to the storm.\n"),
        );
    }
    for c in 0..CHARACTERS {
        write(
            root,
            &format!("characters/character-{c}.md"),
            format!(
                "---\nname: Character {c}\nage: {}\nrelations:\n  member_of: [faction-{}]\n---\n\
                 Born in [[location-{}]], friend of [[character-{}]].\n",
                20 + c % 50,
                c % FACTIONS,
                c % LOCATIONS,
                (c + 1) % CHARACTERS
            ),
        );
    }
}

async fn open(root: &Path) -> Vault {
    let registry = TemplateRegistry::default();
    registry
        .register(builtin::worldbuilding(), TemplateSource::Builtin)
        .unwrap();
    registry.activate(builtin::WORLDBUILDING_ID).unwrap();
    let folders = FolderMappingConfig {
        mappings: vec![
            FolderMapping::new("characters/**", ["character"]),
            FolderMapping::new("places/**", ["location"]),
            FolderMapping::new("factions/**", ["faction"]),
        ],
        fallback_type: None,
    };
    Vault::open(
        root,
        db_init_memory().await.unwrap(),
        registry,
        &folders,
        ParserMap::create(),
        IndexOptions::default(),
        None,
    )
    .unwrap()
}

fn bench_full_scan(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let temp_dir = TempDir::new().unwrap();
    generate_corpus(temp_dir.path());

    c.bench_function("full_scan_fresh_db", |b| {
        b.to_async(&rt).iter(|| async {
            let vault = open(temp_dir.path()).await;
            let report = vault.scan().await.unwrap();
            assert_eq!(report.indexed.len(), CHARACTERS + LOCATIONS + FACTIONS);
        });
    });
}

fn bench_unchanged_rescan(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let temp_dir = TempDir::new().unwrap();
    generate_corpus(temp_dir.path());
    let vault = rt.block_on(async {
        let vault = open(temp_dir.path()).await;
        vault.scan().await.unwrap();
        vault
    });

    c.bench_function("full_scan_unchanged", |b| {
        b.to_async(&rt).iter(|| async {
            let report = vault.scan().await.unwrap();
            assert!(report.changed_ids().is_empty());
        });
    });
}

fn bench_queries(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let temp_dir = TempDir::new().unwrap();
    generate_corpus(temp_dir.path());
    let vault = rt.block_on(async {
        let vault = open(temp_dir.path()).await;
        vault.scan().await.unwrap();
        vault
    });
    let filters = SearchFilters::default().with_limit(20);

    c.bench_function("ranked_search", |b| {
        b.to_async(&rt).iter(|| async {
            vault.search("river", &filters).await.unwrap();
        });
    });

    c.bench_function("neighbors_depth_3", |b| {
        b.to_async(&rt).iter(|| async {
            vault.neighbors("character-0", None, 3).await.unwrap();
        });
    });
}

criterion_group!(benches, bench_full_scan, bench_unchanged_rescan, bench_queries);
criterion_main!(benches);
