//! Templates shipped with the crate.
use serde_json::json;

use super::{
    EntityTypeConfig, FieldConfig, FieldKind, RelationshipDefault, RelationshipTypeConfig,
    TemplateDefinition,
};
use crate::properties::RELATED;

pub const WORLDBUILDING_ID: &str = "worldbuilding";

pub fn all() -> Vec<TemplateDefinition> {
    vec![worldbuilding()]
}

fn default_rel(source_type: &str, target_type: &str, relationship: &str) -> RelationshipDefault {
    RelationshipDefault {
        source_type: source_type.to_string(),
        target_type: target_type.to_string(),
        relationship: relationship.to_string(),
    }
}

/// Fiction worldbuilding: characters living in locations, belonging to factions and owning
/// items, plus events and free-form lore.
pub fn worldbuilding() -> TemplateDefinition {
    let name = || FieldConfig::new("name", FieldKind::String).required();
    let tags = || FieldConfig::new("tags", FieldKind::Array).with_item_kind(FieldKind::String);

    TemplateDefinition {
        id: WORLDBUILDING_ID.to_string(),
        name: "Worldbuilding".to_string(),
        version: "1.0.0".to_string(),
        entity_types: vec![
            EntityTypeConfig::new("character", "Character", "Characters")
                .with_field(name())
                .with_field(FieldConfig::new("age", FieldKind::Number))
                .with_field(FieldConfig::new("species", FieldKind::String))
                .with_field(FieldConfig::new("born", FieldKind::Date))
                .with_field(FieldConfig::new("alive", FieldKind::Boolean).with_default(json!(true)))
                .with_field(tags()),
            EntityTypeConfig::new("location", "Location", "Locations")
                .with_field(name())
                .with_field(
                    FieldConfig::new("kind", FieldKind::Enum)
                        .with_enum_values([
                            "world", "continent", "region", "city", "town", "building", "landmark",
                        ])
                        .with_default(json!("region")),
                )
                .with_field(FieldConfig::new("population", FieldKind::Number))
                .with_field(tags()),
            EntityTypeConfig::new("faction", "Faction", "Factions")
                .with_field(name())
                .with_field(FieldConfig::new("motto", FieldKind::String))
                .with_field(FieldConfig::new("founded", FieldKind::Date))
                .with_field(tags()),
            EntityTypeConfig::new("item", "Item", "Items")
                .with_field(name())
                .with_field(
                    FieldConfig::new("rarity", FieldKind::Enum)
                        .with_enum_values(["common", "uncommon", "rare", "legendary", "unique"])
                        .with_default(json!("common")),
                )
                .with_field(FieldConfig::new("properties", FieldKind::Record))
                .with_field(tags()),
            EntityTypeConfig::new("event", "Event", "Events")
                .with_field(name())
                .with_field(FieldConfig::new("date", FieldKind::Date))
                .with_field(FieldConfig::new("era", FieldKind::String))
                .with_field(tags()),
            EntityTypeConfig::new("lore", "Lore", "Lore")
                .with_field(name())
                .with_field(FieldConfig::new("category", FieldKind::String))
                .with_field(tags()),
        ],
        relationship_types: vec![
            RelationshipTypeConfig::bidirectional(RELATED, RELATED),
            RelationshipTypeConfig::bidirectional("located_in", "has_inhabitant"),
            RelationshipTypeConfig::bidirectional("has_inhabitant", "located_in"),
            RelationshipTypeConfig::bidirectional("member_of", "has_member"),
            RelationshipTypeConfig::bidirectional("has_member", "member_of"),
            RelationshipTypeConfig::bidirectional("owns", "owned_by"),
            RelationshipTypeConfig::bidirectional("owned_by", "owns"),
            RelationshipTypeConfig::directed("participated_in"),
        ],
        relationship_defaults: vec![
            default_rel("character", "location", "located_in"),
            default_rel("character", "faction", "member_of"),
            default_rel("character", "item", "owns"),
            default_rel("character", "event", "participated_in"),
            default_rel("location", "character", "has_inhabitant"),
            default_rel("faction", "character", "has_member"),
            default_rel("item", "character", "owned_by"),
        ],
    }
}
