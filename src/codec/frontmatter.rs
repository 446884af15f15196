use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use super::{CrossReference, DocumentParser, ParsedDocument};
use crate::error::VaultError;

/// Frontmatter key holding typed references: `relations: { owns: [sword], member_of: guild }`.
pub const RELATIONS_KEY: &str = "relations";

static WIKI_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[([^\[\]|#]*)(?:#[^\[\]|]*)?(?:\|([^\[\]]*))?\]\]")
        .unwrap_or_else(|e| panic!("invalid wiki link regex: {e}"))
});

/// Turns a title, file stem or link target into a node id: accents folded, alphanumerics of any
/// script lowercased, every other run of characters collapsed into a single `-`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.nfkd().filter(|c| !is_combining_mark(*c)) {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Id a link target names: the last path segment without a `.md` extension, slugified.
pub fn link_target_id(target: &str) -> Option<String> {
    let target = target.trim();
    let target = target
        .strip_prefix("[[")
        .and_then(|t| t.strip_suffix("]]"))
        .unwrap_or(target);
    let last = target.rsplit('/').next().unwrap_or(target);
    let last = last.split('|').next().unwrap_or(last);
    let last = last.split('#').next().unwrap_or(last);
    let last = last.strip_suffix(".md").unwrap_or(last);
    let slug = slugify(last);
    if slug.is_empty() {
        None
    } else {
        Some(slug)
    }
}

/// Reference adapter for markdown vaults: YAML frontmatter between `---` fences, `[[wiki
/// links]]` in the body, typed references under [`RELATIONS_KEY`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FrontmatterParser;

impl FrontmatterParser {
    /// Splits `text` into (frontmatter source, body). `Ok((None, text))` when there is no
    /// opening fence.
    fn split(path: &str, text: &str) -> Result<(Option<String>, String), VaultError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut lines = text.split_inclusive('\n');
        match lines.next() {
            Some(first) if first.trim_end() == "---" => {}
            _ => return Ok((None, text.to_string())),
        }

        let mut yaml = String::new();
        let mut consumed = text.split_inclusive('\n').next().map_or(0, str::len);
        for line in lines {
            consumed += line.len();
            let trimmed = line.trim_end();
            if trimmed == "---" || trimmed == "..." {
                return Ok((Some(yaml), text[consumed..].to_string()));
            }
            yaml.push_str(line);
        }
        Err(VaultError::Serialization(format!(
            "{path}: frontmatter block is not closed"
        )))
    }

    fn parse_yaml(path: &str, yaml: &str) -> Result<Map<String, Value>, VaultError> {
        if yaml.trim().is_empty() {
            return Ok(Map::new());
        }
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| VaultError::Serialization(format!("{path}: malformed frontmatter: {e}")))?;
        match value {
            serde_yaml::Value::Null => Ok(Map::new()),
            serde_yaml::Value::Mapping(_) => match serde_json::to_value(value)? {
                Value::Object(map) => Ok(map),
                other => Err(VaultError::Serialization(format!(
                    "{path}: frontmatter must be a mapping, found {other}"
                ))),
            },
            _ => Err(VaultError::Serialization(format!(
                "{path}: frontmatter must be a mapping of field names to values"
            ))),
        }
    }

    fn typed_references(
        path: &str,
        frontmatter: &Map<String, Value>,
    ) -> Result<Vec<CrossReference>, VaultError> {
        let Some(relations) = frontmatter.get(RELATIONS_KEY) else {
            return Ok(Vec::new());
        };
        let Value::Object(relations) = relations else {
            return Err(VaultError::Serialization(format!(
                "{path}: '{RELATIONS_KEY}' must map relationship ids to target ids"
            )));
        };
        let mut refs = Vec::new();
        for (relationship, targets) in relations.iter() {
            let targets = match targets {
                Value::String(s) => vec![s.as_str()],
                Value::Array(items) => items
                    .iter()
                    .map(|item| {
                        item.as_str().ok_or_else(|| {
                            VaultError::Serialization(format!(
                                "{path}: '{RELATIONS_KEY}.{relationship}' targets must be strings"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                Value::Null => Vec::new(),
                _ => {
                    return Err(VaultError::Serialization(format!(
                        "{path}: '{RELATIONS_KEY}.{relationship}' must be a string or a list"
                    )))
                }
            };
            for target in targets {
                refs.push(CrossReference {
                    display_target: target.to_string(),
                    resolved_id: link_target_id(target),
                    relationship: Some(relationship.clone()),
                });
            }
        }
        Ok(refs)
    }
}

impl DocumentParser for FrontmatterParser {
    fn parse(&self, path: &str, content: &[u8]) -> Result<ParsedDocument, VaultError> {
        let text = std::str::from_utf8(content)
            .map_err(|e| VaultError::Serialization(format!("{path}: not valid UTF-8: {e}")))?;
        let (yaml, body) = Self::split(path, text)?;
        let frontmatter = yaml
            .as_deref()
            .map(|yaml| Self::parse_yaml(path, yaml))
            .transpose()?;

        let mut cross_references = match frontmatter.as_ref() {
            Some(fm) => Self::typed_references(path, fm)?,
            None => Vec::new(),
        };
        for captures in WIKI_LINK.captures_iter(&body) {
            let target = captures.get(1).map_or("", |m| m.as_str()).trim();
            if target.is_empty() {
                continue;
            }
            cross_references.push(CrossReference {
                display_target: target.to_string(),
                resolved_id: link_target_id(target),
                relationship: None,
            });
        }

        Ok(ParsedDocument {
            frontmatter,
            body,
            cross_references,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Aria Stormborn"), "aria-stormborn");
        assert_eq!(slugify("  Café -- du   Monde!  "), "cafe-du-monde");
        assert_eq!(slugify("Section 2.1: Overview"), "section-2-1-overview");
        assert_eq!(slugify("北京"), "北京");
        assert_eq!(slugify("Москва: столица!"), "москва-столица");
        assert_eq!(link_target_id("[[Города/Москва.md]]"), Some("москва".to_string()));
        assert_eq!(link_target_id("places/Old Harbor.md"), Some("old-harbor".to_string()));
        assert_eq!(link_target_id("[[Old Harbor#Docks|the docks]]"), Some("old-harbor".to_string()));
        assert_eq!(link_target_id("???"), None);
    }

    #[test]
    fn test_parse_document() {
        let source = "---\nname: Aria\ntype: character\nrelations:\n  owns: [Sunblade]\n  member_of: \"[[Night Guild]]\"\n---\nAria lives in [[Old Harbor]] and visits [[Old Harbor#Docks|the docks]].\n";
        let parsed = FrontmatterParser.parse("characters/aria.md", source.as_bytes()).unwrap();
        let fm = parsed.frontmatter.unwrap();
        assert_eq!(fm.get("name"), Some(&json!("Aria")));
        assert!(parsed.body.starts_with("Aria lives in"));

        let mut refs: Vec<(Option<&str>, Option<&str>)> = parsed
            .cross_references
            .iter()
            .map(|r| (r.resolved_id.as_deref(), r.relationship.as_deref()))
            .collect();
        refs.sort();
        assert_eq!(
            refs,
            vec![
                (Some("night-guild"), Some("member_of")),
                (Some("old-harbor"), None),
                (Some("old-harbor"), None),
                (Some("sunblade"), Some("owns")),
            ]
        );
    }

    #[test]
    fn test_no_frontmatter() {
        let parsed = FrontmatterParser.parse("notes/a.md", b"# Title\n\nplain").unwrap();
        assert!(parsed.frontmatter.is_none());
        assert_eq!(parsed.body, "# Title\n\nplain");

        let empty = FrontmatterParser.parse("notes/b.md", b"---\n---\nbody").unwrap();
        assert_eq!(empty.frontmatter, Some(Map::new()));
        assert_eq!(empty.body, "body");
    }

    #[test]
    fn test_malformed_frontmatter() {
        for source in [
            "---\nname: [unclosed\n---\nbody",
            "---\n- a\n- b\n---\nbody",
            "---\nname: Aria\nno closing fence",
            "---\nrelations: owns\n---\nbody",
        ] {
            let result = FrontmatterParser.parse("bad.md", source.as_bytes());
            assert!(
                matches!(result, Err(VaultError::Serialization(_))),
                "{source:?} -> {result:?}"
            );
        }
        assert!(FrontmatterParser.parse("bin.md", &[0xff, 0xfe]).is_err());
    }
}
