//! Folder conventions: map vault-relative paths to candidate entity types with glob patterns.
//!
//! When several patterns match, the most specific one wins. Specificity is ranked by
//!
//! 1. literal segments before the first wildcard segment (more wins),
//! 2. total pattern length (longer wins),
//! 3. wildcard segments (fewer wins),
//!
//! and genuine ties go to the pattern declared first.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

use crate::{error::VaultError, template::TemplateDefinition};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderMapping {
    pub pattern: String,
    pub types: Vec<String>,
}

impl FolderMapping {
    pub fn new<P: Into<String>, I: IntoIterator<Item = S>, S: Into<String>>(
        pattern: P,
        types: I,
    ) -> Self {
        FolderMapping {
            pattern: pattern.into(),
            types: types.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderMappingConfig {
    #[serde(default)]
    pub mappings: Vec<FolderMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// One matching pattern with a single candidate type
    Exact,
    /// The winning pattern lists several candidate types
    Ambiguous,
    /// Nothing matched; the configured fallback type applies
    Fallback,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub types: Vec<String>,
    pub matched_pattern: Option<String>,
    pub confidence: Confidence,
}

impl Resolution {
    /// The single resolved type, if resolution was unambiguous.
    pub fn resolved_type(&self) -> Option<&str> {
        match self.confidence {
            Confidence::Exact | Confidence::Fallback => self.types.first().map(String::as_str),
            Confidence::Ambiguous | Confidence::None => None,
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledMapping {
    mapping: FolderMapping,
    regex: Regex,
    literal_prefix: usize,
    wildcard_segments: usize,
}

impl CompiledMapping {
    fn rank(&self, index: usize) -> (Reverse<usize>, Reverse<usize>, usize, usize) {
        (
            Reverse(self.literal_prefix),
            Reverse(self.mapping.pattern.chars().count()),
            self.wildcard_segments,
            index,
        )
    }
}

fn is_wildcard_segment(segment: &str) -> bool {
    segment.contains(['*', '?', '['])
}

/// Strips leading `./` and `/` and turns `\` into `/`.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.replace('\\', "/");
    loop {
        if let Some(rest) = normalized.strip_prefix("./") {
            normalized = rest.to_string();
        } else if let Some(rest) = normalized.strip_prefix('/') {
            normalized = rest.to_string();
        } else {
            break;
        }
    }
    normalized
}

/// Translates a glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, VaultError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                let at_segment_start = i == 0 || chars[i - 1] == '/';
                if at_segment_start && chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else if at_segment_start && i + 2 == chars.len() && i > 0 {
                    // `dir/**` also matches `dir` itself.
                    out.pop();
                    out.push_str("(?:/.*)?");
                    i += 2;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .enumerate()
                    .skip(1)
                    .find(|(_, c)| **c == ']')
                    .map(|(offset, _)| i + 1 + offset)
                    .ok_or_else(|| {
                        VaultError::Configuration(format!(
                            "glob '{pattern}': unterminated character class"
                        ))
                    })?;
                let mut class = String::from("[");
                let mut body = &chars[i + 1..close];
                if let Some(first) = body.first() {
                    if *first == '!' || *first == '^' {
                        class.push('^');
                        body = &body[1..];
                    }
                }
                for c in body {
                    if *c == '\\' || *c == '[' {
                        class.push('\\');
                    }
                    class.push(*c);
                }
                class.push(']');
                out.push_str(&class);
                i = close + 1;
            }
            c => {
                out.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }
    out.push('$');
    Ok(Regex::new(&out)?)
}

/// Compiled [`FolderMappingConfig`].
#[derive(Debug, Clone)]
pub struct FolderResolver {
    mappings: Vec<CompiledMapping>,
    fallback_type: Option<String>,
}

impl FolderResolver {
    pub fn new(config: &FolderMappingConfig) -> Result<Self, VaultError> {
        let mut mappings = Vec::with_capacity(config.mappings.len());
        for mapping in config.mappings.iter() {
            if mapping.types.is_empty() {
                return Err(VaultError::Configuration(format!(
                    "folder mapping '{}' has no candidate types",
                    mapping.pattern
                )));
            }
            let normalized = normalize_path(&mapping.pattern);
            if normalized.is_empty() {
                return Err(VaultError::Configuration(
                    "folder mapping with an empty pattern".to_string(),
                ));
            }
            let regex = glob_to_regex(&normalized)?;
            let segments: Vec<&str> = normalized.split('/').collect();
            let literal_prefix = segments
                .iter()
                .take_while(|s| !is_wildcard_segment(s))
                .count();
            let wildcard_segments = segments.iter().filter(|s| is_wildcard_segment(s)).count();
            mappings.push(CompiledMapping {
                mapping: FolderMapping {
                    pattern: normalized,
                    types: mapping.types.clone(),
                },
                regex,
                literal_prefix,
                wildcard_segments,
            });
        }
        Ok(FolderResolver {
            mappings,
            fallback_type: config.fallback_type.clone(),
        })
    }

    pub fn resolve_type(&self, path: &str) -> Resolution {
        let path = normalize_path(path);
        let winner = self
            .mappings
            .iter()
            .enumerate()
            .filter(|(_, m)| m.regex.is_match(&path))
            .min_by_key(|(idx, m)| m.rank(*idx))
            .map(|(_, m)| m);

        match winner {
            Some(m) => Resolution {
                types: m.mapping.types.clone(),
                matched_pattern: Some(m.mapping.pattern.clone()),
                confidence: if m.mapping.types.len() == 1 {
                    Confidence::Exact
                } else {
                    Confidence::Ambiguous
                },
            },
            None => match self.fallback_type.as_ref() {
                Some(fallback) => Resolution {
                    types: vec![fallback.clone()],
                    matched_pattern: None,
                    confidence: Confidence::Fallback,
                },
                None => Resolution {
                    types: Vec::new(),
                    matched_pattern: None,
                    confidence: Confidence::None,
                },
            },
        }
    }

    /// Rejects candidate or fallback types the template does not declare.
    pub fn validate_against(&self, template: &TemplateDefinition) -> Result<(), VaultError> {
        let mut unknown = Vec::new();
        for m in self.mappings.iter() {
            for ty in m.mapping.types.iter() {
                if !template.has_entity_type(ty) {
                    unknown.push(format!("'{}' (pattern '{}')", ty, m.mapping.pattern));
                }
            }
        }
        if let Some(fallback) = self.fallback_type.as_ref() {
            if !template.has_entity_type(fallback) {
                unknown.push(format!("'{fallback}' (fallback)"));
            }
        }
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(VaultError::Configuration(format!(
                "folder mappings name types template '{}' does not declare: {}",
                template.id,
                unknown.join(", ")
            )))
        }
    }
}
