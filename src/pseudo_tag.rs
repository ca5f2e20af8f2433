//! Pseudo-tags: engine-provided predicates that are not backed by a stored tag.
//!
//! Each pseudo-tag owns an SQL condition template evaluated against the `pictures` row
//! aliased `p`. Pattern templates reference the `{pattern}` and `{flags}` placeholders,
//! which the emitter replaces by bound parameters.

use crate::query::{QueryError, TagQueryExpr};
use std::{collections::BTreeMap, path::MAIN_SEPARATOR};

/// The two shapes of pseudo-tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoTagKind {
    /// Takes no argument; the template is used verbatim.
    Flag,
    /// Takes one pattern argument and a case-sensitivity flag.
    Pattern,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudoTag {
    pub kind: PseudoTagKind,
    pub template: String,
}

impl PseudoTag {
    pub fn flag<T: Into<String>>(template: T) -> Self {
        Self {
            kind: PseudoTagKind::Flag,
            template: template.into(),
        }
    }

    pub fn pattern<T: Into<String>>(template: T) -> Self {
        Self {
            kind: PseudoTagKind::Pattern,
            template: template.into(),
        }
    }
}

/// Fixed catalog of pseudo-tags, keyed by name.
#[derive(Debug, Clone, PartialEq)]
pub struct PseudoTagRegistry {
    tags: BTreeMap<String, PseudoTag>,
}

impl Default for PseudoTagRegistry {
    fn default() -> Self {
        Self::empty()
            .with(
                "ext",
                PseudoTag::pattern(
                    r#""REGEX"(SUBSTR(p.path, "RINSTR"(p.path, '.') + 1), {pattern}, {flags})"#,
                ),
            )
            .with("no_file", PseudoTag::flag(r#"NOT "FILE_EXISTS"(p.path)"#))
            .with(
                "no_tags",
                PseudoTag::flag(
                    "NOT EXISTS (SELECT 1 FROM picture_tag AS pt WHERE pt.picture_id = p.id)",
                ),
            )
            .with(
                "name",
                PseudoTag::pattern(format!(
                    r#""REGEX"(SUBSTR(p.path, "RINSTR"(p.path, '{MAIN_SEPARATOR}') + 1), {{pattern}}, {{flags}})"#
                )),
            )
            .with(
                "path",
                PseudoTag::pattern(r#""REGEX"(p.path, {pattern}, {flags})"#),
            )
            .with(
                "similar_to",
                PseudoTag::pattern(
                    r#"(p.hash IS NOT NULL AND "SIMILAR_HASHES"(p.hash, (SELECT hash FROM pictures WHERE path = {pattern})))"#,
                ),
            )
    }
}

impl PseudoTagRegistry {
    /// A registry without any pseudo-tag.
    pub fn empty() -> Self {
        Self {
            tags: BTreeMap::new(),
        }
    }

    /// Adds or replaces a pseudo-tag.
    pub fn with<T: Into<String>>(mut self, name: T, tag: PseudoTag) -> Self {
        self.tags.insert(name.into(), tag);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PseudoTag> {
        self.tags.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    /// Checks that every pseudo-tag invocation in `expr` names a registered pseudo-tag and
    /// has an argument exactly when the pseudo-tag is a pattern.
    pub fn validate(&self, expr: &TagQueryExpr) -> Result<(), QueryError> {
        match expr {
            TagQueryExpr::Tag { .. } => Ok(()),
            TagQueryExpr::PseudoTag { name, arg } => {
                let valid = match self.get(name).map(|tag| tag.kind) {
                    Some(PseudoTagKind::Flag) => arg.is_none(),
                    Some(PseudoTagKind::Pattern) => arg.is_some(),
                    None => false,
                };
                if valid {
                    Ok(())
                } else {
                    Err(QueryError::InvalidPseudoTag { name: name.clone() })
                }
            }
            TagQueryExpr::And(lhs, rhs) | TagQueryExpr::Or(lhs, rhs) => {
                self.validate(lhs)?;
                self.validate(rhs)
            }
            TagQueryExpr::Not(expr) => self.validate(expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PseudoTag, PseudoTagKind, PseudoTagRegistry};
    use crate::{
        parser::parse_query,
        query::QueryError,
    };

    #[test]
    fn test_default_registry() {
        let registry = PseudoTagRegistry::default();

        assert_eq!(
            vec!["ext", "name", "no_file", "no_tags", "path", "similar_to"],
            registry.names().collect::<Vec<_>>()
        );
        assert_eq!(PseudoTagKind::Flag, registry.get("no_tags").unwrap().kind);
        assert_eq!(PseudoTagKind::Pattern, registry.get("ext").unwrap().kind);
        assert!(registry.get("name").unwrap().template.contains("{pattern}"));
        assert!(registry.get("name").unwrap().template.contains("{flags}"));
        assert!(!registry.get("similar_to").unwrap().template.contains("{flags}"));
    }

    #[test]
    fn test_validate() {
        let registry = PseudoTagRegistry::default();
        let validate = |q: &str| registry.validate(&parse_query(q).unwrap());

        assert_eq!(Ok(()), validate("cat #no_tags OR #ext:png"));
        assert_eq!(
            Err(QueryError::InvalidPseudoTag {
                name: "unknown_pseudo".to_string()
            }),
            validate("cat OR NOT #unknown_pseudo")
        );
        assert_eq!(
            Err(QueryError::InvalidPseudoTag {
                name: "no_tags".to_string()
            }),
            validate("#no_tags:yes")
        );
        assert_eq!(
            Err(QueryError::InvalidPseudoTag {
                name: "ext".to_string()
            }),
            validate("#ext")
        );
    }

    #[test]
    fn test_extend_registry() {
        let registry = PseudoTagRegistry::empty().with("wide", PseudoTag::flag("p.id > 0"));

        assert!(registry.validate(&parse_query("#wide").unwrap()).is_ok());
        assert!(registry.validate(&parse_query("#no_tags").unwrap()).is_err());
    }
}
