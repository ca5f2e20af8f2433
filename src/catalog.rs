//! Tags, tag types and the immutable snapshot the query compiler reads them from.

use crate::{
    parser::{PSEUDO_TAG_MARKER, is_keyword, is_label_char, is_type_symbol, parse_query},
    query::{
        emit::{TagEntry, TagLookup},
        expand::Definitions,
    },
};
use std::collections::HashMap;
use thiserror::Error;

pub type TagId = i64;
pub type TagTypeId = i64;

/// A tag type groups tags under a shared symbol and color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagType {
    pub id: TagTypeId,
    pub label: String,
    pub symbol: char,
    /// RGB color packed as `0xRRGGBB`.
    pub color: u32,
}

/// A stored tag. Tags with a definition are compound and never attached to pictures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: TagId,
    pub label: String,
    pub type_id: Option<TagTypeId>,
    pub definition: Option<String>,
}

impl Tag {
    pub fn is_compound(&self) -> bool {
        self.definition.is_some()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CatalogError {
    #[error("invalid tag label: '{label}'")]
    InvalidLabel { label: String },

    #[error("invalid tag type symbol: '{symbol}'")]
    InvalidSymbol { symbol: char },

    #[error("tag type symbol '{symbol}' is already used")]
    DuplicateSymbol { symbol: char },

    #[error("unknown tag type symbol: '{symbol}'")]
    UnknownTagType { symbol: char },

    #[error("unknown tag type id: {id}")]
    UnknownTagTypeId { id: TagTypeId },

    #[error("tag '{label}' already exists")]
    DuplicateLabel { label: String },

    #[error("tag '{label}' is referenced by the definition of '{by}'")]
    TagReferenced { label: String, by: String },

    #[error("a picture is already registered at '{path}'")]
    DuplicatePath { path: String },

    #[error("unknown tag: '{label}'")]
    UnknownTag { label: String },

    #[error("invalid definition for tag '{label}': {reason}")]
    InvalidDefinition { label: String, reason: String },

    #[error("compound tag '{label}' cannot be attached to a picture")]
    CompoundTagAttached { label: String },

    #[error("tag '{label}' is attached to pictures and cannot get a definition")]
    TagInUse { label: String },
}

/// Checks that a label is non-empty, made of label characters only, and not a keyword.
pub fn validate_label(label: &str) -> Result<(), CatalogError> {
    if label.is_empty() || !label.chars().all(is_label_char) || is_keyword(label) {
        return Err(CatalogError::InvalidLabel {
            label: label.to_string(),
        });
    }
    Ok(())
}

/// Checks that a character can serve as a tag-type symbol.
pub fn validate_symbol(symbol: char) -> Result<(), CatalogError> {
    if !is_type_symbol(symbol) || symbol == PSEUDO_TAG_MARKER {
        return Err(CatalogError::InvalidSymbol { symbol });
    }
    Ok(())
}

/// Checks that a definition parses and does not reference its own tag directly.
pub fn validate_definition(label: &str, definition: &str) -> Result<(), CatalogError> {
    let invalid = |reason: String| CatalogError::InvalidDefinition {
        label: label.to_string(),
        reason,
    };

    let expr = parse_query(definition).map_err(|e| invalid(e.to_string()))?;
    if expr.labels().contains(&label) {
        return Err(invalid("the definition references the tag itself".to_string()));
    }
    Ok(())
}

/// An immutable view of all tags and tag types.
///
/// The compiler only ever reads from a snapshot, so it can be shared between threads
/// while the underlying storage keeps changing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagCatalog {
    tags: HashMap<String, Tag>,
    tag_types: HashMap<char, TagType>,
}

impl TagCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot from loaded rows.
    pub fn from_parts(
        tag_types: impl IntoIterator<Item = TagType>,
        tags: impl IntoIterator<Item = Tag>,
    ) -> Self {
        Self {
            tags: tags.into_iter().map(|t| (t.label.clone(), t)).collect(),
            tag_types: tag_types.into_iter().map(|t| (t.symbol, t)).collect(),
        }
    }

    /// Adds a tag type with a default color.
    pub fn with_tag_type<T: Into<String>>(mut self, id: TagTypeId, symbol: char, label: T) -> Self {
        self.tag_types.insert(
            symbol,
            TagType {
                id,
                label: label.into(),
                symbol,
                color: 0,
            },
        );
        self
    }

    /// Adds a leaf tag.
    pub fn with_tag<T: Into<String>>(
        mut self,
        id: TagId,
        label: T,
        type_id: Option<TagTypeId>,
    ) -> Self {
        let label = label.into();
        self.tags.insert(
            label.clone(),
            Tag {
                id,
                label,
                type_id,
                definition: None,
            },
        );
        self
    }

    /// Adds an untyped compound tag.
    pub fn with_compound_tag<T: Into<String>, D: Into<String>>(
        self,
        id: TagId,
        label: T,
        definition: D,
    ) -> Self {
        self.with_typed_compound_tag(id, label, None, definition)
    }

    /// Adds a compound tag, optionally typed.
    pub fn with_typed_compound_tag<T: Into<String>, D: Into<String>>(
        mut self,
        id: TagId,
        label: T,
        type_id: Option<TagTypeId>,
        definition: D,
    ) -> Self {
        let label = label.into();
        self.tags.insert(
            label.clone(),
            Tag {
                id,
                label,
                type_id,
                definition: Some(definition.into()),
            },
        );
        self
    }

    pub fn tag(&self, label: &str) -> Option<&Tag> {
        self.tags.get(label)
    }

    pub fn tag_type(&self, symbol: char) -> Option<&TagType> {
        self.tag_types.get(&symbol)
    }

    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.values()
    }

    pub fn tag_types(&self) -> impl Iterator<Item = &TagType> {
        self.tag_types.values()
    }

    /// Returns the labels of the compound tags whose definition mentions `label`, sorted.
    pub fn referencing(&self, label: &str) -> Vec<&str> {
        let mut by: Vec<&str> = self
            .tags
            .values()
            .filter(|tag| tag.label != label)
            .filter(|tag| {
                tag.definition
                    .as_deref()
                    .and_then(|definition| parse_query(definition).ok())
                    .is_some_and(|expr| expr.labels().contains(&label))
            })
            .map(|tag| tag.label.as_str())
            .collect();
        by.sort_unstable();
        by
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl Definitions for TagCatalog {
    fn definition_of(&self, label: &str) -> Option<&str> {
        self.tags.get(label)?.definition.as_deref()
    }

    fn has_type(&self, label: &str, symbol: char) -> bool {
        match (self.tags.get(label), self.tag_types.get(&symbol)) {
            (Some(tag), Some(tag_type)) => tag.type_id == Some(tag_type.id),
            _ => false,
        }
    }
}

impl TagLookup for TagCatalog {
    fn lookup_tag(&self, label: &str) -> Option<TagEntry> {
        self.tags.get(label).map(|tag| TagEntry {
            id: tag.id,
            type_id: tag.type_id,
        })
    }

    fn lookup_tag_type(&self, symbol: char) -> Option<TagTypeId> {
        self.tag_types.get(&symbol).map(|t| t.id)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CatalogError, TagCatalog, validate_definition, validate_label, validate_symbol,
    };
    use crate::query::{
        emit::{TagEntry, TagLookup},
        expand::Definitions,
    };

    #[test]
    fn test_validate_label() {
        assert!(validate_label("cat").is_ok());
        assert!(validate_label("état_2").is_ok());
        for label in ["", "two words", "a#b", "(x)", "a-b", "AND", "x:y"] {
            assert_eq!(
                Err(CatalogError::InvalidLabel {
                    label: label.to_string()
                }),
                validate_label(label)
            );
        }
    }

    #[test]
    fn test_validate_symbol() {
        assert!(validate_symbol('%').is_ok());
        assert!(validate_symbol('@').is_ok());
        for symbol in ['#', 'a', '_', ' ', '(', '-', '"'] {
            assert_eq!(
                Err(CatalogError::InvalidSymbol { symbol }),
                validate_symbol(symbol)
            );
        }
    }

    #[test]
    fn test_validate_definition() {
        assert!(validate_definition("vehicle", "car OR truck").is_ok());
        assert!(matches!(
            validate_definition("vehicle", "car OR"),
            Err(CatalogError::InvalidDefinition { .. })
        ));
        assert!(matches!(
            validate_definition("vehicle", "car OR vehicle"),
            Err(CatalogError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_lookups() {
        let catalog = TagCatalog::new()
            .with_tag_type(7, '%', "person")
            .with_tag(1, "alice", Some(7))
            .with_compound_tag(2, "people", "alice OR bob");

        assert_eq!(
            Some(TagEntry {
                id: 1,
                type_id: Some(7)
            }),
            catalog.lookup_tag("alice")
        );
        assert_eq!(None, catalog.lookup_tag("bob"));
        assert_eq!(Some(7), catalog.lookup_tag_type('%'));
        assert_eq!(None, catalog.lookup_tag_type('@'));
        assert_eq!(Some("alice OR bob"), catalog.definition_of("people"));
        assert_eq!(None, catalog.definition_of("alice"));
        assert!(catalog.tag("people").unwrap().is_compound());
        assert_eq!(2, catalog.len());

        assert_eq!(1, catalog.tag_types().count());
        assert!(catalog.has_type("alice", '%'));
        assert!(!catalog.has_type("people", '%'));
        assert!(!catalog.has_type("alice", '@'));
        assert!(!catalog.has_type("bob", '%'));
    }

    #[test]
    fn test_referencing() {
        let catalog = TagCatalog::new()
            .with_tag(1, "car", None)
            .with_tag(2, "truck", None)
            .with_compound_tag(3, "vehicle", "car OR truck")
            .with_compound_tag(4, "road", "vehicle -%car")
            .with_compound_tag(5, "broken", "car AND");

        assert_eq!(vec!["road", "vehicle"], catalog.referencing("car"));
        assert_eq!(vec!["road"], catalog.referencing("vehicle"));
        assert!(catalog.referencing("road").is_empty());
        assert!(catalog.referencing("bike").is_empty());
    }
}
