//! Expansion of compound tags.
//!
//! A compound tag is a tag whose meaning is given by a definition, itself a tag query.
//! Expansion parses definitions on demand and splices them in place of the reference,
//! keeping the enclosing structure as is (no double-negation elimination).

use super::{QueryError, TagQueryExpr};
use crate::parser::parse_query;
use std::collections::{BTreeMap, HashMap};

/// Read-only access to tag definitions.
pub trait Definitions {
    /// Returns the definition of the tag with the given label, if it is a compound tag.
    fn definition_of(&self, label: &str) -> Option<&str>;

    /// Whether the tag with the given label belongs to the tag type with the given symbol.
    ///
    /// Plain definition maps carry no types.
    fn has_type(&self, _label: &str, _symbol: char) -> bool {
        false
    }
}

impl Definitions for HashMap<String, String> {
    fn definition_of(&self, label: &str) -> Option<&str> {
        self.get(label).map(String::as_str)
    }
}

impl Definitions for BTreeMap<String, String> {
    fn definition_of(&self, label: &str) -> Option<&str> {
        self.get(label).map(String::as_str)
    }
}

/// Replaces every reference to a compound tag by its definition, recursively.
///
/// A label found again while its own definition is being expanded fails with
/// [`QueryError::CycleDetected`]. Visiting more than `max_nodes` nodes in total fails with
/// [`QueryError::TooLarge`].
///
/// A typed reference to a compound tag is expanded only when the tag has that type.
/// Otherwise the typed reference is kept as is, and emission turns it into a condition
/// that never holds.
pub fn expand<D>(
    expr: TagQueryExpr,
    definitions: &D,
    max_nodes: usize,
) -> Result<TagQueryExpr, QueryError>
where
    D: Definitions + ?Sized,
{
    Expander {
        definitions,
        max_nodes,
        nodes: 0,
        path: Vec::new(),
    }
    .expand(expr)
}

struct Expander<'a, D: ?Sized> {
    definitions: &'a D,
    max_nodes: usize,
    nodes: usize,
    // Labels whose definitions are currently being expanded, outermost first.
    path: Vec<String>,
}

impl<D: Definitions + ?Sized> Expander<'_, D> {
    fn expand(&mut self, expr: TagQueryExpr) -> Result<TagQueryExpr, QueryError> {
        self.visit()?;

        match expr {
            TagQueryExpr::Tag { label, symbol } => {
                let Some(definition) = self.definitions.definition_of(&label) else {
                    return Ok(TagQueryExpr::Tag { label, symbol });
                };

                if let Some(symbol) = symbol {
                    if !self.definitions.has_type(&label, symbol) {
                        return Ok(TagQueryExpr::Tag {
                            label,
                            symbol: Some(symbol),
                        });
                    }
                }

                if self.path.contains(&label) {
                    return Err(QueryError::CycleDetected { label });
                }

                let parsed = parse_query(definition).map_err(|source| {
                    QueryError::DefinitionSyntax {
                        label: label.clone(),
                        source,
                    }
                })?;

                self.path.push(label);
                let expanded = self.expand(parsed);
                self.path.pop();
                expanded
            }
            TagQueryExpr::PseudoTag { .. } => Ok(expr),
            TagQueryExpr::And(lhs, rhs) => {
                let lhs = self.expand(*lhs)?;
                let rhs = self.expand(*rhs)?;
                Ok(lhs.and(rhs))
            }
            TagQueryExpr::Or(lhs, rhs) => {
                let lhs = self.expand(*lhs)?;
                let rhs = self.expand(*rhs)?;
                Ok(lhs.or(rhs))
            }
            TagQueryExpr::Not(expr) => Ok(TagQueryExpr::not(self.expand(*expr)?)),
        }
    }

    fn visit(&mut self) -> Result<(), QueryError> {
        self.nodes += 1;
        if self.nodes > self.max_nodes {
            return Err(QueryError::TooLarge {
                max_nodes: self.max_nodes,
            });
        }
        Ok(())
    }
}
