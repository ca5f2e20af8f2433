//! SQL emission.
//!
//! Compiles an expanded [`TagQueryExpr`] into one `SELECT` over the `pictures` table.
//! Tag references become correlated `EXISTS` subqueries on `picture_tag`; pseudo-tags are
//! spliced in from their registry template; boolean nodes map to SQL connectives one to one.
//! Tag identities are inlined as integers, pseudo-tag arguments are bound as parameters.

use super::{QueryError, TagQueryExpr};
use crate::{
    catalog::{TagId, TagTypeId},
    dialect::{CurrentDialect, Dialect},
    pseudo_tag::{PseudoTagKind, PseudoTagRegistry},
};

/// A stored tag as seen by the emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagEntry {
    pub id: TagId,
    pub type_id: Option<TagTypeId>,
}

/// Read-only lookup of stored tags and tag types.
pub trait TagLookup {
    fn lookup_tag(&self, label: &str) -> Option<TagEntry>;
    fn lookup_tag_type(&self, symbol: char) -> Option<TagTypeId>;
}

/// Converts the expression into a full SQL statement and its bound parameters.
///
/// # Returns
/// - `(String, Vec<String>)`: the statement and the ordered parameter values.
///
/// Identical expressions and lookups always produce identical output.
pub fn emit<L>(
    expr: &TagQueryExpr,
    lookup: &L,
    registry: &PseudoTagRegistry,
    case_sensitive_default: bool,
) -> Result<(String, Vec<String>), QueryError>
where
    L: TagLookup + ?Sized,
{
    let emitter = Emitter {
        lookup,
        registry,
        case_sensitive_default,
    };
    let mut params = Vec::new();
    let condition = emitter.build_sql(expr, &mut params)?;
    Ok((CurrentDialect::select_pictures_statement(&condition), params))
}

struct Emitter<'a, L: ?Sized> {
    lookup: &'a L,
    registry: &'a PseudoTagRegistry,
    case_sensitive_default: bool,
}

impl<L: TagLookup + ?Sized> Emitter<'_, L> {
    fn build_sql(&self, expr: &TagQueryExpr, params: &mut Vec<String>) -> Result<String, QueryError> {
        match expr {
            TagQueryExpr::Tag { label, symbol } => Ok(tag_condition(self.lookup, label, *symbol)),
            TagQueryExpr::PseudoTag { name, arg } => {
                let invalid = || QueryError::InvalidPseudoTag { name: name.clone() };
                let tag = self.registry.get(name).ok_or_else(invalid)?;

                match (tag.kind, arg) {
                    (PseudoTagKind::Flag, None) => Ok(tag.template.clone()),
                    (PseudoTagKind::Pattern, Some(arg)) => {
                        let case_sensitive =
                            arg.case_sensitive.unwrap_or(self.case_sensitive_default);
                        let flags = if case_sensitive { "s" } else { "i" };
                        Ok(render_template(
                            &tag.template,
                            &[("pattern", arg.pattern.as_str()), ("flags", flags)],
                            params,
                        ))
                    }
                    _ => Err(invalid()),
                }
            }
            TagQueryExpr::And(lhs, rhs) => Ok(format!(
                "({} AND {})",
                self.build_sql(lhs, params)?,
                self.build_sql(rhs, params)?
            )),
            TagQueryExpr::Or(lhs, rhs) => Ok(format!(
                "({} OR {})",
                self.build_sql(lhs, params)?,
                self.build_sql(rhs, params)?
            )),
            TagQueryExpr::Not(expr) => Ok(format!("NOT {}", self.build_sql(expr, params)?)),
        }
    }
}

fn tag_condition<L: TagLookup + ?Sized>(lookup: &L, label: &str, symbol: Option<char>) -> String {
    let Some(tag) = lookup.lookup_tag(label) else {
        // No picture can carry a tag that does not exist.
        return CurrentDialect::never_true();
    };

    if let Some(symbol) = symbol {
        let type_id = lookup.lookup_tag_type(symbol);
        if type_id.is_none() || type_id != tag.type_id {
            return CurrentDialect::never_true();
        }
    }

    CurrentDialect::exists_tag_query(tag.id)
}

/// Replaces each `{name}` placeholder by a dialect placeholder and pushes the matching
/// value, in order of appearance. Unknown placeholders are left untouched.
fn render_template(template: &str, values: &[(&str, &str)], params: &mut Vec<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        let value = after.find('}').and_then(|end| {
            let key = &after[..end];
            values
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (end, *value))
        });

        match value {
            Some((end, value)) => {
                params.push(value.to_string());
                out.push_str(&CurrentDialect::placeholder(params.len()));
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);

    out
}
