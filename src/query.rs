//! Tag query compilation.
//!
//! A tag query goes through four stages before it reaches the database:
//!
//! 1. **Parsing** ([`crate::parser`]): text is turned into a [`TagQueryExpr`].
//! 2. **Expansion** ([`expand`]): references to compound tags are replaced by their
//!    definitions until only leaf tags and pseudo-tags remain.
//! 3. **Pruning** ([`prune`]): expressions that can never match are detected so the
//!    database is never queried for them.
//! 4. **Emission** ([`emit`]): the expression is compiled into a single parameterized
//!    `SELECT` over the `pictures` table.
//!
//! [`compile`] runs the whole pipeline. It is synchronous, performs no I/O and only reads
//! the catalog snapshot it is given.
//!
//! ```rust
//! # use pictag::catalog::TagCatalog;
//! # use pictag::config::CompilerConfig;
//! # use pictag::pseudo_tag::PseudoTagRegistry;
//! # use pictag::query::compile;
//! let catalog = TagCatalog::new()
//!     .with_tag(1, "car", None)
//!     .with_tag(2, "truck", None)
//!     .with_compound_tag(3, "vehicle", "car OR truck");
//!
//! let compiled = compile(
//!     "vehicle AND NOT #no_tags",
//!     &catalog,
//!     &PseudoTagRegistry::default(),
//!     &CompilerConfig::default(),
//! )
//! .unwrap();
//!
//! assert!(compiled.query_text().is_some());
//! ```

pub mod emit;
pub mod expand;
pub mod prune;

use crate::{
    config::CompilerConfig,
    parser::{ParseErrorDetail, PSEUDO_TAG_MARKER, parse_query},
    pseudo_tag::PseudoTagRegistry,
};
use emit::TagLookup;
use expand::Definitions;
use std::fmt::Display;
use thiserror::Error;

/// Represents a boolean expression over tags and pseudo-tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagQueryExpr {
    /// A reference to a tag, optionally restricted to the tag type with the given symbol.
    Tag { label: String, symbol: Option<char> },

    /// An invocation of an engine-provided predicate.
    PseudoTag {
        name: String,
        arg: Option<PseudoTagArg>,
    },

    /// Logical AND of two subexpressions.
    And(Box<TagQueryExpr>, Box<TagQueryExpr>),

    /// Logical OR of two subexpressions.
    Or(Box<TagQueryExpr>, Box<TagQueryExpr>),

    /// Logical NOT of a subexpression.
    Not(Box<TagQueryExpr>),
}

/// The argument of a pattern pseudo-tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PseudoTagArg {
    pub pattern: String,

    /// Explicit case sensitivity; `None` defers to [`CompilerConfig::case_sensitive_default`].
    pub case_sensitive: Option<bool>,
}

impl PseudoTagArg {
    pub fn new<T: Into<String>>(pattern: T) -> Self {
        Self {
            pattern: pattern.into(),
            case_sensitive: None,
        }
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = Some(case_sensitive);
        self
    }
}

impl TagQueryExpr {
    /// Creates a reference to a tag.
    pub fn tag<T: Into<String>>(label: T) -> Self {
        TagQueryExpr::Tag {
            label: label.into(),
            symbol: None,
        }
    }

    /// Creates a reference to a tag restricted to the tag type with `symbol`.
    pub fn typed_tag<T: Into<String>>(symbol: char, label: T) -> Self {
        TagQueryExpr::Tag {
            label: label.into(),
            symbol: Some(symbol),
        }
    }

    /// Creates a flag pseudo-tag invocation.
    pub fn flag<T: Into<String>>(name: T) -> Self {
        TagQueryExpr::PseudoTag {
            name: name.into(),
            arg: None,
        }
    }

    /// Creates a pattern pseudo-tag invocation.
    pub fn pattern<T: Into<String>>(name: T, arg: PseudoTagArg) -> Self {
        TagQueryExpr::PseudoTag {
            name: name.into(),
            arg: Some(arg),
        }
    }

    /// Combines two expressions with a logical AND.
    pub fn and(self, other: TagQueryExpr) -> Self {
        TagQueryExpr::And(Box::new(self), Box::new(other))
    }

    /// Combines two expressions with a logical OR.
    pub fn or(self, other: TagQueryExpr) -> Self {
        TagQueryExpr::Or(Box::new(self), Box::new(other))
    }

    /// Negates an expression.
    pub fn not(expr: TagQueryExpr) -> Self {
        TagQueryExpr::Not(Box::new(expr))
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        match self {
            TagQueryExpr::Tag { .. } | TagQueryExpr::PseudoTag { .. } => 1,
            TagQueryExpr::And(lhs, rhs) | TagQueryExpr::Or(lhs, rhs) => {
                1 + lhs.node_count() + rhs.node_count()
            }
            TagQueryExpr::Not(expr) => 1 + expr.node_count(),
        }
    }

    /// Returns every tag label referenced by the expression, in order of appearance.
    pub fn labels(&self) -> Vec<&str> {
        fn collect<'a>(expr: &'a TagQueryExpr, out: &mut Vec<&'a str>) {
            match expr {
                TagQueryExpr::Tag { label, .. } => out.push(label),
                TagQueryExpr::PseudoTag { .. } => {}
                TagQueryExpr::And(lhs, rhs) | TagQueryExpr::Or(lhs, rhs) => {
                    collect(lhs, out);
                    collect(rhs, out);
                }
                TagQueryExpr::Not(expr) => collect(expr, out),
            }
        }

        let mut out = Vec::new();
        collect(self, &mut out);
        out
    }
}

/// Renders the expression back into the query language, fully parenthesized.
impl Display for TagQueryExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagQueryExpr::Tag { label, symbol } => match symbol {
                Some(symbol) => write!(f, "{symbol}{label}"),
                None => write!(f, "{label}"),
            },
            TagQueryExpr::PseudoTag { name, arg } => {
                write!(f, "{PSEUDO_TAG_MARKER}{name}")?;
                if let Some(arg) = arg {
                    let escaped = arg.pattern.replace('\\', "\\\\").replace('"', "\\\"");
                    write!(f, ":\"{escaped}\"")?;
                    match arg.case_sensitive {
                        Some(true) => write!(f, "s")?,
                        Some(false) => write!(f, "i")?,
                        None => {}
                    }
                }
                Ok(())
            }
            TagQueryExpr::And(lhs, rhs) => write!(f, "({lhs} AND {rhs})"),
            TagQueryExpr::Or(lhs, rhs) => write!(f, "({lhs} OR {rhs})"),
            TagQueryExpr::Not(expr) => write!(f, "NOT {expr}"),
        }
    }
}

/// The output of [`compile`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    expr: TagQueryExpr,
    sql: Option<String>,
    params: Vec<String>,
}

impl CompiledQuery {
    /// The SQL statement to run, or `None` when the query provably matches nothing.
    pub fn query_text(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    /// Values to bind to the statement's placeholders, in order.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// The fully expanded expression the statement was emitted from.
    pub fn expanded(&self) -> &TagQueryExpr {
        &self.expr
    }

    /// Whether the query was proven to match nothing.
    pub fn is_empty(&self) -> bool {
        self.sql.is_none()
    }
}

/// Errors reported by [`compile`].
#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("syntax error: {0}")]
    Syntax(#[from] ParseErrorDetail),

    #[error("syntax error in the definition of tag '{label}': {source}")]
    DefinitionSyntax {
        label: String,
        #[source]
        source: ParseErrorDetail,
    },

    #[error("invalid pseudo-tag: {name}")]
    InvalidPseudoTag { name: String },

    #[error("tag '{label}' is defined in terms of itself")]
    CycleDetected { label: String },

    #[error("query expands to more than {max_nodes} nodes")]
    TooLarge { max_nodes: usize },
}

impl QueryError {
    /// Whether the error stems from tag definitions expanding without bound.
    ///
    /// Cycles and oversized expansions call for the same fix and are reported to users
    /// as a single condition.
    pub fn is_too_large(&self) -> bool {
        matches!(
            self,
            QueryError::TooLarge { .. } | QueryError::CycleDetected { .. }
        )
    }
}

/// Compiles a textual tag query into a [`CompiledQuery`].
///
/// The catalog must be an immutable snapshot for the duration of the call.
pub fn compile<C>(
    text: &str,
    catalog: &C,
    registry: &PseudoTagRegistry,
    config: &CompilerConfig,
) -> Result<CompiledQuery, QueryError>
where
    C: Definitions + TagLookup + ?Sized,
{
    let parsed = parse_query(text)?;
    let expr = expand::expand(parsed, catalog, config.max_nodes)?;
    registry.validate(&expr)?;
    tracing::debug!(query = text, expanded = %expr, "expanded tag query");

    if prune::is_unsatisfiable(&expr) {
        tracing::debug!(query = text, "tag query is unsatisfiable, skipping emission");
        return Ok(CompiledQuery {
            expr,
            sql: None,
            params: Vec::new(),
        });
    }

    let (sql, params) = emit::emit(&expr, catalog, registry, config.case_sensitive_default)?;
    tracing::debug!(sql = %sql, ?params, "emitted picture query");

    Ok(CompiledQuery {
        expr,
        sql: Some(sql),
        params,
    })
}
