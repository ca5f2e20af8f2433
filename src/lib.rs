//! # Picture Tag Query System
//!
//! This crate compiles textual tag queries into SQL searches over a tagged picture
//! library, and computes perceptual hashes to find similar pictures.
//!
//! ## Features
//!
//! - **Tag Queries**: boolean expressions over tags with `AND`, `OR`, `NOT` (or `-`),
//!   implicit conjunction, grouping, tag-type prefixes such as `%alice`, and pseudo-tags
//!   such as `#no_tags` or `#ext:png`.
//! - **Compound Tags**: tags defined by a query of their own are expanded at compile
//!   time, with cycle detection and a bound on the expanded size.
//! - **Pruning**: queries that can never match are detected and never sent to the
//!   database.
//! - **Similarity**: 64-bit difference hashes and a Hamming-distance based confidence.
//! - **Asynchronous Execution**: database access, hashing and searches run on tokio,
//!   with cooperative cancellation of running searches.
//!
//! ## Usage
//!
//! The compiler only needs a catalog snapshot, so it can be used without a database:
//!
//! ```rust
//! use pictag::prelude::*;
//!
//! let catalog = TagCatalog::new()
//!     .with_tag(1, "car", None)
//!     .with_tag(2, "truck", None)
//!     .with_compound_tag(3, "vehicle", "car OR truck");
//!
//! let compiled = compile(
//!     "vehicle -#no_tags",
//!     &catalog,
//!     &PseudoTagRegistry::default(),
//!     &CompilerConfig::default(),
//! )
//! .unwrap();
//! assert!(compiled.query_text().is_some());
//!
//! let contradiction = compile(
//!     "car AND NOT car",
//!     &catalog,
//!     &PseudoTagRegistry::default(),
//!     &CompilerConfig::default(),
//! )
//! .unwrap();
//! assert!(contradiction.query_text().is_none());
//! ```
//!
//! With a database, [`app::search`] loads the snapshot and runs the compiled query:
//!
//! ```no_run
//! use pictag::prelude::*;
//!
//! async fn find_cats(db: &Database) -> Result<Vec<Picture>, AppError> {
//!     search(
//!         db,
//!         "cat AND NOT #no_file",
//!         &PseudoTagRegistry::default(),
//!         &CompilerConfig::default(),
//!     )
//!     .await
//! }
//! ```

pub mod app;
pub mod catalog;
pub mod config;
pub mod database;
mod dialect;
pub mod hash;
pub mod parser;
pub mod pseudo_tag;
pub mod query;

pub mod prelude {
    pub use crate::app::{
        AppError, RegisterPictureCommand, SearchHandle, find_similar, hash_file,
        recompute_hash, search, search_cancellable, spawn_search,
    };
    pub use crate::catalog::{CatalogError, Tag, TagCatalog, TagType};
    pub use crate::config::{CompilerConfig, Config, DatabaseConfig};
    pub use crate::database::{Database, DatabaseError, Picture, PictureId};
    pub use crate::hash::{HashError, PictureHash, Similarity};
    pub use crate::pseudo_tag::PseudoTagRegistry;
    pub use crate::query::{CompiledQuery, QueryError, TagQueryExpr, compile};
}
