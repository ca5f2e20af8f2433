//! # SQL Dialect Module
//!
//! This module defines the `Dialect` trait, which abstracts over the SQL text the crate
//! sends to the database: placeholders, the picture query wrapper the compiler emits
//! into, the statements used to maintain the catalog, and schema migration.
//!
//! The current dialect is chosen at compile time by feature flags. When the `sqlite`
//! feature is enabled, the `CurrentDialect` type alias is set to `sqlite::SqliteDialect`.
//!
//! ## Key Components
//! - **`Dialect` Trait**: statement builders shared by the query emitter and the database
//!   layer. Every statement runs against the fixed `pictures` / `tags` / `tag_types` /
//!   `picture_tag` schema, with the picture row aliased `p` in picture queries.
//! - **`CurrentDialect` Alias**: the dialect selected by feature flags.
//! - **Scalar functions**: the dialect also owns connection setup, which registers the
//!   `REGEX`, `RINSTR`, `FILE_EXISTS`, `SIMILAR_HASHES` and `SIMILARITY_CONFIDENCE`
//!   functions pseudo-tag templates rely on.

#[cfg(feature = "sqlite")]
mod sqlite;

use crate::catalog::TagId;

/// The current SQL dialect used at compile time, determined by feature flags.
#[cfg(feature = "sqlite")]
pub type CurrentDialect = sqlite::SqliteDialect;

#[cfg(feature = "sqlite")]
pub type Db = sqlx::Sqlite;

#[cfg(feature = "sqlite")]
pub type CurrentRow = sqlx::sqlite::SqliteRow;

/// A trait for SQL dialects to support database-specific query generation.
pub trait Dialect {
    /// Returns the SQL placeholder syntax for the given parameter index.
    ///
    /// - SQLite: `?`
    ///
    /// # Parameters
    /// - `idx`: The 1-based parameter index (used in dialects that number placeholders).
    fn placeholder(idx: usize) -> String;

    /// Returns the full picture query for a condition over the picture row `p`.
    ///
    /// Rows come back as `(id, path, hash)`, ordered by id.
    fn select_pictures_statement(condition: &str) -> String {
        format!("SELECT p.id, p.path, p.hash FROM pictures AS p WHERE {condition} ORDER BY p.id")
    }

    /// Returns a SQL `EXISTS` subquery checking that picture `p` carries the given tag.
    ///
    /// The identity is inlined; tag ids are integers taken from the catalog.
    fn exists_tag_query(tag_id: TagId) -> String {
        format!(
            "EXISTS (SELECT 1 FROM picture_tag AS pt WHERE pt.picture_id = p.id AND pt.tag_id = {tag_id})"
        )
    }

    /// A condition no row satisfies.
    fn never_true() -> String {
        "1 = 0".to_string()
    }

    /// Returns the query ranking hashed pictures by similarity to a reference hash.
    ///
    /// Binds the reference hash twice, then the excluded picture id twice (nullable).
    fn similar_pictures_statement() -> String {
        format!(
            r#"SELECT p.id, p.path, p.hash, "SIMILARITY_CONFIDENCE"(p.hash, {0}) AS confidence
            FROM pictures AS p
            WHERE p.hash IS NOT NULL
              AND "SIMILAR_HASHES"(p.hash, {1})
              AND ({2} IS NULL OR p.id <> {3})
            ORDER BY confidence DESC, p.path"#,
            Self::placeholder(1),
            Self::placeholder(2),
            Self::placeholder(3),
            Self::placeholder(4),
        )
    }

    fn insert_tag_type_statement() -> String {
        format!(
            "INSERT INTO tag_types (label, symbol, color) VALUES ({}, {}, {})",
            Self::placeholder(1),
            Self::placeholder(2),
            Self::placeholder(3),
        )
    }

    fn insert_tag_statement() -> String {
        format!(
            "INSERT INTO tags (label, type_id, definition) VALUES ({}, {}, {})",
            Self::placeholder(1),
            Self::placeholder(2),
            Self::placeholder(3),
        )
    }

    fn update_tag_definition_statement() -> String {
        format!(
            "UPDATE tags SET definition = {} WHERE id = {}",
            Self::placeholder(1),
            Self::placeholder(2),
        )
    }

    fn insert_picture_statement() -> String {
        format!(
            "INSERT INTO pictures (path, hash) VALUES ({}, {})",
            Self::placeholder(1),
            Self::placeholder(2),
        )
    }

    fn update_picture_hash_statement() -> String {
        format!(
            "UPDATE pictures SET hash = {} WHERE id = {}",
            Self::placeholder(1),
            Self::placeholder(2),
        )
    }

    /// Relates a picture and a tag, ignoring an existing relation.
    fn ensure_picture_tag_statement() -> String {
        format!(
            "INSERT OR IGNORE INTO picture_tag (picture_id, tag_id) VALUES ({}, {})",
            Self::placeholder(1),
            Self::placeholder(2),
        )
    }

    fn query_tag_types_statement() -> &'static str {
        "SELECT id, label, symbol, color FROM tag_types ORDER BY id"
    }

    fn query_tags_statement() -> &'static str {
        "SELECT id, label, type_id, definition FROM tags ORDER BY id"
    }

    fn query_tag_by_label_statement() -> String {
        format!(
            "SELECT id, label, type_id, definition FROM tags WHERE label = {}",
            Self::placeholder(1)
        )
    }

    fn query_picture_by_path_statement() -> String {
        format!(
            "SELECT p.id, p.path, p.hash FROM pictures AS p WHERE p.path = {}",
            Self::placeholder(1)
        )
    }

    fn query_picture_by_id_statement() -> String {
        format!(
            "SELECT p.id, p.path, p.hash FROM pictures AS p WHERE p.id = {}",
            Self::placeholder(1)
        )
    }

    /// Returns the SQL statement to retrieve the labels of a picture's tags.
    fn query_tags_by_picture_statement() -> String {
        format!(
            "SELECT t.label FROM picture_tag AS pt JOIN tags AS t ON t.id = pt.tag_id WHERE pt.picture_id = {} ORDER BY t.label",
            Self::placeholder(1)
        )
    }

    fn count_tag_types_by_symbol_statement() -> String {
        format!(
            "SELECT COUNT(*) FROM tag_types WHERE symbol = {}",
            Self::placeholder(1)
        )
    }

    /// Returns the SQL statement counting the pictures a tag is attached to.
    fn count_pictures_by_tag_statement() -> String {
        format!(
            "SELECT COUNT(*) FROM picture_tag WHERE tag_id = {}",
            Self::placeholder(1)
        )
    }

    fn count_other_tag_types_by_symbol_statement() -> String {
        format!(
            "SELECT COUNT(*) FROM tag_types WHERE symbol = {} AND id <> {}",
            Self::placeholder(1),
            Self::placeholder(2),
        )
    }

    fn count_tag_types_by_id_statement() -> String {
        format!(
            "SELECT COUNT(*) FROM tag_types WHERE id = {}",
            Self::placeholder(1)
        )
    }

    fn query_tag_type_by_symbol_statement() -> String {
        format!(
            "SELECT id, label, symbol, color FROM tag_types WHERE symbol = {}",
            Self::placeholder(1)
        )
    }

    fn update_tag_type_statement() -> String {
        format!(
            "UPDATE tag_types SET label = {}, symbol = {}, color = {} WHERE id = {}",
            Self::placeholder(1),
            Self::placeholder(2),
            Self::placeholder(3),
            Self::placeholder(4),
        )
    }

    /// Detaches every tag from a tag type.
    fn clear_tag_type_statement() -> String {
        format!(
            "UPDATE tags SET type_id = NULL WHERE type_id = {}",
            Self::placeholder(1)
        )
    }

    fn delete_tag_type_statement() -> String {
        format!("DELETE FROM tag_types WHERE id = {}", Self::placeholder(1))
    }

    fn rename_tag_statement() -> String {
        format!(
            "UPDATE tags SET label = {} WHERE id = {}",
            Self::placeholder(1),
            Self::placeholder(2),
        )
    }

    fn delete_tag_statement() -> String {
        format!("DELETE FROM tags WHERE id = {}", Self::placeholder(1))
    }

    fn delete_picture_tags_by_tag_statement() -> String {
        format!(
            "DELETE FROM picture_tag WHERE tag_id = {}",
            Self::placeholder(1)
        )
    }

    fn delete_picture_tags_by_picture_statement() -> String {
        format!(
            "DELETE FROM picture_tag WHERE picture_id = {}",
            Self::placeholder(1)
        )
    }

    fn delete_picture_statement() -> String {
        format!("DELETE FROM pictures WHERE id = {}", Self::placeholder(1))
    }

    fn update_picture_path_statement() -> String {
        format!(
            "UPDATE pictures SET path = {} WHERE id = {}",
            Self::placeholder(1),
            Self::placeholder(2),
        )
    }

    /// Copies every tag of the second bound picture onto the first, skipping duplicates.
    fn copy_picture_tags_statement() -> String {
        format!(
            "INSERT OR IGNORE INTO picture_tag (picture_id, tag_id) SELECT {}, tag_id FROM picture_tag WHERE picture_id = {}",
            Self::placeholder(1),
            Self::placeholder(2),
        )
    }

    /// Returns `(id, count)` for every tag, counting the pictures it is attached to.
    fn query_tag_counts_statement() -> &'static str {
        "SELECT t.id AS id, COUNT(pt.picture_id) AS count FROM tags AS t LEFT JOIN picture_tag AS pt ON pt.tag_id = t.id GROUP BY t.id"
    }

    /// Returns `(id, count)` for every tag type, counting the tags typed by it.
    fn query_tag_type_counts_statement() -> &'static str {
        "SELECT tt.id AS id, COUNT(t.id) AS count FROM tag_types AS tt LEFT JOIN tags AS t ON t.type_id = tt.id GROUP BY tt.id"
    }

    /// Creates the schema if missing. Safe to run on every start.
    async fn migration(pool: &sqlx::Pool<Db>) -> Result<(), sqlx::Error>;
}
