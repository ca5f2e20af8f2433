use crate::{
    catalog::{
        CatalogError, Tag, TagCatalog, TagId, TagType, TagTypeId, validate_definition,
        validate_label, validate_symbol,
    },
    config::DatabaseConfig,
    dialect::{CurrentDialect, CurrentRow, Dialect},
    hash::PictureHash,
    query::CompiledQuery,
};
use futures::TryStreamExt;
pub use sqlx::Pool;
use sqlx::{Execute, FromRow, Row};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};
use thiserror::Error;

pub use crate::dialect::Db;

pub type PictureId = i64;

/// A picture row: its identity, file path and perceptual hash, if computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    pub id: PictureId,
    pub path: String,
    pub hash: Option<PictureHash>,
}

pub async fn run_migration(pool: &sqlx::Pool<Db>) -> Result<(), sqlx::Error> {
    CurrentDialect::migration(pool).await?;
    tracing::info!("database schema is up to date");

    Ok(())
}

impl FromRow<'_, CurrentRow> for Picture {
    fn from_row(row: &CurrentRow) -> Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let path: String = row.try_get("path")?;
        let hash: Option<i64> = row.try_get("hash")?;

        Ok(Picture {
            id,
            path,
            hash: hash.map(PictureHash::from),
        })
    }
}

impl FromRow<'_, CurrentRow> for TagType {
    fn from_row(row: &CurrentRow) -> Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let label: String = row.try_get("label")?;
        let symbol: String = row.try_get("symbol")?;
        let color: i64 = row.try_get("color")?;

        let mut chars = symbol.chars();
        let (Some(symbol), None) = (chars.next(), chars.next()) else {
            return Err(sqlx::Error::Decode(
                format!("tag type '{label}' has an invalid symbol: '{symbol}'").into(),
            ));
        };
        let color = u32::try_from(color).map_err(|e| sqlx::Error::Decode(e.into()))?;

        Ok(TagType {
            id,
            label,
            symbol,
            color,
        })
    }
}

impl FromRow<'_, CurrentRow> for Tag {
    fn from_row(row: &CurrentRow) -> Result<Self, sqlx::Error> {
        Ok(Tag {
            id: row.try_get("id")?,
            label: row.try_get("label")?,
            type_id: row.try_get("type_id")?,
            definition: row.try_get("definition")?,
        })
    }
}

/// A database abstraction over the picture library.
///
/// This struct wraps an SQLx connection pool. It loads catalog snapshots for the query
/// compiler, runs compiled queries, and provides the writes needed to maintain tags,
/// tag types and pictures. SQL text is delegated to `Dialect`.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Db>,
}

impl Database {
    /// Wraps a pool whose connections already carry the scalar functions, then migrates.
    pub async fn with_migration(pool: sqlx::Pool<Db>) -> Result<Self, sqlx::Error> {
        run_migration(&pool).await?;

        Ok(Self { pool })
    }

    /// Opens the configured database, creating and migrating it as needed.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        tracing::info!(url = %config.url, "connecting to database");
        let pool = CurrentDialect::connect(&config.url).await?;

        Self::with_migration(pool).await
    }

    async fn retry<F, Fut, T>(&self, mut op: F) -> Result<T, DatabaseError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, DatabaseError>>,
    {
        let max_retries = 3;
        for attempt in 0..max_retries {
            let result = op().await;
            match result {
                Ok(v) => return Ok(v),
                Err(ref e) if e.is_retryable() && attempt + 1 < max_retries => {
                    tracing::warn!(attempt, error = %e, "retrying database operation");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        unreachable!("Retry loop should return before exceeding max_retries")
    }

    /// Loads an immutable snapshot of every tag and tag type.
    pub async fn catalog(&self) -> Result<TagCatalog, DatabaseError> {
        let tag_types: Vec<TagType> = self
            .retry(|| async {
                let stmt = CurrentDialect::query_tag_types_statement();
                sqlx::query_as(stmt)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::QueryCatalog,
                        sql: stmt.to_string(),
                        source: e,
                    })
            })
            .await?;

        let tags: Vec<Tag> = self
            .retry(|| async {
                let stmt = CurrentDialect::query_tags_statement();
                sqlx::query_as(stmt)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::QueryCatalog,
                        sql: stmt.to_string(),
                        source: e,
                    })
            })
            .await?;

        tracing::debug!(
            tag_types = tag_types.len(),
            tags = tags.len(),
            "loaded catalog snapshot"
        );

        Ok(TagCatalog::from_parts(tag_types, tags))
    }

    /// Runs a compiled query and returns the matching pictures, ordered by id.
    ///
    /// A query proven empty at compile time never reaches the pool.
    pub async fn query_pictures(
        &self,
        query: &CompiledQuery,
    ) -> Result<Vec<Picture>, DatabaseError> {
        let Some(stmt) = query.query_text() else {
            return Ok(Vec::new());
        };

        self.retry(|| async {
            let mut q = sqlx::query_as::<_, Picture>(stmt);

            for param in query.params() {
                q = q.bind(param);
            }

            q.fetch_all(&self.pool)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryPictures,
                    sql: stmt.to_string(),
                    source: e,
                })
        })
        .await
    }

    /// Like [`Database::query_pictures`], but polls `cancelled` before each row.
    ///
    /// Returns [`DatabaseError::Cancelled`] as soon as the flag is seen set. The query is
    /// not retried.
    pub async fn query_pictures_cancellable(
        &self,
        query: &CompiledQuery,
        cancelled: &AtomicBool,
    ) -> Result<Vec<Picture>, DatabaseError> {
        if cancelled.load(Ordering::Relaxed) {
            return Err(DatabaseError::Cancelled);
        }
        let Some(stmt) = query.query_text() else {
            return Ok(Vec::new());
        };

        let mut q = sqlx::query_as::<_, Picture>(stmt);
        for param in query.params() {
            q = q.bind(param);
        }

        let mut rows = q.fetch(&self.pool);
        let mut pictures = Vec::new();
        loop {
            if cancelled.load(Ordering::Relaxed) {
                tracing::debug!(fetched = pictures.len(), "picture query cancelled");
                return Err(DatabaseError::Cancelled);
            }

            let row = rows
                .try_next()
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryPictures,
                    sql: stmt.to_string(),
                    source: e,
                })?;
            match row {
                Some(picture) => pictures.push(picture),
                None => break,
            }
        }

        Ok(pictures)
    }

    /// Returns every hashed picture similar to `hash` with its confidence, most similar
    /// first, ties broken by path.
    pub async fn similar_pictures(
        &self,
        hash: PictureHash,
        exclude: Option<PictureId>,
    ) -> Result<Vec<(Picture, f32)>, DatabaseError> {
        let stmt = CurrentDialect::similar_pictures_statement();

        let rows = self
            .retry(|| async {
                sqlx::query(&stmt)
                    .bind(hash.to_signed())
                    .bind(hash.to_signed())
                    .bind(exclude)
                    .bind(exclude)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::QuerySimilarPictures { hash },
                        sql: stmt.to_string(),
                        source: e,
                    })
            })
            .await?;

        rows.iter()
            .map(|row| {
                let picture = Picture::from_row(row)?;
                let confidence: f64 = row.try_get("confidence")?;
                Ok((picture, confidence as f32))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| DatabaseError::QueryFailed {
                operation: DbOperation::QuerySimilarPictures { hash },
                sql: stmt.to_string(),
                source: e,
            })
    }

    pub async fn picture(&self, id: PictureId) -> Result<Option<Picture>, DatabaseError> {
        let stmt = CurrentDialect::query_picture_by_id_statement();

        self.retry(|| async {
            sqlx::query_as(&stmt)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryPicture,
                    sql: stmt.to_string(),
                    source: e,
                })
        })
        .await
    }

    pub async fn picture_by_path(&self, path: &str) -> Result<Option<Picture>, DatabaseError> {
        let stmt = CurrentDialect::query_picture_by_path_statement();

        self.retry(|| async {
            sqlx::query_as(&stmt)
                .bind(path)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryPicture,
                    sql: stmt.to_string(),
                    source: e,
                })
        })
        .await
    }

    /// Returns the labels of the tags attached to a picture, sorted.
    pub async fn tags_of(&self, picture_id: PictureId) -> Result<Vec<String>, DatabaseError> {
        let stmt = CurrentDialect::query_tags_by_picture_statement();

        self.retry(|| async {
            sqlx::query_scalar(&stmt)
                .bind(picture_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryPictureTags { picture_id },
                    sql: stmt.to_string(),
                    source: e,
                })
        })
        .await
    }

    /// Creates a tag type. Symbols must be valid and unused.
    pub async fn insert_tag_type(
        &self,
        label: &str,
        symbol: char,
        color: u32,
    ) -> Result<TagType, DatabaseError> {
        validate_symbol(symbol)?;
        if label.trim().is_empty() {
            return Err(CatalogError::InvalidLabel {
                label: label.to_string(),
            }
            .into());
        }

        let symbol_text = symbol.to_string();
        let count_stmt = CurrentDialect::count_tag_types_by_symbol_statement();
        let used: i64 = self
            .retry(|| async {
                sqlx::query_scalar(&count_stmt)
                    .bind(&symbol_text)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::QueryCatalog,
                        sql: count_stmt.to_string(),
                        source: e,
                    })
            })
            .await?;
        if used > 0 {
            return Err(CatalogError::DuplicateSymbol { symbol }.into());
        }

        let stmt = CurrentDialect::insert_tag_type_statement();

        let id = self
            .retry(|| async {
                let query = sqlx::query(&stmt)
                    .bind(label)
                    .bind(&symbol_text)
                    .bind(i64::from(color));
                let sql = query.sql();
                query
                    .execute(&self.pool)
                    .await
                    .map(|result| result.last_insert_rowid())
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::InsertTagType {
                            label: label.to_string(),
                        },
                        sql: sql.to_string(),
                        source: e,
                    })
            })
            .await?;

        Ok(TagType {
            id,
            label: label.to_string(),
            symbol,
            color,
        })
    }

    /// Creates a tag, optionally typed and optionally compound.
    pub async fn insert_tag(
        &self,
        label: &str,
        type_id: Option<TagTypeId>,
        definition: Option<&str>,
    ) -> Result<Tag, DatabaseError> {
        validate_label(label)?;
        if let Some(definition) = definition {
            validate_definition(label, definition)?;
        }

        if let Some(type_id) = type_id {
            let count_stmt = CurrentDialect::count_tag_types_by_id_statement();
            let known: i64 = self
                .retry(|| async {
                    sqlx::query_scalar(&count_stmt)
                        .bind(type_id)
                        .fetch_one(&self.pool)
                        .await
                        .map_err(|e| DatabaseError::QueryFailed {
                            operation: DbOperation::QueryCatalog,
                            sql: count_stmt.to_string(),
                            source: e,
                        })
                })
                .await?;
            if known == 0 {
                return Err(CatalogError::UnknownTagTypeId { id: type_id }.into());
            }
        }

        let select_stmt = CurrentDialect::query_tag_by_label_statement();
        let existing: Option<Tag> = self
            .retry(|| async {
                sqlx::query_as(&select_stmt)
                    .bind(label)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::QueryCatalog,
                        sql: select_stmt.to_string(),
                        source: e,
                    })
            })
            .await?;
        if existing.is_some() {
            return Err(CatalogError::DuplicateLabel {
                label: label.to_string(),
            }
            .into());
        }

        let stmt = CurrentDialect::insert_tag_statement();

        let id = self
            .retry(|| async {
                let query = sqlx::query(&stmt)
                    .bind(label)
                    .bind(type_id)
                    .bind(definition);
                let sql = query.sql();
                query
                    .execute(&self.pool)
                    .await
                    .map(|result| result.last_insert_rowid())
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::InsertTag {
                            label: label.to_string(),
                        },
                        sql: sql.to_string(),
                        source: e,
                    })
            })
            .await?;

        Ok(Tag {
            id,
            label: label.to_string(),
            type_id,
            definition: definition.map(str::to_string),
        })
    }

    /// Sets or clears the definition of an existing tag.
    ///
    /// A tag attached to at least one picture cannot become compound.
    pub async fn define_tag(
        &self,
        label: &str,
        definition: Option<&str>,
    ) -> Result<Tag, DatabaseError> {
        if let Some(definition) = definition {
            validate_definition(label, definition)?;
        }

        let select_stmt = CurrentDialect::query_tag_by_label_statement();
        let count_stmt = CurrentDialect::count_pictures_by_tag_statement();
        let update_stmt = CurrentDialect::update_tag_definition_statement();

        self.retry(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            let tag = sqlx::query_as::<_, Tag>(&select_stmt)
                .bind(label)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryCatalog,
                    sql: select_stmt.to_string(),
                    source: e,
                })?
                .ok_or_else(|| CatalogError::UnknownTag {
                    label: label.to_string(),
                })?;

            if definition.is_some() {
                let attached: i64 = sqlx::query_scalar(&count_stmt)
                    .bind(tag.id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::QueryCatalog,
                        sql: count_stmt.to_string(),
                        source: e,
                    })?;
                if attached > 0 {
                    return Err(CatalogError::TagInUse {
                        label: label.to_string(),
                    }
                    .into());
                }
            }

            sqlx::query(&update_stmt)
                .bind(definition)
                .bind(tag.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::DefineTag {
                        label: label.to_string(),
                    },
                    sql: update_stmt.to_string(),
                    source: e,
                })?;

            tx.commit()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            Ok(Tag {
                definition: definition.map(str::to_string),
                ..tag
            })
        })
        .await
    }

    pub async fn insert_picture(
        &self,
        path: &str,
        hash: Option<PictureHash>,
    ) -> Result<Picture, DatabaseError> {
        let stmt = CurrentDialect::insert_picture_statement();

        let id = self
            .retry(|| async {
                let query = sqlx::query(&stmt)
                    .bind(path)
                    .bind(hash.map(PictureHash::to_signed));
                let sql = query.sql();
                query
                    .execute(&self.pool)
                    .await
                    .map(|result| result.last_insert_rowid())
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::InsertPicture {
                            path: path.to_string(),
                        },
                        sql: sql.to_string(),
                        source: e,
                    })
            })
            .await?;

        Ok(Picture {
            id,
            path: path.to_string(),
            hash,
        })
    }

    pub async fn update_picture_hash(
        &self,
        id: PictureId,
        hash: Option<PictureHash>,
    ) -> Result<(), DatabaseError> {
        let stmt = CurrentDialect::update_picture_hash_statement();

        self.retry(|| async {
            let query = sqlx::query(&stmt)
                .bind(hash.map(PictureHash::to_signed))
                .bind(id);
            let sql = query.sql();
            query
                .execute(&self.pool)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::UpdatePictureHash { id, hash },
                    sql: sql.to_string(),
                    source: e,
                })
        })
        .await?;

        Ok(())
    }

    /// Attaches the tag with the given label to a picture.
    ///
    /// This method is idempotent. Compound tags are rejected.
    pub async fn attach_tag(
        &self,
        picture_id: PictureId,
        label: &str,
    ) -> Result<TagId, DatabaseError> {
        let select_stmt = CurrentDialect::query_tag_by_label_statement();
        let insert_stmt = CurrentDialect::ensure_picture_tag_statement();

        self.retry(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            let tag = sqlx::query_as::<_, Tag>(&select_stmt)
                .bind(label)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryCatalog,
                    sql: select_stmt.to_string(),
                    source: e,
                })?
                .ok_or_else(|| CatalogError::UnknownTag {
                    label: label.to_string(),
                })?;

            if tag.is_compound() {
                return Err(CatalogError::CompoundTagAttached {
                    label: label.to_string(),
                }
                .into());
            }

            sqlx::query(&insert_stmt)
                .bind(picture_id)
                .bind(tag.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::AttachTag {
                        picture_id,
                        label: label.to_string(),
                    },
                    sql: insert_stmt.to_string(),
                    source: e,
                })?;

            tx.commit()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            Ok(tag.id)
        })
        .await
    }

    /// Renames a tag. Tags referenced by a definition keep their label.
    pub async fn rename_tag(&self, label: &str, new_label: &str) -> Result<Tag, DatabaseError> {
        validate_label(new_label)?;
        let stmt = CurrentDialect::rename_tag_statement();

        self.retry(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            let tag = fetch_tag(&mut *tx, label).await?;
            if label == new_label {
                return Ok(tag);
            }
            if find_tag(&mut *tx, new_label).await?.is_some() {
                return Err(CatalogError::DuplicateLabel {
                    label: new_label.to_string(),
                }
                .into());
            }
            ensure_unreferenced(&mut *tx, label).await?;
            if let Some(definition) = &tag.definition {
                validate_definition(new_label, definition)?;
            }

            execute_in(
                &mut *tx,
                sqlx::query(&stmt).bind(new_label).bind(tag.id),
                || DbOperation::RenameTag {
                    label: label.to_string(),
                },
            )
            .await?;

            tx.commit()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            tracing::info!(from = %label, to = %new_label, "renamed tag");
            Ok(Tag {
                label: new_label.to_string(),
                ..tag
            })
        })
        .await
    }

    /// Deletes a tag and detaches it from every picture.
    ///
    /// Tags referenced by a definition cannot be deleted.
    pub async fn delete_tag(&self, label: &str) -> Result<Tag, DatabaseError> {
        let detach_stmt = CurrentDialect::delete_picture_tags_by_tag_statement();
        let delete_stmt = CurrentDialect::delete_tag_statement();

        self.retry(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            let tag = fetch_tag(&mut *tx, label).await?;
            ensure_unreferenced(&mut *tx, label).await?;

            let operation = || DbOperation::DeleteTag {
                label: label.to_string(),
            };
            let detached =
                execute_in(&mut *tx, sqlx::query(&detach_stmt).bind(tag.id), operation).await?;
            execute_in(&mut *tx, sqlx::query(&delete_stmt).bind(tag.id), operation).await?;

            tx.commit()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            tracing::info!(label = %label, detached, "deleted tag");
            Ok(tag)
        })
        .await
    }

    /// Changes the label, symbol and color of the tag type currently using `symbol`.
    pub async fn update_tag_type(
        &self,
        symbol: char,
        label: &str,
        new_symbol: char,
        color: u32,
    ) -> Result<TagType, DatabaseError> {
        validate_symbol(new_symbol)?;
        if label.trim().is_empty() {
            return Err(CatalogError::InvalidLabel {
                label: label.to_string(),
            }
            .into());
        }

        let count_stmt = CurrentDialect::count_other_tag_types_by_symbol_statement();
        let update_stmt = CurrentDialect::update_tag_type_statement();
        let new_symbol_text = new_symbol.to_string();

        self.retry(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            let tag_type = fetch_tag_type(&mut *tx, symbol).await?;

            let used: i64 = sqlx::query_scalar(&count_stmt)
                .bind(&new_symbol_text)
                .bind(tag_type.id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryCatalog,
                    sql: count_stmt.to_string(),
                    source: e,
                })?;
            if used > 0 {
                return Err(CatalogError::DuplicateSymbol { symbol: new_symbol }.into());
            }

            execute_in(
                &mut *tx,
                sqlx::query(&update_stmt)
                    .bind(label)
                    .bind(&new_symbol_text)
                    .bind(i64::from(color))
                    .bind(tag_type.id),
                || DbOperation::UpdateTagType { symbol },
            )
            .await?;

            tx.commit()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            Ok(TagType {
                id: tag_type.id,
                label: label.to_string(),
                symbol: new_symbol,
                color,
            })
        })
        .await
    }

    /// Deletes a tag type. Its tags stay, untyped.
    pub async fn delete_tag_type(&self, symbol: char) -> Result<TagType, DatabaseError> {
        let clear_stmt = CurrentDialect::clear_tag_type_statement();
        let delete_stmt = CurrentDialect::delete_tag_type_statement();

        self.retry(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            let tag_type = fetch_tag_type(&mut *tx, symbol).await?;

            let operation = || DbOperation::DeleteTagType { symbol };
            execute_in(&mut *tx, sqlx::query(&clear_stmt).bind(tag_type.id), operation).await?;
            execute_in(&mut *tx, sqlx::query(&delete_stmt).bind(tag_type.id), operation).await?;

            tx.commit()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            Ok(tag_type)
        })
        .await
    }

    /// Removes a picture and its tag relations. Returns whether the picture existed.
    pub async fn delete_picture(&self, id: PictureId) -> Result<bool, DatabaseError> {
        let detach_stmt = CurrentDialect::delete_picture_tags_by_picture_statement();
        let delete_stmt = CurrentDialect::delete_picture_statement();

        self.retry(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            let operation = || DbOperation::DeletePicture { id };
            execute_in(&mut *tx, sqlx::query(&detach_stmt).bind(id), operation).await?;
            let deleted =
                execute_in(&mut *tx, sqlx::query(&delete_stmt).bind(id), operation).await?;

            tx.commit()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            Ok(deleted > 0)
        })
        .await
    }

    /// Points a registered picture at a new path, keeping its tags and hash.
    ///
    /// Returns `None` when no picture has the id.
    pub async fn move_picture(
        &self,
        id: PictureId,
        new_path: &str,
    ) -> Result<Option<Picture>, DatabaseError> {
        let by_id_stmt = CurrentDialect::query_picture_by_id_statement();
        let by_path_stmt = CurrentDialect::query_picture_by_path_statement();
        let update_stmt = CurrentDialect::update_picture_path_statement();

        self.retry(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            let picture = sqlx::query_as::<_, Picture>(&by_id_stmt)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryPicture,
                    sql: by_id_stmt.to_string(),
                    source: e,
                })?;
            let Some(picture) = picture else {
                return Ok(None);
            };

            let occupant = sqlx::query_as::<_, Picture>(&by_path_stmt)
                .bind(new_path)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryPicture,
                    sql: by_path_stmt.to_string(),
                    source: e,
                })?;
            if occupant.is_some_and(|other| other.id != id) {
                return Err(CatalogError::DuplicatePath {
                    path: new_path.to_string(),
                }
                .into());
            }

            execute_in(
                &mut *tx,
                sqlx::query(&update_stmt).bind(new_path).bind(id),
                || DbOperation::MovePicture {
                    id,
                    path: new_path.to_string(),
                },
            )
            .await?;

            tx.commit()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            Ok(Some(Picture {
                path: new_path.to_string(),
                ..picture
            }))
        })
        .await
    }

    /// Moves every tag of `source` onto `target`, then removes `source`.
    ///
    /// Returns `false` without changes when the ids are equal or either picture is
    /// missing.
    pub async fn merge_pictures(
        &self,
        source: PictureId,
        target: PictureId,
    ) -> Result<bool, DatabaseError> {
        if source == target {
            return Ok(false);
        }

        let by_id_stmt = CurrentDialect::query_picture_by_id_statement();
        let copy_stmt = CurrentDialect::copy_picture_tags_statement();
        let detach_stmt = CurrentDialect::delete_picture_tags_by_picture_statement();
        let delete_stmt = CurrentDialect::delete_picture_statement();

        self.retry(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            for id in [source, target] {
                let picture = sqlx::query_as::<_, Picture>(&by_id_stmt)
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::QueryPicture,
                        sql: by_id_stmt.to_string(),
                        source: e,
                    })?;
                if picture.is_none() {
                    return Ok(false);
                }
            }

            let operation = || DbOperation::MergePictures { source, target };
            let copied = execute_in(
                &mut *tx,
                sqlx::query(&copy_stmt).bind(target).bind(source),
                operation,
            )
            .await?;
            execute_in(&mut *tx, sqlx::query(&detach_stmt).bind(source), operation).await?;
            execute_in(&mut *tx, sqlx::query(&delete_stmt).bind(source), operation).await?;

            tx.commit()
                .await
                .map_err(|e| DatabaseError::TransactionFailed { source: e })?;

            tracing::info!(source, target, copied, "merged pictures");
            Ok(true)
        })
        .await
    }

    /// Returns the number of pictures each tag is attached to, for every tag.
    pub async fn tag_counts(&self) -> Result<HashMap<TagId, i64>, DatabaseError> {
        self.counts(CurrentDialect::query_tag_counts_statement())
            .await
    }

    /// Returns the number of tags typed by each tag type, for every tag type.
    pub async fn tag_type_counts(&self) -> Result<HashMap<TagTypeId, i64>, DatabaseError> {
        self.counts(CurrentDialect::query_tag_type_counts_statement())
            .await
    }

    async fn counts(&self, stmt: &'static str) -> Result<HashMap<i64, i64>, DatabaseError> {
        let rows: Vec<(i64, i64)> = self
            .retry(|| async {
                sqlx::query_as(stmt)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::QueryCounts,
                        sql: stmt.to_string(),
                        source: e,
                    })
            })
            .await?;

        Ok(rows.into_iter().collect())
    }
}

type Connection = <Db as sqlx::Database>::Connection;

/// Runs a write on an open transaction and returns the number of affected rows.
async fn execute_in<'q>(
    conn: &mut Connection,
    query: sqlx::query::Query<'q, Db, <Db as sqlx::Database>::Arguments<'q>>,
    operation: impl FnOnce() -> DbOperation,
) -> Result<u64, DatabaseError> {
    let sql = query.sql();
    query
        .execute(conn)
        .await
        .map(|result| result.rows_affected())
        .map_err(|e| DatabaseError::QueryFailed {
            operation: operation(),
            sql: sql.to_string(),
            source: e,
        })
}

async fn find_tag(conn: &mut Connection, label: &str) -> Result<Option<Tag>, DatabaseError> {
    let stmt = CurrentDialect::query_tag_by_label_statement();
    sqlx::query_as(&stmt)
        .bind(label)
        .fetch_optional(conn)
        .await
        .map_err(|e| DatabaseError::QueryFailed {
            operation: DbOperation::QueryCatalog,
            sql: stmt.to_string(),
            source: e,
        })
}

async fn fetch_tag(conn: &mut Connection, label: &str) -> Result<Tag, DatabaseError> {
    match find_tag(conn, label).await? {
        Some(tag) => Ok(tag),
        None => Err(CatalogError::UnknownTag {
            label: label.to_string(),
        }
        .into()),
    }
}

async fn fetch_tag_type(conn: &mut Connection, symbol: char) -> Result<TagType, DatabaseError> {
    let stmt = CurrentDialect::query_tag_type_by_symbol_statement();
    let tag_type: Option<TagType> = sqlx::query_as(&stmt)
        .bind(symbol.to_string())
        .fetch_optional(conn)
        .await
        .map_err(|e| DatabaseError::QueryFailed {
            operation: DbOperation::QueryCatalog,
            sql: stmt.to_string(),
            source: e,
        })?;

    tag_type.ok_or_else(|| CatalogError::UnknownTagType { symbol }.into())
}

/// Fails when a compound tag definition mentions `label`.
async fn ensure_unreferenced(conn: &mut Connection, label: &str) -> Result<(), DatabaseError> {
    let stmt = CurrentDialect::query_tags_statement();
    let tags: Vec<Tag> = sqlx::query_as(stmt)
        .fetch_all(conn)
        .await
        .map_err(|e| DatabaseError::QueryFailed {
            operation: DbOperation::QueryCatalog,
            sql: stmt.to_string(),
            source: e,
        })?;

    let catalog = TagCatalog::from_parts(Vec::new(), tags);
    match catalog.referencing(label).first() {
        Some(by) => Err(CatalogError::TagReferenced {
            label: label.to_string(),
            by: by.to_string(),
        }
        .into()),
        None => Ok(()),
    }
}

/// Represents errors that can occur during database operations.
///
/// Each variant includes contextual information to assist with debugging and error handling.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A general SQL query failure, with full context including operation and SQL.
    #[error("Query failed during {operation:?}: sql={sql}")]
    QueryFailed {
        operation: DbOperation,
        sql: String,
        #[source]
        source: sqlx::Error,
    },

    /// A failure to begin or commit a transaction.
    #[error("Failed to operate transaction")]
    TransactionFailed {
        #[source]
        source: sqlx::Error,
    },

    /// The caller raised the cancellation flag while rows were being read.
    #[error("Query cancelled")]
    Cancelled,

    /// The write would break a catalog invariant.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Enum representing the kind of database operation being performed,
/// used for attaching context to [`DatabaseError::QueryFailed`].
#[derive(Debug)]
pub enum DbOperation {
    /// SELECT FROM tag_types / tags
    QueryCatalog,
    /// INSERT INTO tag_types
    InsertTagType { label: String },
    /// INSERT INTO tags
    InsertTag { label: String },
    /// UPDATE tags SET definition = ...
    DefineTag { label: String },
    /// INSERT INTO pictures
    InsertPicture { path: String },
    /// UPDATE pictures SET hash = ...
    UpdatePictureHash {
        id: PictureId,
        hash: Option<PictureHash>,
    },
    /// INSERT INTO picture_tag
    AttachTag { picture_id: PictureId, label: String },
    /// Compiled tag query
    QueryPictures,
    /// SELECT FROM pictures WHERE id / path = ...
    QueryPicture,
    /// SELECT label FROM picture_tag JOIN tags WHERE picture_id = ...
    QueryPictureTags { picture_id: PictureId },
    QuerySimilarPictures { hash: PictureHash },
    /// UPDATE tags SET label = ...
    RenameTag { label: String },
    /// DELETE FROM tags
    DeleteTag { label: String },
    /// UPDATE tag_types
    UpdateTagType { symbol: char },
    /// DELETE FROM tag_types
    DeleteTagType { symbol: char },
    /// DELETE FROM pictures
    DeletePicture { id: PictureId },
    /// UPDATE pictures SET path = ...
    MovePicture { id: PictureId, path: String },
    /// Tag copy and removal of the source picture
    MergePictures {
        source: PictureId,
        target: PictureId,
    },
    /// Per-tag and per-tag-type usage counts
    QueryCounts,
}

impl DatabaseError {
    fn is_retryable(&self) -> bool {
        let is_retryable_kind = |e: &sqlx::Error| {
            matches!(e, sqlx::Error::Io(_))
                || matches!(e, sqlx::Error::Protocol(_))
                || matches!(e, sqlx::Error::PoolTimedOut)
        };

        match self {
            DatabaseError::QueryFailed { source, .. } => is_retryable_kind(source),
            DatabaseError::TransactionFailed { source } => is_retryable_kind(source),
            DatabaseError::Cancelled | DatabaseError::Catalog(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        catalog::CatalogError,
        config::{CompilerConfig, DatabaseConfig},
        database::{Database, DatabaseError, Picture},
        hash::PictureHash,
        pseudo_tag::PseudoTagRegistry,
        query::{CompiledQuery, compile},
    };
    use std::{
        path::MAIN_SEPARATOR,
        sync::atomic::{AtomicBool, Ordering},
    };

    async fn get_db() -> Database {
        Database::connect(&DatabaseConfig {
            url: ":memory:".to_string(),
        })
        .await
        .unwrap()
    }

    fn path(name: &str) -> String {
        format!("{MAIN_SEPARATOR}pics{MAIN_SEPARATOR}{name}")
    }

    async fn compile_with(db: &Database, query: &str) -> CompiledQuery {
        compile(
            query,
            &db.catalog().await.unwrap(),
            &PseudoTagRegistry::default(),
            &CompilerConfig::default(),
        )
        .unwrap()
    }

    async fn search(db: &Database, query: &str) -> Vec<String> {
        let compiled = compile_with(db, query).await;
        db.query_pictures(&compiled)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.path)
            .collect()
    }

    /// Pictures:
    /// - a.png: cat, hash 0
    /// - b.jpg: dog, %alice, hash 0b111
    /// - c.PNG: cat, dog, hash u64::MAX
    /// - d.gif: untagged, no hash
    async fn populate(db: &Database) -> Vec<Picture> {
        let person = db.insert_tag_type("person", '%', 0xff0000).await.unwrap();
        db.insert_tag("cat", None, None).await.unwrap();
        db.insert_tag("dog", None, None).await.unwrap();
        db.insert_tag("alice", Some(person.id), None).await.unwrap();
        db.insert_tag("pets", None, Some("cat OR dog")).await.unwrap();

        let a = db
            .insert_picture(&path("a.png"), Some(PictureHash::from(0u64)))
            .await
            .unwrap();
        let b = db
            .insert_picture(&path("b.jpg"), Some(PictureHash::from(0b111u64)))
            .await
            .unwrap();
        let c = db
            .insert_picture(&path("c.PNG"), Some(PictureHash::from(u64::MAX)))
            .await
            .unwrap();
        let d = db.insert_picture(&path("d.gif"), None).await.unwrap();

        db.attach_tag(a.id, "cat").await.unwrap();
        db.attach_tag(b.id, "dog").await.unwrap();
        db.attach_tag(b.id, "alice").await.unwrap();
        db.attach_tag(c.id, "cat").await.unwrap();
        db.attach_tag(c.id, "dog").await.unwrap();

        vec![a, b, c, d]
    }

    #[tokio::test]
    async fn test_migration_idempotency() {
        let db = get_db().await;

        Database::with_migration(db.pool.clone()).await.unwrap();
        Database::with_migration(db.pool.clone()).await.unwrap();
    }

    #[tokio::test]
    async fn test_catalog_snapshot() {
        let db = get_db().await;
        populate(&db).await;

        let catalog = db.catalog().await.unwrap();

        assert_eq!(4, catalog.len());
        let person = catalog.tag_type('%').unwrap();
        assert_eq!("person", person.label);
        assert_eq!(0xff0000, person.color);
        assert_eq!(Some(person.id), catalog.tag("alice").unwrap().type_id);
        assert_eq!(
            Some("cat OR dog"),
            catalog.tag("pets").unwrap().definition.as_deref()
        );
    }

    #[tokio::test]
    async fn test_insert_tag_type_validation() {
        let db = get_db().await;

        assert!(db.insert_tag_type("person", '%', 0).await.is_ok());
        assert!(matches!(
            db.insert_tag_type("people", '%', 0).await,
            Err(DatabaseError::Catalog(CatalogError::DuplicateSymbol { symbol: '%' }))
        ));
        assert!(matches!(
            db.insert_tag_type("place", '#', 0).await,
            Err(DatabaseError::Catalog(CatalogError::InvalidSymbol { symbol: '#' }))
        ));
    }

    #[tokio::test]
    async fn test_insert_tag_validation() {
        let db = get_db().await;

        assert!(matches!(
            db.insert_tag("two words", None, None).await,
            Err(DatabaseError::Catalog(CatalogError::InvalidLabel { .. }))
        ));
        assert!(matches!(
            db.insert_tag("loop", None, Some("loop OR x")).await,
            Err(DatabaseError::Catalog(CatalogError::InvalidDefinition { .. }))
        ));
        assert!(matches!(
            db.insert_tag("broken", None, Some("(x")).await,
            Err(DatabaseError::Catalog(CatalogError::InvalidDefinition { .. }))
        ));
    }

    #[tokio::test]
    async fn test_attach_tag() {
        let db = get_db().await;
        let pictures = populate(&db).await;
        let a = &pictures[0];

        // Attaching twice is a no-op.
        assert!(db.attach_tag(a.id, "cat").await.is_ok());
        assert!(db.attach_tag(a.id, "dog").await.is_ok());
        assert_eq!(vec!["cat", "dog"], db.tags_of(a.id).await.unwrap());

        assert!(matches!(
            db.attach_tag(a.id, "pets").await,
            Err(DatabaseError::Catalog(CatalogError::CompoundTagAttached { .. }))
        ));
        assert!(matches!(
            db.attach_tag(a.id, "ghost").await,
            Err(DatabaseError::Catalog(CatalogError::UnknownTag { .. }))
        ));
    }

    #[tokio::test]
    async fn test_define_tag() {
        let db = get_db().await;
        populate(&db).await;
        db.insert_tag("animal", None, None).await.unwrap();

        let animal = db.define_tag("animal", Some("pets OR bird")).await.unwrap();
        assert_eq!(Some("pets OR bird".to_string()), animal.definition);

        assert!(matches!(
            db.define_tag("cat", Some("kitten")).await,
            Err(DatabaseError::Catalog(CatalogError::TagInUse { .. }))
        ));
        assert!(matches!(
            db.define_tag("ghost", None).await,
            Err(DatabaseError::Catalog(CatalogError::UnknownTag { .. }))
        ));

        let animal = db.define_tag("animal", None).await.unwrap();
        assert!(!animal.is_compound());
    }

    #[tokio::test]
    async fn test_query_pictures() {
        let db = get_db().await;
        populate(&db).await;

        assert_eq!(vec![path("a.png"), path("c.PNG")], search(&db, "cat").await);
        assert_eq!(
            vec![path("b.jpg"), path("c.PNG")],
            search(&db, "cat AND NOT #ext:png OR dog").await
        );
        assert_eq!(vec![path("a.png")], search(&db, "pets -dog").await);
        assert_eq!(vec![path("d.gif")], search(&db, "-pets").await);
        assert_eq!(
            vec![path("a.png"), path("c.PNG")],
            search(&db, "ghost OR cat").await
        );
        assert!(search(&db, "ghost").await.is_empty());
    }

    #[tokio::test]
    async fn test_query_typed_tags() {
        let db = get_db().await;
        populate(&db).await;

        assert_eq!(vec![path("b.jpg")], search(&db, "%alice").await);
        assert!(search(&db, "@alice").await.is_empty());
        assert!(search(&db, "%cat").await.is_empty());
    }

    #[tokio::test]
    async fn test_query_pseudo_tags() {
        let db = get_db().await;
        populate(&db).await;

        assert_eq!(vec![path("d.gif")], search(&db, "#no_tags").await);
        assert_eq!(
            vec![path("a.png"), path("c.PNG")],
            search(&db, "#ext:png").await
        );
        assert_eq!(vec![path("a.png")], search(&db, r#"#ext:"png"s"#).await);
        assert_eq!(vec![path("b.jpg")], search(&db, r#"#name:"B\..*""#).await);
        assert_eq!(
            vec![path("c.PNG"), path("d.gif")],
            search(&db, r#"#path:".*[cd]\.[a-z]+"i"#).await
        );
        assert_eq!(4, search(&db, "#no_file").await.len());
        assert_eq!(
            vec![path("a.png"), path("b.jpg")],
            search(&db, &format!(r#"#similar_to:"{}""#, path("a.png"))).await
        );
        assert!(
            search(&db, &format!(r#"#similar_to:"{}""#, path("d.gif")))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_unsatisfiable_query_skips_database() {
        let db = get_db().await;
        populate(&db).await;

        let compiled = compile_with(&db, "cat AND NOT cat").await;
        assert!(compiled.query_text().is_none());
        assert!(db.query_pictures(&compiled).await.unwrap().is_empty());

        // Tautologies still run.
        assert_eq!(4, search(&db, "cat OR NOT cat").await.len());
    }

    #[tokio::test]
    async fn test_query_pictures_cancellable() {
        let db = get_db().await;
        populate(&db).await;
        let compiled = compile_with(&db, "cat OR dog").await;

        let running = AtomicBool::new(false);
        assert_eq!(
            db.query_pictures(&compiled).await.unwrap(),
            db.query_pictures_cancellable(&compiled, &running)
                .await
                .unwrap()
        );

        let cancelled = AtomicBool::new(false);
        cancelled.store(true, Ordering::Relaxed);
        assert!(matches!(
            db.query_pictures_cancellable(&compiled, &cancelled).await,
            Err(DatabaseError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_similar_pictures() {
        let db = get_db().await;
        let pictures = populate(&db).await;
        let a = &pictures[0];

        let similar = db
            .similar_pictures(PictureHash::from(0u64), None)
            .await
            .unwrap();
        assert_eq!(2, similar.len());
        assert_eq!(path("a.png"), similar[0].0.path);
        assert_eq!(path("b.jpg"), similar[1].0.path);
        assert!(similar[0].1 > similar[1].1);
        assert!((similar[0].1 - 10.9 / 11.0).abs() < 1e-6);

        let similar = db
            .similar_pictures(PictureHash::from(0u64), Some(a.id))
            .await
            .unwrap();
        assert_eq!(vec![path("b.jpg")], similar.into_iter().map(|(p, _)| p.path).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_update_picture_hash() {
        let db = get_db().await;
        let pictures = populate(&db).await;
        let d = &pictures[3];

        db.update_picture_hash(d.id, Some(PictureHash::from(1u64)))
            .await
            .unwrap();

        assert_eq!(
            Some(PictureHash::from(1u64)),
            db.picture(d.id).await.unwrap().unwrap().hash
        );
        assert_eq!(
            Some(d.id),
            db.picture_by_path(&path("d.gif")).await.unwrap().map(|p| p.id)
        );
        assert_eq!(None, db.picture_by_path("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_tag_checks_type_and_label() {
        let db = get_db().await;
        populate(&db).await;

        assert!(matches!(
            db.insert_tag("bob", Some(999), None).await,
            Err(DatabaseError::Catalog(CatalogError::UnknownTagTypeId { id: 999 }))
        ));
        assert!(db.catalog().await.unwrap().tag("bob").is_none());

        assert!(matches!(
            db.insert_tag("cat", None, None).await,
            Err(DatabaseError::Catalog(CatalogError::DuplicateLabel { .. }))
        ));
    }

    #[tokio::test]
    async fn test_rename_tag() {
        let db = get_db().await;
        let pictures = populate(&db).await;
        let b = &pictures[1];

        let renamed = db.rename_tag("alice", "alicia").await.unwrap();
        assert_eq!("alicia", renamed.label);
        assert!(renamed.type_id.is_some());
        assert_eq!(vec![path("b.jpg")], search(&db, "%alicia").await);
        assert_eq!(vec!["alicia", "dog"], db.tags_of(b.id).await.unwrap());

        db.rename_tag("pets", "animals").await.unwrap();
        assert_eq!(
            vec![path("a.png"), path("b.jpg"), path("c.PNG")],
            search(&db, "animals").await
        );

        assert_eq!(
            Some(CatalogError::TagReferenced {
                label: "cat".to_string(),
                by: "animals".to_string(),
            }),
            match db.rename_tag("cat", "kitten").await {
                Err(DatabaseError::Catalog(e)) => Some(e),
                _ => None,
            }
        );
        assert!(matches!(
            db.rename_tag("dog", "alicia").await,
            Err(DatabaseError::Catalog(CatalogError::DuplicateLabel { .. }))
        ));
        assert!(matches!(
            db.rename_tag("nope", "other").await,
            Err(DatabaseError::Catalog(CatalogError::UnknownTag { .. }))
        ));
        assert!(matches!(
            db.rename_tag("dog", "NOT").await,
            Err(DatabaseError::Catalog(CatalogError::InvalidLabel { .. }))
        ));
    }

    #[tokio::test]
    async fn test_delete_tag() {
        let db = get_db().await;
        let pictures = populate(&db).await;
        let a = &pictures[0];

        assert!(matches!(
            db.delete_tag("cat").await,
            Err(DatabaseError::Catalog(CatalogError::TagReferenced { .. }))
        ));

        db.delete_tag("pets").await.unwrap();
        let cat = db.delete_tag("cat").await.unwrap();
        assert_eq!("cat", cat.label);

        assert!(db.catalog().await.unwrap().tag("cat").is_none());
        assert!(db.tags_of(a.id).await.unwrap().is_empty());
        assert_eq!(
            vec![path("a.png"), path("d.gif")],
            search(&db, "#no_tags").await
        );
        assert!(matches!(
            db.delete_tag("cat").await,
            Err(DatabaseError::Catalog(CatalogError::UnknownTag { .. }))
        ));
    }

    #[tokio::test]
    async fn test_update_tag_type() {
        let db = get_db().await;
        populate(&db).await;
        db.insert_tag_type("place", '@', 0).await.unwrap();

        let updated = db
            .update_tag_type('%', "people", '&', 0x00ff00)
            .await
            .unwrap();
        assert_eq!('&', updated.symbol);

        let catalog = db.catalog().await.unwrap();
        assert!(catalog.tag_type('%').is_none());
        let people = catalog.tag_type('&').unwrap();
        assert_eq!("people", people.label);
        assert_eq!(0x00ff00, people.color);
        assert_eq!(Some(people.id), catalog.tag("alice").unwrap().type_id);
        assert_eq!(vec![path("b.jpg")], search(&db, "&alice").await);

        // Keeping its own symbol is not a conflict.
        assert!(db.update_tag_type('&', "persons", '&', 0).await.is_ok());
        assert!(matches!(
            db.update_tag_type('&', "persons", '@', 0).await,
            Err(DatabaseError::Catalog(CatalogError::DuplicateSymbol { symbol: '@' }))
        ));
        assert!(matches!(
            db.update_tag_type('!', "nope", '!', 0).await,
            Err(DatabaseError::Catalog(CatalogError::UnknownTagType { symbol: '!' }))
        ));
        assert!(matches!(
            db.update_tag_type('&', "persons", '#', 0).await,
            Err(DatabaseError::Catalog(CatalogError::InvalidSymbol { symbol: '#' }))
        ));
    }

    #[tokio::test]
    async fn test_delete_tag_type() {
        let db = get_db().await;
        populate(&db).await;

        let person = db.delete_tag_type('%').await.unwrap();
        assert_eq!("person", person.label);

        let catalog = db.catalog().await.unwrap();
        assert!(catalog.tag_type('%').is_none());
        assert_eq!(None, catalog.tag("alice").unwrap().type_id);
        assert_eq!(vec![path("b.jpg")], search(&db, "alice").await);

        assert!(matches!(
            db.delete_tag_type('%').await,
            Err(DatabaseError::Catalog(CatalogError::UnknownTagType { symbol: '%' }))
        ));
    }

    #[tokio::test]
    async fn test_delete_picture() {
        let db = get_db().await;
        let pictures = populate(&db).await;
        let b = &pictures[1];

        assert!(db.delete_picture(b.id).await.unwrap());
        assert_eq!(None, db.picture(b.id).await.unwrap());
        assert!(db.tags_of(b.id).await.unwrap().is_empty());
        assert_eq!(vec![path("c.PNG")], search(&db, "dog").await);

        assert!(!db.delete_picture(b.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_move_picture() {
        let db = get_db().await;
        let pictures = populate(&db).await;
        let a = &pictures[0];

        let moved = db.move_picture(a.id, &path("e.png")).await.unwrap().unwrap();
        assert_eq!(path("e.png"), moved.path);
        assert_eq!(a.hash, moved.hash);
        assert_eq!(vec![path("e.png"), path("c.PNG")], search(&db, "cat").await);
        assert_eq!(None, db.picture_by_path(&path("a.png")).await.unwrap());

        assert!(matches!(
            db.move_picture(a.id, &path("c.PNG")).await,
            Err(DatabaseError::Catalog(CatalogError::DuplicatePath { .. }))
        ));
        assert!(db.move_picture(a.id, &path("e.png")).await.unwrap().is_some());
        assert_eq!(None, db.move_picture(999, &path("f.png")).await.unwrap());
    }

    #[tokio::test]
    async fn test_merge_pictures() {
        let db = get_db().await;
        let pictures = populate(&db).await;
        let (a, b) = (&pictures[0], &pictures[1]);

        assert!(db.merge_pictures(b.id, a.id).await.unwrap());
        assert_eq!(vec!["alice", "cat", "dog"], db.tags_of(a.id).await.unwrap());
        assert_eq!(None, db.picture(b.id).await.unwrap());

        assert!(!db.merge_pictures(a.id, a.id).await.unwrap());
        assert!(!db.merge_pictures(999, a.id).await.unwrap());
        assert!(!db.merge_pictures(a.id, 999).await.unwrap());
        assert!(db.picture(a.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_usage_counts() {
        let db = get_db().await;
        populate(&db).await;
        db.insert_tag_type("place", '@', 0).await.unwrap();

        let catalog = db.catalog().await.unwrap();
        let id = |label: &str| catalog.tag(label).unwrap().id;

        let counts = db.tag_counts().await.unwrap();
        assert_eq!(4, counts.len());
        assert_eq!(Some(&2), counts.get(&id("cat")));
        assert_eq!(Some(&2), counts.get(&id("dog")));
        assert_eq!(Some(&1), counts.get(&id("alice")));
        assert_eq!(Some(&0), counts.get(&id("pets")));

        let counts = db.tag_type_counts().await.unwrap();
        assert_eq!(Some(&1), counts.get(&catalog.tag_type('%').unwrap().id));
        assert_eq!(Some(&0), counts.get(&catalog.tag_type('@').unwrap().id));
    }
}
