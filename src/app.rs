//! # Picture Library Module
//!
//! This module ties the query compiler, the hash primitive and the database together
//! into the operations a front end calls.
//!
//! ## Provided Structures
//!
//! - **RegisterPictureCommand**: registers a picture file, computing its perceptual hash
//!   on a blocking worker and attaching tags.
//! - **SearchHandle**: a search running on its own task, cancellable from the caller.
//!
//! ## Core Asynchronous Functions
//!
//! - **search** / **search_cancellable**: compile a tag query against a fresh catalog
//!   snapshot and run it.
//! - **spawn_search**: run a search in the background and deliver its result later.
//! - **recompute_hash**: recompute and store the hash of a registered picture.
//! - **find_similar**: list the pictures whose hashes are close to a given picture's.
//! - **hash_file**: compute the hash of any image file off the async threads.
//!
//! ## Error Handling
//!
//! `AppError` wraps query, database, hash and task errors so callers deal with a single
//! error type.

use crate::{
    config::CompilerConfig,
    database::{Database, DatabaseError, Picture, PictureId},
    hash::{self, HashError, PictureHash},
    pseudo_tag::PseudoTagRegistry,
    query::{QueryError, compile},
};
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::task::{JoinHandle, JoinSet};

/// Represents a command registering a picture file in the library.
///
/// Use `with_tags` to attach tags before calling `execute()`.
pub struct RegisterPictureCommand {
    /// Path of the picture file, stored as given.
    pub path: PathBuf,
    /// Labels of the tags to attach.
    pub tags: Vec<String>,
}

impl RegisterPictureCommand {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        RegisterPictureCommand {
            path: path.into(),
            tags: vec![],
        }
    }

    /// Adds tags to the command.
    pub fn with_tags<T: IntoIterator<Item = String>>(mut self, tags: T) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    /// Registers the picture and attaches its tags.
    ///
    /// If any tag cannot be attached, the picture is removed again and the error returned.
    /// A file that cannot be read or decoded is still registered, without a hash, so it
    /// can be found later with `#no_file` or fixed with [`recompute_hash`].
    pub async fn execute(self, db: &Database) -> Result<Picture, AppError> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| AppError::InvalidPath {
                path: self.path.clone(),
            })?
            .to_string();

        let hash = match hash_file(&self.path).await {
            Ok(hash) => Some(hash),
            Err(AppError::Hash(e)) => {
                tracing::warn!(path = %path, error = %e, "could not hash picture, registering without hash");
                None
            }
            Err(e) => return Err(e),
        };

        let picture = db.insert_picture(&path, hash).await?;
        tracing::info!(id = picture.id, path = %path, hash = ?hash.map(|h| h.to_string()), "registered picture");

        if !self.tags.is_empty() {
            if let Err(e) = attach_tags(db, picture.id, &self.tags).await {
                tracing::warn!(id = picture.id, error = %e, "could not attach tags, removing picture");
                db.delete_picture(picture.id).await?;
                return Err(e);
            }
        }

        Ok(picture)
    }
}

/// Attaches every label to the picture concurrently.
///
/// On the first failure the remaining attachments are aborted and awaited.
pub async fn attach_tags(
    db: &Database,
    picture_id: PictureId,
    labels: &[String],
) -> Result<(), AppError> {
    let mut set = JoinSet::new();
    for label in labels {
        let db = db.clone();
        let label = label.clone();
        set.spawn(async move { db.attach_tag(picture_id, &label).await });
    }

    while let Some(result) = set.join_next().await {
        let attached = result
            .map_err(AppError::from)
            .and_then(|r| r.map_err(AppError::from));
        if let Err(e) = attached {
            set.shutdown().await;
            return Err(e);
        }
    }

    Ok(())
}

/// Computes the hash of an image file on a blocking worker.
pub async fn hash_file(path: &Path) -> Result<PictureHash, AppError> {
    let path = path.to_path_buf();
    let hash = tokio::task::spawn_blocking(move || hash::compute_for_file(&path)).await??;

    Ok(hash)
}

/// Compiles `text` against a fresh catalog snapshot and returns the matching pictures.
pub async fn search(
    db: &Database,
    text: &str,
    registry: &PseudoTagRegistry,
    config: &CompilerConfig,
) -> Result<Vec<Picture>, AppError> {
    let catalog = db.catalog().await?;
    let compiled = compile(text, &catalog, registry, config)?;
    if compiled.is_empty() {
        tracing::info!(query = text, "query can never match, skipping database");
    }

    Ok(db.query_pictures(&compiled).await?)
}

/// Like [`search`], stopping with [`DatabaseError::Cancelled`] once `cancelled` is set.
pub async fn search_cancellable(
    db: &Database,
    text: &str,
    registry: &PseudoTagRegistry,
    config: &CompilerConfig,
    cancelled: &AtomicBool,
) -> Result<Vec<Picture>, AppError> {
    if cancelled.load(Ordering::Relaxed) {
        return Err(DatabaseError::Cancelled.into());
    }

    let catalog = db.catalog().await?;
    let compiled = compile(text, &catalog, registry, config)?;

    Ok(db.query_pictures_cancellable(&compiled, cancelled).await?)
}

/// A search running on its own task.
pub struct SearchHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<Result<Vec<Picture>, AppError>>,
}

impl SearchHandle {
    /// Asks the search to stop. Rows already read are discarded.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the search to finish.
    pub async fn join(self) -> Result<Vec<Picture>, AppError> {
        self.task.await?
    }
}

/// Starts a search in the background.
pub fn spawn_search(
    db: Database,
    text: String,
    registry: Arc<PseudoTagRegistry>,
    config: CompilerConfig,
) -> SearchHandle {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();

    let task = tokio::spawn(async move {
        search_cancellable(&db, &text, &registry, &config, &flag).await
    });

    SearchHandle { cancelled, task }
}

/// Recomputes the hash of a registered picture from its file and stores it.
pub async fn recompute_hash(db: &Database, id: PictureId) -> Result<Picture, AppError> {
    let picture = db
        .picture(id)
        .await?
        .ok_or(AppError::PictureNotFound { id })?;

    let hash = hash_file(Path::new(&picture.path)).await?;
    db.update_picture_hash(id, Some(hash)).await?;
    tracing::info!(id, hash = %hash, "recomputed picture hash");

    Ok(Picture {
        hash: Some(hash),
        ..picture
    })
}

/// Returns the pictures similar to the given one, most similar first.
///
/// A picture without a hash has no similar pictures.
pub async fn find_similar(
    db: &Database,
    id: PictureId,
) -> Result<Vec<(Picture, f32)>, AppError> {
    let picture = db
        .picture(id)
        .await?
        .ok_or(AppError::PictureNotFound { id })?;

    let Some(hash) = picture.hash else {
        tracing::debug!(id, "picture has no hash");
        return Ok(Vec::new());
    };

    Ok(db.similar_pictures(hash, Some(id)).await?)
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("could not open database")]
    Connection(#[from] sqlx::Error),

    #[error("background task failed")]
    Join(#[from] tokio::task::JoinError),

    #[error("picture not found: {id}")]
    PictureNotFound { id: PictureId },

    #[error("path is not valid UTF-8: {}", path.display())]
    InvalidPath { path: PathBuf },
}

impl AppError {
    /// Whether the error comes from a search that was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Database(DatabaseError::Cancelled))
    }
}
