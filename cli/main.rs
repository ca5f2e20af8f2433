use clap::{Parser, Subcommand};
use pictag::prelude::*;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "pictag")]
#[command(about = "Tagged picture library with tag queries and similarity search", long_about = None)]
pub struct Cli {
    #[arg(long, global = true, help = "Database URL (overrides PICTAG_DATABASE_URL)")]
    pub database_url: Option<String>,

    #[arg(long, global = true, help = "Maximum size of an expanded query")]
    pub max_nodes: Option<usize>,

    #[arg(long, global = true, help = "Match pseudo-tag patterns case-sensitively by default")]
    pub case_sensitive: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database schema.
    Init,

    /// Register a picture file.
    Add {
        #[arg(help = "Path to picture file")]
        path: PathBuf,

        #[arg(short, long, help = "Tags (space separated)")]
        tags: Option<String>,
    },

    /// Create a tag type.
    TagType {
        label: String,

        #[arg(help = "Single-character prefix used in queries")]
        symbol: char,

        #[arg(short, long, default_value = "ffffff", help = "Display color as RRGGBB")]
        color: String,
    },

    /// Create a tag.
    Tag {
        label: String,

        #[arg(short = 'y', long = "type", help = "Symbol of the tag type")]
        type_symbol: Option<char>,

        #[arg(short, long, help = "Query defining a compound tag")]
        definition: Option<String>,
    },

    /// Set or clear the definition of a tag.
    Define {
        label: String,

        #[arg(help = "Query defining the tag; omit to clear")]
        definition: Option<String>,
    },

    /// List the pictures matching a tag query.
    Search {
        #[arg(help = "Tag query, e.g. \"cat -%alice\"")]
        query: String,
    },

    /// Print the perceptual hash of a picture file.
    Hash { path: PathBuf },

    /// List pictures similar to a picture file.
    Similar { path: PathBuf },

    /// Recompute the stored hash of a registered picture.
    Rehash { path: PathBuf },

    /// Unregister a picture. The file is left alone.
    Remove { path: PathBuf },

    /// Point a registered picture at a new path.
    Move { path: PathBuf, new_path: PathBuf },

    /// Move the tags of one registered picture onto another and unregister the first.
    Merge { source: PathBuf, target: PathBuf },

    /// Rename a tag.
    RenameTag { label: String, new_label: String },

    /// Delete a tag and detach it from every picture.
    DeleteTag { label: String },

    /// Delete a tag type. Its tags become untyped.
    DeleteTagType { symbol: char },

    /// List tag types and tags with their usage counts.
    Tags,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if let Some(max_nodes) = cli.max_nodes {
        config.compiler = config.compiler.with_max_nodes(max_nodes);
    }
    if cli.case_sensitive {
        config.compiler = config.compiler.with_case_sensitive(true);
    }

    if let Commands::Hash { path } = &cli.command {
        let hash = hash_file(path).await?;
        println!("{hash}");
        return Ok(());
    }

    ensure_database_dir(&config.database.url).await;
    let db = Database::connect(&config.database).await?;

    match cli.command {
        Commands::Init => {
            println!("Database ready: {}", config.database.url);
        }
        Commands::Add { path, tags } => {
            let cmd = RegisterPictureCommand::new(path).with_tags(
                tags.unwrap_or_default()
                    .split_whitespace()
                    .map(String::from)
                    .collect::<Vec<_>>(),
            );

            let picture = cmd.execute(&db).await?;

            println!("Registered picture:");
            println!("{picture:?}");
        }
        Commands::TagType {
            label,
            symbol,
            color,
        } => {
            let color = match u32::from_str_radix(color.trim_start_matches('#'), 16) {
                Ok(color) if color <= 0xff_ffff => color,
                _ => {
                    eprintln!("invalid color: '{color}'");
                    std::process::exit(2);
                }
            };

            let tag_type = db.insert_tag_type(&label, symbol, color).await?;
            println!("{tag_type:?}");
        }
        Commands::Tag {
            label,
            type_symbol,
            definition,
        } => {
            let type_id = match type_symbol {
                Some(symbol) => {
                    let catalog = db.catalog().await?;
                    let tag_type = catalog
                        .tag_type(symbol)
                        .ok_or(DatabaseError::Catalog(CatalogError::UnknownTagType { symbol }))?;
                    Some(tag_type.id)
                }
                None => None,
            };

            let tag = db.insert_tag(&label, type_id, definition.as_deref()).await?;
            println!("{tag:?}");
        }
        Commands::Define { label, definition } => {
            let tag = db.define_tag(&label, definition.as_deref()).await?;
            println!("{tag:?}");
        }
        Commands::Search { query } => {
            let registry = PseudoTagRegistry::default();
            let pictures = search(&db, &query, &registry, &config.compiler).await?;

            for picture in pictures {
                println!("{}", picture.path);
            }
        }
        Commands::Similar { path } => {
            let similar = match registered_picture(&db, &path).await? {
                Some(picture) => find_similar(&db, picture.id).await?,
                None => {
                    let hash = hash_file(&path).await?;
                    db.similar_pictures(hash, None).await?
                }
            };

            for (picture, confidence) in similar {
                println!("{confidence:.3}\t{}", picture.path);
            }
        }
        Commands::Rehash { path } => {
            let picture = require_registered(&db, &path).await?;

            let picture = recompute_hash(&db, picture.id).await?;
            println!("{picture:?}");
        }
        Commands::Remove { path } => {
            let picture = require_registered(&db, &path).await?;
            db.delete_picture(picture.id).await?;
            println!("Removed {}", picture.path);
        }
        Commands::Move { path, new_path } => {
            let picture = require_registered(&db, &path).await?;
            let Some(new_path) = new_path.to_str() else {
                return Err(AppError::InvalidPath { path: new_path });
            };

            if let Some(picture) = db.move_picture(picture.id, new_path).await? {
                println!("{picture:?}");
            }
        }
        Commands::Merge { source, target } => {
            let source = require_registered(&db, &source).await?;
            let target = require_registered(&db, &target).await?;

            if db.merge_pictures(source.id, target.id).await? {
                println!("Merged {} into {}", source.path, target.path);
            }
        }
        Commands::RenameTag { label, new_label } => {
            let tag = db.rename_tag(&label, &new_label).await?;
            println!("{tag:?}");
        }
        Commands::DeleteTag { label } => {
            let tag = db.delete_tag(&label).await?;
            println!("Deleted tag {}", tag.label);
        }
        Commands::DeleteTagType { symbol } => {
            let tag_type = db.delete_tag_type(symbol).await?;
            println!("Deleted tag type {} ({})", tag_type.label, tag_type.symbol);
        }
        Commands::Tags => {
            let catalog = db.catalog().await?;
            let tag_counts = db.tag_counts().await?;
            let type_counts = db.tag_type_counts().await?;

            let mut tag_types: Vec<_> = catalog.tag_types().collect();
            tag_types.sort_by_key(|t| t.symbol);
            for tag_type in tag_types {
                let count = type_counts.get(&tag_type.id).copied().unwrap_or(0);
                println!(
                    "{}\t{}\t#{:06x}\t{count} tags",
                    tag_type.symbol, tag_type.label, tag_type.color
                );
            }

            let mut tags: Vec<_> = catalog.tags().collect();
            tags.sort_by(|a, b| a.label.cmp(&b.label));
            for tag in tags {
                match &tag.definition {
                    Some(definition) => println!("{} := {definition}", tag.label),
                    None => {
                        let count = tag_counts.get(&tag.id).copied().unwrap_or(0);
                        println!("{}\t{count}", tag.label);
                    }
                }
            }
        }
        Commands::Hash { .. } => unreachable!("handled before connecting"),
    }

    Ok(())
}

async fn registered_picture(db: &Database, path: &Path) -> Result<Option<Picture>, AppError> {
    let Some(text) = path.to_str() else {
        return Err(AppError::InvalidPath {
            path: path.to_path_buf(),
        });
    };

    Ok(db.picture_by_path(text).await?)
}

/// Looks a picture up by path, exiting when it is not registered.
async fn require_registered(db: &Database, path: &Path) -> Result<Picture, AppError> {
    match registered_picture(db, path).await? {
        Some(picture) => Ok(picture),
        None => {
            eprintln!("picture not registered: {}", path.display());
            std::process::exit(1);
        }
    }
}

/// Creates the directory holding a SQLite database file, if any.
async fn ensure_database_dir(url: &str) {
    let Some(rest) = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
    else {
        return;
    };
    let file = rest.split('?').next().unwrap_or(rest);
    if file.is_empty() || file.starts_with(':') {
        return;
    }

    if let Some(parent) = Path::new(file).parent() {
        if parent.as_os_str().is_empty() {
            return;
        }
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::warn!(dir = %parent.display(), error = %e, "could not create database directory");
        }
    }
}
