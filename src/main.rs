//! glacier: generates self-contained offline archives of forum-style data
//! sets, with a parallel render pipeline and a deduplicating media cache.

mod archive;
mod build;
mod config;
mod error;
mod media;
mod models;
mod render;
mod storage;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use archive::DirectorySink;
use build::ArchiveBuilder;
use config::BuildOptions;
use media::download::Downloader;
use storage::sqlite::StoreConfig;
use storage::{ContentStore, Importer};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "glacier", version, about = "Offline archive generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the archive from an existing content store.
    Build {
        /// SQLite content store path.
        #[arg(long)]
        db: PathBuf,
        /// Output directory for the archive tree.
        #[arg(long)]
        output: PathBuf,
        /// Directory holding downloaded media.
        #[arg(long, default_value = "media")]
        media_dir: PathBuf,
        /// JSON build options file; command line flags override it.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Render worker count.
        #[arg(long)]
        workers: Option<usize>,
        /// Skip per-user pages.
        #[arg(long)]
        no_users: bool,
        /// Skip statistics pages.
        #[arg(long)]
        no_stats: bool,
        /// Leave external media URLs untouched.
        #[arg(long)]
        no_media: bool,
        /// Give each worker its own store connection.
        #[arg(long)]
        isolate_workers: bool,
    },
    /// Import posts and comments from JSONL exports into the content store.
    Import {
        #[arg(long)]
        db: PathBuf,
        /// JSONL file of posts.
        #[arg(long)]
        posts_file: Option<PathBuf>,
        /// JSONL file of comments; posts should be imported first.
        #[arg(long)]
        comments_file: Option<PathBuf>,
    },
    /// Download media referenced by posts into the media directory.
    Download {
        #[arg(long)]
        db: PathBuf,
        #[arg(long, default_value = "media")]
        media_dir: PathBuf,
        /// Delay between requests, in milliseconds.
        #[arg(long, default_value_t = 200)]
        sleep_ms: u64,
    },
    /// Print content store counts.
    Status {
        #[arg(long)]
        db: PathBuf,
    },
}

async fn open_store(db: &Path) -> error::Result<(ContentStore, StoreConfig)> {
    let store_config = StoreConfig::new(db.to_string_lossy());
    let store = ContentStore::open(&store_config).await?;
    store.migrate().await?;
    Ok((store, store_config))
}

#[allow(clippy::too_many_arguments)]
async fn cmd_build(
    db: PathBuf,
    output: PathBuf,
    media_dir: PathBuf,
    config: Option<PathBuf>,
    workers: Option<usize>,
    no_users: bool,
    no_stats: bool,
    no_media: bool,
    isolate_workers: bool,
) -> error::Result<()> {
    let (store, store_config) = open_store(&db).await?;
    let mut options = match config {
        Some(path) => BuildOptions::load(&path)?,
        None => BuildOptions::default(),
    };
    if let Some(workers) = workers {
        options.worker_count = workers;
    }
    if no_users {
        options.with_users = false;
    }
    if no_stats {
        options.with_stats = false;
    }
    if no_media {
        options.rewrite_media = false;
    }
    if isolate_workers {
        options.isolate_workers = true;
    }

    let sink = DirectorySink::create(&output)?;
    let builder = ArchiveBuilder::new(store, store_config, options, media_dir);
    let report = builder.build(sink).await?;
    println!(
        "archive written to {}: {} entries, {} bytes, {} soft failures, {:.1}s",
        output.display(),
        report.archive.entries,
        report.archive.bytes,
        report.stats.soft_failures,
        report.elapsed_secs,
    );
    Ok(())
}

async fn cmd_import(
    db: PathBuf,
    posts_file: Option<PathBuf>,
    comments_file: Option<PathBuf>,
) -> error::Result<()> {
    let (store, _) = open_store(&db).await?;
    let importer = Importer::new(store);
    if let Some(path) = posts_file {
        let report = importer.import_posts(&path).await?;
        println!(
            "posts: {} imported, {} skipped, {} failed",
            report.imported, report.skipped, report.failed,
        );
    }
    if let Some(path) = comments_file {
        let report = importer.import_comments(&path).await?;
        println!(
            "comments: {} imported, {} skipped, {} failed",
            report.imported, report.skipped, report.failed,
        );
    }
    Ok(())
}

async fn cmd_download(db: PathBuf, media_dir: PathBuf, sleep_ms: u64) -> error::Result<()> {
    let (store, _) = open_store(&db).await?;
    let downloader = Downloader::new(store, media_dir, sleep_ms)?;
    let report = downloader.download_all().await?;
    println!(
        "{} attempted, {} succeeded ({} deduplicated), {} failed, {} already known",
        report.attempted, report.succeeded, report.deduplicated, report.failed, report.skipped,
    );
    Ok(())
}

async fn cmd_status(db: PathBuf) -> error::Result<()> {
    let (store, _) = open_store(&db).await?;
    store.health_check().await?;
    println!("posts:    {}", store.count_posts().await?);
    println!("boards:   {}", store.count_boards().await?);
    println!("users:    {}", store.count_users().await?);
    println!("media:    {}", store.media_all().await?.len());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Build {
            db,
            output,
            media_dir,
            config,
            workers,
            no_users,
            no_stats,
            no_media,
            isolate_workers,
        } => {
            cmd_build(
                db,
                output,
                media_dir,
                config,
                workers,
                no_users,
                no_stats,
                no_media,
                isolate_workers,
            )
            .await?
        }
        Command::Import {
            db,
            posts_file,
            comments_file,
        } => cmd_import(db, posts_file, comments_file).await?,
        Command::Download {
            db,
            media_dir,
            sleep_ms,
        } => cmd_download(db, media_dir, sleep_ms).await?,
        Command::Status { db } => cmd_status(db).await?,
    }
    Ok(())
}
