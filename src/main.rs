use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;

use imagedb::config::Config;
use imagedb::db::Stores;
use imagedb::duplicates::Deduplicator;
use imagedb::ingest::{collect_import_paths, ingest_file};
use imagedb::model::{tags_from_string, ImageRecord, RecordId};
use imagedb::query::{self, Predicate};
use imagedb::{logging, sweep, tags, CancelToken, ErrorKind};

#[derive(Parser, Debug)]
#[command(name = "imagedb", version)]
#[command(about = "Tagged image store with duplicate detection", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (overrides IMAGEDB_CONFIG and the default location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to daily files in this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import image files or directories
    Import {
        /// Show what would be imported without storing anything
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Tag to apply to every imported image (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Files or directories to import
        #[arg(required = true, num_args = 1..)]
        paths: Vec<PathBuf>,
    },

    /// List images matching a query (":all", ":untagged", or tags)
    Find { query: String },

    /// Show one image record
    Show { id: String },

    /// Write an image's bytes to stdout
    Cat { id: String },

    /// Replace an image's tags with a space-separated list
    Retag { id: String, tags: String },

    /// List tags with usage counts
    Tags,

    /// Rename a tag on every image carrying it
    RenameTag { from: String, to: String },

    /// Merge exact duplicates, marking the extra copies for deletion
    Dedupe {
        /// Report duplicate groups without merging them
        #[arg(long)]
        dry_run: bool,
    },

    /// Permanently remove images carrying a tag
    Sweep {
        /// Tag to sweep (defaults to the configured delete tag)
        #[arg(long)]
        tag: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(cli.log_dir.clone())?;

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    tracing::debug!(db_path = ?config.db_path, "Configuration loaded");

    let stores = Stores::open(&config).context("Failed to open image store")?;
    run(cli.command, &config, &stores)
}

fn run(command: Commands, config: &Config, stores: &Stores) -> Result<()> {
    let cancel = CancelToken::new();

    match command {
        Commands::Import {
            dry_run,
            tags,
            paths,
        } => {
            let tags: Vec<String> = tags.iter().flat_map(|t| tags_from_string(t)).collect();
            let files = collect_import_paths(&paths, &config.import.image_extensions);
            let failed = import_files(&mut io::stdout().lock(), stores, &files, &tags, dry_run, &cancel)?;
            if failed > 0 {
                anyhow::bail!("{} of {} files failed to import", failed, files.len());
            }
        }

        Commands::Find { query } => {
            for record in stores.records().find(&query::parse(&query))? {
                print_summary(&record);
            }
        }

        Commands::Show { id } => {
            let record = stores.records().find_by_id(&RecordId::parse(&id)?)?;
            let blob = stores.blobs().blob_info(&record.blob_ref)?;
            println!("id:           {}", record.id);
            println!("name:         {}", record.original_name);
            println!("tags:         {}", record.tags_string());
            println!("blob:         {}", blob.id);
            println!("content type: {}", blob.content_type);
            println!("size:         {}", blob.size);
            if let Some(hash) = &record.cached_hash {
                println!("hash:         {}", hash);
            }
        }

        Commands::Cat { id } => {
            let record = stores.records().find_by_id(&RecordId::parse(&id)?)?;
            let (mut reader, _content_type) = stores.blobs().open_blob(&record.blob_ref)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            io::copy(&mut reader, &mut out).context("Failed to write image to stdout")?;
            out.flush()?;
        }

        Commands::Retag { id, tags } => {
            let id = RecordId::parse(&id)?;
            stores.records().replace_tags(&id, &tags_from_string(&tags))?;
            print_summary(&stores.records().find_by_id(&id)?);
        }

        Commands::Tags => {
            let records = stores.records().find(&Predicate::All)?;
            for info in tags::aggregate(&records) {
                println!("{:>6}  {}", info.count, info.name);
            }
        }

        Commands::RenameTag { from, to } => {
            let records = stores.records().find(&Predicate::tagged(from.as_str()))?;
            let renamed = tags::rename_tag(stores.records(), &records, &from, &to)?;
            println!("renamed {} on {} images", from, renamed);
        }

        Commands::Dedupe { dry_run } => {
            let dedup = Deduplicator::new(stores.clone(), config.duplicates.clone());
            let records = stores.records().find(&Predicate::All)?;
            let groups = dedup.find_groups(records, &cancel)?;
            println!("found {} duplicated images", groups.len());

            if dry_run {
                for group in &groups {
                    let ids: Vec<String> = group.records.iter().map(|r| r.id.to_string()).collect();
                    println!("{}  {}", group.hash, ids.join(" "));
                }
            } else {
                let report = dedup.merge_all(&groups, &cancel)?;
                println!(
                    "merged {} groups, marked {} images with {}",
                    report.groups, report.retired, config.duplicates.delete_tag
                );
            }
        }

        Commands::Sweep { tag } => {
            let tag = tag.unwrap_or_else(|| config.duplicates.delete_tag.clone());
            match sweep::sweep(stores, &tag, config.sweep.reap_blobs) {
                Ok(report) => println!(
                    "removed {} images and {} blobs",
                    report.records, report.blobs
                ),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    println!("nothing tagged {}", tag);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}

/// Import `files`, reporting each to `out`. Returns the number that failed.
///
/// A dry run only lists what would be imported.
fn import_files(
    out: &mut impl Write,
    stores: &Stores,
    files: &[PathBuf],
    tags: &[String],
    dry_run: bool,
    cancel: &CancelToken,
) -> Result<usize> {
    if dry_run {
        for path in files {
            writeln!(out, "would import {} [{}]", path.display(), tags.join(" "))?;
        }
        return Ok(0);
    }

    writeln!(out, "{} images in store", stores.records().count()?)?;
    let mut failed = 0;
    for path in files {
        match ingest_file(stores, path, tags, cancel) {
            Ok(record) => writeln!(out, "{} {}", record.id, path.display())?,
            Err(e) => {
                failed += 1;
                tracing::error!(path = %path.display(), error = %e, "Import failed");
                eprintln!("failed to import {}: {}", path.display(), e);
            }
        }
    }
    writeln!(out, "{} images in store", stores.records().count()?)?;
    Ok(failed)
}

fn print_summary(record: &ImageRecord) {
    println!("{}  {}  [{}]", record.id, record.original_name, record.tags_string());
}
