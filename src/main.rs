//! # ragsync CLI
//!
//! The `ragsync` binary drives the sync engine: catalog initialization, KB
//! registration, single- and multi-source syncs, non-mutating scans, and
//! run inspection.
//!
//! ## Usage
//!
//! ```bash
//! ragsync --config ./ragsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragsync init` | Create the catalog and run schema migrations |
//! | `ragsync kb add <file>` | Register a single-source KB from a JSON definition |
//! | `ragsync sync --kb-name <n>` | Run one sync of a KB |
//! | `ragsync scan --kb-name <n>` | Non-mutating scan of a KB's source |
//! | `ragsync scan --path <p>` | Summarize an arbitrary directory |
//! | `ragsync multi-source add-kb <file>` | Register a multi-source KB |
//! | `ragsync multi-source sync-multi-kb <cfg>` | Sync a multi-source KB |
//! | `ragsync status <kb>` | List recent runs |
//! | `ragsync info <kb>` | KB configuration snapshot |
//!
//! Exit codes: 0 ok, 2 usage, 1 runtime failure.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

use ragsync::config::{init_logging, load_settings};
use ragsync::models::{SourceDefinition, SyncMode};
use ragsync::multi_sync::{run_multi_sync, MultiSyncOutcome};
use ragsync::processor::SourceContext;
use ragsync::rag::create_rag;
use ragsync::repository::Repository;
use ragsync::scan::{run_scan_kb, scan_path};
use ragsync::source::create_source;
use ragsync::status::{show_info, show_status};
use ragsync::sync::{cancellation, run_sync, RunMode, SyncOptions, SyncOutcome, SyncTarget};
use ragsync::{db, migrate};

/// ragsync — synchronize documents from heterogeneous sources into RAG
/// storage with a durable audit catalog.
#[derive(Parser)]
#[command(
    name = "ragsync",
    about = "Synchronize documents from heterogeneous sources into RAG storage",
    version,
    long_about = "ragsync maintains an authoritative catalog of every file it has ever seen, \
    classifies each source listing into new/modified/unchanged/deleted, and applies only the \
    changes to the configured RAG backend. Sources: local file trees, SharePoint, OneDrive. \
    Backends: local file tree, Azure Blob, in-memory mock."
)]
struct Cli {
    /// Path to the engine settings file (TOML). Optional; every setting
    /// has a default, and RAGSYNC_DB_PATH / RAGSYNC_DB_POOL_SIZE override.
    #[arg(long, global = true, default_value = "./ragsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the catalog schema.
    ///
    /// Creates the SQLite catalog and all tables (knowledge bases, sync
    /// runs, file records, delta tokens). Idempotent.
    Init,

    /// Manage single-source knowledge bases.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },

    /// Run one sync of a knowledge base.
    ///
    /// Lists the source (incrementally when delta tokens are available),
    /// classifies changes against the catalog, and applies them to the
    /// RAG backend.
    Sync {
        /// Knowledge base name.
        #[arg(long)]
        kb_name: String,
    },

    /// Non-mutating scan.
    ///
    /// With --kb-name: runs the full detection pipeline and records
    /// scanned/scan_error rows, without touching the RAG backend or delta
    /// tokens. With --path: summarizes an arbitrary directory.
    Scan {
        /// Knowledge base name.
        #[arg(long, conflicts_with = "path")]
        kb_name: Option<String>,

        /// Directory to summarize (catalog-free).
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Multi-source knowledge base operations.
    #[command(name = "multi-source")]
    MultiSource {
        #[command(subcommand)]
        action: MultiSourceAction,
    },

    /// List recent sync runs for a knowledge base.
    Status {
        /// Knowledge base name (single- or multi-source).
        kb: String,

        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Show a knowledge base's configuration snapshot (secrets masked).
    Info {
        /// Knowledge base name (single- or multi-source).
        kb: String,
    },
}

#[derive(Subcommand)]
enum KbAction {
    /// Register a single-source KB from a JSON definition file.
    ///
    /// Expected shape: {"name", "source_type", "source_config",
    /// "rag_type", "rag_config"}.
    Add {
        /// Path to the JSON definition.
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum MultiSourceAction {
    /// Register a multi-source KB from a JSON definition file.
    ///
    /// Expected shape: {"name", "rag_type", "rag_config",
    /// "file_organization"?, "sync_strategy"?, "sources": [...]}.
    AddKb {
        /// Path to the JSON definition.
        file: PathBuf,
    },

    /// Sync a multi-source KB.
    ///
    /// CFG is a registered KB name, or a path to a JSON definition which
    /// is registered first if the name is unknown.
    SyncMultiKb {
        /// KB name or definition file path.
        cfg: String,

        /// Fan-out strategy across sources.
        #[arg(long, default_value = "parallel")]
        sync_mode: String,

        /// Comma-separated source ids (required for selective mode).
        #[arg(long)]
        sources: Option<String>,
    },
}

/// Single-source KB definition file.
#[derive(Deserialize)]
struct KbDefinition {
    name: String,
    source_type: String,
    source_config: serde_json::Value,
    rag_type: String,
    rag_config: serde_json::Value,
}

/// Multi-source KB definition file.
#[derive(Deserialize)]
struct MultiKbDefinition {
    name: String,
    rag_type: String,
    rag_config: serde_json::Value,
    #[serde(default)]
    file_organization: serde_json::Value,
    #[serde(default)]
    sync_strategy: serde_json::Value,
    sources: Vec<SourceDefinition>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    // Ad-hoc path scans don't need the catalog
    if let Commands::Scan {
        kb_name: None,
        path: Some(path),
    } = &cli.command
    {
        let report = scan_path(path).await?;
        println!("scan {}", path.display());
        println!("  files: {}", report.files);
        println!("  total bytes: {}", report.total_bytes);
        for (content_type, count) in &report.by_content_type {
            println!("  {:<50} {}", content_type, count);
        }
        return Ok(());
    }

    let settings = load_settings(&cli.config)?;
    let pool = db::connect(&settings).await?;
    let repo = Repository::new(pool);
    let opts = SyncOptions::from_settings(&settings.sync);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(repo.pool()).await?;
            println!("Catalog initialized successfully.");
        }

        Commands::Kb {
            action: KbAction::Add { file },
        } => {
            let def: KbDefinition = read_definition(&file)?;
            create_source(&def.source_type, &def.source_config)
                .with_context(|| format!("invalid source config in {}", file.display()))?;
            create_rag(&def.rag_type, &def.rag_config, &def.name)
                .with_context(|| format!("invalid rag config in {}", file.display()))?;

            let id = repo
                .create_knowledge_base(
                    &def.name,
                    &def.source_type,
                    &def.source_config,
                    &def.rag_type,
                    &def.rag_config,
                )
                .await?;
            println!("Registered knowledge base '{}' (id {id}).", def.name);
        }

        Commands::Sync { kb_name } => {
            let kb = repo
                .get_knowledge_base_by_name(&kb_name)
                .await?
                .with_context(|| format!("knowledge base '{kb_name}' not found"))?;

            let source = create_source(&kb.source_type, &kb.source_config)?;
            let rag = create_rag(&kb.rag_type, &kb.rag_config, &kb.name)?;
            repo.fail_abandoned_runs(kb.id).await?;
            let target = SyncTarget {
                kb_id: kb.id,
                kb_name: kb.name.clone(),
            };
            let ctx = SourceContext::single(&kb.name, &kb.source_type);

            let cancel = spawn_ctrl_c_handler();
            let outcome = run_sync(
                &repo,
                &target,
                Arc::from(source),
                rag,
                ctx,
                RunMode::Sync,
                &opts,
                cancel,
            )
            .await?;

            print_sync_summary("sync", &kb.name, &outcome);
            if !outcome.succeeded() {
                bail!(
                    "sync failed: {}",
                    outcome.error_message.as_deref().unwrap_or("unknown error")
                );
            }
        }

        Commands::Scan { kb_name, path } => {
            let Some(kb_name) = kb_name else {
                // Both flags absent: --path was handled above
                let _ = path;
                bail!("scan requires --kb-name or --path");
            };
            let kb = repo
                .get_knowledge_base_by_name(&kb_name)
                .await?
                .with_context(|| format!("knowledge base '{kb_name}' not found"))?;

            let cancel = spawn_ctrl_c_handler();
            let outcome = run_scan_kb(&repo, &kb, &opts, cancel).await?;

            print_sync_summary("scan", &kb.name, &outcome);
            if !outcome.succeeded() {
                bail!(
                    "scan failed: {}",
                    outcome.error_message.as_deref().unwrap_or("unknown error")
                );
            }
        }

        Commands::MultiSource { action } => match action {
            MultiSourceAction::AddKb { file } => {
                let def: MultiKbDefinition = read_definition(&file)?;
                for source_def in &def.sources {
                    create_source(&source_def.source_type, &source_def.source_config)
                        .with_context(|| {
                            format!("invalid config for source '{}'", source_def.source_id)
                        })?;
                }
                create_rag(&def.rag_type, &def.rag_config, &def.name)
                    .with_context(|| format!("invalid rag config in {}", file.display()))?;
                let id = repo
                    .create_multi_source_kb(
                        &def.name,
                        &def.rag_type,
                        &def.rag_config,
                        &def.file_organization,
                        &def.sync_strategy,
                        &def.sources,
                    )
                    .await?;
                println!(
                    "Registered multi-source knowledge base '{}' (id {id}, {} sources).",
                    def.name,
                    def.sources.len()
                );
            }

            MultiSourceAction::SyncMultiKb {
                cfg,
                sync_mode,
                sources,
            } => {
                let mode = SyncMode::parse(&sync_mode).with_context(|| {
                    format!(
                        "unknown sync mode '{sync_mode}': expected parallel, sequential, selective, or incremental"
                    )
                })?;
                let selected: Option<Vec<String>> = sources.map(|csv| {
                    csv.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                });

                let multi_kb = resolve_multi_kb(&repo, &cfg).await?;

                let cancel = spawn_ctrl_c_handler();
                let outcome = run_multi_sync(
                    &repo,
                    &multi_kb,
                    mode,
                    selected.as_deref(),
                    &opts,
                    cancel,
                )
                .await?;

                print_multi_summary(&multi_kb.name, &outcome);
                if outcome.status != ragsync::models::SyncRunStatus::Completed {
                    bail!(
                        "multi-source sync failed: {}",
                        outcome.error_message.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        },

        Commands::Status { kb, limit } => {
            show_status(&repo, &kb, limit).await?;
        }

        Commands::Info { kb } => {
            show_info(&repo, &kb).await?;
        }
    }

    Ok(())
}

fn read_definition<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// `sync-multi-kb` accepts a registered name or a definition file path;
/// an unknown name that is an existing file gets registered on the fly.
async fn resolve_multi_kb(
    repo: &Repository,
    cfg: &str,
) -> Result<ragsync::models::MultiSourceKnowledgeBase> {
    if let Some(kb) = repo.get_multi_source_kb_by_name(cfg).await? {
        return Ok(kb);
    }

    let path = PathBuf::from(cfg);
    if path.exists() {
        let def: MultiKbDefinition = read_definition(&path)?;
        if repo.get_multi_source_kb_by_name(&def.name).await?.is_none() {
            repo.create_multi_source_kb(
                &def.name,
                &def.rag_type,
                &def.rag_config,
                &def.file_organization,
                &def.sync_strategy,
                &def.sources,
            )
            .await?;
            println!("Registered multi-source knowledge base '{}'.", def.name);
        }
        return repo
            .get_multi_source_kb_by_name(&def.name)
            .await?
            .with_context(|| format!("knowledge base '{}' missing after registration", def.name));
    }

    bail!("multi-source knowledge base '{cfg}' not found (and no such file exists)");
}

/// Flip a cancellation signal on Ctrl-C.
fn spawn_ctrl_c_handler() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancellation requested; letting in-flight files finish");
            let _ = tx.send(true);
        }
        // Keep the sender alive so the channel stays open
        std::future::pending::<()>().await;
    });
    rx
}

fn print_sync_summary(verb: &str, kb_name: &str, outcome: &SyncOutcome) {
    println!("{verb} {kb_name} (run {})", outcome.sync_run_id);
    println!("  status:    {}", outcome.status.as_str());
    println!("  total:     {}", outcome.counters.total);
    println!("  new:       {}", outcome.counters.new);
    println!("  modified:  {}", outcome.counters.modified);
    println!("  unchanged: {}", outcome.counters.unchanged);
    println!("  deleted:   {}", outcome.counters.deleted);
    println!("  errors:    {}", outcome.counters.errors);
    if let Some(message) = &outcome.error_message {
        println!("  error:     {message}");
    }
}

fn print_multi_summary(kb_name: &str, outcome: &MultiSyncOutcome) {
    println!("sync-multi-kb {kb_name} (run {})", outcome.run_id);
    println!("  status:   {}", outcome.status.as_str());
    println!("  total:    {}", outcome.counters.total);
    println!("  new:      {}", outcome.counters.new);
    println!("  modified: {}", outcome.counters.modified);
    println!("  deleted:  {}", outcome.counters.deleted);
    println!("  errors:   {}", outcome.counters.errors);
    if let Some(message) = &outcome.error_message {
        println!("  note:     {message}");
    }

    if !outcome.source_stats.is_empty() {
        println!(
            "  {:<20} {:<12} {:>6} {:>5} {:>5} {:>5} {:>5} {:>9}",
            "SOURCE", "STATUS", "TOTAL", "NEW", "MOD", "DEL", "ERR", "SECS"
        );
        for (source_id, stats) in &outcome.source_stats {
            println!(
                "  {:<20} {:<12} {:>6} {:>5} {:>5} {:>5} {:>5} {:>9.1}",
                source_id,
                stats.status,
                stats.files_total,
                stats.files_new,
                stats.files_modified,
                stats.files_deleted,
                stats.errors,
                stats.duration_secs,
            );
        }
    }
}
