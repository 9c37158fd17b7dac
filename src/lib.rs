//! # ragsync
//!
//! **A document synchronization engine: heterogeneous sources to RAG
//! storage, with a durable, auditable catalog.**
//!
//! ragsync brings files from external sources (local trees, SharePoint
//! document libraries, OneDrive) into a RAG storage backend (local tree,
//! Azure Blob, or an in-memory sink for tests), recording every file it has
//! ever seen in a relational catalog and moving only what changed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │  FileSource  │──▶│ ChangeDetector │──▶│ FileProcessor │
//! │ fs/SP/OneDr  │   │ size/mtime/hash│   │ fetch→hash→RAG│
//! └──────────────┘   └───────┬───────┘   └──────┬───────┘
//!                            │                  │
//!                      ┌─────▼──────────────────▼─────┐
//!                      │     Catalog (SQLite/sqlx)     │
//!                      │ kb · sync_run · file_record   │
//!                      │       · delta tokens          │
//!                      └──────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **multi-source driver** ([`multi_sync`]) or the CLI picks a KB
//!    and constructs adapters via the `(tag → factory)` registries in
//!    [`source`] and [`rag`].
//! 2. The **orchestrator** ([`sync`]) creates a durable sync run, lists the
//!    source (incrementally via [`delta`] tokens when supported), and hands
//!    the listing to the **change detector** ([`detector`]).
//! 3. Classifications stream through a bounded queue to a worker pool; the
//!    **file processor** ([`processor`]) fetches, hashes, writes the RAG
//!    backend, and records a [`models::FileRecord`] per file.
//! 4. Counters and the terminal state commit transactionally; delta tokens
//!    advance only on success.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Catalog records, enums, listing descriptors |
//! | [`config`] | Engine settings (TOML + env overrides) and logging init |
//! | [`db`] | SQLite connection pool (WAL, foreign keys on) |
//! | [`migrate`] | Idempotent catalog schema |
//! | [`repository`] | All catalog reads and writes |
//! | [`error`] | `SourceError` / `RagError` taxonomies |
//! | [`source`] | Source capability trait, filtering, factory |
//! | [`source_fs`] | Local file tree source |
//! | [`graph`] | Microsoft Graph client (auth, paging, delta) |
//! | [`source_sharepoint`] | SharePoint document libraries |
//! | [`source_onedrive`] | OneDrive user drives |
//! | [`rag`] | RAG capability trait and factory |
//! | [`rag_fs`] | Local tree backend with metadata sidecars |
//! | [`rag_azure`] | Azure Blob backend (Shared Key / OAuth) |
//! | [`rag_mock`] | In-memory recording backend |
//! | [`detector`] | NEW / MODIFIED / UNCHANGED / DELETED classification |
//! | [`processor`] | Per-file fetch, hash, identifiers, records |
//! | [`delta`] | Delta token lifecycle |
//! | [`sync`] | Sync-run orchestrator (workers, retries, cancellation) |
//! | [`multi_sync`] | Multi-source fan-out and the schema bridge |
//! | [`scan`] | Non-mutating scan runs |
//! | [`status`] | `status` / `info` command output |

pub mod config;
pub mod db;
pub mod delta;
pub mod detector;
pub mod error;
pub mod graph;
pub mod migrate;
pub mod models;
pub mod multi_sync;
pub mod processor;
pub mod rag;
pub mod rag_azure;
pub mod rag_fs;
pub mod rag_mock;
pub mod repository;
pub mod scan;
pub mod source;
pub mod source_fs;
pub mod source_onedrive;
pub mod source_sharepoint;
pub mod status;
pub mod sync;
