//! Catalog schema migrations.
//!
//! Creates all required tables and ensures idempotent execution.
//! Designed to be run via `ragsync init`.
//!
//! # Schema
//!
//! ```text
//! ┌──────────────────┐      ┌──────────────┐      ┌──────────────┐
//! │ knowledge_base   │──┐   │  sync_run    │──┐   │ file_record  │
//! │                  │  │   │              │  │   │              │
//! │ id (PK)          │  └───│ kb_id (FK)   │  └───│ sync_run_id  │
//! │ name UNIQUE      │      │ start_time   │      │ original_uri │
//! │ source_type      │      │ end_time     │      │ rag_uri      │
//! │ source_config    │      │ status       │      │ file_hash    │
//! │ rag_type         │      │ counters…    │      │ uuid_filename│
//! │ rag_config       │      └──────────────┘      │ status       │
//! └──────────────────┘                            │ source_id…   │
//!                                                 └──────────────┘
//! ┌──────────────────────────┐   ┌───────────────────┐
//! │ multi_source_            │──┐│ source_definition │
//! │ knowledge_base           │  └│ multi_kb_id (FK)  │
//! │ id, name UNIQUE          │   │ source_id         │
//! │ rag_type, rag_config     │   │ source_type       │
//! │ file_organization        │   │ source_config     │
//! │ sync_strategy            │   │ enabled           │
//! └──────────────────────────┘   └───────────────────┘
//!
//! ┌────────────────────────┐   ┌────────────────────┐
//! │ multi_source_sync_run  │   │ delta_sync_tokens  │
//! │ multi_kb_id (FK)       │   │ UNIQUE(source_id,  │
//! │ compatible_kb_id       │   │        drive_id)   │
//! │ sync_mode, source_stats│   │ delta_token        │
//! └────────────────────────┘   └────────────────────┘
//! ```
//!
//! # Indexes
//!
//! - `idx_file_record_original_uri` — change-detection lookups by URI
//! - `idx_file_record_sync_run_id` — join to the owning run
//! - `idx_sync_run_kb_start` — latest-run-first queries per KB
//!
//! # Idempotency
//!
//! All statements use `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT
//! EXISTS`. Running `ragsync init` multiple times is safe.

use anyhow::Result;
use sqlx::SqlitePool;

/// Run all catalog migrations. Safe to call multiple times.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_base (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            source_type TEXT NOT NULL,
            source_config TEXT NOT NULL DEFAULT '{}',
            rag_type TEXT NOT NULL,
            rag_config TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS multi_source_knowledge_base (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            rag_type TEXT NOT NULL,
            rag_config TEXT NOT NULL DEFAULT '{}',
            file_organization TEXT NOT NULL DEFAULT '{}',
            sync_strategy TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_definition (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            multi_source_kb_id INTEGER NOT NULL,
            source_id TEXT NOT NULL,
            source_type TEXT NOT NULL,
            source_config TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            metadata_tags TEXT NOT NULL DEFAULT '{}',
            UNIQUE(multi_source_kb_id, source_id),
            CHECK(length(source_id) > 0 AND source_id NOT GLOB '*[^A-Za-z0-9_]*'),
            FOREIGN KEY (multi_source_kb_id) REFERENCES multi_source_knowledge_base(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_run (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            knowledge_base_id INTEGER NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER,
            status TEXT NOT NULL DEFAULT 'running',
            total_files INTEGER NOT NULL DEFAULT 0,
            new_files INTEGER NOT NULL DEFAULT 0,
            modified_files INTEGER NOT NULL DEFAULT 0,
            deleted_files INTEGER NOT NULL DEFAULT 0,
            error_files INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            FOREIGN KEY (knowledge_base_id) REFERENCES knowledge_base(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS multi_source_sync_run (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            multi_source_kb_id INTEGER NOT NULL,
            compatible_kb_id INTEGER,
            start_time INTEGER NOT NULL,
            end_time INTEGER,
            status TEXT NOT NULL DEFAULT 'running',
            total_files INTEGER NOT NULL DEFAULT 0,
            new_files INTEGER NOT NULL DEFAULT 0,
            modified_files INTEGER NOT NULL DEFAULT 0,
            deleted_files INTEGER NOT NULL DEFAULT 0,
            error_files INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            sync_mode TEXT NOT NULL DEFAULT 'parallel',
            sources_processed TEXT NOT NULL DEFAULT '[]',
            source_stats TEXT NOT NULL DEFAULT '{}',
            FOREIGN KEY (multi_source_kb_id) REFERENCES multi_source_knowledge_base(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_record (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sync_run_id INTEGER NOT NULL,
            original_uri TEXT NOT NULL,
            rag_uri TEXT NOT NULL,
            file_hash TEXT NOT NULL DEFAULT '',
            uuid_filename TEXT NOT NULL DEFAULT '',
            upload_time INTEGER NOT NULL,
            file_size INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            error_message TEXT,
            source_id TEXT,
            source_type TEXT,
            source_path TEXT,
            content_type TEXT,
            source_metadata TEXT,
            source_created_at INTEGER,
            source_modified_at INTEGER,
            tags TEXT,
            FOREIGN KEY (sync_run_id) REFERENCES sync_run(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS delta_sync_tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id TEXT NOT NULL,
            source_type TEXT NOT NULL,
            drive_id TEXT NOT NULL,
            delta_token TEXT NOT NULL,
            last_sync_time INTEGER NOT NULL,
            UNIQUE(source_id, drive_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for the change-detection query path
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_record_original_uri ON file_record(original_uri)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_record_sync_run_id ON file_record(sync_run_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_run_kb_start ON sync_run(knowledge_base_id, start_time DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
