//! Catalog repository: the durable record of KBs, sync runs, file records,
//! and delta tokens.
//!
//! All engine components go through this type; it owns no business logic
//! beyond query shape. Timestamps are stored as Unix epoch seconds for
//! efficient comparison and indexing.
//!
//! # Latest-record semantics
//!
//! [`Repository::latest_records_by_kb`] returns, for each URI ever seen
//! under a KB, the most recent [`FileRecord`] ordered by the owning run's
//! `start_time` (ties broken by insertion id). Rows with status `scanned` /
//! `scan_error` are excluded: scans are audit-only and must not influence
//! change detection. Insertion order within a run is irrelevant by design.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::models::{
    FileRecord, FileStatus, KnowledgeBase, MultiSourceKnowledgeBase, MultiSourceSyncRun,
    SourceDefinition, SyncCounters, SyncMode, SyncRun, SyncRunStatus,
};

#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn json_or_empty(raw: Option<String>) -> Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| Value::Object(Default::default()))
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── Knowledge bases ────────────────────────────────────────────────

    /// Insert a single-source KB. The name must be unique across both the
    /// single-source and multi-source tables so that lookups by name stay
    /// unambiguous.
    pub async fn create_knowledge_base(
        &self,
        name: &str,
        source_type: &str,
        source_config: &Value,
        rag_type: &str,
        rag_config: &Value,
    ) -> Result<i64> {
        if self.multi_source_kb_name_exists(name).await? {
            anyhow::bail!("a multi-source knowledge base named '{name}' already exists");
        }

        let now = ts(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO knowledge_base (name, source_type, source_config, rag_type, rag_config, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(source_type)
        .bind(source_config.to_string())
        .bind(rag_type)
        .bind(rag_config.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create knowledge base '{name}'"))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_knowledge_base_by_name(&self, name: &str) -> Result<Option<KnowledgeBase>> {
        let row = sqlx::query("SELECT * FROM knowledge_base WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| knowledge_base_from_row(&r)).transpose()
    }

    pub async fn get_knowledge_base(&self, id: i64) -> Result<Option<KnowledgeBase>> {
        let row = sqlx::query("SELECT * FROM knowledge_base WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| knowledge_base_from_row(&r)).transpose()
    }

    pub async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>> {
        let rows = sqlx::query("SELECT * FROM knowledge_base ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(knowledge_base_from_row).collect()
    }

    /// Lowest-id single-source KB whose name matches the SQL LIKE pattern.
    /// Used by the multi-source schema bridge.
    pub async fn find_knowledge_base_like(&self, pattern: &str) -> Result<Option<i64>> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM knowledge_base WHERE name LIKE ? ORDER BY id LIMIT 1")
                .bind(pattern)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id)
    }

    async fn multi_source_kb_name_exists(&self, name: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM multi_source_knowledge_base WHERE name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Insert a multi-source KB with its source definitions in one
    /// transaction. Validates `source_id` charset before touching the DB.
    pub async fn create_multi_source_kb(
        &self,
        name: &str,
        rag_type: &str,
        rag_config: &Value,
        file_organization: &Value,
        sync_strategy: &Value,
        sources: &[SourceDefinition],
    ) -> Result<i64> {
        let existing = self.get_knowledge_base_by_name(name).await?;
        if existing.is_some() {
            anyhow::bail!("a knowledge base named '{name}' already exists");
        }
        for def in sources {
            if !is_valid_source_id(&def.source_id) {
                anyhow::bail!(
                    "invalid source_id '{}': only [A-Za-z0-9_] is allowed",
                    def.source_id
                );
            }
        }

        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO multi_source_knowledge_base
                (name, rag_type, rag_config, file_organization, sync_strategy, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(rag_type)
        .bind(rag_config.to_string())
        .bind(file_organization.to_string())
        .bind(sync_strategy.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to create multi-source knowledge base '{name}'"))?;

        let kb_id = result.last_insert_rowid();

        for def in sources {
            sqlx::query(
                r#"
                INSERT INTO source_definition
                    (multi_source_kb_id, source_id, source_type, source_config, enabled, metadata_tags)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(kb_id)
            .bind(&def.source_id)
            .bind(&def.source_type)
            .bind(def.source_config.to_string())
            .bind(def.enabled)
            .bind(def.metadata_tags.to_string())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert source definition '{}'", def.source_id))?;
        }

        tx.commit().await?;
        Ok(kb_id)
    }

    pub async fn get_multi_source_kb_by_name(
        &self,
        name: &str,
    ) -> Result<Option<MultiSourceKnowledgeBase>> {
        let row = sqlx::query("SELECT * FROM multi_source_knowledge_base WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut kb = multi_source_kb_from_row(&row)?;

        let source_rows =
            sqlx::query("SELECT * FROM source_definition WHERE multi_source_kb_id = ? ORDER BY id")
                .bind(kb.id)
                .fetch_all(&self.pool)
                .await?;
        kb.sources = source_rows
            .iter()
            .map(source_definition_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(kb))
    }

    // ── Sync runs ──────────────────────────────────────────────────────

    /// Create a sync run in the given non-terminal state; returns the run
    /// with its assigned id and start time.
    pub async fn create_sync_run(&self, kb_id: i64, status: SyncRunStatus) -> Result<SyncRun> {
        let start = Utc::now();
        let result = sqlx::query(
            "INSERT INTO sync_run (knowledge_base_id, start_time, status) VALUES (?, ?, ?)",
        )
        .bind(kb_id)
        .bind(ts(start))
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to create sync run")?;

        Ok(SyncRun {
            id: result.last_insert_rowid(),
            knowledge_base_id: kb_id,
            start_time: start,
            end_time: None,
            status,
            total_files: 0,
            new_files: 0,
            modified_files: 0,
            deleted_files: 0,
            error_files: 0,
            error_message: None,
        })
    }

    /// Write the final counters and the terminal state transition in a
    /// single transaction.
    pub async fn finalize_sync_run(
        &self,
        sync_run_id: i64,
        counters: &SyncCounters,
        status: SyncRunStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE sync_run
            SET end_time = ?, status = ?, total_files = ?, new_files = ?,
                modified_files = ?, deleted_files = ?, error_files = ?, error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(ts(Utc::now()))
        .bind(status.as_str())
        .bind(counters.total)
        .bind(counters.new)
        .bind(counters.modified)
        .bind(counters.deleted)
        .bind(counters.errors)
        .bind(error_message)
        .bind(sync_run_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_sync_run(&self, id: i64) -> Result<Option<SyncRun>> {
        let row = sqlx::query("SELECT * FROM sync_run WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| sync_run_from_row(&r)).transpose()
    }

    pub async fn list_sync_runs(&self, kb_id: i64, limit: i64) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_run WHERE knowledge_base_id = ? ORDER BY start_time DESC, id DESC LIMIT ?",
        )
        .bind(kb_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sync_run_from_row).collect()
    }

    /// Mark abandoned runs (non-terminal state, process gone) as failed.
    /// Records are never deleted.
    pub async fn fail_abandoned_runs(&self, kb_id: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_run
            SET status = CASE status WHEN 'scan_running' THEN 'scan_failed' ELSE 'failed' END,
                end_time = ?, error_message = 'abandoned'
            WHERE knowledge_base_id = ? AND status IN ('running', 'scan_running')
            "#,
        )
        .bind(ts(Utc::now()))
        .bind(kb_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ── Multi-source sync runs ─────────────────────────────────────────

    pub async fn create_multi_source_sync_run(
        &self,
        multi_kb_id: i64,
        compatible_kb_id: i64,
        sync_mode: SyncMode,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO multi_source_sync_run
                (multi_source_kb_id, compatible_kb_id, start_time, status, sync_mode)
            VALUES (?, ?, ?, 'running', ?)
            "#,
        )
        .bind(multi_kb_id)
        .bind(compatible_kb_id)
        .bind(ts(Utc::now()))
        .bind(sync_mode.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to create multi-source sync run")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn finalize_multi_source_sync_run(
        &self,
        run_id: i64,
        counters: &SyncCounters,
        status: SyncRunStatus,
        error_message: Option<&str>,
        sources_processed: &[String],
        source_stats: &Value,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE multi_source_sync_run
            SET end_time = ?, status = ?, total_files = ?, new_files = ?,
                modified_files = ?, deleted_files = ?, error_files = ?,
                error_message = ?, sources_processed = ?, source_stats = ?
            WHERE id = ?
            "#,
        )
        .bind(ts(Utc::now()))
        .bind(status.as_str())
        .bind(counters.total)
        .bind(counters.new)
        .bind(counters.modified)
        .bind(counters.deleted)
        .bind(counters.errors)
        .bind(error_message)
        .bind(serde_json::to_string(sources_processed)?)
        .bind(source_stats.to_string())
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_multi_source_sync_run(&self, id: i64) -> Result<Option<MultiSourceSyncRun>> {
        let row = sqlx::query("SELECT * FROM multi_source_sync_run WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| multi_source_sync_run_from_row(&r)).transpose()
    }

    pub async fn list_multi_source_sync_runs(
        &self,
        multi_kb_id: i64,
        limit: i64,
    ) -> Result<Vec<MultiSourceSyncRun>> {
        let rows = sqlx::query(
            "SELECT * FROM multi_source_sync_run WHERE multi_source_kb_id = ? ORDER BY start_time DESC, id DESC LIMIT ?",
        )
        .bind(multi_kb_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(multi_source_sync_run_from_row).collect()
    }

    // ── File records ───────────────────────────────────────────────────

    pub async fn insert_file_record(&self, record: &FileRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO file_record
                (sync_run_id, original_uri, rag_uri, file_hash, uuid_filename, upload_time,
                 file_size, status, error_message, source_id, source_type, source_path,
                 content_type, source_metadata, source_created_at, source_modified_at, tags)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.sync_run_id)
        .bind(&record.original_uri)
        .bind(&record.rag_uri)
        .bind(&record.file_hash)
        .bind(&record.uuid_filename)
        .bind(ts(record.upload_time))
        .bind(record.file_size)
        .bind(record.status.as_str())
        .bind(&record.error_message)
        .bind(&record.source_id)
        .bind(&record.source_type)
        .bind(&record.source_path)
        .bind(&record.content_type)
        .bind(record.source_metadata.as_ref().map(|v| v.to_string()))
        .bind(record.source_created_at.map(ts))
        .bind(record.source_modified_at.map(ts))
        .bind(record.tags.as_ref().map(|v| v.to_string()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert file record for '{}'", record.original_uri))?;

        Ok(result.last_insert_rowid())
    }

    /// The most recent record per URI ever seen under this KB, keyed by
    /// `original_uri`. Scan rows are excluded (audit-only).
    pub async fn latest_records_by_kb(&self, kb_name: &str) -> Result<HashMap<String, FileRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT fr.* FROM file_record fr
            JOIN sync_run sr ON sr.id = fr.sync_run_id
            JOIN knowledge_base kb ON kb.id = sr.knowledge_base_id
            WHERE kb.name = ? AND fr.status NOT IN ('scanned', 'scan_error')
            ORDER BY sr.start_time ASC, fr.id ASC
            "#,
        )
        .bind(kb_name)
        .fetch_all(&self.pool)
        .await?;

        let mut latest = HashMap::new();
        for row in &rows {
            let record = file_record_from_row(row)?;
            latest.insert(record.original_uri.clone(), record);
        }
        Ok(latest)
    }

    /// Full history for one URI under a KB, oldest first.
    pub async fn records_by_uri(&self, kb_id: i64, original_uri: &str) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT fr.* FROM file_record fr
            JOIN sync_run sr ON sr.id = fr.sync_run_id
            WHERE sr.knowledge_base_id = ? AND fr.original_uri = ?
            ORDER BY sr.start_time ASC, fr.id ASC
            "#,
        )
        .bind(kb_id)
        .bind(original_uri)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_record_from_row).collect()
    }

    pub async fn records_by_run(&self, sync_run_id: i64) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query("SELECT * FROM file_record WHERE sync_run_id = ? ORDER BY id")
            .bind(sync_run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(file_record_from_row).collect()
    }

    // ── Delta tokens ───────────────────────────────────────────────────

    pub async fn get_delta_token(
        &self,
        source_id: &str,
        drive_id: &str,
    ) -> Result<Option<String>> {
        let token: Option<String> = sqlx::query_scalar(
            "SELECT delta_token FROM delta_sync_tokens WHERE source_id = ? AND drive_id = ?",
        )
        .bind(source_id)
        .bind(drive_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    pub async fn save_delta_token(
        &self,
        source_id: &str,
        source_type: &str,
        drive_id: &str,
        token: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delta_sync_tokens (source_id, source_type, drive_id, delta_token, last_sync_time)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source_id, drive_id) DO UPDATE SET
                delta_token = excluded.delta_token,
                source_type = excluded.source_type,
                last_sync_time = excluded.last_sync_time
            "#,
        )
        .bind(source_id)
        .bind(source_type)
        .bind(drive_id)
        .bind(token)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_delta_token(&self, source_id: &str, drive_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM delta_sync_tokens WHERE source_id = ? AND drive_id = ?")
            .bind(source_id)
            .bind(drive_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// `source_id` values are embedded in filenames and delta-token keys;
/// only `[A-Za-z0-9_]+` is allowed.
pub fn is_valid_source_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ── Row mapping ────────────────────────────────────────────────────────

fn knowledge_base_from_row(row: &SqliteRow) -> Result<KnowledgeBase> {
    Ok(KnowledgeBase {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        source_type: row.try_get("source_type")?,
        source_config: json_or_empty(row.try_get("source_config")?),
        rag_type: row.try_get("rag_type")?,
        rag_config: json_or_empty(row.try_get("rag_config")?),
        created_at: from_ts(row.try_get("created_at")?),
        updated_at: from_ts(row.try_get("updated_at")?),
    })
}

fn multi_source_kb_from_row(row: &SqliteRow) -> Result<MultiSourceKnowledgeBase> {
    Ok(MultiSourceKnowledgeBase {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        rag_type: row.try_get("rag_type")?,
        rag_config: json_or_empty(row.try_get("rag_config")?),
        file_organization: json_or_empty(row.try_get("file_organization")?),
        sync_strategy: json_or_empty(row.try_get("sync_strategy")?),
        sources: Vec::new(),
        created_at: from_ts(row.try_get("created_at")?),
        updated_at: from_ts(row.try_get("updated_at")?),
    })
}

fn source_definition_from_row(row: &SqliteRow) -> Result<SourceDefinition> {
    Ok(SourceDefinition {
        id: row.try_get("id")?,
        multi_source_kb_id: row.try_get("multi_source_kb_id")?,
        source_id: row.try_get("source_id")?,
        source_type: row.try_get("source_type")?,
        source_config: json_or_empty(row.try_get("source_config")?),
        enabled: row.try_get("enabled")?,
        metadata_tags: json_or_empty(row.try_get("metadata_tags")?),
    })
}

fn multi_source_sync_run_from_row(row: &SqliteRow) -> Result<MultiSourceSyncRun> {
    let status: String = row.try_get("status")?;
    let mode: String = row.try_get("sync_mode")?;
    Ok(MultiSourceSyncRun {
        id: row.try_get("id")?,
        multi_source_kb_id: row.try_get("multi_source_kb_id")?,
        compatible_kb_id: row.try_get::<Option<i64>, _>("compatible_kb_id")?.unwrap_or(0),
        start_time: from_ts(row.try_get("start_time")?),
        end_time: row.try_get::<Option<i64>, _>("end_time")?.map(from_ts),
        status: SyncRunStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("unknown sync run status '{status}'"))?,
        total_files: row.try_get("total_files")?,
        new_files: row.try_get("new_files")?,
        modified_files: row.try_get("modified_files")?,
        deleted_files: row.try_get("deleted_files")?,
        error_files: row.try_get("error_files")?,
        error_message: row.try_get("error_message")?,
        sync_mode: SyncMode::parse(&mode)
            .ok_or_else(|| anyhow::anyhow!("unknown sync mode '{mode}'"))?,
        sources_processed: row
            .try_get::<Option<String>, _>("sources_processed")?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        source_stats: json_or_empty(row.try_get("source_stats")?),
    })
}

fn sync_run_from_row(row: &SqliteRow) -> Result<SyncRun> {
    let status: String = row.try_get("status")?;
    Ok(SyncRun {
        id: row.try_get("id")?,
        knowledge_base_id: row.try_get("knowledge_base_id")?,
        start_time: from_ts(row.try_get("start_time")?),
        end_time: row.try_get::<Option<i64>, _>("end_time")?.map(from_ts),
        status: SyncRunStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("unknown sync run status '{status}'"))?,
        total_files: row.try_get("total_files")?,
        new_files: row.try_get("new_files")?,
        modified_files: row.try_get("modified_files")?,
        deleted_files: row.try_get("deleted_files")?,
        error_files: row.try_get("error_files")?,
        error_message: row.try_get("error_message")?,
    })
}

fn file_record_from_row(row: &SqliteRow) -> Result<FileRecord> {
    let status: String = row.try_get("status")?;
    Ok(FileRecord {
        id: row.try_get("id")?,
        sync_run_id: row.try_get("sync_run_id")?,
        original_uri: row.try_get("original_uri")?,
        rag_uri: row.try_get("rag_uri")?,
        file_hash: row.try_get("file_hash")?,
        uuid_filename: row.try_get("uuid_filename")?,
        upload_time: from_ts(row.try_get("upload_time")?),
        file_size: row.try_get("file_size")?,
        status: FileStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("unknown file status '{status}'"))?,
        error_message: row.try_get("error_message")?,
        source_id: row.try_get("source_id")?,
        source_type: row.try_get("source_type")?,
        source_path: row.try_get("source_path")?,
        content_type: row.try_get("content_type")?,
        source_metadata: row
            .try_get::<Option<String>, _>("source_metadata")?
            .and_then(|s| serde_json::from_str(&s).ok()),
        source_created_at: row
            .try_get::<Option<i64>, _>("source_created_at")?
            .map(from_ts),
        source_modified_at: row
            .try_get::<Option<i64>, _>("source_modified_at")?
            .map(from_ts),
        tags: row
            .try_get::<Option<String>, _>("tags")?
            .and_then(|s| serde_json::from_str(&s).ok()),
    })
}
