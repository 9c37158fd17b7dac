//! Core data models for the sync engine.
//!
//! These types mirror the catalog tables and the values that flow through
//! the sync pipeline. The data lifecycle is:
//!
//! ```text
//! FileSource → FileDescriptor → ChangeDetector → FileChange → FileProcessor
//!                                                                  ↓
//!                                                   RagStore + FileRecord
//! ```
//!
//! # Type Relationships
//!
//! - A **[`KnowledgeBase`]** (single-source) or **[`MultiSourceKnowledgeBase`]**
//!   names the source(s) and the RAG backend a sync operates on.
//! - A **[`SyncRun`]** is one durable execution against one KB.
//! - A **[`FileRecord`]** is one row per (sync run, URI) describing what the
//!   engine observed and did for that file.
//! - A **[`DeltaToken`]** is an opaque incremental cursor for a Graph-backed
//!   source drive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal and non-terminal states of a sync run.
///
/// Scan mode uses the parallel `Scan*` states so that scans are
/// distinguishable from real syncs in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRunStatus {
    Running,
    Completed,
    Failed,
    ScanRunning,
    ScanCompleted,
    ScanFailed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Completed => "completed",
            SyncRunStatus::Failed => "failed",
            SyncRunStatus::ScanRunning => "scan_running",
            SyncRunStatus::ScanCompleted => "scan_completed",
            SyncRunStatus::ScanFailed => "scan_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SyncRunStatus::Running),
            "completed" => Some(SyncRunStatus::Completed),
            "failed" => Some(SyncRunStatus::Failed),
            "scan_running" => Some(SyncRunStatus::ScanRunning),
            "scan_completed" => Some(SyncRunStatus::ScanCompleted),
            "scan_failed" => Some(SyncRunStatus::ScanFailed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncRunStatus::Running | SyncRunStatus::ScanRunning)
    }
}

/// Per-file outcome recorded in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    New,
    Modified,
    Unchanged,
    Deleted,
    Error,
    Scanned,
    ScanError,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::New => "new",
            FileStatus::Modified => "modified",
            FileStatus::Unchanged => "unchanged",
            FileStatus::Deleted => "deleted",
            FileStatus::Error => "error",
            FileStatus::Scanned => "scanned",
            FileStatus::ScanError => "scan_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(FileStatus::New),
            "modified" => Some(FileStatus::Modified),
            "unchanged" => Some(FileStatus::Unchanged),
            "deleted" => Some(FileStatus::Deleted),
            "error" => Some(FileStatus::Error),
            "scanned" => Some(FileStatus::Scanned),
            "scan_error" => Some(FileStatus::ScanError),
            _ => None,
        }
    }
}

/// How a multi-source sync fans out across its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Parallel,
    Sequential,
    Selective,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Parallel => "parallel",
            SyncMode::Sequential => "sequential",
            SyncMode::Selective => "selective",
            SyncMode::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parallel" => Some(SyncMode::Parallel),
            "sequential" => Some(SyncMode::Sequential),
            "selective" => Some(SyncMode::Selective),
            "incremental" => Some(SyncMode::Incremental),
            _ => None,
        }
    }
}

/// A single-source knowledge base: one source, one RAG backend.
///
/// `source_config` and `rag_config` are opaque JSON blobs interpreted by the
/// adapter factories ([`crate::source::create_source`],
/// [`crate::rag::create_rag`]).
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    pub id: i64,
    pub name: String,
    pub source_type: String,
    pub source_config: Value,
    pub rag_type: String,
    pub rag_config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One source within a multi-source knowledge base.
///
/// `source_id` is unique within its KB and restricted to `[A-Za-z0-9_]+` so
/// it can be embedded in filenames and delta-token keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDefinition {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub multi_source_kb_id: i64,
    pub source_id: String,
    pub source_type: String,
    pub source_config: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub metadata_tags: Value,
}

fn default_enabled() -> bool {
    true
}

/// A knowledge base aggregating several sources into a single RAG backend.
#[derive(Debug, Clone)]
pub struct MultiSourceKnowledgeBase {
    pub id: i64,
    pub name: String,
    pub rag_type: String,
    pub rag_config: Value,
    pub file_organization: Value,
    pub sync_strategy: Value,
    pub sources: Vec<SourceDefinition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MultiSourceKnowledgeBase {
    /// Sources with `enabled = true`, in declaration order.
    pub fn enabled_sources(&self) -> Vec<&SourceDefinition> {
        self.sources.iter().filter(|s| s.enabled).collect()
    }
}

/// Monotonic per-run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    pub total: i64,
    pub new: i64,
    pub modified: i64,
    pub unchanged: i64,
    pub deleted: i64,
    pub errors: i64,
}

impl SyncCounters {
    pub fn add(&mut self, other: &SyncCounters) {
        self.total += other.total;
        self.new += other.new;
        self.modified += other.modified;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
        self.errors += other.errors;
    }
}

/// One durable execution of the engine against one KB.
#[derive(Debug, Clone)]
pub struct SyncRun {
    pub id: i64,
    pub knowledge_base_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SyncRunStatus,
    pub total_files: i64,
    pub new_files: i64,
    pub modified_files: i64,
    pub deleted_files: i64,
    pub error_files: i64,
    pub error_message: Option<String>,
}

/// Per-source statistics stored on a multi-source run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStats {
    pub status: String,
    pub files_total: i64,
    pub files_new: i64,
    pub files_modified: i64,
    pub files_deleted: i64,
    pub errors: i64,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A sync run over a multi-source KB.
///
/// `compatible_kb_id` is the single-source KB id used to satisfy the
/// `sync_run` foreign key (the schema bridge); `multi_source_kb_id` is the
/// logical owner.
#[derive(Debug, Clone)]
pub struct MultiSourceSyncRun {
    pub id: i64,
    pub multi_source_kb_id: i64,
    pub compatible_kb_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SyncRunStatus,
    pub total_files: i64,
    pub new_files: i64,
    pub modified_files: i64,
    pub deleted_files: i64,
    pub error_files: i64,
    pub error_message: Option<String>,
    pub sync_mode: SyncMode,
    pub sources_processed: Vec<String>,
    pub source_stats: Value,
}

/// One row per (sync run, URI) in the audit log.
///
/// Invariants:
/// - `rag_uri` and `uuid_filename` are never null, even for error rows
///   (error rows carry the sentinel `"<kb>/error-<unix-ts>"`).
/// - Once assigned for a (KB, original_uri), `uuid_filename` is preserved
///   across every later record for that URI, including deletion and
///   restoration.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub sync_run_id: i64,
    pub original_uri: String,
    pub rag_uri: String,
    pub file_hash: String,
    pub uuid_filename: String,
    pub upload_time: DateTime<Utc>,
    pub file_size: i64,
    pub status: FileStatus,
    pub error_message: Option<String>,
    pub source_id: Option<String>,
    pub source_type: Option<String>,
    pub source_path: Option<String>,
    pub content_type: Option<String>,
    pub source_metadata: Option<Value>,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_modified_at: Option<DateTime<Utc>>,
    pub tags: Option<Value>,
}

/// Opaque incremental cursor for one (source, drive) pair.
#[derive(Debug, Clone)]
pub struct DeltaToken {
    pub source_id: String,
    pub source_type: String,
    pub drive_id: String,
    pub token: String,
    pub last_sync_time: DateTime<Utc>,
}

/// A file visible in a source listing, before any catalog comparison.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    /// Canonical identifier of the file within its source (a relative path
    /// for local sources, a drive path for Graph sources).
    pub uri: String,
    pub size: i64,
    pub content_type: String,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    /// Adapter-private metadata carried into `source_metadata` on the record.
    pub metadata: Value,
}

/// One element of a delta listing: a live file or a tombstone.
#[derive(Debug, Clone)]
pub enum DeltaEntry {
    Present(FileDescriptor),
    Tombstone { uri: String },
}
