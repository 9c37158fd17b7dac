//! Per-file processing: fetch, hash, identifier assignment, RAG write,
//! catalog record.
//!
//! # Identifier policy
//!
//! - `uuid_filename` is a random UUIDv4 plus the original file's extension
//!   (lowercased, leading dot). It is chosen once per (KB, original_uri)
//!   and preserved in every subsequent record for that URI — through
//!   deletion and later restoration.
//! - `Upload` is called exactly once per logical lifetime (first appearance
//!   or post-deletion restoration). Modifications go through `Update` with
//!   the existing `rag_uri`.
//!
//! # Error recording
//!
//! Adapter failures never fail the run. After the orchestrator exhausts
//! retries, [`FileProcessor::record_error`] writes a well-formed error row:
//! `rag_uri` gets the sentinel `"<kb>/error-<unix-ts>"`, `file_hash` and
//! `uuid_filename` are empty strings, `error_message` is populated. Only a
//! catalog write failure is fatal.

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::detector::{ChangeType, FileChange};
use crate::error::SourceError;
use crate::models::{FileDescriptor, FileRecord, FileStatus};
use crate::rag::RagStore;
use crate::repository::Repository;
use crate::source::FileSource;

/// Identity and tagging of the source a file came from, plus the label
/// used for sentinels and RAG metadata.
#[derive(Debug, Clone)]
pub struct SourceContext {
    /// Logical KB name (the multi-source KB's own name when bridged).
    pub kb_label: String,
    /// Multi-source source id; `None` for single-source KBs.
    pub source_id: Option<String>,
    pub source_type: String,
    pub metadata_tags: Value,
    /// Optional filename template from the KB's file-organization policy,
    /// e.g. `"{source_id}_{uuid}{extension}"`.
    pub naming_convention: Option<String>,
}

impl SourceContext {
    pub fn single(kb_label: &str, source_type: &str) -> Self {
        Self {
            kb_label: kb_label.to_string(),
            source_id: None,
            source_type: source_type.to_string(),
            metadata_tags: Value::Null,
            naming_convention: None,
        }
    }
}

/// A failed processing attempt.
#[derive(Debug)]
pub enum AttemptError {
    /// Source or RAG adapter failure; retried when transient, then
    /// recorded as an error row.
    Adapter { message: String, transient: bool },
    /// Catalog write failure; fatal to the run.
    Fatal(anyhow::Error),
}

impl AttemptError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AttemptError::Adapter { transient: true, .. })
    }

    pub fn message(&self) -> String {
        match self {
            AttemptError::Adapter { message, .. } => message.clone(),
            AttemptError::Fatal(e) => e.to_string(),
        }
    }

    fn from_source(e: SourceError) -> Self {
        AttemptError::Adapter {
            transient: e.is_transient(),
            message: e.to_string(),
        }
    }

    fn from_rag(e: crate::error::RagError) -> Self {
        AttemptError::Adapter {
            transient: e.is_transient(),
            message: e.to_string(),
        }
    }
}

pub struct FileProcessor {
    ctx: SourceContext,
    /// Scan mode: classify and record, never touch the RAG backend.
    scan: bool,
}

impl FileProcessor {
    pub fn new(ctx: SourceContext, scan: bool) -> Self {
        Self { ctx, scan }
    }

    /// Process one classification. Returns the counted outcome, or `None`
    /// when the file vanished before it could be fetched and there was
    /// nothing to record.
    pub async fn attempt(
        &self,
        source: &dyn FileSource,
        rag: &dyn RagStore,
        repo: &Repository,
        sync_run_id: i64,
        change: &FileChange,
    ) -> Result<Option<FileStatus>, AttemptError> {
        match change.change_type {
            ChangeType::Deleted => self.process_deleted(rag, repo, sync_run_id, change).await,
            ChangeType::Unchanged => Ok(Some(FileStatus::Unchanged)),
            ChangeType::New | ChangeType::Modified => {
                self.process_present(source, rag, repo, sync_run_id, change).await
            }
        }
    }

    async fn process_present(
        &self,
        source: &dyn FileSource,
        rag: &dyn RagStore,
        repo: &Repository,
        sync_run_id: i64,
        change: &FileChange,
    ) -> Result<Option<FileStatus>, AttemptError> {
        let fetched = match source.fetch(&change.uri).await {
            Ok(f) => f,
            Err(SourceError::NotFound(_)) => {
                // Deleted between listing and fetch. If the catalog holds a
                // live record, treat it as the deletion it is; otherwise
                // there is nothing to record.
                let live_existing = change
                    .existing
                    .as_ref()
                    .map(|r| r.status != FileStatus::Deleted)
                    .unwrap_or(false);
                if change.change_type == ChangeType::Modified && live_existing {
                    tracing::debug!(uri = %change.uri, "file vanished before fetch; deleting");
                    return self.process_deleted(rag, repo, sync_run_id, change).await;
                }
                tracing::debug!(uri = %change.uri, "file vanished before first fetch; skipping");
                return Ok(None);
            }
            Err(e) => return Err(AttemptError::from_source(e)),
        };

        let file_hash = sha256_hex(&fetched.content);
        let descriptor = change.descriptor.as_ref();

        if self.scan {
            return self
                .record_scanned(repo, sync_run_id, change, &file_hash, fetched.size)
                .await;
        }

        match change.change_type {
            ChangeType::New => {
                let existing_uuid = change
                    .existing
                    .as_ref()
                    .map(|r| r.uuid_filename.as_str())
                    .filter(|u| !u.is_empty());
                let uuid_filename = generate_uuid_filename(
                    &change.uri,
                    existing_uuid,
                    self.ctx.naming_convention.as_deref(),
                    self.ctx.source_id.as_deref(),
                );

                let metadata = self.rag_metadata(change, &file_hash);
                let rag_uri = rag
                    .upload(&fetched.content, &uuid_filename, &metadata)
                    .await
                    .map_err(AttemptError::from_rag)?;

                let record = self.build_record(
                    sync_run_id,
                    change,
                    descriptor,
                    rag_uri,
                    file_hash,
                    uuid_filename,
                    fetched.size,
                    FileStatus::New,
                    None,
                );
                repo.insert_file_record(&record)
                    .await
                    .map_err(AttemptError::Fatal)?;
                Ok(Some(FileStatus::New))
            }
            ChangeType::Modified => {
                let existing = change.existing.as_ref().ok_or_else(|| {
                    AttemptError::Fatal(anyhow::anyhow!(
                        "modified classification without an existing record for '{}'",
                        change.uri
                    ))
                })?;

                if change.hash_check && file_hash == existing.file_hash {
                    // Content identical after all: downgrade in place. The
                    // fetch was paid for, so the row records the verification.
                    let record = self.build_record(
                        sync_run_id,
                        change,
                        descriptor,
                        existing.rag_uri.clone(),
                        file_hash,
                        existing.uuid_filename.clone(),
                        fetched.size,
                        FileStatus::Unchanged,
                        None,
                    );
                    repo.insert_file_record(&record)
                        .await
                        .map_err(AttemptError::Fatal)?;
                    return Ok(Some(FileStatus::Unchanged));
                }

                let metadata = self.rag_metadata(change, &file_hash);
                rag.update(&existing.rag_uri, &fetched.content, &metadata)
                    .await
                    .map_err(AttemptError::from_rag)?;

                let record = self.build_record(
                    sync_run_id,
                    change,
                    descriptor,
                    existing.rag_uri.clone(),
                    file_hash,
                    existing.uuid_filename.clone(),
                    fetched.size,
                    FileStatus::Modified,
                    None,
                );
                repo.insert_file_record(&record)
                    .await
                    .map_err(AttemptError::Fatal)?;
                Ok(Some(FileStatus::Modified))
            }
            _ => unreachable!("process_present only sees new/modified"),
        }
    }

    async fn process_deleted(
        &self,
        rag: &dyn RagStore,
        repo: &Repository,
        sync_run_id: i64,
        change: &FileChange,
    ) -> Result<Option<FileStatus>, AttemptError> {
        let Some(existing) = change.existing.as_ref() else {
            return Ok(None);
        };

        if self.scan {
            // A scan must not flip catalog state for a file whose artifact
            // still exists; the deletion is reported, not recorded.
            return Ok(Some(FileStatus::Deleted));
        }

        match rag.delete(&existing.rag_uri).await {
            Ok(()) => {}
            Err(crate::error::RagError::NotFound(_)) => {
                tracing::debug!(rag_uri = %existing.rag_uri, "artifact already gone");
            }
            Err(e) => return Err(AttemptError::from_rag(e)),
        }

        let record = self.build_record(
            sync_run_id,
            change,
            None,
            existing.rag_uri.clone(),
            String::new(),
            existing.uuid_filename.clone(),
            existing.file_size,
            FileStatus::Deleted,
            None,
        );
        repo.insert_file_record(&record)
            .await
            .map_err(AttemptError::Fatal)?;
        Ok(Some(FileStatus::Deleted))
    }

    async fn record_scanned(
        &self,
        repo: &Repository,
        sync_run_id: i64,
        change: &FileChange,
        file_hash: &str,
        size: i64,
    ) -> Result<Option<FileStatus>, AttemptError> {
        if change.hash_check {
            if let Some(existing) = change.existing.as_ref() {
                if file_hash == existing.file_hash {
                    return Ok(Some(FileStatus::Unchanged));
                }
            }
        }

        let (rag_uri, uuid_filename) = match change.existing.as_ref() {
            Some(r) if !r.rag_uri.is_empty() => (r.rag_uri.clone(), r.uuid_filename.clone()),
            _ => (
                format!("{}/scan-{}", self.ctx.kb_label, Utc::now().timestamp()),
                String::new(),
            ),
        };

        let record = self.build_record(
            sync_run_id,
            change,
            change.descriptor.as_ref(),
            rag_uri,
            file_hash.to_string(),
            uuid_filename,
            size,
            FileStatus::Scanned,
            None,
        );
        repo.insert_file_record(&record)
            .await
            .map_err(AttemptError::Fatal)?;

        // Counters track what the scan observed, not the row status.
        Ok(Some(match change.change_type {
            ChangeType::New => FileStatus::New,
            _ => FileStatus::Modified,
        }))
    }

    /// Write the error row after retries are exhausted. Well-formed by
    /// construction: non-null sentinel `rag_uri`, empty hash and UUID.
    pub async fn record_error(
        &self,
        repo: &Repository,
        sync_run_id: i64,
        change: &FileChange,
        message: &str,
    ) -> anyhow::Result<()> {
        let status = if self.scan {
            FileStatus::ScanError
        } else {
            FileStatus::Error
        };
        let record = self.build_record(
            sync_run_id,
            change,
            change.descriptor.as_ref(),
            format!("{}/error-{}", self.ctx.kb_label, Utc::now().timestamp()),
            String::new(),
            String::new(),
            0,
            status,
            Some(message.to_string()),
        );
        repo.insert_file_record(&record).await?;
        Ok(())
    }

    fn rag_metadata(&self, change: &FileChange, file_hash: &str) -> Value {
        let mut metadata = serde_json::json!({
            "original_uri": change.uri,
            "kb_name": self.ctx.kb_label,
            "file_hash": file_hash,
            "source_type": self.ctx.source_type,
            "source_path": change.uri,
        });
        if let Some(id) = &self.ctx.source_id {
            metadata["source_id"] = Value::String(id.clone());
        }
        if let Some(d) = change.descriptor.as_ref() {
            if let Some(mtime) = d.modified_at {
                metadata["source_modified_at"] = Value::String(mtime.to_rfc3339());
            }
        }
        metadata
    }

    #[allow(clippy::too_many_arguments)]
    fn build_record(
        &self,
        sync_run_id: i64,
        change: &FileChange,
        descriptor: Option<&FileDescriptor>,
        rag_uri: String,
        file_hash: String,
        uuid_filename: String,
        file_size: i64,
        status: FileStatus,
        error_message: Option<String>,
    ) -> FileRecord {
        FileRecord {
            id: 0,
            sync_run_id,
            original_uri: change.uri.clone(),
            rag_uri,
            file_hash,
            uuid_filename,
            upload_time: Utc::now(),
            file_size,
            status,
            error_message,
            source_id: self.ctx.source_id.clone(),
            source_type: Some(self.ctx.source_type.clone()),
            source_path: Some(change.uri.clone()),
            content_type: descriptor.map(|d| d.content_type.clone()),
            source_metadata: descriptor
                .map(|d| d.metadata.clone())
                .filter(|m| !m.is_null()),
            source_created_at: descriptor.and_then(|d| d.created_at),
            source_modified_at: descriptor.and_then(|d| d.modified_at),
            tags: match &self.ctx.metadata_tags {
                Value::Null => None,
                other => Some(other.clone()),
            },
        }
    }
}

/// Hex-encoded SHA-256 of the content.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Pick the UUID filename for a file.
///
/// An existing name is preserved verbatim up to its first dot, re-suffixed
/// with the current extension — this is the restoration path. Fresh names
/// are a v4 UUID plus the lowercased extension, optionally templated by the
/// KB's naming convention.
pub fn generate_uuid_filename(
    original_uri: &str,
    existing: Option<&str>,
    naming_convention: Option<&str>,
    source_id: Option<&str>,
) -> String {
    let extension = file_extension(original_uri);

    if let Some(existing) = existing {
        let stem = existing.split('.').next().unwrap_or(existing);
        return format!("{stem}{extension}");
    }

    let uuid = Uuid::new_v4().to_string();

    if let (Some(template), Some(source_id)) = (naming_convention, source_id) {
        if template.contains("{source_id}") {
            let original_name = original_uri.rsplit('/').next().unwrap_or(original_uri);
            let stem = original_name
                .rsplit_once('.')
                .map(|(s, _)| s)
                .unwrap_or(original_name);
            return template
                .replace("{source_id}", source_id)
                .replace("{uuid}", &uuid)
                .replace("{extension}", &extension)
                .replace("{original_name}", stem);
        }
    }

    format!("{uuid}{extension}")
}

/// Lowercased extension with leading dot, or empty.
fn file_extension(uri: &str) -> String {
    let name = uri.rsplit('/').next().unwrap_or(uri);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => String::new(),
    }
}
