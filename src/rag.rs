//! RAG adapter capability.
//!
//! The engine treats the RAG backend as a write-through of the catalog: the
//! catalog is the source of truth and the backend is reconstructible from
//! it. A [`RagStore`] exposes upload / update / delete plus list / get for
//! reconciliation and health checks.
//!
//! Contract highlights:
//!
//! - `upload` is idempotent under a stable filename: uploading the same
//!   filename twice overwrites. This is what makes restoration safe — a
//!   restored file re-uploads under its original UUID filename.
//! - `update` addresses an existing artifact by its `rag_uri`; updating a
//!   missing artifact is a [`RagError::Conflict`], not a silent re-upload.
//! - `delete` is best-effort; [`RagError::NotFound`] is non-fatal to the
//!   caller.
//!
//! Adding a backend means implementing [`RagStore`] and adding a
//! `(tag → constructor)` arm to [`create_rag`].

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::RagError;

/// One stored artifact, as reported by `list` / `get`.
#[derive(Debug, Clone)]
pub struct RagArtifact {
    pub rag_uri: String,
    pub size: i64,
    pub metadata: Value,
}

/// A pluggable RAG storage backend.
///
/// Implementations must be safe for concurrent calls under distinct
/// filenames; the orchestrator guarantees two concurrent writes never
/// address the same `rag_uri`.
#[async_trait]
pub trait RagStore: Send + Sync + std::fmt::Debug {
    /// The rag type tag (e.g. `"azure_blob"`, `"file_system_storage"`).
    fn rag_type(&self) -> &str;

    /// Create (or overwrite) an artifact under `filename`; returns the
    /// `rag_uri` by which the artifact is addressed from now on.
    async fn upload(
        &self,
        content: &[u8],
        filename: &str,
        metadata: &Value,
    ) -> Result<String, RagError>;

    /// In-place overwrite of an existing artifact.
    async fn update(&self, rag_uri: &str, content: &[u8], metadata: &Value)
        -> Result<(), RagError>;

    /// Best-effort removal.
    async fn delete(&self, rag_uri: &str) -> Result<(), RagError>;

    /// Enumerate stored artifacts, optionally under a `rag_uri` prefix.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<RagArtifact>, RagError>;

    /// Metadata for one artifact, or `None` if absent.
    async fn get(&self, rag_uri: &str) -> Result<Option<RagArtifact>, RagError>;
}

/// Construct a RAG backend from its type tag and config blob.
///
/// `kb_name` prefixes artifact identifiers (`"<kb>/<uuid-filename>"`) so
/// several KBs can share one backend.
pub fn create_rag(
    rag_type: &str,
    config: &Value,
    kb_name: &str,
) -> Result<Arc<dyn RagStore>, RagError> {
    match rag_type {
        "mock" => Ok(Arc::new(crate::rag_mock::MockRagStore::new(kb_name))),
        "file_system_storage" => Ok(Arc::new(crate::rag_fs::FileSystemStorage::from_config(
            config, kb_name,
        )?)),
        "azure_blob" => Ok(Arc::new(crate::rag_azure::AzureBlobStorage::from_config(
            config, kb_name,
        )?)),
        other => Err(RagError::Config(format!(
            "unknown rag type '{other}'. Available: mock, file_system_storage, azure_blob"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_rag_type_rejected() {
        let err = create_rag("pinecone", &serde_json::json!({}), "kb").unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[test]
    fn mock_needs_no_config() {
        let store = create_rag("mock", &serde_json::json!({}), "kb").unwrap();
        assert_eq!(store.rag_type(), "mock");
    }
}
