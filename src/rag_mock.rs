//! In-memory RAG backend.
//!
//! Backs the `mock` rag type used by tests and dry connectivity checks.
//! Every call is recorded so test suites can assert on the exact sequence
//! of backend operations a sync performed (e.g. "an unchanged sync makes
//! zero calls", "a modification never re-uploads").

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::RagError;
use crate::rag::{RagArtifact, RagStore};

#[derive(Debug, Default)]
struct MockState {
    documents: HashMap<String, StoredDoc>,
    uploads: Vec<String>,
    updates: Vec<String>,
    deletes: Vec<String>,
}

#[derive(Debug, Clone)]
struct StoredDoc {
    content: Vec<u8>,
    metadata: Value,
}

/// Cheaply cloneable handle over shared state: tests keep one clone while
/// the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct MockRagStore {
    kb_name: String,
    inner: Arc<Mutex<MockState>>,
}

impl MockRagStore {
    pub fn new(kb_name: &str) -> Self {
        Self {
            kb_name: kb_name.to_string(),
            inner: Arc::default(),
        }
    }

    pub fn upload_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().uploads.clone()
    }

    pub fn update_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().updates.clone()
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().deletes.clone()
    }

    pub fn total_calls(&self) -> usize {
        let state = self.inner.lock().unwrap();
        state.uploads.len() + state.updates.len() + state.deletes.len()
    }

    pub fn document_count(&self) -> usize {
        self.inner.lock().unwrap().documents.len()
    }

    pub fn content_of(&self, rag_uri: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .documents
            .get(rag_uri)
            .map(|d| d.content.clone())
    }
}

#[async_trait]
impl RagStore for MockRagStore {
    fn rag_type(&self) -> &str {
        "mock"
    }

    async fn upload(
        &self,
        content: &[u8],
        filename: &str,
        metadata: &Value,
    ) -> Result<String, RagError> {
        let rag_uri = format!("{}/{}", self.kb_name, filename);
        let mut state = self.inner.lock().unwrap();
        state.uploads.push(rag_uri.clone());
        // Overwrite semantics under a stable filename
        state.documents.insert(
            rag_uri.clone(),
            StoredDoc {
                content: content.to_vec(),
                metadata: metadata.clone(),
            },
        );
        Ok(rag_uri)
    }

    async fn update(
        &self,
        rag_uri: &str,
        content: &[u8],
        metadata: &Value,
    ) -> Result<(), RagError> {
        let mut state = self.inner.lock().unwrap();
        state.updates.push(rag_uri.to_string());
        match state.documents.get_mut(rag_uri) {
            Some(doc) => {
                doc.content = content.to_vec();
                doc.metadata = metadata.clone();
                Ok(())
            }
            None => Err(RagError::Conflict(rag_uri.to_string())),
        }
    }

    async fn delete(&self, rag_uri: &str) -> Result<(), RagError> {
        let mut state = self.inner.lock().unwrap();
        state.deletes.push(rag_uri.to_string());
        match state.documents.remove(rag_uri) {
            Some(_) => Ok(()),
            None => Err(RagError::NotFound(rag_uri.to_string())),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<RagArtifact>, RagError> {
        let state = self.inner.lock().unwrap();
        let mut artifacts: Vec<RagArtifact> = state
            .documents
            .iter()
            .filter(|(uri, _)| prefix.map_or(true, |p| uri.starts_with(p)))
            .map(|(uri, doc)| RagArtifact {
                rag_uri: uri.clone(),
                size: doc.content.len() as i64,
                metadata: doc.metadata.clone(),
            })
            .collect();
        artifacts.sort_by(|a, b| a.rag_uri.cmp(&b.rag_uri));
        Ok(artifacts)
    }

    async fn get(&self, rag_uri: &str) -> Result<Option<RagArtifact>, RagError> {
        let state = self.inner.lock().unwrap();
        Ok(state.documents.get(rag_uri).map(|doc| RagArtifact {
            rag_uri: rag_uri.to_string(),
            size: doc.content.len() as i64,
            metadata: doc.metadata.clone(),
        }))
    }
}
