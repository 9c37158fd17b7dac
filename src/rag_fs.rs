//! Local file tree RAG backend.
//!
//! Stores artifacts under `<storage_path>/documents/` with JSON metadata
//! sidecars under `<storage_path>/metadata/`. Artifact identifiers are
//! `"<kb>/<filename>"` relative paths, so the same layout works no matter
//! where the tree is mounted.
//!
//! # Configuration
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `storage_path` (or `root_path`) | base directory; falls back to `RAGSYNC_STORAGE_PATH` |
//! | `kb_name` | subdirectory name; defaults to the owning KB |
//! | `create_dirs` | create missing directories on write (default true) |
//! | `preserve_structure` | store under the source path instead of the flat UUID name |
//! | `metadata_format` | `json` or `yaml`; recorded in the sidecar, persisted as JSON |

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::RagError;
use crate::rag::{RagArtifact, RagStore};

#[derive(Debug)]
pub struct FileSystemStorage {
    storage_path: PathBuf,
    kb_name: String,
    create_dirs: bool,
    preserve_structure: bool,
    metadata_format: String,
}

impl FileSystemStorage {
    pub fn from_config(config: &Value, default_kb_name: &str) -> Result<Self, RagError> {
        let base_path = config
            .get("storage_path")
            .or_else(|| config.get("root_path"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| std::env::var("RAGSYNC_STORAGE_PATH").ok())
            .ok_or_else(|| {
                RagError::Config(
                    "file_system_storage requires 'storage_path' (or 'root_path', or the RAGSYNC_STORAGE_PATH env var)"
                        .into(),
                )
            })?;

        let metadata_format = config
            .get("metadata_format")
            .and_then(|v| v.as_str())
            .unwrap_or("json")
            .to_string();
        if metadata_format != "json" && metadata_format != "yaml" {
            return Err(RagError::Config(format!(
                "metadata_format must be 'json' or 'yaml', got '{metadata_format}'"
            )));
        }

        Ok(Self {
            storage_path: PathBuf::from(base_path),
            kb_name: config
                .get("kb_name")
                .and_then(|v| v.as_str())
                .unwrap_or(default_kb_name)
                .to_string(),
            create_dirs: config
                .get("create_dirs")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            preserve_structure: config
                .get("preserve_structure")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            metadata_format,
        })
    }

    fn documents_dir(&self) -> PathBuf {
        self.storage_path.join("documents")
    }

    fn document_path(&self, rag_uri: &str) -> PathBuf {
        self.documents_dir().join(rag_uri)
    }

    fn metadata_path(&self, rag_uri: &str) -> PathBuf {
        self.storage_path
            .join("metadata")
            .join(format!("{rag_uri}.meta.json"))
    }

    /// Stored name within the KB subdirectory: the UUID filename, or the
    /// source-relative path when `preserve_structure` is set.
    fn stored_name(&self, filename: &str, metadata: &Value) -> String {
        if self.preserve_structure {
            if let Some(path) = metadata.get("source_path").and_then(|v| v.as_str()) {
                let clean = path.trim_start_matches('/');
                if !clean.is_empty() {
                    return clean.to_string();
                }
            }
        }
        filename.to_string()
    }

    async fn write_artifact(
        &self,
        rag_uri: &str,
        content: &[u8],
        metadata: &Value,
    ) -> Result<(), RagError> {
        let doc_path = self.document_path(rag_uri);
        let meta_path = self.metadata_path(rag_uri);

        if self.create_dirs {
            for path in [&doc_path, &meta_path] {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        tokio::fs::write(&doc_path, content).await?;

        let mut sidecar = metadata.clone();
        if let Some(map) = sidecar.as_object_mut() {
            map.insert(
                "metadata_format".to_string(),
                Value::String(self.metadata_format.clone()),
            );
            map.insert("rag_uri".to_string(), Value::String(rag_uri.to_string()));
        }
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&sidecar).unwrap_or_default())
            .await?;

        Ok(())
    }

    async fn read_sidecar(&self, rag_uri: &str) -> Value {
        match tokio::fs::read(self.metadata_path(rag_uri)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(Value::Null),
            Err(_) => Value::Null,
        }
    }
}

#[async_trait]
impl RagStore for FileSystemStorage {
    fn rag_type(&self) -> &str {
        "file_system_storage"
    }

    async fn upload(
        &self,
        content: &[u8],
        filename: &str,
        metadata: &Value,
    ) -> Result<String, RagError> {
        let rag_uri = format!("{}/{}", self.kb_name, self.stored_name(filename, metadata));
        self.write_artifact(&rag_uri, content, metadata).await?;
        Ok(rag_uri)
    }

    async fn update(
        &self,
        rag_uri: &str,
        content: &[u8],
        metadata: &Value,
    ) -> Result<(), RagError> {
        if !self.document_path(rag_uri).exists() {
            return Err(RagError::Conflict(rag_uri.to_string()));
        }
        self.write_artifact(rag_uri, content, metadata).await
    }

    async fn delete(&self, rag_uri: &str) -> Result<(), RagError> {
        match tokio::fs::remove_file(self.document_path(rag_uri)).await {
            Ok(()) => {
                // Sidecar removal is best-effort
                let _ = tokio::fs::remove_file(self.metadata_path(rag_uri)).await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RagError::NotFound(rag_uri.to_string()))
            }
            Err(e) => Err(RagError::Io(e)),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<RagArtifact>, RagError> {
        let root = self.documents_dir();
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut artifacts = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let rag_uri = relative_uri(&root, &path);
                if let Some(p) = prefix {
                    if !rag_uri.starts_with(p) {
                        continue;
                    }
                }
                let size = entry.metadata().await.map(|m| m.len() as i64).unwrap_or(0);
                artifacts.push(RagArtifact {
                    metadata: self.read_sidecar(&rag_uri).await,
                    rag_uri,
                    size,
                });
            }
        }

        artifacts.sort_by(|a, b| a.rag_uri.cmp(&b.rag_uri));
        Ok(artifacts)
    }

    async fn get(&self, rag_uri: &str) -> Result<Option<RagArtifact>, RagError> {
        let path = self.document_path(rag_uri);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(RagArtifact {
                rag_uri: rag_uri.to_string(),
                size: meta.len() as i64,
                metadata: self.read_sidecar(rag_uri).await,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RagError::Io(e)),
        }
    }
}

fn relative_uri(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
