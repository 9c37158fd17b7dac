//! Local file tree source.
//!
//! Walks a root directory and produces one descriptor per regular file that
//! survives the configured filters. URIs are root-relative paths with `/`
//! separators so records stay stable across machines.
//!
//! # Configuration
//!
//! ```json
//! {
//!   "root_path": "/srv/docs",
//!   "include_patterns": ["**/*.pdf", "reports/**"],
//!   "exclude_patterns": ["**/archive/**"],
//!   "include_extensions": ["pdf", "docx"],
//!   "exclude_extensions": [".tmp"]
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::error::SourceError;
use crate::models::FileDescriptor;
use crate::source::{detect_content_type, FetchedFile, FileSource, SourceFilter};

#[derive(Debug)]
pub struct FileSystemSource {
    root: PathBuf,
    filter: SourceFilter,
}

impl FileSystemSource {
    pub fn from_config(config: &Value) -> Result<Self, SourceError> {
        let root = config
            .get("root_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SourceError::Config("file_system source requires 'root_path'".into()))?;

        Ok(Self {
            root: PathBuf::from(root),
            filter: SourceFilter::from_config(config)?,
        })
    }

    /// A transient source over an arbitrary directory with no filters.
    /// Used by `scan --path`.
    pub fn over_path(root: &Path) -> Result<Self, SourceError> {
        Ok(Self {
            root: root.to_path_buf(),
            filter: SourceFilter::from_config(&Value::Object(Default::default()))?,
        })
    }

    fn absolute(&self, uri: &str) -> PathBuf {
        self.root.join(uri)
    }
}

#[async_trait]
impl FileSource for FileSystemSource {
    fn source_type(&self) -> &str {
        "file_system"
    }

    async fn list(&self) -> Result<Vec<FileDescriptor>, SourceError> {
        if !self.root.exists() {
            return Err(SourceError::Unavailable(format!(
                "root path does not exist: {}",
                self.root.display()
            )));
        }

        let mut items = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| SourceError::Unavailable(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let uri = relative.to_string_lossy().replace('\\', "/");

            if !self.filter.matches(&uri) {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| {
                SourceError::Unavailable(format!("stat failed for {}: {e}", path.display()))
            })?;

            items.push(FileDescriptor {
                size: metadata.len() as i64,
                content_type: detect_content_type(&uri),
                created_at: metadata.created().ok().map(system_time_to_utc),
                modified_at: metadata.modified().ok().map(system_time_to_utc),
                metadata: serde_json::json!({ "root": self.root.display().to_string() }),
                uri,
            });
        }

        // Sort for deterministic ordering
        items.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(items)
    }

    async fn fetch(&self, uri: &str) -> Result<FetchedFile, SourceError> {
        let path = self.absolute(uri);
        let content = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(uri.to_string()));
            }
            Err(e) => return Err(SourceError::Io(e)),
        };

        let metadata = std::fs::metadata(&path)?;
        Ok(FetchedFile {
            size: content.len() as i64,
            content,
            created_at: metadata.created().ok().map(system_time_to_utc),
            modified_at: metadata.modified().ok().map(system_time_to_utc),
        })
    }
}

fn system_time_to_utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}
