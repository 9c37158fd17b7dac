//! Source adapter capability.
//!
//! A [`FileSource`] exposes two operations to the engine: **list** (produce
//! the set of file descriptors currently visible) and **fetch** (return one
//! file's bytes plus authoritative size and timestamps). Graph-backed
//! sources additionally advertise **delta listing**: given a stored token,
//! they return only the entries changed since that token was issued, split
//! into live files and tombstones.
//!
//! Adding a new source type means implementing [`FileSource`] and adding a
//! `(tag → constructor)` arm to [`create_source`]. No reflection, no plugin
//! loader.
//!
//! # Filtering
//!
//! Config-driven filtering is applied by the adapter before returning a
//! listing. [`SourceFilter`] implements the fixed order:
//!
//! 1. `exclude_extensions` — drop if matched
//! 2. `include_extensions` — if non-empty, acts as a whitelist
//! 3. `exclude_patterns` — glob over the relative path, drop if matched
//! 4. `include_patterns` — if non-empty, keep only matches
//!
//! Extensions are case-insensitive and accepted with or without a leading
//! dot. Glob patterns use `**` as the path-segment wildcard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;

use crate::error::SourceError;
use crate::models::{DeltaEntry, FileDescriptor};

/// Bytes plus authoritative metadata returned by [`FileSource::fetch`].
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub content: Vec<u8>,
    pub size: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// One page-complete delta listing for a single drive.
#[derive(Debug, Clone)]
pub struct DeltaPage {
    pub entries: Vec<DeltaEntry>,
    /// The token to persist for the next incremental listing.
    pub new_token: String,
}

/// A source of files the engine can synchronize from.
///
/// Implementations must be safe for concurrent `fetch` calls: one listing
/// feeds a pool of workers that fetch in parallel.
#[async_trait]
pub trait FileSource: Send + Sync + std::fmt::Debug {
    /// The source type tag (e.g. `"file_system"`, `"enterprise_sharepoint"`).
    fn source_type(&self) -> &str;

    /// Produce the set of file descriptors currently visible in the source,
    /// already filtered by the adapter's [`SourceFilter`].
    async fn list(&self) -> Result<Vec<FileDescriptor>, SourceError>;

    /// Return one file's content plus authoritative size and timestamps.
    ///
    /// A URI that disappeared since listing surfaces as
    /// [`SourceError::NotFound`] and is treated as a concurrent deletion.
    async fn fetch(&self, uri: &str) -> Result<FetchedFile, SourceError>;

    /// Whether this source supports incremental (delta) listings.
    fn supports_delta(&self) -> bool {
        false
    }

    /// The drive identifiers this source spans. Delta tokens are persisted
    /// per (source, drive). Non-delta sources return an empty list.
    async fn drives(&self) -> Result<Vec<String>, SourceError> {
        Ok(Vec::new())
    }

    /// List only the entries changed since `token` was issued. A `None`
    /// token means "from the beginning" and yields a full baseline.
    ///
    /// A stored token the API no longer accepts surfaces as
    /// [`SourceError::TokenInvalid`]; the caller clears it and re-baselines.
    async fn delta_list(
        &self,
        _drive_id: &str,
        _token: Option<&str>,
    ) -> Result<DeltaPage, SourceError> {
        Err(SourceError::Config(format!(
            "source type '{}' does not support delta listings",
            self.source_type()
        )))
    }
}

/// Construct a source adapter from its type tag and config blob.
pub fn create_source(
    source_type: &str,
    config: &Value,
) -> Result<Box<dyn FileSource>, SourceError> {
    match source_type {
        "file_system" => Ok(Box::new(crate::source_fs::FileSystemSource::from_config(
            config,
        )?)),
        "sharepoint" | "enterprise_sharepoint" => Ok(Box::new(
            crate::source_sharepoint::SharePointSource::from_config(source_type, config)?,
        )),
        "onedrive" => Ok(Box::new(crate::source_onedrive::OneDriveSource::from_config(
            config,
        )?)),
        other => Err(SourceError::Config(format!(
            "unknown source type '{other}'. Available: file_system, sharepoint, enterprise_sharepoint, onedrive"
        ))),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SourceFilter
// ═══════════════════════════════════════════════════════════════════════

/// Include/exclude filtering over relative paths and extensions.
#[derive(Debug)]
pub struct SourceFilter {
    include_patterns: GlobSet,
    include_empty: bool,
    exclude_patterns: GlobSet,
    include_extensions: Vec<String>,
    exclude_extensions: Vec<String>,
}

impl SourceFilter {
    /// Build a filter from the standard config keys (`include_patterns`,
    /// `exclude_patterns`, `include_extensions`, `exclude_extensions`).
    /// Missing keys mean "no constraint".
    pub fn from_config(config: &Value) -> Result<Self, SourceError> {
        let include = string_list(config, "include_patterns");
        let exclude = string_list(config, "exclude_patterns");
        let include_ext = string_list(config, "include_extensions");
        let exclude_ext = string_list(config, "exclude_extensions");
        Self::new(&include, &exclude, &include_ext, &exclude_ext)
    }

    pub fn new(
        include_patterns: &[String],
        exclude_patterns: &[String],
        include_extensions: &[String],
        exclude_extensions: &[String],
    ) -> Result<Self, SourceError> {
        Ok(Self {
            include_empty: include_patterns.is_empty(),
            include_patterns: build_globset(include_patterns)?,
            exclude_patterns: build_globset(exclude_patterns)?,
            include_extensions: include_extensions.iter().map(|e| normalize_ext(e)).collect(),
            exclude_extensions: exclude_extensions.iter().map(|e| normalize_ext(e)).collect(),
        })
    }

    /// Apply the filter to a relative path. Order: exclude-ext →
    /// include-ext → exclude-pattern → include-pattern.
    pub fn matches(&self, relative_path: &str) -> bool {
        let ext = path_extension(relative_path);

        if let Some(ref ext) = ext {
            if self.exclude_extensions.iter().any(|e| e == ext) {
                return false;
            }
        }

        if !self.include_extensions.is_empty() {
            match ext {
                Some(ref ext) if self.include_extensions.iter().any(|e| e == ext) => {}
                _ => return false,
            }
        }

        if self.exclude_patterns.is_match(relative_path) {
            return false;
        }

        if self.include_empty {
            return true;
        }
        self.include_patterns.is_match(relative_path)
    }
}

fn string_list(config: &Value, key: &str) -> Vec<String> {
    config
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, SourceError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| SourceError::Config(format!("bad glob '{pattern}': {e}")))?,
        );
    }
    builder
        .build()
        .map_err(|e| SourceError::Config(e.to_string()))
}

/// Lowercase, no leading dot.
fn normalize_ext(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

/// Lowercased extension of the final path segment, if any.
fn path_extension(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Detect MIME content type from a file extension.
pub fn detect_content_type(path: &str) -> String {
    match path_extension(path).as_deref() {
        Some("md") => "text/markdown".to_string(),
        Some("txt") => "text/plain".to_string(),
        Some("json") => "application/json".to_string(),
        Some("yaml" | "yml") => "text/yaml".to_string(),
        Some("html" | "htm") => "text/html".to_string(),
        Some("pdf") => "application/pdf".to_string(),
        Some("doc") => "application/msword".to_string(),
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document".to_string()
        }
        Some("xls") => "application/vnd.ms-excel".to_string(),
        Some("xlsx") => {
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string()
        }
        Some("ppt") => "application/vnd.ms-powerpoint".to_string(),
        Some("pptx") => {
            "application/vnd.openxmlformats-officedocument.presentationml.presentation".to_string()
        }
        Some("csv") => "text/csv".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(
        inc: &[&str],
        exc: &[&str],
        inc_ext: &[&str],
        exc_ext: &[&str],
    ) -> SourceFilter {
        SourceFilter::new(
            &inc.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &exc.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &inc_ext.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &exc_ext.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    #[test]
    fn empty_filter_accepts_everything() {
        let f = filter(&[], &[], &[], &[]);
        assert!(f.matches("a.pdf"));
        assert!(f.matches("deep/nested/file.bin"));
    }

    #[test]
    fn exclude_extension_wins_over_include_pattern() {
        let f = filter(&["**/*"], &[], &[], &["tmp"]);
        assert!(!f.matches("docs/cache.tmp"));
        assert!(f.matches("docs/report.pdf"));
    }

    #[test]
    fn include_extensions_whitelist() {
        let f = filter(&[], &[], &[".PDF", "docx"], &[]);
        assert!(f.matches("a.pdf"));
        assert!(f.matches("b.DOCX"));
        assert!(!f.matches("c.txt"));
        assert!(!f.matches("no_extension"));
    }

    #[test]
    fn exclude_pattern_applies_before_include_pattern() {
        let f = filter(&["**/*.md"], &["drafts/**"], &[], &[]);
        assert!(f.matches("notes/a.md"));
        assert!(!f.matches("drafts/a.md"));
        assert!(!f.matches("notes/a.txt"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let f = filter(&["docs/**/*.md"], &[], &[], &[]);
        assert!(f.matches("docs/a/b/c.md"));
        assert!(!f.matches("other/a.md"));
    }

    #[test]
    fn extension_normalization() {
        assert_eq!(normalize_ext(".PDF"), "pdf");
        assert_eq!(normalize_ext("Txt"), "txt");
        assert_eq!(path_extension("a/b/report.PDF"), Some("pdf".to_string()));
        assert_eq!(path_extension("a/b/.hidden"), None);
        assert_eq!(path_extension("no_ext"), None);
    }

    #[test]
    fn filter_from_config_blob() {
        let cfg = serde_json::json!({
            "include_patterns": ["**/*.md"],
            "exclude_extensions": ["tmp"]
        });
        let f = SourceFilter::from_config(&cfg).unwrap();
        assert!(f.matches("a/b.md"));
        assert!(!f.matches("a/b.tmp"));
        assert!(!f.matches("a/b.rs"));
    }

    #[test]
    fn unknown_source_type_rejected() {
        let err = create_source("gopher", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, SourceError::Config(_)));
    }
}
