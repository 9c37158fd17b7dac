//! SharePoint document library source (Microsoft Graph).
//!
//! Resolves the configured site URL to a Graph site id, enumerates its
//! document libraries (drives), and lists files per drive. URIs are
//! `"<library-name>/<drive-relative-path>"` so one source can span several
//! libraries without ambiguity.
//!
//! Delta listings are supported per drive: the stored token is the
//! `@odata.deltaLink` from the previous run, and tombstoned items come back
//! as [`DeltaEntry::Tombstone`].
//!
//! # Configuration
//!
//! ```json
//! {
//!   "site_url": "https://acme.sharepoint.com/sites/docs",
//!   "path": "reports",
//!   "recursive": true,
//!   "tenant_id": "…", "client_id": "…", "client_secret": "…",
//!   "include_extensions": ["pdf", "docx"]
//! }
//! ```
//!
//! Credentials may alternatively be `username` + `password`.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::SourceError;
use crate::graph::{
    encode_drive_path, item_is_deleted, item_is_folder, item_relative_path, parse_graph_time,
    GraphClient, GraphCredentials, GRAPH_BASE,
};
use crate::models::{DeltaEntry, FileDescriptor};
use crate::source::{detect_content_type, DeltaPage, FetchedFile, FileSource, SourceFilter};

#[derive(Debug, Clone)]
struct DriveInfo {
    id: String,
    name: String,
}

#[derive(Debug, Clone)]
struct SiteState {
    site_id: String,
    drives: Vec<DriveInfo>,
}

#[derive(Debug)]
pub struct SharePointSource {
    source_type: String,
    site_url: String,
    path: Option<String>,
    recursive: bool,
    filter: SourceFilter,
    client: GraphClient,
    state: Mutex<Option<SiteState>>,
}

impl SharePointSource {
    pub fn from_config(source_type: &str, config: &Value) -> Result<Self, SourceError> {
        let site_url = config
            .get("site_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SourceError::Config("sharepoint source requires 'site_url'".into()))?
            .trim_end_matches('/')
            .to_string();

        let creds = GraphCredentials::from_config(config, "organizations")?;

        Ok(Self {
            source_type: source_type.to_string(),
            site_url,
            path: config
                .get("path")
                .and_then(|v| v.as_str())
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
            recursive: config
                .get("recursive")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            filter: SourceFilter::from_config(config)?,
            client: GraphClient::new(creds),
            state: Mutex::new(None),
        })
    }

    /// Resolve and cache the site id and its document libraries.
    async fn site_state(&self) -> Result<SiteState, SourceError> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_ref() {
            return Ok(state.clone());
        }

        let (hostname, server_path) = split_site_url(&self.site_url)?;
        let site_url = if server_path.is_empty() {
            format!("{GRAPH_BASE}/sites/{hostname}")
        } else {
            format!("{GRAPH_BASE}/sites/{hostname}:/{server_path}")
        };

        let site = self.client.get(&site_url).await?;
        let site_id = site
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SourceError::Unavailable(format!("site lookup returned no id for {}", self.site_url))
            })?
            .to_string();

        let drive_items = self
            .client
            .get_collection(&format!("{GRAPH_BASE}/sites/{site_id}/drives"))
            .await?;

        let drives = drive_items
            .iter()
            .filter_map(|d| {
                Some(DriveInfo {
                    id: d.get("id")?.as_str()?.to_string(),
                    name: d.get("name")?.as_str()?.to_string(),
                })
            })
            .collect::<Vec<_>>();

        if drives.is_empty() {
            return Err(SourceError::Unavailable(format!(
                "no document libraries found for {}",
                self.site_url
            )));
        }

        let state = SiteState { site_id, drives };
        *guard = Some(state.clone());
        Ok(state)
    }

    /// Breadth-first listing of one drive, honoring `path` and `recursive`.
    async fn list_drive(&self, drive: &DriveInfo) -> Result<Vec<FileDescriptor>, SourceError> {
        let mut items = Vec::new();
        let mut folders = vec![self.path.clone().unwrap_or_default()];

        while let Some(folder) = folders.pop() {
            let url = if folder.is_empty() {
                format!("{GRAPH_BASE}/drives/{}/root/children", drive.id)
            } else {
                format!(
                    "{GRAPH_BASE}/drives/{}/root:/{}:/children",
                    drive.id,
                    encode_drive_path(&folder)
                )
            };

            for child in self.client.get_collection(&url).await? {
                let Some(name) = child.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                let child_path = if folder.is_empty() {
                    name.to_string()
                } else {
                    format!("{folder}/{name}")
                };

                if item_is_folder(&child) {
                    if self.recursive {
                        folders.push(child_path);
                    }
                    continue;
                }

                let uri = format!("{}/{}", drive.name, child_path);
                if !self.filter.matches(&uri) {
                    continue;
                }
                items.push(descriptor_from_item(&child, uri, &drive.id));
            }
        }

        Ok(items)
    }

    fn drive_by_name<'a>(state: &'a SiteState, name: &str) -> Option<&'a DriveInfo> {
        state.drives.iter().find(|d| d.name == name)
    }

    fn drive_by_id<'a>(state: &'a SiteState, id: &str) -> Option<&'a DriveInfo> {
        state.drives.iter().find(|d| d.id == id)
    }
}

#[async_trait]
impl FileSource for SharePointSource {
    fn source_type(&self) -> &str {
        &self.source_type
    }

    async fn list(&self) -> Result<Vec<FileDescriptor>, SourceError> {
        let state = self.site_state().await?;
        let mut items = Vec::new();
        for drive in &state.drives {
            items.extend(self.list_drive(drive).await?);
        }
        items.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(items)
    }

    async fn fetch(&self, uri: &str) -> Result<FetchedFile, SourceError> {
        let state = self.site_state().await?;
        let (drive_name, rel_path) = uri
            .split_once('/')
            .ok_or_else(|| SourceError::NotFound(uri.to_string()))?;
        let drive = Self::drive_by_name(&state, drive_name)
            .ok_or_else(|| SourceError::NotFound(uri.to_string()))?;

        let item_url = format!(
            "{GRAPH_BASE}/drives/{}/root:/{}",
            drive.id,
            encode_drive_path(rel_path)
        );
        let item = self.client.get(&item_url).await?;
        let content = self
            .client
            .download(&format!("{item_url}:/content"))
            .await?;

        Ok(FetchedFile {
            size: content.len() as i64,
            content,
            created_at: parse_graph_time(&item, "createdDateTime"),
            modified_at: parse_graph_time(&item, "lastModifiedDateTime"),
        })
    }

    fn supports_delta(&self) -> bool {
        true
    }

    async fn drives(&self) -> Result<Vec<String>, SourceError> {
        let state = self.site_state().await?;
        Ok(state.drives.iter().map(|d| d.id.clone()).collect())
    }

    async fn delta_list(
        &self,
        drive_id: &str,
        token: Option<&str>,
    ) -> Result<DeltaPage, SourceError> {
        let state = self.site_state().await?;
        let drive = Self::drive_by_id(&state, drive_id)
            .ok_or_else(|| SourceError::NotFound(format!("drive {drive_id}")))?;

        let url = match token {
            Some(t) => t.to_string(),
            None => format!("{GRAPH_BASE}/drives/{drive_id}/root/delta"),
        };

        let (raw_items, delta_link) = self.client.delta(&url).await?;

        let mut entries = Vec::new();
        for item in &raw_items {
            if item_is_deleted(item) {
                if item_is_folder(item) {
                    continue;
                }
                let rel = item_relative_path(item)
                    .or_else(|| item.get("name").and_then(|v| v.as_str()).map(str::to_string));
                if let Some(rel) = rel {
                    entries.push(DeltaEntry::Tombstone {
                        uri: format!("{}/{}", drive.name, rel),
                    });
                }
                continue;
            }
            if item_is_folder(item) {
                continue;
            }
            let Some(rel) = item_relative_path(item) else {
                continue;
            };
            let uri = format!("{}/{}", drive.name, rel);
            if !self.filter.matches(&uri) {
                continue;
            }
            entries.push(DeltaEntry::Present(descriptor_from_item(
                item, uri, &drive.id,
            )));
        }

        Ok(DeltaPage {
            entries,
            new_token: delta_link,
        })
    }
}

fn descriptor_from_item(item: &Value, uri: String, drive_id: &str) -> FileDescriptor {
    FileDescriptor {
        size: item.get("size").and_then(|v| v.as_i64()).unwrap_or(0),
        content_type: item
            .get("file")
            .and_then(|f| f.get("mimeType"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| detect_content_type(&uri)),
        created_at: parse_graph_time(item, "createdDateTime"),
        modified_at: parse_graph_time(item, "lastModifiedDateTime"),
        metadata: serde_json::json!({
            "drive_id": drive_id,
            "item_id": item.get("id").and_then(|v| v.as_str()),
            "web_url": item.get("webUrl").and_then(|v| v.as_str()),
        }),
        uri,
    }
}

/// Split `https://host/sites/name` into `(host, "sites/name")`.
fn split_site_url(site_url: &str) -> Result<(String, String), SourceError> {
    let stripped = site_url
        .strip_prefix("https://")
        .or_else(|| site_url.strip_prefix("http://"))
        .ok_or_else(|| SourceError::Config(format!("invalid site_url: {site_url}")))?;

    match stripped.split_once('/') {
        Some((host, path)) => Ok((host.to_string(), path.trim_matches('/').to_string())),
        None => Ok((stripped.to_string(), String::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_url_split() {
        let (host, path) = split_site_url("https://acme.sharepoint.com/sites/docs").unwrap();
        assert_eq!(host, "acme.sharepoint.com");
        assert_eq!(path, "sites/docs");

        let (host, path) = split_site_url("https://acme.sharepoint.com").unwrap();
        assert_eq!(host, "acme.sharepoint.com");
        assert_eq!(path, "");

        assert!(split_site_url("acme.sharepoint.com").is_err());
    }

    #[test]
    fn config_requires_site_url() {
        let err = SharePointSource::from_config(
            "enterprise_sharepoint",
            &serde_json::json!({"client_id": "x", "client_secret": "y"}),
        )
        .unwrap_err();
        assert!(matches!(err, SourceError::Config(_)));
    }

    #[test]
    fn descriptor_uses_mime_type_from_item() {
        let item = serde_json::json!({
            "id": "item1",
            "size": 42,
            "file": {"mimeType": "application/pdf"},
            "lastModifiedDateTime": "2024-01-01T00:00:00Z"
        });
        let d = descriptor_from_item(&item, "Documents/a.pdf".into(), "drive1");
        assert_eq!(d.content_type, "application/pdf");
        assert_eq!(d.size, 42);
        assert!(d.modified_at.is_some());
    }
}
