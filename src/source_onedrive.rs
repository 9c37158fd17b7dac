//! OneDrive source (Microsoft Graph).
//!
//! Lists a single user's drive, optionally scoped to a `root_folder`. URIs
//! are paths relative to that folder. `account_type` selects the token
//! authority: `business` authenticates against the tenant (or
//! `organizations`), `personal` against the `consumers` endpoint.
//!
//! # Configuration
//!
//! ```json
//! {
//!   "user_id": "user@acme.com",
//!   "root_folder": "Documents/kb",
//!   "account_type": "business",
//!   "recursive": true,
//!   "client_id": "…", "client_secret": "…", "tenant_id": "…"
//! }
//! ```

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

#[derive(Debug)]
pub struct OneDriveSource {
    user_id: String,
    root_folder: Option<String>,
    recursive: bool,
    filter: SourceFilter,
    client: GraphClient,
    drive_id: Mutex<Option<String>>,
}

impl OneDriveSource {
    pub fn from_config(config: &Value) -> Result<Self, SourceError> {
        let user_id = config
            .get("user_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SourceError::Config("onedrive source requires 'user_id'".into()))?
            .to_string();

        let account_type = config
            .get("account_type")
            .and_then(|v| v.as_str())
            .unwrap_or("business");
        let default_authority = match account_type {
            "personal" => "consumers",
            "business" => "organizations",
            other => {
                return Err(SourceError::Config(format!(
                    "unknown account_type '{other}': expected 'business' or 'personal'"
                )))
            }
        };

        let creds = GraphCredentials::from_config(config, default_authority)?;

        Ok(Self {
            user_id,
            root_folder: config
                .get("root_folder")
                .and_then(|v| v.as_str())
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
            recursive: config
                .get("recursive")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            filter: SourceFilter::from_config(config)?,
            client: GraphClient::new(creds),
            drive_id: Mutex::new(None),
        })
    }

    async fn resolve_drive(&self) -> Result<String, SourceError> {
        let mut guard = self.drive_id.lock().await;
        if let Some(id) = guard.as_ref() {
            return Ok(id.clone());
        }

        let drive = self
            .client
            .get(&format!("{GRAPH_BASE}/users/{}/drive", self.user_id))
            .await?;
        let id = drive
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SourceError::Unavailable(format!("no drive found for user {}", self.user_id))
            })?
            .to_string();

        *guard = Some(id.clone());
        Ok(id)
    }

    /// Drive path of a source URI: root_folder-prefixed.
    fn drive_path(&self, uri: &str) -> String {
        match &self.root_folder {
            Some(root) => format!("{root}/{uri}"),
            None => uri.to_string(),
        }
    }

    /// Source URI of a drive-relative path, if it falls under root_folder.
    fn uri_of_drive_path(&self, drive_path: &str) -> Option<String> {
        match &self.root_folder {
            Some(root) => drive_path
                .strip_prefix(root.as_str())
                .map(|rest| rest.trim_start_matches('/').to_string())
                .filter(|rest| !rest.is_empty()),
            None => Some(drive_path.to_string()),
        }
    }
}

#[async_trait]
impl FileSource for OneDriveSource {
    fn source_type(&self) -> &str {
        "onedrive"
    }

    async fn list(&self) -> Result<Vec<FileDescriptor>, SourceError> {
        let drive_id = self.resolve_drive().await?;
        let mut items = Vec::new();
        let mut folders = vec![String::new()];

        while let Some(folder) = folders.pop() {
            let drive_folder = if folder.is_empty() {
                self.root_folder.clone().unwrap_or_default()
            } else {
                self.drive_path(&folder)
            };
            let url = if drive_folder.is_empty() {
                format!("{GRAPH_BASE}/drives/{drive_id}/root/children")
            } else {
                format!(
                    "{GRAPH_BASE}/drives/{drive_id}/root:/{}:/children",
                    encode_drive_path(&drive_folder)
                )
            };

            for child in self.client.get_collection(&url).await? {
                let Some(name) = child.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                let child_uri = if folder.is_empty() {
                    name.to_string()
                } else {
                    format!("{folder}/{name}")
                };

                if item_is_folder(&child) {
                    if self.recursive {
                        folders.push(child_uri);
                    }
                    continue;
                }

                if !self.filter.matches(&child_uri) {
                    continue;
                }
                items.push(descriptor_from_item(&child, child_uri, &drive_id));
            }
        }

        items.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(items)
    }

    async fn fetch(&self, uri: &str) -> Result<FetchedFile, SourceError> {
        let drive_id = self.resolve_drive().await?;
        let item_url = format!(
            "{GRAPH_BASE}/drives/{drive_id}/root:/{}",
            encode_drive_path(&self.drive_path(uri))
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
        Ok(vec![self.resolve_drive().await?])
    }

    async fn delta_list(
        &self,
        drive_id: &str,
        token: Option<&str>,
    ) -> Result<DeltaPage, SourceError> {
        let url = match token {
            Some(t) => t.to_string(),
            None => format!("{GRAPH_BASE}/drives/{drive_id}/root/delta"),
        };

        let (raw_items, delta_link) = self.client.delta(&url).await?;

        let mut entries = Vec::new();
        for item in &raw_items {
            if item_is_folder(item) && !item_is_deleted(item) {
                continue;
            }
            let Some(drive_path) = item_relative_path(item)
                .or_else(|| item.get("name").and_then(|v| v.as_str()).map(str::to_string))
            else {
                continue;
            };
            let Some(uri) = self.uri_of_drive_path(&drive_path) else {
                continue;
            };

            if item_is_deleted(item) {
                if item_is_folder(item) {
                    continue;
                }
                entries.push(DeltaEntry::Tombstone { uri });
                continue;
            }
            if !self.filter.matches(&uri) {
                continue;
            }
            entries.push(DeltaEntry::Present(descriptor_from_item(
                item, uri, drive_id,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn source(root_folder: Option<&str>) -> OneDriveSource {
        let mut cfg = serde_json::json!({
            "user_id": "user@acme.com",
            "client_id": "app",
            "client_secret": "secret",
            "tenant_id": "tenant"
        });
        if let Some(root) = root_folder {
            cfg["root_folder"] = serde_json::json!(root);
        }
        OneDriveSource::from_config(&cfg).unwrap()
    }

    #[test]
    fn drive_path_round_trip_with_root() {
        let s = source(Some("Documents/kb"));
        assert_eq!(s.drive_path("a/b.pdf"), "Documents/kb/a/b.pdf");
        assert_eq!(
            s.uri_of_drive_path("Documents/kb/a/b.pdf"),
            Some("a/b.pdf".to_string())
        );
        assert_eq!(s.uri_of_drive_path("Elsewhere/c.pdf"), None);
    }

    #[test]
    fn drive_path_without_root() {
        let s = source(None);
        assert_eq!(s.drive_path("a.pdf"), "a.pdf");
        assert_eq!(s.uri_of_drive_path("a.pdf"), Some("a.pdf".to_string()));
    }

    #[test]
    fn bad_account_type_rejected() {
        let err = OneDriveSource::from_config(&serde_json::json!({
            "user_id": "u",
            "client_id": "app",
            "client_secret": "s",
            "account_type": "corporate"
        }))
        .unwrap_err();
        assert!(matches!(err, SourceError::Config(_)));
    }
}
