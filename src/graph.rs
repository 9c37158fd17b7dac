//! Microsoft Graph client shared by the SharePoint and OneDrive sources.
//!
//! Talks to the Graph REST API directly over `reqwest` — token acquisition,
//! collection paging (`@odata.nextLink`), delta paging (`@odata.deltaLink`),
//! and content download. No vendor SDK.
//!
//! # Authentication
//!
//! Two credential shapes are accepted:
//!
//! - **Client credentials** (`tenant_id` + `client_id` + `client_secret`) —
//!   the application-permissions flow used by unattended syncs.
//! - **Username/password** (`client_id` + `username` + `password`) — the
//!   resource-owner fallback for tenants that have not provisioned an
//!   application registration.
//!
//! Tokens are cached and refreshed with a five-minute expiry buffer.
//!
//! # Delta listings
//!
//! A stored delta token is the full `@odata.deltaLink` URL returned by the
//! previous sync. Replaying it yields only changed items; items carrying a
//! `deleted` facet are tombstones. A `410 Gone` response means the token
//! has expired server-side and surfaces as [`SourceError::TokenInvalid`].

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::SourceError;

pub const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 300;

/// Credential material for a Graph connection.
#[derive(Debug, Clone)]
pub struct GraphCredentials {
    pub authority: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl GraphCredentials {
    /// Read credentials from a source config blob. `default_authority` is
    /// used when the blob has no `tenant_id` (e.g. `"consumers"` for
    /// personal OneDrive accounts).
    pub fn from_config(config: &Value, default_authority: &str) -> Result<Self, SourceError> {
        let str_key = |key: &str| config.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let client_id = str_key("client_id")
            .ok_or_else(|| SourceError::Config("graph source requires 'client_id'".into()))?;
        let client_secret = str_key("client_secret");
        let username = str_key("username");
        let password = str_key("password");

        if client_secret.is_none() && (username.is_none() || password.is_none()) {
            return Err(SourceError::Config(
                "graph source requires 'client_secret' or 'username' + 'password'".into(),
            ));
        }

        Ok(Self {
            authority: str_key("tenant_id").unwrap_or_else(|| default_authority.to_string()),
            client_id,
            client_secret,
            username,
            password,
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// An authenticated Graph API client, safe for concurrent use.
#[derive(Debug)]
pub struct GraphClient {
    http: reqwest::Client,
    creds: GraphCredentials,
    token: Mutex<Option<CachedToken>>,
}

impl GraphClient {
    pub fn new(creds: GraphCredentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            creds,
            token: Mutex::new(None),
        }
    }

    /// Return a valid bearer token, refreshing when within the expiry buffer.
    async fn bearer(&self) -> Result<String, SourceError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Utc::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let token_url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.creds.authority
        );

        let mut form: Vec<(&str, String)> = vec![
            ("client_id", self.creds.client_id.clone()),
            ("scope", "https://graph.microsoft.com/.default".to_string()),
        ];
        match (&self.creds.client_secret, &self.creds.username) {
            (Some(secret), _) => {
                form.push(("client_secret", secret.clone()));
                form.push(("grant_type", "client_credentials".to_string()));
            }
            (None, Some(username)) => {
                form.push(("grant_type", "password".to_string()));
                form.push(("username", username.clone()));
                form.push((
                    "password",
                    self.creds.password.clone().unwrap_or_default(),
                ));
            }
            _ => {
                return Err(SourceError::Config(
                    "no usable graph credentials configured".into(),
                ))
            }
        }

        let resp = self
            .http
            .post(&token_url)
            .form(&form)
            .send()
            .await
            .map_err(SourceError::from_http)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Unavailable(format!(
                "graph token request failed (HTTP {status}): {}",
                truncate(&body, 300)
            )));
        }

        let payload: Value = resp.json().await.map_err(SourceError::from_http)?;
        let access_token = payload
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SourceError::Unavailable("token response missing access_token".into()))?
            .to_string();
        let expires_in = payload
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(3600);

        let expires_at =
            Utc::now() + Duration::seconds((expires_in - TOKEN_EXPIRY_BUFFER_SECS).max(60));
        *guard = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at,
        });
        Ok(access_token)
    }

    async fn get_checked(&self, url: &str) -> Result<reqwest::Response, SourceError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(SourceError::from_http)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            404 => SourceError::NotFound(url.to_string()),
            410 => SourceError::TokenInvalid,
            401 | 403 => SourceError::Unavailable(format!(
                "graph request unauthorized (HTTP {status}): {}",
                truncate(&body, 300)
            )),
            429 | 500..=599 => SourceError::Transient(format!(
                "graph request failed (HTTP {status}): {}",
                truncate(&body, 300)
            )),
            _ => SourceError::Unavailable(format!(
                "graph request failed (HTTP {status}): {}",
                truncate(&body, 300)
            )),
        })
    }

    /// GET a single JSON resource.
    pub async fn get(&self, url: &str) -> Result<Value, SourceError> {
        let resp = self.get_checked(url).await?;
        resp.json().await.map_err(SourceError::from_http)
    }

    /// GET a paged collection, following `@odata.nextLink` to completion.
    pub async fn get_collection(&self, url: &str) -> Result<Vec<Value>, SourceError> {
        let mut items = Vec::new();
        let mut next = Some(url.to_string());

        while let Some(page_url) = next {
            let page = self.get(&page_url).await?;
            if let Some(values) = page.get("value").and_then(|v| v.as_array()) {
                items.extend(values.iter().cloned());
            }
            next = page
                .get("@odata.nextLink")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }

        Ok(items)
    }

    /// Walk a delta listing to completion. Returns the collected items and
    /// the `@odata.deltaLink` to persist for the next incremental sync.
    pub async fn delta(&self, url: &str) -> Result<(Vec<Value>, String), SourceError> {
        let mut items = Vec::new();
        let mut page_url = url.to_string();

        loop {
            let page = self.get(&page_url).await?;
            if let Some(values) = page.get("value").and_then(|v| v.as_array()) {
                items.extend(values.iter().cloned());
            }
            if let Some(next) = page.get("@odata.nextLink").and_then(|v| v.as_str()) {
                page_url = next.to_string();
                continue;
            }
            let delta_link = page
                .get("@odata.deltaLink")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    SourceError::Unavailable("delta response missing @odata.deltaLink".into())
                })?;
            return Ok((items, delta_link.to_string()));
        }
    }

    /// Download raw content.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let resp = self.get_checked(url).await?;
        let bytes = resp.bytes().await.map_err(SourceError::from_http)?;
        Ok(bytes.to_vec())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// driveItem helpers
// ═══════════════════════════════════════════════════════════════════════

pub fn item_is_folder(item: &Value) -> bool {
    item.get("folder").is_some()
}

pub fn item_is_deleted(item: &Value) -> bool {
    item.get("deleted").is_some()
}

/// Drive-relative path of a driveItem: `parentReference.path` (shaped like
/// `/drives/<id>/root:/sub/folder`) joined with `name`, with the root
/// prefix stripped. Returns `None` when the parent path is absent
/// (tombstones sometimes omit it).
pub fn item_relative_path(item: &Value) -> Option<String> {
    let name = item.get("name").and_then(|v| v.as_str())?;
    let parent = item
        .get("parentReference")
        .and_then(|p| p.get("path"))
        .and_then(|v| v.as_str())?;

    let folder = match parent.split_once("root:") {
        Some((_, rest)) => rest.trim_start_matches('/'),
        None => "",
    };

    if folder.is_empty() {
        Some(name.to_string())
    } else {
        Some(format!("{folder}/{name}"))
    }
}

pub fn parse_graph_time(item: &Value, key: &str) -> Option<DateTime<Utc>> {
    item.get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Percent-encode a drive path for `root:/<path>:` addressing, keeping `/`.
pub fn encode_drive_path(path: &str) -> String {
    path.split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/")
}

/// URI-encode a path segment per RFC 3986 unreserved characters.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
