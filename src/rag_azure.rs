//! Azure Blob Storage RAG backend.
//!
//! Talks to the Blob service REST API directly with either Shared Key
//! signing (connection string) or OAuth bearer tokens (service principal).
//! Implements pagination for large containers and stores artifact metadata
//! as `x-ms-meta-*` headers.
//!
//! Uses only pure-Rust dependencies (`hmac`, `sha2`, `base64`) for request
//! signing — no vendor SDK.
//!
//! # Configuration
//!
//! ```json
//! {
//!   "container_name": "rag-docs",
//!   "storage_account_name": "acmestore",
//!   "auth_method": "connection_string",
//!   "connection_string": "DefaultEndpointsProtocol=https;AccountName=…;AccountKey=…"
//! }
//! ```
//!
//! `auth_method` may be one of `connection_string`, `service_principal`,
//! `managed_identity`, `default_credential`. The last two require an
//! ambient credential endpoint and are rejected with a configuration error
//! in this build; use `service_principal` (tenant_id / client_id /
//! client_secret) for unattended deployments.
//!
//! # Authentication
//!
//! Shared Key requests are signed per the
//! [Blob service authorization scheme](https://learn.microsoft.com/rest/api/storageservices/authorize-with-shared-key):
//! HMAC-SHA256 over the canonicalized headers and resource with the
//! base64-decoded account key.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::error::RagError;
use crate::rag::{RagArtifact, RagStore};

type HmacSha256 = Hmac<Sha256>;

const STORAGE_API_VERSION: &str = "2021-08-06";
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 300;

#[derive(Debug)]
enum AzureAuth {
    SharedKey {
        key: Vec<u8>,
    },
    ServicePrincipal {
        tenant_id: String,
        client_id: String,
        client_secret: String,
        token: Mutex<Option<CachedToken>>,
    },
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug)]
pub struct AzureBlobStorage {
    account: String,
    container: String,
    endpoint_suffix: String,
    kb_name: String,
    auth: AzureAuth,
    http: reqwest::Client,
}

impl AzureBlobStorage {
    pub fn from_config(config: &Value, kb_name: &str) -> Result<Self, RagError> {
        let str_key = |key: &str| config.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let container = str_key("container_name")
            .ok_or_else(|| RagError::Config("azure_blob requires 'container_name'".into()))?;

        let auth_method = str_key("auth_method").unwrap_or_else(|| "connection_string".into());

        let (account, endpoint_suffix, auth) = match auth_method.as_str() {
            "connection_string" => {
                let conn = str_key("connection_string").ok_or_else(|| {
                    RagError::Config(
                        "auth_method 'connection_string' requires 'connection_string'".into(),
                    )
                })?;
                let parsed = parse_connection_string(&conn)?;
                let account = str_key("storage_account_name").unwrap_or(parsed.account_name);
                (
                    account,
                    parsed.endpoint_suffix,
                    AzureAuth::SharedKey { key: parsed.key },
                )
            }
            "service_principal" => {
                let account = str_key("storage_account_name").ok_or_else(|| {
                    RagError::Config(
                        "auth_method 'service_principal' requires 'storage_account_name'".into(),
                    )
                })?;
                let need = |key: &str| {
                    str_key(key).ok_or_else(|| {
                        RagError::Config(format!("auth_method 'service_principal' requires '{key}'"))
                    })
                };
                (
                    account,
                    "core.windows.net".to_string(),
                    AzureAuth::ServicePrincipal {
                        tenant_id: need("tenant_id")?,
                        client_id: need("client_id")?,
                        client_secret: need("client_secret")?,
                        token: Mutex::new(None),
                    },
                )
            }
            "managed_identity" | "default_credential" => {
                return Err(RagError::Config(format!(
                    "auth_method '{auth_method}' is not supported in this build; use 'connection_string' or 'service_principal'"
                )));
            }
            other => {
                return Err(RagError::Config(format!(
                    "unknown auth_method '{other}'"
                )));
            }
        };

        Ok(Self {
            account,
            container,
            endpoint_suffix,
            kb_name: kb_name.to_string(),
            auth,
            http: reqwest::Client::new(),
        })
    }

    fn container_url(&self) -> String {
        format!(
            "https://{}.blob.{}/{}",
            self.account, self.endpoint_suffix, self.container
        )
    }

    async fn bearer(&self) -> Result<Option<String>, RagError> {
        let AzureAuth::ServicePrincipal {
            tenant_id,
            client_id,
            client_secret,
            token,
        } = &self.auth
        else {
            return Ok(None);
        };

        let mut guard = token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Utc::now() {
                return Ok(Some(cached.access_token.clone()));
            }
        }

        let resp = self
            .http
            .post(format!(
                "https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token"
            ))
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("scope", "https://storage.azure.com/.default"),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(RagError::from_http)?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(RagError::Unavailable(format!(
                "storage token request failed (HTTP {status})"
            )));
        }

        let payload: Value = resp.json().await.map_err(RagError::from_http)?;
        let access_token = payload
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RagError::Unavailable("token response missing access_token".into()))?
            .to_string();
        let expires_in = payload
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(3600);

        *guard = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Utc::now()
                + chrono::Duration::seconds((expires_in - TOKEN_EXPIRY_BUFFER_SECS).max(60)),
        });
        Ok(Some(access_token))
    }

    /// Build, sign, and send one Blob service request.
    async fn request(
        &self,
        method: reqwest::Method,
        resource: &str,
        query: &[(&str, String)],
        extra_headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, RagError> {
        let now = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let content_length = body.as_ref().map(|b| b.len()).unwrap_or(0);

        let mut ms_headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), now.clone()),
            ("x-ms-version".to_string(), STORAGE_API_VERSION.to_string()),
        ];
        ms_headers.extend(extra_headers.iter().cloned());
        ms_headers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut url = format!(
            "https://{}.blob.{}{}",
            self.account, self.endpoint_suffix, resource
        );
        if !query.is_empty() {
            let qs: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{k}={}", uri_encode(v)))
                .collect();
            url.push('?');
            url.push_str(&qs.join("&"));
        }

        let mut req = self.http.request(method.clone(), &url);
        for (k, v) in &ms_headers {
            req = req.header(k, v);
        }

        match self.bearer().await? {
            Some(token) => {
                req = req.header("Authorization", format!("Bearer {token}"));
            }
            None => {
                let AzureAuth::SharedKey { key } = &self.auth else {
                    unreachable!("bearer() returns a token for non-shared-key auth");
                };
                let signature = shared_key_signature(
                    key,
                    method.as_str(),
                    content_length,
                    &ms_headers,
                    &canonicalized_resource(&self.account, resource, query),
                );
                req = req.header(
                    "Authorization",
                    format!("SharedKey {}:{signature}", self.account),
                );
            }
        }

        if let Some(body) = body {
            req = req.body(body);
        }

        req.send().await.map_err(RagError::from_http)
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response, RagError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(300).collect();
        Err(match status.as_u16() {
            404 => RagError::NotFound(what.to_string()),
            401 | 403 => {
                RagError::Unavailable(format!("{what} unauthorized (HTTP {status}): {excerpt}"))
            }
            429 | 500..=599 => {
                RagError::Transient(format!("{what} failed (HTTP {status}): {excerpt}"))
            }
            _ => RagError::Unavailable(format!("{what} failed (HTTP {status}): {excerpt}")),
        })
    }

    fn blob_resource(&self, blob: &str) -> String {
        format!(
            "/{}/{}",
            self.container,
            blob.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
        )
    }

    async fn put_blob(&self, blob: &str, content: &[u8], metadata: &Value) -> Result<(), RagError> {
        let mut headers = vec![(
            "x-ms-blob-type".to_string(),
            "BlockBlob".to_string(),
        )];
        headers.extend(metadata_headers(metadata));

        let resp = self
            .request(
                reqwest::Method::PUT,
                &self.blob_resource(blob),
                &[],
                &headers,
                Some(content.to_vec()),
            )
            .await?;
        Self::check(resp, blob).await?;
        Ok(())
    }

    async fn head_blob(&self, blob: &str) -> Result<Option<(i64, Value)>, RagError> {
        let resp = self
            .request(
                reqwest::Method::HEAD,
                &self.blob_resource(blob),
                &[],
                &[],
                None,
            )
            .await?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let resp = Self::check(resp, blob).await?;

        let size = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);

        let mut metadata = serde_json::Map::new();
        for (name, value) in resp.headers() {
            if let Some(key) = name.as_str().strip_prefix("x-ms-meta-") {
                if let Ok(v) = value.to_str() {
                    metadata.insert(key.to_string(), Value::String(v.to_string()));
                }
            }
        }
        Ok(Some((size, Value::Object(metadata))))
    }
}

#[async_trait]
impl RagStore for AzureBlobStorage {
    fn rag_type(&self) -> &str {
        "azure_blob"
    }

    async fn upload(
        &self,
        content: &[u8],
        filename: &str,
        metadata: &Value,
    ) -> Result<String, RagError> {
        let blob = format!("{}/{}", self.kb_name, filename);
        self.put_blob(&blob, content, metadata).await?;
        Ok(blob)
    }

    async fn update(
        &self,
        rag_uri: &str,
        content: &[u8],
        metadata: &Value,
    ) -> Result<(), RagError> {
        if self.head_blob(rag_uri).await?.is_none() {
            return Err(RagError::Conflict(rag_uri.to_string()));
        }
        self.put_blob(rag_uri, content, metadata).await
    }

    async fn delete(&self, rag_uri: &str) -> Result<(), RagError> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &self.blob_resource(rag_uri),
                &[],
                &[],
                None,
            )
            .await?;
        Self::check(resp, rag_uri).await?;
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<RagArtifact>, RagError> {
        let mut artifacts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("restype", "container".to_string()),
                ("comp", "list".to_string()),
            ];
            if let Some(p) = prefix {
                query.push(("prefix", p.to_string()));
            }
            if let Some(ref m) = marker {
                query.push(("marker", m.clone()));
            }

            let resp = self
                .request(
                    reqwest::Method::GET,
                    &format!("/{}", self.container),
                    &query,
                    &[],
                    None,
                )
                .await?;
            let resp = Self::check(resp, &self.container_url()).await?;
            let xml = resp.text().await.map_err(RagError::from_http)?;

            let mut remaining = xml.as_str();
            while let Some(start) = remaining.find("<Blob>") {
                let block_start = start + "<Blob>".len();
                let Some(end) = remaining[block_start..].find("</Blob>") else {
                    break;
                };
                let block = &remaining[block_start..block_start + end];

                if let Some(name) = extract_xml_value(block, "Name") {
                    let size = extract_xml_value(block, "Content-Length")
                        .and_then(|s| s.parse::<i64>().ok())
                        .unwrap_or(0);
                    artifacts.push(RagArtifact {
                        rag_uri: name,
                        size,
                        metadata: Value::Null,
                    });
                }
                remaining = &remaining[block_start + end + "</Blob>".len()..];
            }

            match extract_xml_value(&xml, "NextMarker").filter(|m| !m.is_empty()) {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        artifacts.sort_by(|a, b| a.rag_uri.cmp(&b.rag_uri));
        Ok(artifacts)
    }

    async fn get(&self, rag_uri: &str) -> Result<Option<RagArtifact>, RagError> {
        Ok(self.head_blob(rag_uri).await?.map(|(size, metadata)| RagArtifact {
            rag_uri: rag_uri.to_string(),
            size,
            metadata,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Shared Key signing
// ═══════════════════════════════════════════════════════════════════════

/// Compute the Shared Key signature for one request.
///
/// ```text
/// StringToSign = VERB + "\n" + standard headers… + "\n"
///                + CanonicalizedHeaders + CanonicalizedResource
/// Signature    = base64(HMAC-SHA256(StringToSign, base64decode(AccountKey)))
/// ```
fn shared_key_signature(
    key: &[u8],
    verb: &str,
    content_length: usize,
    ms_headers: &[(String, String)],
    canonicalized_resource: &str,
) -> String {
    // Zero Content-Length must be an empty string in recent API versions
    let length_field = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let canonicalized_headers: String = ms_headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect();

    let string_to_sign = format!(
        "{verb}\n\n\n{length_field}\n\n\n\n\n\n\n\n\n{canonicalized_headers}{canonicalized_resource}"
    );

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(string_to_sign.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// `/{account}{resource}` plus each query parameter as `\nname:value`,
/// sorted by name.
fn canonicalized_resource(account: &str, resource: &str, query: &[(&str, String)]) -> String {
    let mut out = format!("/{account}{resource}");
    let mut params: Vec<(&str, &str)> = query.iter().map(|(k, v)| (*k, v.as_str())).collect();
    params.sort();
    for (k, v) in params {
        out.push_str(&format!("\n{k}:{v}"));
    }
    out
}

#[derive(Debug)]
struct ParsedConnectionString {
    account_name: String,
    key: Vec<u8>,
    endpoint_suffix: String,
}

fn parse_connection_string(conn: &str) -> Result<ParsedConnectionString, RagError> {
    let mut account_name = None;
    let mut account_key = None;
    let mut endpoint_suffix = "core.windows.net".to_string();

    for pair in conn.split(';') {
        let Some((k, v)) = pair.split_once('=') else {
            continue;
        };
        match k.trim() {
            "AccountName" => account_name = Some(v.to_string()),
            "AccountKey" => account_key = Some(v.to_string()),
            "EndpointSuffix" => endpoint_suffix = v.to_string(),
            _ => {}
        }
    }

    let account_name = account_name
        .ok_or_else(|| RagError::Config("connection string missing AccountName".into()))?;
    let key_b64 = account_key
        .ok_or_else(|| RagError::Config("connection string missing AccountKey".into()))?;
    let key = base64::engine::general_purpose::STANDARD
        .decode(key_b64)
        .map_err(|e| RagError::Config(format!("AccountKey is not valid base64: {e}")))?;

    Ok(ParsedConnectionString {
        account_name,
        key,
        endpoint_suffix,
    })
}

/// Scalar string metadata values become `x-ms-meta-*` headers; keys are
/// sanitized to the identifier charset the service accepts.
fn metadata_headers(metadata: &Value) -> Vec<(String, String)> {
    let Some(map) = metadata.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(k, v)| {
            let value = v.as_str()?;
            if !value.is_ascii() {
                return None;
            }
            let key: String = k
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            Some((format!("x-ms-meta-{key}"), value.to_string()))
        })
        .collect()
}

/// URI-encode per RFC 3986 unreserved characters.
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

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)?;
    let value_start = start + open.len();
    let end = xml[value_start..].find(&close)?;
    Some(xml[value_start..value_start + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_parses() {
        let parsed = parse_connection_string(
            "DefaultEndpointsProtocol=https;AccountName=acme;AccountKey=a2V5bWF0ZXJpYWw=;EndpointSuffix=core.windows.net",
        )
        .unwrap();
        assert_eq!(parsed.account_name, "acme");
        assert_eq!(parsed.key, b"keymaterial");
        assert_eq!(parsed.endpoint_suffix, "core.windows.net");
    }

    #[test]
    fn connection_string_missing_key_rejected() {
        let err = parse_connection_string("AccountName=acme").unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[test]
    fn unsupported_auth_methods_rejected() {
        for method in ["managed_identity", "default_credential"] {
            let err = AzureBlobStorage::from_config(
                &serde_json::json!({
                    "container_name": "c",
                    "storage_account_name": "a",
                    "auth_method": method
                }),
                "kb",
            )
            .unwrap_err();
            assert!(matches!(err, RagError::Config(_)), "method {method}");
        }
    }

    #[test]
    fn canonicalized_resource_sorts_params() {
        let out = canonicalized_resource(
            "acme",
            "/container",
            &[("restype", "container".into()), ("comp", "list".into())],
        );
        assert_eq!(out, "/acme/container\ncomp:list\nrestype:container");
    }

    #[test]
    fn signature_is_stable() {
        let headers = vec![
            ("x-ms-date".to_string(), "Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
            ("x-ms-version".to_string(), STORAGE_API_VERSION.to_string()),
        ];
        let a = shared_key_signature(b"key", "GET", 0, &headers, "/acme/c");
        let b = shared_key_signature(b"key", "GET", 0, &headers, "/acme/c");
        assert_eq!(a, b);
        let c = shared_key_signature(b"key", "PUT", 10, &headers, "/acme/c");
        assert_ne!(a, c);
    }

    #[test]
    fn metadata_headers_sanitize_keys() {
        let headers = metadata_headers(&serde_json::json!({
            "original-uri": "a.pdf",
            "kb name": "docs",
            "size": 5
        }));
        let keys: Vec<&str> = headers.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"x-ms-meta-original_uri"));
        assert!(keys.contains(&"x-ms-meta-kb_name"));
        // Non-string values are skipped
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn xml_extraction() {
        let xml = "<Blob><Name>kb/a.pdf</Name><Properties><Content-Length>42</Content-Length></Properties></Blob>";
        assert_eq!(extract_xml_value(xml, "Name"), Some("kb/a.pdf".into()));
        assert_eq!(extract_xml_value(xml, "Content-Length"), Some("42".into()));
        assert_eq!(extract_xml_value(xml, "NextMarker"), None);
    }
}
