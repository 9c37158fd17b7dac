use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Engine settings loaded from an optional `ragsync.toml`.
///
/// Every field has a default so the file may be absent entirely; the
/// environment variables `RAGSYNC_DB_PATH` and `RAGSYNC_DB_POOL_SIZE`
/// override the file. KB-level source/RAG configuration does not live here —
/// it travels as JSON blobs in the catalog.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub db: DbSettings,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/ragsync.sqlite")
}

fn default_pool_size() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    /// Worker tasks per source.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bound of the classification queue feeding the workers.
    #[serde(default = "default_queue_bound")]
    pub queue_bound: usize,
    /// Timeout for one file operation (fetch + hash + RAG call + insert).
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,
    /// Attempts for transient per-file errors (exponential backoff).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Grace window for in-flight files after cancellation.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_bound: default_queue_bound(),
            file_timeout_secs: default_file_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

fn default_workers() -> usize {
    8
}
fn default_queue_bound() -> usize {
    256
}
fn default_file_timeout_secs() -> u64 {
    60
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_cancel_grace_secs() -> u64 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db: DbSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

/// Load settings from `path` (missing file is fine), then apply environment
/// overrides.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let mut settings = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Settings::default()
    };

    if let Ok(db_path) = std::env::var("RAGSYNC_DB_PATH") {
        settings.db.path = PathBuf::from(db_path);
    }
    if let Ok(pool) = std::env::var("RAGSYNC_DB_POOL_SIZE") {
        settings.db.pool_size = pool
            .parse()
            .with_context(|| format!("Invalid RAGSYNC_DB_POOL_SIZE: {pool}"))?;
    }

    if settings.sync.workers == 0 {
        anyhow::bail!("sync.workers must be > 0");
    }
    if settings.sync.queue_bound == 0 {
        anyhow::bail!("sync.queue_bound must be > 0");
    }
    if settings.db.pool_size == 0 {
        anyhow::bail!("db.pool_size must be > 0");
    }

    Ok(settings)
}

/// Initialize the tracing subscriber from `RAGSYNC_LOG` (falling back to
/// `RUST_LOG`, then `info`).
pub fn init_logging() {
    let filter = std::env::var("RAGSYNC_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let settings = load_settings(Path::new("/nonexistent/ragsync.toml")).unwrap();
        assert_eq!(settings.sync.workers, 8);
        assert_eq!(settings.sync.queue_bound, 256);
        assert_eq!(settings.sync.file_timeout_secs, 60);
        assert_eq!(settings.db.pool_size, 10);
    }

    #[test]
    fn parse_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragsync.toml");
        std::fs::write(&path, "[sync]\nworkers = 2\n").unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.sync.workers, 2);
        // Unspecified fields fall back to defaults
        assert_eq!(settings.sync.queue_bound, 256);
    }

    #[test]
    fn zero_workers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragsync.toml");
        std::fs::write(&path, "[sync]\nworkers = 0\n").unwrap();
        assert!(load_settings(&path).is_err());
    }
}
