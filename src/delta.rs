//! Delta token lifecycle.
//!
//! Tokens are persisted per (source, drive) and advanced only when a run
//! reaches `completed`; a failed or cancelled run leaves every token
//! untouched so the next sync replays the same window. Scans never advance
//! tokens. An invalid token is cleared and the same run falls back to a
//! full baseline listing.

use anyhow::Result;

use crate::repository::Repository;

/// Tokens collected during listing, applied at the successful terminal
/// transition.
#[derive(Debug, Default)]
pub struct PendingTokens {
    tokens: Vec<(String, String)>,
}

impl PendingTokens {
    pub fn push(&mut self, drive_id: &str, token: &str) {
        self.tokens.push((drive_id.to_string(), token.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}

pub struct DeltaTokenManager<'a> {
    repo: &'a Repository,
    /// Key under which tokens are stored: the multi-source `source_id`, or
    /// the KB name for single-source KBs.
    source_key: String,
    source_type: String,
}

impl<'a> DeltaTokenManager<'a> {
    pub fn new(repo: &'a Repository, source_key: &str, source_type: &str) -> Self {
        Self {
            repo,
            source_key: source_key.to_string(),
            source_type: source_type.to_string(),
        }
    }

    /// The stored cursor for a drive, if any. `None` means a full listing.
    pub async fn token_for(&self, drive_id: &str) -> Result<Option<String>> {
        self.repo.get_delta_token(&self.source_key, drive_id).await
    }

    /// Drop a token the listing API rejected; the next listing re-baselines.
    pub async fn invalidate(&self, drive_id: &str) -> Result<()> {
        tracing::warn!(
            source = %self.source_key,
            drive = %drive_id,
            "delta token rejected by source; clearing"
        );
        self.repo.clear_delta_token(&self.source_key, drive_id).await
    }

    /// Upsert every pending token. Call only after the run committed as
    /// `completed`.
    pub async fn commit(&self, pending: &PendingTokens) -> Result<()> {
        for (drive_id, token) in &pending.tokens {
            self.repo
                .save_delta_token(&self.source_key, &self.source_type, drive_id, token)
                .await?;
        }
        if !pending.is_empty() {
            tracing::info!(
                source = %self.source_key,
                drives = pending.len(),
                "delta tokens advanced"
            );
        }
        Ok(())
    }
}
