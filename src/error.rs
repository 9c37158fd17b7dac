//! Error taxonomy for the adapter capability seams.
//!
//! The engine distinguishes errors by what it does with them:
//!
//! | Kind | Policy |
//! |------|--------|
//! | `Transient` | retried with exponential backoff, then recorded per-file |
//! | `NotFound` (source) | treated as a concurrent deletion |
//! | `NotFound` (RAG delete) | non-fatal, deletion proceeds |
//! | `TokenInvalid` | delta token cleared, full listing in the same run |
//! | `Unavailable` / `Config` | fail the source's run |
//!
//! Orchestration-level code stays on `anyhow::Result`; these sum types exist
//! only at the boundary so policy decisions can match on the kind.

use thiserror::Error;

/// Errors surfaced by a [`crate::source::FileSource`].
#[derive(Debug, Error)]
pub enum SourceError {
    /// Authentication or transport failure; the source cannot be used.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// A URI requested for fetch no longer exists (concurrent deletion).
    #[error("not found in source: {0}")]
    NotFound(String),

    /// The stored delta token was rejected by the listing API.
    #[error("delta token invalid")]
    TokenInvalid,

    /// Retryable with backoff.
    #[error("transient source error: {0}")]
    Transient(String),

    /// The source config blob is missing or malformed.
    #[error("invalid source config: {0}")]
    Config(String),

    #[error("source i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }

    /// Map a reqwest failure onto the taxonomy: connect/timeout errors are
    /// transient, everything else means the source is unavailable.
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            SourceError::Transient(err.to_string())
        } else {
            SourceError::Unavailable(err.to_string())
        }
    }
}

/// Errors surfaced by a [`crate::rag::RagStore`].
#[derive(Debug, Error)]
pub enum RagError {
    /// Transport or auth failure against the backend.
    #[error("rag backend unavailable: {0}")]
    Unavailable(String),

    /// The addressed artifact does not exist. Non-fatal for `delete`.
    #[error("artifact not found: {0}")]
    NotFound(String),

    /// Update addressed an artifact that was deleted out from under us.
    #[error("conflict updating artifact: {0}")]
    Conflict(String),

    /// Retryable with backoff.
    #[error("transient rag error: {0}")]
    Transient(String),

    /// The rag config blob is missing or malformed.
    #[error("invalid rag config: {0}")]
    Config(String),

    #[error("rag i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RagError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RagError::Transient(_))
    }

    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            RagError::Transient(err.to_string())
        } else {
            RagError::Unavailable(err.to_string())
        }
    }
}
