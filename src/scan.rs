//! Scan mode: a non-mutating sync.
//!
//! A KB scan follows the same orchestration and change detection as a real
//! sync — same size and mtime pre-filters, same hash verification — but
//! never touches the RAG backend and never advances delta tokens. Observed
//! files are recorded as `scanned` / `scan_error` rows so scans stay
//! distinguishable from real syncs in the audit log; change detection
//! ignores those rows entirely.
//!
//! `scan --path <p>` is even lighter: it walks an arbitrary directory and
//! prints a summary without touching the catalog at all.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use crate::models::KnowledgeBase;
use crate::processor::SourceContext;
use crate::rag_mock::MockRagStore;
use crate::repository::Repository;
use crate::source::{create_source, FileSource};
use crate::source_fs::FileSystemSource;
use crate::sync::{run_sync, RunMode, SyncOptions, SyncOutcome, SyncTarget};

/// Scan a registered KB's source, recording what a sync would have done.
pub async fn run_scan_kb(
    repo: &Repository,
    kb: &KnowledgeBase,
    opts: &SyncOptions,
    cancel: watch::Receiver<bool>,
) -> Result<SyncOutcome> {
    let source = create_source(&kb.source_type, &kb.source_config)
        .with_context(|| format!("building source adapter for '{}'", kb.name))?;

    let abandoned = repo.fail_abandoned_runs(kb.id).await?;
    if abandoned > 0 {
        tracing::warn!(kb = %kb.name, runs = abandoned, "failed abandoned sync runs");
    }

    // Scan mode makes no backend calls; the orchestrator still wants a
    // store wired in, so it gets one that would record any leak.
    let rag = Arc::new(MockRagStore::new(&kb.name));

    let target = SyncTarget {
        kb_id: kb.id,
        kb_name: kb.name.clone(),
    };
    let ctx = SourceContext::single(&kb.name, &kb.source_type);

    run_sync(
        repo,
        &target,
        Arc::from(source),
        rag,
        ctx,
        RunMode::Scan,
        opts,
        cancel,
    )
    .await
}

/// Summary of an ad-hoc path scan.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub files: usize,
    pub total_bytes: i64,
    pub by_content_type: BTreeMap<String, usize>,
}

/// Walk an arbitrary directory and summarize it. Catalog-free.
pub async fn scan_path(path: &Path) -> Result<ScanReport> {
    let source = FileSystemSource::over_path(path)?;
    let listing = source
        .list()
        .await
        .with_context(|| format!("scanning {}", path.display()))?;

    let mut report = ScanReport {
        files: listing.len(),
        ..Default::default()
    };
    for descriptor in &listing {
        report.total_bytes += descriptor.size;
        *report
            .by_content_type
            .entry(descriptor.content_type.clone())
            .or_insert(0) += 1;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn path_scan_summarizes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), b"hello").unwrap();
        std::fs::write(dir.path().join("b.md"), b"world!").unwrap();
        std::fs::write(dir.path().join("c.pdf"), b"%PDF").unwrap();

        let report = scan_path(dir.path()).await.unwrap();
        assert_eq!(report.files, 3);
        assert_eq!(report.total_bytes, 5 + 6 + 4);
        assert_eq!(report.by_content_type.get("text/markdown"), Some(&2));
        assert_eq!(report.by_content_type.get("application/pdf"), Some(&1));
    }

    #[tokio::test]
    async fn missing_path_errors() {
        assert!(scan_path(Path::new("/definitely/not/here")).await.is_err());
    }
}
