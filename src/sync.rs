//! Sync-run orchestration.
//!
//! Owns the lifecycle of one sync of one source against one KB:
//!
//! ```text
//! INIT → LISTING → CLASSIFYING → PROCESSING → FINALIZING → (DONE | FAILED)
//! ```
//!
//! - **INIT**: a new `sync_run` row is created. (Abandoned runs are failed
//!   by the entry points — CLI and multi-source driver — before any run of
//!   the current sync exists, so concurrent sibling sources cannot mistake
//!   each other for abandoned.)
//! - **LISTING**: full listing, or delta listing per drive when the source
//!   supports it and a token may be stored. An invalid token is cleared and
//!   the same run re-baselines.
//! - **CLASSIFYING**: the change detector compares the listing with the
//!   latest-records map. Mtime-unchanged files are counted and elided.
//! - **PROCESSING**: N workers pull classifications from a bounded channel
//!   (backpressure: the feeder blocks on a full queue). Each file operation
//!   is wrapped in a timeout; transient failures retry with exponential
//!   backoff before an error row is recorded.
//! - **FINALIZING**: counters and the terminal transition commit in one
//!   transaction. Delta tokens advance only on `completed`.
//!
//! Cancellation is a watch signal: workers stop dequeuing, in-flight files
//! get a grace window to finish their catalog insert, and the run finalizes
//! as `failed` with error message `"cancelled"`.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::config::SyncSettings;
use crate::delta::{DeltaTokenManager, PendingTokens};
use crate::detector::{self, ChangeType, FileChange};
use crate::models::{SyncCounters, SyncRunStatus, FileStatus};
use crate::processor::{AttemptError, FileProcessor, SourceContext};
use crate::rag::RagStore;
use crate::repository::Repository;
use crate::source::FileSource;

/// The catalog identity a run writes under. For multi-source KBs this is
/// the *compatible* single-source KB resolved by the schema bridge, so
/// historical records keep being found.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    pub kb_id: i64,
    pub kb_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Sync,
    /// Detect and record, never touch the RAG backend or delta tokens.
    Scan,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub workers: usize,
    pub queue_bound: usize,
    pub file_timeout: Duration,
    pub retry_attempts: u32,
    pub cancel_grace: Duration,
}

impl SyncOptions {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            workers: settings.workers,
            queue_bound: settings.queue_bound,
            file_timeout: Duration::from_secs(settings.file_timeout_secs),
            retry_attempts: settings.retry_attempts,
            cancel_grace: Duration::from_secs(settings.cancel_grace_secs),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub sync_run_id: i64,
    pub status: SyncRunStatus,
    pub counters: SyncCounters,
    pub error_message: Option<String>,
}

impl SyncOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(
            self.status,
            SyncRunStatus::Completed | SyncRunStatus::ScanCompleted
        )
    }
}

/// A watch channel whose sender flips to `true` to cancel a run.
pub fn cancellation() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Run one sync (or scan) of `source` into `rag` under `target`.
///
/// Per-file and per-source failures are captured in the returned
/// [`SyncOutcome`]; only infrastructure failures (catalog connectivity at
/// the run boundary) surface as `Err`.
#[allow(clippy::too_many_arguments)]
pub async fn run_sync(
    repo: &Repository,
    target: &SyncTarget,
    source: Arc<dyn FileSource>,
    rag: Arc<dyn RagStore>,
    ctx: SourceContext,
    mode: RunMode,
    opts: &SyncOptions,
    cancel: watch::Receiver<bool>,
) -> Result<SyncOutcome> {
    let initial = match mode {
        RunMode::Sync => SyncRunStatus::Running,
        RunMode::Scan => SyncRunStatus::ScanRunning,
    };
    let run = repo
        .create_sync_run(target.kb_id, initial)
        .await
        .context("creating sync run")?;

    tracing::info!(
        kb = %target.kb_name,
        run = run.id,
        source = %ctx.source_type,
        mode = ?mode,
        "sync run started"
    );

    let token_key = ctx
        .source_id
        .clone()
        .unwrap_or_else(|| target.kb_name.clone());
    let token_mgr = DeltaTokenManager::new(repo, &token_key, &ctx.source_type);
    let mut pending_tokens = PendingTokens::default();

    // LISTING → CLASSIFYING. Any failure here fails the run as a whole;
    // delta tokens are left untouched.
    let (changes, total) = match build_changes(
        repo,
        target,
        source.as_ref(),
        mode,
        &token_mgr,
        &mut pending_tokens,
    )
    .await
    {
        Ok(v) => v,
        Err(message) => {
            tracing::error!(kb = %target.kb_name, run = run.id, error = %message, "listing failed");
            let counters = SyncCounters::default();
            let status = failed_status(mode);
            repo.finalize_sync_run(run.id, &counters, status, Some(&message))
                .await?;
            return Ok(SyncOutcome {
                sync_run_id: run.id,
                status,
                counters,
                error_message: Some(message),
            });
        }
    };

    let summary = detector::change_summary(&changes);
    tracing::info!(
        kb = %target.kb_name,
        run = run.id,
        total,
        new = summary.new,
        modified = summary.modified,
        unchanged = summary.unchanged,
        deleted = summary.deleted,
        "classification complete"
    );

    // PROCESSING
    let counters = Arc::new(Mutex::new(SyncCounters {
        total,
        ..Default::default()
    }));
    let fatal: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let processor = Arc::new(FileProcessor::new(ctx, mode == RunMode::Scan));

    let (tx, rx) = mpsc::channel::<FileChange>(opts.queue_bound);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let mut workers = JoinSet::new();
    for _ in 0..opts.workers.max(1) {
        let rx = Arc::clone(&rx);
        let source = Arc::clone(&source);
        let rag = Arc::clone(&rag);
        let processor = Arc::clone(&processor);
        let repo = repo.clone();
        let counters = Arc::clone(&counters);
        let fatal = Arc::clone(&fatal);
        let mut cancel = cancel.clone();
        let opts = *opts;
        let run_id = run.id;

        workers.spawn(async move {
            loop {
                if fatal.lock().unwrap().is_some() {
                    break;
                }
                let change = tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => break,
                    maybe = recv_next(&rx) => match maybe {
                        Some(change) => change,
                        None => break,
                    },
                };

                match process_one(&processor, &*source, &*rag, &repo, run_id, &change, &opts).await
                {
                    Ok(Some(status)) => {
                        let mut c = counters.lock().unwrap();
                        match status {
                            FileStatus::New => c.new += 1,
                            FileStatus::Modified => c.modified += 1,
                            FileStatus::Unchanged => c.unchanged += 1,
                            FileStatus::Deleted => c.deleted += 1,
                            FileStatus::Error | FileStatus::ScanError => c.errors += 1,
                            FileStatus::Scanned => {}
                        }
                    }
                    Ok(None) => {}
                    Err(message) => {
                        tracing::error!(error = %message, "catalog write failed; aborting run");
                        *fatal.lock().unwrap() = Some(message);
                        break;
                    }
                }
            }
        });
    }

    // Only workers may hold the receiver: once they all exit, the feeder's
    // send fails instead of blocking on a queue nobody drains.
    drop(rx);

    // Feed classifications. Mtime-unchanged files are elided here: no row,
    // no fetch — the previous record stays authoritative.
    let mut feed_cancel = cancel.clone();
    for change in changes {
        if change.change_type == ChangeType::Unchanged {
            counters.lock().unwrap().unchanged += 1;
            continue;
        }
        if fatal.lock().unwrap().is_some() {
            break;
        }
        let stop = tokio::select! {
            biased;
            _ = cancelled(&mut feed_cancel) => true,
            sent = tx.send(change) => sent.is_err(),
        };
        if stop {
            break;
        }
    }
    drop(tx);

    // Drain the pool; a cancelled run grants in-flight files a grace window
    // to finish their catalog insert before aborting.
    if *cancel.borrow() {
        let drained = tokio::time::timeout(opts.cancel_grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(run = run.id, "grace window elapsed; aborting in-flight files");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
    } else {
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "sync worker panicked");
                    *fatal.lock().unwrap() = Some(format!("worker panicked: {e}"));
                }
            }
        }
    }

    // FINALIZING
    let final_counters = *counters.lock().unwrap();
    let fatal_message = fatal.lock().unwrap().clone();
    let was_cancelled = *cancel.borrow();

    let (status, error_message) = if was_cancelled {
        (failed_status(mode), Some("cancelled".to_string()))
    } else if let Some(message) = fatal_message {
        (failed_status(mode), Some(message))
    } else {
        (completed_status(mode), None)
    };

    repo.finalize_sync_run(run.id, &final_counters, status, error_message.as_deref())
        .await?;

    if status == SyncRunStatus::Completed {
        token_mgr.commit(&pending_tokens).await?;
    }

    tracing::info!(
        kb = %target.kb_name,
        run = run.id,
        status = status.as_str(),
        total = final_counters.total,
        new = final_counters.new,
        modified = final_counters.modified,
        deleted = final_counters.deleted,
        errors = final_counters.errors,
        "sync run finished"
    );

    Ok(SyncOutcome {
        sync_run_id: run.id,
        status,
        counters: final_counters,
        error_message,
    })
}

/// LISTING + CLASSIFYING. Returns the classifications and the run's total
/// (the listing size, or the delta entry count for incremental listings).
async fn build_changes(
    repo: &Repository,
    target: &SyncTarget,
    source: &dyn FileSource,
    mode: RunMode,
    token_mgr: &DeltaTokenManager<'_>,
    pending_tokens: &mut PendingTokens,
) -> std::result::Result<(Vec<FileChange>, i64), String> {
    let latest = repo
        .latest_records_by_kb(&target.kb_name)
        .await
        .map_err(|e| format!("loading latest records: {e}"))?;

    // Scans always use the full listing: replaying a delta window would
    // consume nothing but also observe nothing but the changed tail.
    if mode == RunMode::Sync && source.supports_delta() {
        let drives = source.drives().await.map_err(|e| e.to_string())?;
        let mut entries = Vec::new();

        for drive_id in &drives {
            let token = token_mgr
                .token_for(drive_id)
                .await
                .map_err(|e| e.to_string())?;

            let page = match source.delta_list(drive_id, token.as_deref()).await {
                Ok(page) => page,
                Err(crate::error::SourceError::TokenInvalid) => {
                    token_mgr
                        .invalidate(drive_id)
                        .await
                        .map_err(|e| e.to_string())?;
                    source
                        .delta_list(drive_id, None)
                        .await
                        .map_err(|e| e.to_string())?
                }
                Err(e) => return Err(e.to_string()),
            };

            pending_tokens.push(drive_id, &page.new_token);
            entries.extend(page.entries);
        }

        let total = entries.len() as i64;
        return Ok((detector::detect_delta_changes(&entries, &latest), total));
    }

    let listing = source.list().await.map_err(|e| e.to_string())?;
    let total = listing.len() as i64;
    Ok((detector::detect_changes(&listing, &latest), total))
}

/// One file through timeout + retry. `Err` carries a fatal catalog failure.
async fn process_one(
    processor: &FileProcessor,
    source: &dyn FileSource,
    rag: &dyn RagStore,
    repo: &Repository,
    run_id: i64,
    change: &FileChange,
    opts: &SyncOptions,
) -> std::result::Result<Option<FileStatus>, String> {
    let attempts = opts.retry_attempts.max(1);
    let mut delay = Duration::from_millis(200);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match tokio::time::timeout(
            opts.file_timeout,
            processor.attempt(source, rag, repo, run_id, change),
        )
        .await
        {
            Ok(Ok(outcome)) => return Ok(outcome),
            Ok(Err(AttemptError::Fatal(e))) => return Err(e.to_string()),
            Ok(Err(e)) => {
                last_error = e.message();
                if !e.is_transient() {
                    break;
                }
                tracing::debug!(
                    uri = %change.uri,
                    attempt,
                    error = %last_error,
                    "transient failure; backing off"
                );
            }
            Err(_) => {
                last_error = format!(
                    "file operation timed out after {}s",
                    opts.file_timeout.as_secs()
                );
                break;
            }
        }

        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay *= 4;
        }
    }

    tracing::warn!(uri = %change.uri, error = %last_error, "recording file error");
    processor
        .record_error(repo, run_id, change, &last_error)
        .await
        .map_err(|e| e.to_string())?;
    Ok(Some(FileStatus::Error))
}

async fn recv_next(rx: &Arc<tokio::sync::Mutex<mpsc::Receiver<FileChange>>>) -> Option<FileChange> {
    rx.lock().await.recv().await
}

/// Resolves when the cancel signal flips to `true`; otherwise never.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    loop {
        if rx.changed().await.is_err() {
            // Sender gone without cancelling: stay pending forever.
            std::future::pending::<()>().await;
        }
        if *rx.borrow() {
            return;
        }
    }
}

fn completed_status(mode: RunMode) -> SyncRunStatus {
    match mode {
        RunMode::Sync => SyncRunStatus::Completed,
        RunMode::Scan => SyncRunStatus::ScanCompleted,
    }
}

fn failed_status(mode: RunMode) -> SyncRunStatus {
    match mode {
        RunMode::Sync => SyncRunStatus::Failed,
        RunMode::Scan => SyncRunStatus::ScanFailed,
    }
}
