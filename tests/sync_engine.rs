//! End-to-end sync engine suite: a scripted source, the recording mock RAG
//! backend, and a temp SQLite catalog.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use ragsync::models::{DeltaEntry, FileStatus, SyncRunStatus};
use ragsync::rag_mock::MockRagStore;
use ragsync::sync::RunMode;

/// Fresh KB, three files, all new: three uploads, three distinct UUID
/// filenames, counters total=3/new=3.
#[tokio::test]
async fn fresh_kb_uploads_every_file() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "docs").await;
    let rag = MockRagStore::new("docs");

    let source = ScriptedSource::new();
    source.insert("a.pdf", &[1u8; 100], Some(1_704_067_200));
    source.insert("b.txt", &[2u8; 50], Some(1_704_067_200));
    source.insert("c.md", &[3u8; 75], Some(1_704_067_200));

    let outcome = sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;

    assert_eq!(outcome.status, SyncRunStatus::Completed);
    assert_eq!(outcome.counters.total, 3);
    assert_eq!(outcome.counters.new, 3);
    assert_eq!(outcome.counters.modified, 0);
    assert_eq!(outcome.counters.deleted, 0);
    assert_eq!(rag.upload_calls().len(), 3);
    assert_eq!(rag.update_calls().len(), 0);

    let latest = repo.latest_records_by_kb("docs").await.unwrap();
    assert_eq!(latest.len(), 3);
    let mut uuids: Vec<String> = latest.values().map(|r| r.uuid_filename.clone()).collect();
    uuids.sort();
    uuids.dedup();
    assert_eq!(uuids.len(), 3, "uuid filenames must be distinct");
    for record in latest.values() {
        assert_eq!(record.status, FileStatus::New);
        assert!(!record.rag_uri.is_empty());
        assert_eq!(record.file_hash.len(), 64);
    }
}

/// Unchanged second sync: every URI short-circuits on the mtime pre-filter,
/// zero fetches, zero RAG calls.
#[tokio::test]
async fn unchanged_sync_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "docs").await;
    let rag = MockRagStore::new("docs");

    let source = ScriptedSource::new();
    source.insert("a.pdf", &[1u8; 100], Some(1_704_067_200));
    source.insert("b.txt", &[2u8; 50], Some(1_704_067_200));
    source.insert("c.md", &[3u8; 75], Some(1_704_067_200));

    sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;
    let fetches_after_first = source.total_fetches();
    let calls_after_first = rag.total_calls();

    let outcome = sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;

    assert_eq!(outcome.counters.total, 3);
    assert_eq!(outcome.counters.new, 0);
    assert_eq!(outcome.counters.modified, 0);
    assert_eq!(outcome.counters.deleted, 0);
    assert_eq!(outcome.counters.unchanged, 3);
    assert_eq!(source.total_fetches(), fetches_after_first, "no fetch may occur");
    assert_eq!(rag.total_calls(), calls_after_first, "no RAG call may occur");
}

/// Modify + delete: the modified file updates in place under its original
/// rag_uri and UUID; the deleted file keeps its UUID on the deletion row.
#[tokio::test]
async fn modification_and_deletion() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "docs").await;
    let rag = MockRagStore::new("docs");

    let source = ScriptedSource::new();
    source.insert("a.pdf", &[1u8; 100], Some(1_704_067_200));
    source.insert("b.txt", &[2u8; 50], Some(1_704_067_200));
    source.insert("c.md", &[3u8; 75], Some(1_704_067_200));
    sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;

    let before = repo.latest_records_by_kb("docs").await.unwrap();
    let a_before = before["a.pdf"].clone();
    let b_before = before["b.txt"].clone();

    // a.pdf grows to 120 bytes; b.txt disappears
    source.insert("a.pdf", &[9u8; 120], Some(1_706_745_600));
    source.remove("b.txt");
    let a_fetches_before = source.fetch_count("a.pdf");

    let outcome = sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;

    assert_eq!(outcome.counters.total, 2);
    assert_eq!(outcome.counters.new, 0);
    assert_eq!(outcome.counters.modified, 1);
    assert_eq!(outcome.counters.deleted, 1);
    assert_eq!(outcome.counters.unchanged, 1); // c.md via mtime pre-filter

    // Size pre-filter: fetched exactly once, hash stored on the new row
    assert_eq!(source.fetch_count("a.pdf"), a_fetches_before + 1);

    let after = repo.latest_records_by_kb("docs").await.unwrap();
    let a_after = &after["a.pdf"];
    assert_eq!(a_after.status, FileStatus::Modified);
    assert_eq!(a_after.rag_uri, a_before.rag_uri, "rag_uri stable across modify");
    assert_eq!(a_after.uuid_filename, a_before.uuid_filename);
    assert_eq!(a_after.file_hash.len(), 64);
    assert_ne!(a_after.file_hash, a_before.file_hash);

    // One upload (initial), then updates only
    assert_eq!(
        rag.upload_calls()
            .iter()
            .filter(|uri| *uri == &a_before.rag_uri)
            .count(),
        1
    );
    assert_eq!(rag.update_calls(), vec![a_before.rag_uri.clone()]);

    let b_after = &after["b.txt"];
    assert_eq!(b_after.status, FileStatus::Deleted);
    assert_eq!(b_after.uuid_filename, b_before.uuid_filename);
    assert_eq!(b_after.rag_uri, b_before.rag_uri);
    assert_eq!(b_after.file_hash, "");
    assert_eq!(rag.delete_calls(), vec![b_before.rag_uri.clone()]);
}

/// A URI already deleted and still absent produces no new rows and no
/// deleted-counter increment.
#[tokio::test]
async fn deletion_is_not_repeated() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "docs").await;
    let rag = MockRagStore::new("docs");

    let source = ScriptedSource::new();
    source.insert("keep.txt", &[1u8; 10], Some(1_704_067_200));
    source.insert("gone.txt", &[2u8; 20], Some(1_704_067_200));
    sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;

    source.remove("gone.txt");
    sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;
    let deletes_after_first = rag.delete_calls().len();
    let history_len = repo.records_by_uri(kb.id, "gone.txt").await.unwrap().len();

    let outcome = sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;

    assert_eq!(outcome.counters.deleted, 0);
    assert_eq!(rag.delete_calls().len(), deletes_after_first);
    assert_eq!(
        repo.records_by_uri(kb.id, "gone.txt").await.unwrap().len(),
        history_len,
        "no duplicate deletion rows"
    );
}

/// Restoration: delete in run N, reappear in run N+1. Classified NEW, the
/// original UUID is reused, and Upload (not Update) is called.
#[tokio::test]
async fn restoration_reuses_uuid() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "docs").await;
    let rag = MockRagStore::new("docs");

    let source = ScriptedSource::new();
    source.insert("b.txt", &[2u8; 50], Some(1_704_067_200));
    sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;
    let original = repo.latest_records_by_kb("docs").await.unwrap()["b.txt"].clone();

    source.remove("b.txt");
    sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;

    source.insert("b.txt", &[2u8; 50], Some(1_704_067_200));
    let outcome = sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;

    assert_eq!(outcome.counters.new, 1);
    let restored = repo.latest_records_by_kb("docs").await.unwrap()["b.txt"].clone();
    assert_eq!(restored.status, FileStatus::New);
    assert_eq!(restored.uuid_filename, original.uuid_filename);
    assert_eq!(restored.rag_uri, original.rag_uri);

    // Upload twice (initial + restoration), never Update
    assert_eq!(
        rag.upload_calls()
            .iter()
            .filter(|uri| *uri == &original.rag_uri)
            .count(),
        2
    );
    assert!(rag.update_calls().is_empty());

    // UUID identical across the full history, including the deleted row
    let history = repo.records_by_uri(kb.id, "b.txt").await.unwrap();
    assert_eq!(history.len(), 3);
    for record in &history {
        assert_eq!(record.uuid_filename, original.uuid_filename);
    }
}

/// No mtime, same size, same bytes: the tentative modification downgrades
/// to an unchanged row after the hash check, with no RAG update.
#[tokio::test]
async fn hash_verified_downgrade() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "docs").await;
    let rag = MockRagStore::new("docs");

    let source = ScriptedSource::new();
    source.insert("n.bin", b"same-bytes", None);
    sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;

    let outcome = sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;

    assert_eq!(outcome.counters.modified, 0);
    assert_eq!(outcome.counters.unchanged, 1);
    assert!(rag.update_calls().is_empty());
    assert_eq!(source.fetch_count("n.bin"), 2, "second sync must fetch to verify");

    let history = repo.records_by_uri(kb.id, "n.bin").await.unwrap();
    assert_eq!(history.last().unwrap().status, FileStatus::Unchanged);

    // Same size, different bytes: a real modification
    source.insert("n.bin", b"diff-bytes", None);
    let outcome = sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;
    assert_eq!(outcome.counters.modified, 1);
    assert_eq!(rag.update_calls().len(), 1);
}

/// Delta-driven sync: only the replayed entries are considered, tombstones
/// delete, and the token advances exactly once on success.
#[tokio::test]
async fn delta_sync_applies_changes_and_advances_token() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "sp-kb").await;
    let rag = MockRagStore::new("sp-kb");

    // Baseline: two files known to the catalog
    let delta_source = ScriptedDeltaSource::new("token-v1");
    delta_source.add_file("Documents/keep.pdf", &[1u8; 40]);
    delta_source.add_file("Documents/edit.pdf", &[2u8; 60]);
    delta_source.set_entries(vec![
        present("Documents/keep.pdf", 40, Some(1_704_067_200)),
        present("Documents/edit.pdf", 60, Some(1_704_067_200)),
    ]);

    let (_tx, rx) = ragsync::sync::cancellation();
    let outcome = sync_with(
        &repo,
        &kb,
        Arc::new(delta_source.clone()),
        &rag,
        RunMode::Sync,
        &fast_options(),
        rx,
    )
    .await;
    assert_eq!(outcome.counters.new, 2);
    assert_eq!(delta_source.tokens_seen(), vec![None]);
    assert_eq!(
        repo.get_delta_token("sp-kb", DRIVE_ID).await.unwrap(),
        Some("token-v1".to_string())
    );

    // Incremental window: one modified file, one tombstone
    delta_source.add_file("Documents/edit.pdf", &[9u8; 61]);
    delta_source.set_entries(vec![
        present("Documents/edit.pdf", 61, Some(1_706_745_600)),
        tombstone("Documents/keep.pdf"),
    ]);
    delta_source.set_new_token("token-v2");

    let (_tx, rx) = ragsync::sync::cancellation();
    let outcome = sync_with(
        &repo,
        &kb,
        Arc::new(delta_source.clone()),
        &rag,
        RunMode::Sync,
        &fast_options(),
        rx,
    )
    .await;

    assert_eq!(outcome.counters.total, 2);
    assert_eq!(outcome.counters.modified, 1);
    assert_eq!(outcome.counters.deleted, 1);
    assert_eq!(outcome.counters.new, 0);
    assert_eq!(
        delta_source.tokens_seen(),
        vec![None, Some("token-v1".to_string())]
    );
    assert_eq!(
        repo.get_delta_token("sp-kb", DRIVE_ID).await.unwrap(),
        Some("token-v2".to_string())
    );

    // The untouched catalog entry was not classified as deleted
    let latest = repo.latest_records_by_kb("sp-kb").await.unwrap();
    assert_eq!(latest["Documents/edit.pdf"].status, FileStatus::Modified);
    assert_eq!(latest["Documents/keep.pdf"].status, FileStatus::Deleted);
}

/// An invalid stored token is cleared and the same run re-baselines.
#[tokio::test]
async fn invalid_delta_token_rebaselines_in_same_run() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "sp-kb").await;
    let rag = MockRagStore::new("sp-kb");

    repo.save_delta_token("sp-kb", "enterprise_sharepoint", DRIVE_ID, "expired")
        .await
        .unwrap();

    let delta_source = ScriptedDeltaSource::new("token-fresh");
    delta_source.invalidate_token("expired");
    delta_source.add_file("Documents/a.pdf", &[1u8; 10]);
    delta_source.set_entries(vec![present("Documents/a.pdf", 10, Some(1_704_067_200))]);

    let (_tx, rx) = ragsync::sync::cancellation();
    let outcome = sync_with(
        &repo,
        &kb,
        Arc::new(delta_source.clone()),
        &rag,
        RunMode::Sync,
        &fast_options(),
        rx,
    )
    .await;

    assert_eq!(outcome.status, SyncRunStatus::Completed);
    assert_eq!(outcome.counters.new, 1);
    assert_eq!(
        delta_source.tokens_seen(),
        vec![Some("expired".to_string()), None],
        "rejected token must be followed by a baseline listing"
    );
    assert_eq!(
        repo.get_delta_token("sp-kb", DRIVE_ID).await.unwrap(),
        Some("token-fresh".to_string())
    );
}

/// A failed (cancelled) run leaves the stored token untouched.
#[tokio::test]
async fn failed_run_does_not_advance_token() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "sp-kb").await;
    let rag = MockRagStore::new("sp-kb");

    repo.save_delta_token("sp-kb", "enterprise_sharepoint", DRIVE_ID, "token-v1")
        .await
        .unwrap();

    let delta_source = ScriptedDeltaSource::new("token-v2");
    delta_source.add_file("Documents/a.pdf", &[1u8; 10]);
    delta_source.set_entries(vec![present("Documents/a.pdf", 10, Some(1_704_067_200))]);

    let (tx, rx) = ragsync::sync::cancellation();
    tx.send(true).unwrap();

    let outcome = sync_with(
        &repo,
        &kb,
        Arc::new(delta_source),
        &rag,
        RunMode::Sync,
        &fast_options(),
        rx,
    )
    .await;

    assert_eq!(outcome.status, SyncRunStatus::Failed);
    assert_eq!(outcome.error_message.as_deref(), Some("cancelled"));
    assert_eq!(
        repo.get_delta_token("sp-kb", DRIVE_ID).await.unwrap(),
        Some("token-v1".to_string()),
        "failed run must not advance the token"
    );
}

/// Cancellation mid-run: status failed/"cancelled", end_time set, every
/// inserted row well-formed.
#[tokio::test]
async fn cancellation_is_clean() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "docs").await;
    let rag = MockRagStore::new("docs");

    let source = ScriptedSource::new();
    for i in 0..50 {
        source.insert(&format!("file-{i:02}.bin"), &[i as u8; 64], Some(1_704_067_200));
    }
    source.set_fetch_delay(Duration::from_millis(50));

    let (tx, rx) = ragsync::sync::cancellation();
    let repo_clone = repo.clone();
    let kb_clone = kb.clone();
    let source_clone = source.clone();
    let rag_clone = rag.clone();
    let run = tokio::spawn(async move {
        sync_with(
            &repo_clone,
            &kb_clone,
            Arc::new(source_clone),
            &rag_clone,
            RunMode::Sync,
            &fast_options(),
            rx,
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(120)).await;
    tx.send(true).unwrap();
    let outcome = run.await.unwrap();

    assert_eq!(outcome.status, SyncRunStatus::Failed);
    assert_eq!(outcome.error_message.as_deref(), Some("cancelled"));
    assert!(
        (outcome.counters.new as usize) < 50,
        "cancellation should land mid-run"
    );

    let run_row = repo.get_sync_run(outcome.sync_run_id).await.unwrap().unwrap();
    assert_eq!(run_row.status, SyncRunStatus::Failed);
    assert!(run_row.end_time.is_some());
    assert_eq!(run_row.error_message.as_deref(), Some("cancelled"));

    for record in repo.records_by_run(outcome.sync_run_id).await.unwrap() {
        assert!(!record.rag_uri.is_empty(), "no orphan rows with empty rag_uri");
        assert!(!record.original_uri.is_empty());
    }
}

/// Adapter failures produce well-formed error rows and never fail the run.
#[tokio::test]
async fn per_file_errors_are_recorded_not_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "docs").await;
    let rag = MockRagStore::new("docs");

    let source = ScriptedSource::new();
    source.insert("ok.txt", &[1u8; 10], Some(1_704_067_200));
    source.insert("bad.txt", &[2u8; 10], Some(1_704_067_200));
    source.fail_fetch("bad.txt");

    let outcome = sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;

    assert_eq!(outcome.status, SyncRunStatus::Completed);
    assert_eq!(outcome.counters.new, 1);
    assert_eq!(outcome.counters.errors, 1);

    let history = repo.records_by_uri(kb.id, "bad.txt").await.unwrap();
    assert_eq!(history.len(), 1);
    let error_row = &history[0];
    assert_eq!(error_row.status, FileStatus::Error);
    assert!(error_row.rag_uri.starts_with("docs/error-"));
    assert_eq!(error_row.file_hash, "");
    assert_eq!(error_row.uuid_filename, "");
    assert!(error_row
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("scripted failure"));
}

/// Transient failures retry with backoff and succeed without an error row.
#[tokio::test]
async fn transient_errors_retry() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "docs").await;
    let rag = MockRagStore::new("docs");

    let source = ScriptedSource::new();
    source.insert("flaky.txt", &[1u8; 10], Some(1_704_067_200));
    source.fail_transiently("flaky.txt", 2);

    let mut opts = fast_options();
    opts.retry_attempts = 3;
    let (_tx, rx) = ragsync::sync::cancellation();
    let outcome = sync_with(&repo, &kb, Arc::new(source.clone()), &rag, RunMode::Sync, &opts, rx).await;

    assert_eq!(outcome.counters.new, 1);
    assert_eq!(outcome.counters.errors, 0);
    assert_eq!(source.fetch_count("flaky.txt"), 3);
}

/// Scan mode records scanned rows, never touches the backend, and leaves
/// change detection for the next real sync untouched.
#[tokio::test]
async fn scan_mode_is_non_mutating() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "docs").await;
    let rag = MockRagStore::new("docs");

    let source = ScriptedSource::new();
    source.insert("a.txt", &[1u8; 10], Some(1_704_067_200));
    source.insert("b.txt", &[2u8; 20], Some(1_704_067_200));

    let outcome = sync_once(&repo, &kb, &source, &rag, RunMode::Scan).await;

    assert_eq!(outcome.status, SyncRunStatus::ScanCompleted);
    assert_eq!(outcome.counters.new, 2);
    assert_eq!(rag.total_calls(), 0, "scan must not touch the backend");

    let scan_rows = repo.records_by_run(outcome.sync_run_id).await.unwrap();
    assert_eq!(scan_rows.len(), 2);
    for record in &scan_rows {
        assert_eq!(record.status, FileStatus::Scanned);
        assert!(!record.rag_uri.is_empty());
    }

    // Scan rows are invisible to change detection: the real sync still
    // classifies both files as new.
    let outcome = sync_once(&repo, &kb, &source, &rag, RunMode::Sync).await;
    assert_eq!(outcome.counters.new, 2);
    assert_eq!(rag.upload_calls().len(), 2);
}

/// An abandoned run (non-terminal status, process gone) is failed by the
/// pre-sync sweep, never deleted; terminal runs are untouched.
#[tokio::test]
async fn abandoned_runs_are_failed_not_deleted() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "docs").await;

    let stale_sync = repo
        .create_sync_run(kb.id, SyncRunStatus::Running)
        .await
        .unwrap();
    let stale_scan = repo
        .create_sync_run(kb.id, SyncRunStatus::ScanRunning)
        .await
        .unwrap();
    let done = repo
        .create_sync_run(kb.id, SyncRunStatus::Running)
        .await
        .unwrap();
    repo.finalize_sync_run(done.id, &Default::default(), SyncRunStatus::Completed, None)
        .await
        .unwrap();

    assert_eq!(repo.fail_abandoned_runs(kb.id).await.unwrap(), 2);

    let sync_row = repo.get_sync_run(stale_sync.id).await.unwrap().unwrap();
    assert_eq!(sync_row.status, SyncRunStatus::Failed);
    assert_eq!(sync_row.error_message.as_deref(), Some("abandoned"));
    assert!(sync_row.end_time.is_some());

    let scan_row = repo.get_sync_run(stale_scan.id).await.unwrap().unwrap();
    assert_eq!(scan_row.status, SyncRunStatus::ScanFailed);

    let done_row = repo.get_sync_run(done.id).await.unwrap().unwrap();
    assert_eq!(done_row.status, SyncRunStatus::Completed);
}

/// A vanishing delta source entry (tombstone for an unknown URI) is a
/// no-op rather than an error.
#[tokio::test]
async fn unknown_tombstone_is_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repository(tmp.path()).await;
    let kb = register_kb(&repo, "sp-kb").await;
    let rag = MockRagStore::new("sp-kb");

    let delta_source = ScriptedDeltaSource::new("t1");
    delta_source.set_entries(vec![DeltaEntry::Tombstone {
        uri: "Documents/never-seen.pdf".to_string(),
    }]);

    let (_tx, rx) = ragsync::sync::cancellation();
    let outcome = sync_with(
        &repo,
        &kb,
        Arc::new(delta_source),
        &rag,
        RunMode::Sync,
        &fast_options(),
        rx,
    )
    .await;

    assert_eq!(outcome.status, SyncRunStatus::Completed);
    assert_eq!(outcome.counters.deleted, 0);
    assert!(rag.delete_calls().is_empty());
}
