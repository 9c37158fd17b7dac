//! Change detection: classify each URI in a source listing against the
//! catalog's latest records.
//!
//! Hashing is expensive — the bytes must be fetched first — so two cheap
//! pre-filters run before any fetch:
//!
//! 1. **Size**: a size mismatch is a definite modification; the processor
//!    fetches and hashes without a downgrade path.
//! 2. **Mtime**: when both sides carry a modification time and they agree
//!    within ±2 seconds (and the size matches), the file is unchanged and
//!    never fetched.
//!
//! Everything else becomes a *tentative* modification: the processor
//! fetches, hashes, and downgrades to unchanged when the hash matches.
//!
//! Restoration is deliberate: a URI whose latest record is `deleted` and
//! which reappears in the listing classifies as NEW, carrying the old
//! record forward so the processor reuses its UUID filename. That keeps the
//! RAG identifier stable across a delete/restore cycle.

use std::collections::{HashMap, HashSet};

use crate::models::{DeltaEntry, FileDescriptor, FileRecord, FileStatus, SyncCounters};

/// Modification-time agreement window. Heuristic; do not loosen without
/// evidence of false negatives.
pub const MTIME_TOLERANCE_SECS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    New,
    Modified,
    Unchanged,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::New => "new",
            ChangeType::Modified => "modified",
            ChangeType::Unchanged => "unchanged",
            ChangeType::Deleted => "deleted",
        }
    }
}

/// One classified URI, ready for the file processor.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub uri: String,
    pub change_type: ChangeType,
    /// Listing metadata; absent for deletions.
    pub descriptor: Option<FileDescriptor>,
    /// The latest catalog record; present for modifications, deletions, and
    /// restorations (where it supplies the UUID to reuse).
    pub existing: Option<FileRecord>,
    /// Tentative modification: size matched but mtime could not prove the
    /// file unchanged. The processor hashes and may downgrade.
    pub hash_check: bool,
}

/// Classify a full listing against the latest-records map.
pub fn detect_changes(
    listing: &[FileDescriptor],
    latest: &HashMap<String, FileRecord>,
) -> Vec<FileChange> {
    let mut changes: Vec<FileChange> = listing
        .iter()
        .map(|descriptor| classify_present(descriptor, latest.get(&descriptor.uri)))
        .collect();

    // Catalog URIs absent from the listing are deletions, except URIs
    // already recorded as deleted (emitting those every run would pile up
    // duplicate deletion records).
    let listed: HashSet<&str> = listing.iter().map(|d| d.uri.as_str()).collect();
    for (uri, record) in latest {
        if listed.contains(uri.as_str()) {
            continue;
        }
        if !is_live(record) {
            continue;
        }
        changes.push(FileChange {
            uri: uri.clone(),
            change_type: ChangeType::Deleted,
            descriptor: None,
            existing: Some(record.clone()),
            hash_check: false,
        });
    }

    changes
}

/// Classify a delta listing. Deletions come only from tombstones — a delta
/// page is partial by construction, so absence means nothing.
///
/// A window may mention the same URI several times (edited twice, edited
/// then deleted); the last entry carries the final state and is the only
/// one classified. That also keeps each URI in exactly one classification,
/// which is what lets the worker pool write each `rag_uri` from exactly
/// one task.
pub fn detect_delta_changes(
    entries: &[DeltaEntry],
    latest: &HashMap<String, FileRecord>,
) -> Vec<FileChange> {
    let mut final_state: HashMap<&str, &DeltaEntry> = HashMap::new();
    for entry in entries {
        let uri = match entry {
            DeltaEntry::Present(descriptor) => descriptor.uri.as_str(),
            DeltaEntry::Tombstone { uri } => uri.as_str(),
        };
        final_state.insert(uri, entry);
    }

    let mut changes = Vec::new();
    for entry in final_state.values() {
        match entry {
            DeltaEntry::Present(descriptor) => {
                changes.push(classify_present(descriptor, latest.get(&descriptor.uri)));
            }
            DeltaEntry::Tombstone { uri } => match latest.get(uri.as_str()) {
                Some(record) if is_live(record) => changes.push(FileChange {
                    uri: uri.clone(),
                    change_type: ChangeType::Deleted,
                    descriptor: None,
                    existing: Some(record.clone()),
                    hash_check: false,
                }),
                // Unknown to the catalog, or already deleted: no-op.
                _ => {}
            },
        }
    }

    changes
}

fn classify_present(descriptor: &FileDescriptor, existing: Option<&FileRecord>) -> FileChange {
    let Some(record) = existing else {
        return FileChange {
            uri: descriptor.uri.clone(),
            change_type: ChangeType::New,
            descriptor: Some(descriptor.clone()),
            existing: None,
            hash_check: false,
        };
    };

    // Restoration: deleted in the catalog, present again in the source.
    // NEW, but the old record rides along so its UUID filename is reused.
    if record.status == FileStatus::Deleted {
        return FileChange {
            uri: descriptor.uri.clone(),
            change_type: ChangeType::New,
            descriptor: Some(descriptor.clone()),
            existing: Some(record.clone()),
            hash_check: false,
        };
    }

    // A latest record of `error` means the last attempt never produced a
    // usable artifact or UUID; start the file's lifetime over.
    if record.status == FileStatus::Error {
        return FileChange {
            uri: descriptor.uri.clone(),
            change_type: ChangeType::New,
            descriptor: Some(descriptor.clone()),
            existing: None,
            hash_check: false,
        };
    }

    if descriptor.size != record.file_size {
        return FileChange {
            uri: descriptor.uri.clone(),
            change_type: ChangeType::Modified,
            descriptor: Some(descriptor.clone()),
            existing: Some(record.clone()),
            hash_check: false,
        };
    }

    if let (Some(listed), Some(stored)) = (descriptor.modified_at, record.source_modified_at) {
        if (listed - stored).num_seconds().abs() <= MTIME_TOLERANCE_SECS {
            return FileChange {
                uri: descriptor.uri.clone(),
                change_type: ChangeType::Unchanged,
                descriptor: Some(descriptor.clone()),
                existing: Some(record.clone()),
                hash_check: false,
            };
        }
    }

    FileChange {
        uri: descriptor.uri.clone(),
        change_type: ChangeType::Modified,
        descriptor: Some(descriptor.clone()),
        existing: Some(record.clone()),
        hash_check: true,
    }
}

/// Statuses that represent a file currently expected to exist in the RAG
/// backend. `deleted` is handled by the callers; `error` rows carry no
/// artifact to delete.
fn is_live(record: &FileRecord) -> bool {
    matches!(
        record.status,
        FileStatus::New | FileStatus::Modified | FileStatus::Unchanged
    )
}

/// Counts by classification, for the pre-processing summary.
pub fn change_summary(changes: &[FileChange]) -> SyncCounters {
    let mut counters = SyncCounters::default();
    for change in changes {
        match change.change_type {
            ChangeType::New => counters.new += 1,
            ChangeType::Modified => counters.modified += 1,
            ChangeType::Unchanged => counters.unchanged += 1,
            ChangeType::Deleted => counters.deleted += 1,
        }
    }
    counters
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn descriptor(uri: &str, size: i64, mtime: Option<i64>) -> FileDescriptor {
        FileDescriptor {
            uri: uri.to_string(),
            size,
            content_type: "application/octet-stream".to_string(),
            created_at: None,
            modified_at: mtime.map(|t| Utc.timestamp_opt(t, 0).unwrap()),
            metadata: serde_json::Value::Null,
        }
    }

    fn record(uri: &str, size: i64, mtime: Option<i64>, status: FileStatus) -> FileRecord {
        FileRecord {
            id: 1,
            sync_run_id: 1,
            original_uri: uri.to_string(),
            rag_uri: format!("kb/{uri}"),
            file_hash: "abc".to_string(),
            uuid_filename: "uuid-1.bin".to_string(),
            upload_time: Utc::now(),
            file_size: size,
            status,
            error_message: None,
            source_id: None,
            source_type: None,
            source_path: None,
            content_type: None,
            source_metadata: None,
            source_created_at: None,
            source_modified_at: mtime.map(|t| Utc.timestamp_opt(t, 0).unwrap()),
            tags: None,
        }
    }

    fn latest(records: Vec<FileRecord>) -> HashMap<String, FileRecord> {
        records
            .into_iter()
            .map(|r| (r.original_uri.clone(), r))
            .collect()
    }

    #[test]
    fn unknown_uri_is_new() {
        let changes = detect_changes(&[descriptor("a.pdf", 100, Some(1000))], &HashMap::new());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::New);
        assert!(changes[0].existing.is_none());
    }

    #[test]
    fn size_mismatch_is_definite_modification() {
        let map = latest(vec![record("a.pdf", 100, Some(1000), FileStatus::New)]);
        let changes = detect_changes(&[descriptor("a.pdf", 120, Some(1000))], &map);
        assert_eq!(changes[0].change_type, ChangeType::Modified);
        assert!(!changes[0].hash_check);
    }

    #[test]
    fn mtime_within_tolerance_is_unchanged() {
        let map = latest(vec![record("a.pdf", 100, Some(1000), FileStatus::New)]);
        for delta in [-2, -1, 0, 1, 2] {
            let changes = detect_changes(&[descriptor("a.pdf", 100, Some(1000 + delta))], &map);
            assert_eq!(changes[0].change_type, ChangeType::Unchanged, "Δ={delta}");
        }
    }

    #[test]
    fn mtime_outside_tolerance_is_tentative_modification() {
        let map = latest(vec![record("a.pdf", 100, Some(1000), FileStatus::New)]);
        let changes = detect_changes(&[descriptor("a.pdf", 100, Some(1003))], &map);
        assert_eq!(changes[0].change_type, ChangeType::Modified);
        assert!(changes[0].hash_check);
    }

    #[test]
    fn missing_mtime_is_tentative_modification() {
        let map = latest(vec![record("a.pdf", 100, Some(1000), FileStatus::New)]);
        let changes = detect_changes(&[descriptor("a.pdf", 100, None)], &map);
        assert_eq!(changes[0].change_type, ChangeType::Modified);
        assert!(changes[0].hash_check);

        // Stored side missing too
        let map = latest(vec![record("a.pdf", 100, None, FileStatus::New)]);
        let changes = detect_changes(&[descriptor("a.pdf", 100, Some(1000))], &map);
        assert!(changes[0].hash_check);
    }

    #[test]
    fn absent_live_uri_is_deleted() {
        let map = latest(vec![record("gone.txt", 50, Some(1000), FileStatus::Unchanged)]);
        let changes = detect_changes(&[], &map);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Deleted);
        assert_eq!(changes[0].existing.as_ref().unwrap().uuid_filename, "uuid-1.bin");
    }

    #[test]
    fn already_deleted_uri_is_suppressed() {
        let map = latest(vec![record("gone.txt", 50, Some(1000), FileStatus::Deleted)]);
        let changes = detect_changes(&[], &map);
        assert!(changes.is_empty());
    }

    #[test]
    fn deleted_then_present_is_restoration() {
        let map = latest(vec![record("back.txt", 50, Some(1000), FileStatus::Deleted)]);
        let changes = detect_changes(&[descriptor("back.txt", 50, Some(2000))], &map);
        assert_eq!(changes[0].change_type, ChangeType::New);
        // The old record rides along for UUID reuse
        assert!(changes[0].existing.is_some());
    }

    #[test]
    fn error_latest_restarts_lifetime() {
        let map = latest(vec![record("flaky.txt", 0, None, FileStatus::Error)]);
        let changes = detect_changes(&[descriptor("flaky.txt", 10, Some(1000))], &map);
        assert_eq!(changes[0].change_type, ChangeType::New);
        assert!(changes[0].existing.is_none());

        // And an absent error row produces nothing to delete
        let changes = detect_changes(&[], &map);
        assert!(changes.is_empty());
    }

    #[test]
    fn delta_tombstone_deletes_live_record() {
        let map = latest(vec![record("a.pdf", 100, Some(1000), FileStatus::New)]);
        let entries = vec![DeltaEntry::Tombstone {
            uri: "a.pdf".to_string(),
        }];
        let changes = detect_delta_changes(&entries, &map);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Deleted);
    }

    #[test]
    fn delta_tombstone_for_unknown_or_deleted_is_noop() {
        let map = latest(vec![record("a.pdf", 100, Some(1000), FileStatus::Deleted)]);
        let entries = vec![
            DeltaEntry::Tombstone { uri: "a.pdf".to_string() },
            DeltaEntry::Tombstone { uri: "never-seen.pdf".to_string() },
        ];
        assert!(detect_delta_changes(&entries, &map).is_empty());
    }

    #[test]
    fn delta_absence_is_not_deletion() {
        // 1873 files in the catalog, delta page mentions one: nothing else
        // may classify as deleted.
        let map = latest(vec![
            record("kept.pdf", 10, Some(1000), FileStatus::New),
            record("touched.pdf", 10, Some(1000), FileStatus::New),
        ]);
        let entries = vec![DeltaEntry::Present(descriptor("touched.pdf", 20, Some(2000)))];
        let changes = detect_delta_changes(&entries, &map);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].uri, "touched.pdf");
        assert_eq!(changes[0].change_type, ChangeType::Modified);
    }

    #[test]
    fn delta_last_entry_per_uri_wins() {
        // Edited then deleted within one window: only the deletion counts.
        let map = latest(vec![record("a.pdf", 100, Some(1000), FileStatus::New)]);
        let entries = vec![
            DeltaEntry::Present(descriptor("a.pdf", 120, Some(2000))),
            DeltaEntry::Tombstone { uri: "a.pdf".to_string() },
        ];
        let changes = detect_delta_changes(&entries, &map);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Deleted);
    }

    #[test]
    fn tolerance_uses_chrono_arithmetic() {
        let base = Utc.timestamp_opt(1000, 0).unwrap();
        assert_eq!((base + Duration::seconds(2) - base).num_seconds(), 2);
    }

    #[test]
    fn summary_counts() {
        let map = latest(vec![
            record("a", 1, Some(1000), FileStatus::New),
            record("gone", 1, Some(1000), FileStatus::New),
        ]);
        let listing = vec![descriptor("a", 1, Some(1000)), descriptor("b", 2, None)];
        let summary = change_summary(&detect_changes(&listing, &map));
        assert_eq!(summary.new, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.deleted, 1);
    }
}
