//! Multi-source sync driver.
//!
//! Fans one logical sync out across the enabled sources of a multi-source
//! KB — concurrently (`parallel`), one at a time (`sequential`), or over a
//! caller-named subset (`selective`) — then reconciles per-source results
//! into the multi-source run record.
//!
//! # The schema bridge
//!
//! The catalog's `sync_run` table references the single-source
//! `knowledge_base` table, but a multi-source KB lives in its own table. To
//! keep the foreign key satisfied (and to keep finding historical records
//! of KBs that evolved from single-source setups), the driver resolves a
//! *compatible* single-source KB id:
//!
//! 1. the lowest-id KB whose name matches `"<multi-kb-name>_%"`, else
//! 2. a placeholder KB named `"<multi-kb-name>_placeholder"` with the
//!    sentinel source type `multi_source_placeholder`.
//!
//! Every per-source `sync_run` row is written under that compatible id, and
//! change detection reads the compatible KB's name. The multi-source run
//! row carries the real KB id plus the compatible id as an auxiliary field.
//! Deliberate wart; do not "clean it up" — historical-record lookup depends
//! on it.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::models::{
    KnowledgeBase, MultiSourceKnowledgeBase, SourceDefinition, SourceStats, SyncCounters,
    SyncMode, SyncRunStatus,
};
use crate::processor::SourceContext;
use crate::rag::create_rag;
use crate::repository::Repository;
use crate::source::create_source;
use crate::sync::{run_sync, RunMode, SyncOptions, SyncOutcome, SyncTarget};

pub const PLACEHOLDER_SOURCE_TYPE: &str = "multi_source_placeholder";

#[derive(Debug, Clone)]
pub struct MultiSyncOutcome {
    pub run_id: i64,
    pub status: SyncRunStatus,
    pub counters: SyncCounters,
    pub source_stats: BTreeMap<String, SourceStats>,
    pub sources_processed: Vec<String>,
    pub compatible_kb_id: i64,
    pub error_message: Option<String>,
}

/// Resolve (or create) the compatible single-source KB for FK purposes.
pub async fn resolve_compatible_kb(
    repo: &Repository,
    multi_kb: &MultiSourceKnowledgeBase,
) -> Result<KnowledgeBase> {
    let pattern = format!("{}_%", multi_kb.name);
    if let Some(id) = repo.find_knowledge_base_like(&pattern).await? {
        let kb = repo
            .get_knowledge_base(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("compatible KB {id} disappeared during resolution"))?;
        tracing::info!(kb = %multi_kb.name, compatible = %kb.name, "schema bridge reusing existing KB");
        return Ok(kb);
    }

    let placeholder_name = format!("{}_placeholder", multi_kb.name);
    tracing::info!(kb = %multi_kb.name, placeholder = %placeholder_name, "schema bridge creating placeholder KB");

    let source_config = serde_json::json!({
        "placeholder": true,
        "multi_source_kb_id": multi_kb.id,
    });
    let id = repo
        .create_knowledge_base(
            &placeholder_name,
            PLACEHOLDER_SOURCE_TYPE,
            &source_config,
            &multi_kb.rag_type,
            &multi_kb.rag_config,
        )
        .await
        .with_context(|| {
            format!(
                "cannot create compatible KB for multi-source KB '{}'; sync_run foreign key cannot be satisfied",
                multi_kb.name
            )
        })?;

    repo.get_knowledge_base(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("placeholder KB {id} missing after insert"))
}

/// Run one multi-source sync.
///
/// `selected` restricts the run to the named source ids; it is required for
/// [`SyncMode::Selective`] and optional otherwise.
pub async fn run_multi_sync(
    repo: &Repository,
    multi_kb: &MultiSourceKnowledgeBase,
    mode: SyncMode,
    selected: Option<&[String]>,
    opts: &SyncOptions,
    cancel: watch::Receiver<bool>,
) -> Result<MultiSyncOutcome> {
    // Bridge resolution failures abort before any per-file work.
    let compatible = resolve_compatible_kb(repo, multi_kb).await?;

    // Sweep abandoned runs once, before any run of this sync exists.
    let abandoned = repo.fail_abandoned_runs(compatible.id).await?;
    if abandoned > 0 {
        tracing::warn!(kb = %multi_kb.name, runs = abandoned, "failed abandoned sync runs");
    }

    let run_id = repo
        .create_multi_source_sync_run(multi_kb.id, compatible.id, mode)
        .await?;

    let defs = match select_sources(multi_kb, mode, selected) {
        Ok(defs) => defs,
        Err(message) => {
            let counters = SyncCounters::default();
            repo.finalize_multi_source_sync_run(
                run_id,
                &counters,
                SyncRunStatus::Failed,
                Some(&message),
                &[],
                &Value::Object(Default::default()),
            )
            .await?;
            return Ok(MultiSyncOutcome {
                run_id,
                status: SyncRunStatus::Failed,
                counters,
                source_stats: BTreeMap::new(),
                sources_processed: Vec::new(),
                compatible_kb_id: compatible.id,
                error_message: Some(message),
            });
        }
    };

    let target = SyncTarget {
        kb_id: compatible.id,
        kb_name: compatible.name.clone(),
    };
    let naming_convention = multi_kb
        .file_organization
        .get("naming_convention")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    tracing::info!(
        kb = %multi_kb.name,
        run = run_id,
        mode = mode.as_str(),
        sources = defs.len(),
        "multi-source sync started"
    );

    let mut stats: BTreeMap<String, SourceStats> = BTreeMap::new();
    match mode {
        SyncMode::Sequential => {
            for def in &defs {
                if *cancel.borrow() {
                    break;
                }
                let (source_id, source_stats) = sync_one_source(
                    repo.clone(),
                    target.clone(),
                    (*def).clone(),
                    multi_kb.rag_type.clone(),
                    multi_kb.rag_config.clone(),
                    multi_kb.name.clone(),
                    naming_convention.clone(),
                    *opts,
                    cancel.clone(),
                )
                .await;
                stats.insert(source_id, source_stats);
            }
        }
        // Selective restricts the set; execution is concurrent like
        // parallel. Incremental rides the per-source delta tokens.
        SyncMode::Parallel | SyncMode::Selective | SyncMode::Incremental => {
            let mut jobs = JoinSet::new();
            for def in &defs {
                jobs.spawn(sync_one_source(
                    repo.clone(),
                    target.clone(),
                    (*def).clone(),
                    multi_kb.rag_type.clone(),
                    multi_kb.rag_config.clone(),
                    multi_kb.name.clone(),
                    naming_convention.clone(),
                    *opts,
                    cancel.clone(),
                ));
            }
            while let Some(joined) = jobs.join_next().await {
                match joined {
                    Ok((source_id, source_stats)) => {
                        stats.insert(source_id, source_stats);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "source sync task panicked");
                    }
                }
            }
        }
    }

    // Reconcile
    let mut counters = SyncCounters::default();
    for s in stats.values() {
        counters.total += s.files_total;
        counters.new += s.files_new;
        counters.modified += s.files_modified;
        counters.deleted += s.files_deleted;
        counters.errors += s.errors;
    }
    let sources_processed: Vec<String> = stats.keys().cloned().collect();

    let failed_sources: Vec<&str> = stats
        .iter()
        .filter(|(_, s)| s.status != SyncRunStatus::Completed.as_str())
        .map(|(id, _)| id.as_str())
        .collect();

    let (status, error_message) = if *cancel.borrow() {
        (SyncRunStatus::Failed, Some("cancelled".to_string()))
    } else if !stats.is_empty() && failed_sources.len() == stats.len() {
        (
            SyncRunStatus::Failed,
            Some(format!("all sources failed: {}", failed_sources.join(", "))),
        )
    } else if !failed_sources.is_empty() {
        (
            SyncRunStatus::Completed,
            Some(format!("sources failed: {}", failed_sources.join(", "))),
        )
    } else {
        (SyncRunStatus::Completed, None)
    };

    repo.finalize_multi_source_sync_run(
        run_id,
        &counters,
        status,
        error_message.as_deref(),
        &sources_processed,
        &serde_json::to_value(&stats)?,
    )
    .await?;

    tracing::info!(
        kb = %multi_kb.name,
        run = run_id,
        status = status.as_str(),
        sources = sources_processed.len(),
        "multi-source sync finished"
    );

    Ok(MultiSyncOutcome {
        run_id,
        status,
        counters,
        source_stats: stats,
        sources_processed,
        compatible_kb_id: compatible.id,
        error_message,
    })
}

fn select_sources<'a>(
    multi_kb: &'a MultiSourceKnowledgeBase,
    mode: SyncMode,
    selected: Option<&[String]>,
) -> std::result::Result<Vec<&'a SourceDefinition>, String> {
    let enabled = multi_kb.enabled_sources();

    let Some(names) = selected else {
        if mode == SyncMode::Selective {
            return Err("selective mode requires a list of source ids".to_string());
        }
        if enabled.is_empty() {
            return Err(format!("knowledge base '{}' has no enabled sources", multi_kb.name));
        }
        return Ok(enabled);
    };

    let mut out = Vec::new();
    for name in names {
        match enabled.iter().find(|d| &d.source_id == name) {
            Some(def) => out.push(*def),
            None => {
                return Err(format!(
                    "source '{name}' is not an enabled source of knowledge base '{}'",
                    multi_kb.name
                ))
            }
        }
    }
    if out.is_empty() {
        return Err("no sources selected".to_string());
    }
    Ok(out)
}

/// Sync one source end to end, converting every failure into that source's
/// stats so sibling sources keep running.
#[allow(clippy::too_many_arguments)]
async fn sync_one_source(
    repo: Repository,
    target: SyncTarget,
    def: SourceDefinition,
    rag_type: String,
    rag_config: Value,
    kb_label: String,
    naming_convention: Option<String>,
    opts: SyncOptions,
    cancel: watch::Receiver<bool>,
) -> (String, SourceStats) {
    let started = Instant::now();
    let source_id = def.source_id.clone();

    let failed = |message: String, started: Instant| SourceStats {
        status: SyncRunStatus::Failed.as_str().to_string(),
        duration_secs: started.elapsed().as_secs_f64(),
        error_message: Some(message),
        ..Default::default()
    };

    let source = match create_source(&def.source_type, &def.source_config) {
        Ok(s) => Arc::from(s),
        Err(e) => {
            tracing::error!(source = %source_id, error = %e, "source adapter construction failed");
            return (source_id, failed(e.to_string(), started));
        }
    };
    let rag = match create_rag(&rag_type, &rag_config, &kb_label) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(source = %source_id, error = %e, "rag adapter construction failed");
            return (source_id, failed(e.to_string(), started));
        }
    };

    let ctx = SourceContext {
        kb_label,
        source_id: Some(source_id.clone()),
        source_type: def.source_type.clone(),
        metadata_tags: def.metadata_tags.clone(),
        naming_convention,
    };

    match run_sync(
        &repo,
        &target,
        source,
        rag,
        ctx,
        RunMode::Sync,
        &opts,
        cancel,
    )
    .await
    {
        Ok(outcome) => {
            let stats = stats_from_outcome(&outcome, started);
            (source_id, stats)
        }
        Err(e) => (source_id, failed(e.to_string(), started)),
    }
}

fn stats_from_outcome(outcome: &SyncOutcome, started: Instant) -> SourceStats {
    let c = &outcome.counters;
    SourceStats {
        status: outcome.status.as_str().to_string(),
        // Files the source actually processed; a fully-unchanged source
        // contributes zero to the aggregated run.
        files_total: c.new + c.modified + c.deleted + c.errors,
        files_new: c.new,
        files_modified: c.modified,
        files_deleted: c.deleted,
        errors: c.errors,
        duration_secs: started.elapsed().as_secs_f64(),
        error_message: outcome.error_message.clone(),
    }
}
