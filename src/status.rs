//! `status` and `info` command output.
//!
//! Plain column-formatted tables on stdout; credential material in config
//! blobs is masked before display.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::repository::Repository;

/// `ragsync status <kb> [--limit N]` — recent runs, newest first.
pub async fn show_status(repo: &Repository, kb_name: &str, limit: i64) -> Result<()> {
    if let Some(kb) = repo.get_knowledge_base_by_name(kb_name).await? {
        let runs = repo.list_sync_runs(kb.id, limit).await?;
        if runs.is_empty() {
            println!("No sync runs recorded for '{kb_name}'.");
            return Ok(());
        }

        println!(
            "{:<6} {:<15} {:<20} {:<20} {:>6} {:>5} {:>5} {:>5} {:>5}",
            "RUN", "STATUS", "START", "END", "TOTAL", "NEW", "MOD", "DEL", "ERR"
        );
        for run in runs {
            println!(
                "{:<6} {:<15} {:<20} {:<20} {:>6} {:>5} {:>5} {:>5} {:>5}{}",
                run.id,
                run.status.as_str(),
                format_time(Some(run.start_time)),
                format_time(run.end_time),
                run.total_files,
                run.new_files,
                run.modified_files,
                run.deleted_files,
                run.error_files,
                run.error_message
                    .map(|m| format!("  ({m})"))
                    .unwrap_or_default(),
            );
        }
        return Ok(());
    }

    if let Some(multi_kb) = repo.get_multi_source_kb_by_name(kb_name).await? {
        let runs = repo.list_multi_source_sync_runs(multi_kb.id, limit).await?;
        if runs.is_empty() {
            println!("No sync runs recorded for '{kb_name}'.");
            return Ok(());
        }

        println!(
            "{:<6} {:<12} {:<11} {:<20} {:>6} {:>5} {:>5} {:>5} {:>5}  SOURCES",
            "RUN", "STATUS", "MODE", "START", "TOTAL", "NEW", "MOD", "DEL", "ERR"
        );
        for run in runs {
            println!(
                "{:<6} {:<12} {:<11} {:<20} {:>6} {:>5} {:>5} {:>5} {:>5}  {}",
                run.id,
                run.status.as_str(),
                run.sync_mode.as_str(),
                format_time(Some(run.start_time)),
                run.total_files,
                run.new_files,
                run.modified_files,
                run.deleted_files,
                run.error_files,
                run.sources_processed.join(","),
            );
        }
        return Ok(());
    }

    bail!("knowledge base '{kb_name}' not found");
}

/// `ragsync info <kb>` — configuration snapshot with masked secrets.
pub async fn show_info(repo: &Repository, kb_name: &str) -> Result<()> {
    if let Some(kb) = repo.get_knowledge_base_by_name(kb_name).await? {
        println!("Knowledge base: {} (id {})", kb.name, kb.id);
        println!("  source_type: {}", kb.source_type);
        println!(
            "  source_config: {}",
            serde_json::to_string_pretty(&mask_secrets(&kb.source_config))?
        );
        println!("  rag_type: {}", kb.rag_type);
        println!(
            "  rag_config: {}",
            serde_json::to_string_pretty(&mask_secrets(&kb.rag_config))?
        );
        println!("  created: {}", format_time(Some(kb.created_at)));
        return Ok(());
    }

    if let Some(kb) = repo.get_multi_source_kb_by_name(kb_name).await? {
        println!("Multi-source knowledge base: {} (id {})", kb.name, kb.id);
        println!("  rag_type: {}", kb.rag_type);
        println!(
            "  rag_config: {}",
            serde_json::to_string_pretty(&mask_secrets(&kb.rag_config))?
        );
        println!(
            "  file_organization: {}",
            serde_json::to_string(&kb.file_organization)?
        );
        println!("  sync_strategy: {}", serde_json::to_string(&kb.sync_strategy)?);
        println!("  sources ({}):", kb.sources.len());
        for def in &kb.sources {
            println!(
                "    {:<20} {:<24} enabled={}",
                def.source_id, def.source_type, def.enabled
            );
            println!(
                "      config: {}",
                serde_json::to_string(&mask_secrets(&def.source_config))?
            );
        }
        return Ok(());
    }

    bail!("knowledge base '{kb_name}' not found");
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

const SECRET_KEY_HINTS: &[&str] = &[
    "secret",
    "password",
    "account_key",
    "connection_string",
    "token",
    "credential",
];

/// Recursively replace values of credential-shaped keys with `"***"`.
pub fn mask_secrets(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, v) in map {
                let lowered = key.to_ascii_lowercase();
                if SECRET_KEY_HINTS.iter().any(|hint| lowered.contains(hint)) {
                    out.insert(key.clone(), Value::String("***".to_string()));
                } else {
                    out.insert(key.clone(), mask_secrets(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_secrets).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_credential_keys_recursively() {
        let masked = mask_secrets(&serde_json::json!({
            "site_url": "https://acme.sharepoint.com",
            "client_secret": "s3cr3t",
            "auth": { "password": "hunter2", "username": "svc" },
            "connection_string": "AccountKey=abc"
        }));
        assert_eq!(masked["site_url"], "https://acme.sharepoint.com");
        assert_eq!(masked["client_secret"], "***");
        assert_eq!(masked["auth"]["password"], "***");
        assert_eq!(masked["auth"]["username"], "svc");
        assert_eq!(masked["connection_string"], "***");
    }
}
