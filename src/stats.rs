//! Store statistics overview.
//!
//! Quick summary of what's indexed: rule counts, severity breakdown, and
//! checkpoint freshness. Used by `rulectl stats` to give confidence that
//! syncs are landing as expected.

use anyhow::Result;

use crate::config::Config;
use crate::store::RuleStore;

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config, source_label: &str) -> Result<()> {
    let store = RuleStore::connect(&config.db.path).await?;
    store.ensure_schema().await?;

    let summary = store.summary().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Rule Harness — Store Stats");
    println!("==========================");
    println!();
    println!("  Database:  {}", config.db.path.display());
    println!("  Size:      {}", format_bytes(db_size));
    println!();
    println!("  Rules:     {}", summary.total_rules);

    if !summary.by_severity.is_empty() {
        println!();
        println!("  By severity:");
        for (severity, count) in &summary.by_severity {
            println!("    {:<10} {:>6}", severity, count);
        }
    }

    let checkpoint = store.get_checkpoint(source_label).await?;
    println!();
    match checkpoint {
        Some(state) => {
            let marker = state.last_marker.as_deref().unwrap_or("-");
            let synced = state
                .last_sync_time
                .map(|t| format_ts_relative(t.timestamp()))
                .unwrap_or_else(|| "never".to_string());
            println!("  Checkpoint:  {} (synced {})", marker, synced);
        }
        None => println!("  Checkpoint:  none"),
    }
    println!();

    store.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        chrono::DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| ts.to_string())
    }
}
