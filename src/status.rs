//! Checkpoint and connector overviews.
//!
//! `rs-onyx status` reads the checkpoint file and shows when the last
//! successful syncs ran, how far the current or last run got and whether
//! the next `sync` will be a full one. `rs-onyx stats` shows client,
//! rate limiter and cache figures.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::cache::CacheStats;
use crate::checkpoint::{needs_full_sync_at, CheckpointStore, SyncCheckpoint};
use crate::config::Config;
use crate::models::EntityKind;
use crate::progress::format_number;
use crate::source::ClientStats;

/// Run the status command: load the checkpoint and print a summary.
pub fn run_status(config: &Config) -> Result<()> {
    let store = CheckpointStore::new(&config.sync.state_path);
    let checkpoint = store.load();

    println!("RepairShopr → Onyx: Sync Status");
    println!("===============================");
    println!();
    println!("  State file:  {}", store.path().display());
    for line in status_lines(&checkpoint, config, Utc::now()) {
        println!("{}", line);
    }
    println!();
    Ok(())
}

/// Summary lines for `checkpoint`, as of `now`.
pub fn status_lines(checkpoint: &SyncCheckpoint, config: &Config, now: DateTime<Utc>) -> Vec<String> {
    let mut lines = vec![
        format!("  Last full:   {}", describe_ts(checkpoint.last_full_sync, now)),
        format!("  Last poll:   {}", describe_ts(checkpoint.last_poll, now)),
    ];

    if let Some(started) = checkpoint.sync_started_at {
        let state = if checkpoint.is_interrupted() {
            "interrupted"
        } else {
            "complete"
        };
        lines.push(String::new());
        lines.push(format!(
            "  Last run:    {} sync, {}",
            checkpoint
                .sync_type
                .map(|t| t.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            state
        ));
        lines.push(format!("  Started:     {}", describe_ts(Some(started), now)));
        lines.push(format!(
            "  Documents:   {}",
            format_number(checkpoint.documents_processed)
        ));
        lines.push(String::new());
        lines.push(format!("  {:<12} {:>8} {:>10}", "KIND", "SEEN", "STATUS"));
        lines.push(format!("  {}", "-".repeat(32)));
        for kind in EntityKind::SYNC_ORDER {
            let progress = checkpoint.progress(kind);
            let status = if !config.sync.includes(kind) {
                "disabled"
            } else if progress.complete {
                "done"
            } else {
                "pending"
            };
            lines.push(format!(
                "  {:<12} {:>8} {:>10}",
                kind.to_string(),
                progress.seen_ids.len(),
                status
            ));
        }
    }

    if !checkpoint.errors.is_empty() {
        lines.push(String::new());
        lines.push(format!("  Errors:      {}", checkpoint.errors.len()));
        for error in checkpoint.errors.iter().rev().take(5) {
            lines.push(format!("    - {}", error));
        }
    }

    lines.push(String::new());
    let full = needs_full_sync_at(checkpoint, config.sync.max_age_hours, now);
    lines.push(format!(
        "  Next sync:   {}",
        if full { "full" } else { "poll" }
    ));
    lines
}

/// Client and cache figures for the `stats` command.
pub fn stats_lines(
    config: &Config,
    client: &ClientStats,
    customers: &CacheStats,
    assets: &CacheStats,
) -> Vec<String> {
    let error_rate = if client.request_count > 0 {
        client.error_count as f64 / client.request_count as f64 * 100.0
    } else {
        0.0
    };
    let rl = &client.rate_limiter;
    vec![
        format!("  Subdomain:   {}", config.source.subdomain),
        String::new(),
        "  Cache:".to_string(),
        format!("    customers  {}", cache_line(customers)),
        format!("    assets     {}", cache_line(assets)),
        String::new(),
        "  API client:".to_string(),
        format!("    requests   {}", format_number(client.request_count)),
        format!("    errors     {} ({:.2}%)", client.error_count, error_rate),
        format!(
            "    limiter    {:.0}/min, burst {:.0}, {} requests, {} throttled, {:.1}s waiting",
            rl.rate_per_minute, rl.capacity, rl.requests_made, rl.requests_throttled, rl.total_wait_secs
        ),
    ]
}

fn cache_line(stats: &CacheStats) -> String {
    format!(
        "{} / {}  ttl {}s  hit rate {:.1}%  evictions {}",
        format_number(stats.size as u64),
        format_number(stats.max_size as u64),
        stats.ttl_secs,
        stats.hit_rate * 100.0,
        stats.evictions
    )
}

fn describe_ts(ts: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match ts {
        Some(ts) => format!(
            "{} ({})",
            ts.format("%Y-%m-%d %H:%M:%S UTC"),
            format_ts_relative(ts, now)
        ),
        None => "never".to_string(),
    }
}

/// Format a timestamp relative to `now` (e.g. "3 hours ago").
pub fn format_ts_relative(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - ts).num_seconds();

    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}
