//! Sync progress reporting.
//!
//! Reports observable progress during `rs-onyx sync` so users see which
//! entity kind is being walked, how far through its pages the walk is and
//! how many documents have gone out. Progress is emitted on **stderr** so
//! stdout remains parseable for scripts.

use std::io::Write;

use crate::models::EntityKind;

/// A single progress event for sync.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// A page of `kind` was fetched. `total_pages` is unknown for some endpoints.
    Fetching {
        kind: EntityKind,
        page: u32,
        total_pages: Option<u32>,
    },
    /// A batch of `n` documents was delivered; `total_processed` counts the whole run.
    Batch {
        kind: EntityKind,
        n: u64,
        total_processed: u64,
    },
    /// Every page of `kind` was walked.
    KindComplete { kind: EntityKind },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the sync engine.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync tickets  page 3 / 12".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Fetching {
                kind,
                page,
                total_pages,
            } => match total_pages {
                Some(total) => format!("sync {}  page {} / {}\n", kind, page, total),
                None => format!("sync {}  page {}\n", kind, page),
            },
            SyncProgressEvent::Batch {
                kind,
                n,
                total_processed,
            } => format!(
                "sync {}  sent {} documents  ({} total)\n",
                kind,
                format_number(*n),
                format_number(*total_processed)
            ),
            SyncProgressEvent::KindComplete { kind } => format!("sync {}  complete\n", kind),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Fetching {
                kind,
                page,
                total_pages,
            } => serde_json::json!({
                "event": "progress",
                "kind": kind,
                "phase": "fetching",
                "page": page,
                "total_pages": total_pages
            }),
            SyncProgressEvent::Batch {
                kind,
                n,
                total_processed,
            } => serde_json::json!({
                "event": "progress",
                "kind": kind,
                "phase": "batch",
                "n": n,
                "total_processed": total_processed
            }),
            SyncProgressEvent::KindComplete { kind } => serde_json::json!({
                "event": "progress",
                "kind": kind,
                "phase": "complete"
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse the `--progress` flag value.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
