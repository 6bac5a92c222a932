//! Paginated fetch with deduplication.
//!
//! [`PagedFetch`] walks one collection page by page and hands back batches
//! of raw records through a pull interface: call
//! [`next_batch`](PagedFetch::next_batch) until it yields `None`.
//!
//! # Per-record pipeline
//!
//! 1. The observer, if any, sees every record with an id (cache preload).
//! 2. Records whose id was already emitted, either in this run's checkpoint
//!    or earlier in this walk, are skipped. Source pagination can shift
//!    under concurrent writes, so consecutive pages may overlap.
//! 3. With a `since` watermark, records updated at or before it are
//!    skipped. Records without `updated_at` are kept.
//! 4. Survivors are buffered and released in batches of `batch_size`.
//!
//! Ids are added to the caller's seen-set only when their batch is handed
//! out, so a checkpoint saved after each batch records exactly what was
//! emitted.
//!
//! # Termination
//!
//! The walk ends on an empty page or once the last reported page is
//! fetched. Cancellation is checked before every page request. When the
//! walk is cancelled or a request fails, records already buffered are
//! still returned first; the error surfaces on the following call.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{BridgeError, Result};
use crate::models::{record_id, record_updated_at, EntityKind};
use crate::source::{PageQuery, SourceApi};

/// Cooperative cancellation shared between the CLI and a running sync.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel automatically once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Callback invoked for every record that carries an id.
pub type RecordObserver<'a> = &'a (dyn Fn(&Value) + Send + Sync);

pub struct FetchOptions<'a> {
    /// Skip records updated at or before this instant.
    pub since: Option<DateTime<Utc>>,
    /// Extra query parameters sent with every page request.
    pub filters: Vec<(String, String)>,
    pub batch_size: usize,
    pub per_page: Option<u32>,
    pub observer: Option<RecordObserver<'a>>,
}

impl Default for FetchOptions<'_> {
    fn default() -> Self {
        Self {
            since: None,
            filters: Vec::new(),
            batch_size: 50,
            per_page: None,
            observer: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchStats {
    pub pages: u32,
    pub total_pages: Option<u32>,
    pub records: u64,
    pub duplicates_skipped: u64,
    pub filtered_by_since: u64,
    pub emitted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FetchState {
    Fetching { page: u32 },
    Done,
}

/// Pull-based page walker for one entity kind.
pub struct PagedFetch<'a> {
    source: &'a dyn SourceApi,
    kind: EntityKind,
    opts: FetchOptions<'a>,
    cancel: Cancellation,
    state: FetchState,
    buffer: VecDeque<(i64, Value)>,
    /// Ids encountered in this walk, emitted or not.
    encountered: HashSet<i64>,
    deferred: Option<BridgeError>,
    rejected: Vec<String>,
    stats: FetchStats,
}

impl<'a> PagedFetch<'a> {
    pub fn new(
        source: &'a dyn SourceApi,
        kind: EntityKind,
        opts: FetchOptions<'a>,
        cancel: Cancellation,
    ) -> Self {
        Self {
            source,
            kind,
            opts,
            cancel,
            state: FetchState::Fetching { page: 1 },
            buffer: VecDeque::new(),
            encountered: HashSet::new(),
            deferred: None,
            rejected: Vec::new(),
            stats: FetchStats::default(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn stats(&self) -> &FetchStats {
        &self.stats
    }

    /// Drain messages about records that were dropped for lacking an id.
    pub fn take_rejections(&mut self) -> Vec<String> {
        std::mem::take(&mut self.rejected)
    }

    /// Next batch of records, or `None` once the walk is over.
    ///
    /// `seen` holds ids already emitted in this sync run; ids in the
    /// returned batch are added to it.
    pub async fn next_batch(&mut self, seen: &mut BTreeSet<i64>) -> Result<Option<Vec<Value>>> {
        let batch_size = self.opts.batch_size.max(1);

        loop {
            if self.buffer.len() >= batch_size {
                return Ok(Some(self.release(batch_size, seen)));
            }

            let page = match self.state {
                FetchState::Done => {
                    if !self.buffer.is_empty() {
                        let n = self.buffer.len();
                        return Ok(Some(self.release(n, seen)));
                    }
                    return match self.deferred.take() {
                        Some(err) => Err(err),
                        None => Ok(None),
                    };
                }
                FetchState::Fetching { page } => page,
            };

            if self.cancel.is_cancelled() {
                tracing::info!(kind = %self.kind, page, "fetch cancelled");
                self.deferred = Some(BridgeError::Cancelled);
                self.state = FetchState::Done;
                continue;
            }

            let query = PageQuery {
                page,
                per_page: self.opts.per_page,
                filters: self.opts.filters.clone(),
            };
            let result = self.source.list_page(self.kind, &query).await;
            let fetched = match result {
                Ok(fetched) => fetched,
                Err(e) => {
                    tracing::warn!(kind = %self.kind, page, error = %e, "page fetch failed");
                    self.deferred = Some(e);
                    self.state = FetchState::Done;
                    continue;
                }
            };

            self.stats.pages += 1;
            if fetched.total_pages.is_some() {
                self.stats.total_pages = fetched.total_pages;
            }
            tracing::info!(
                kind = %self.kind,
                page,
                total_pages = ?fetched.total_pages,
                items = fetched.items.len(),
                "fetched page"
            );

            let item_count = fetched.items.len();
            let new_ids = self.absorb_page(fetched.items, seen);

            self.state = if item_count == 0 {
                FetchState::Done
            } else if fetched.total_pages.is_some_and(|total| page >= total) {
                FetchState::Done
            } else if fetched.total_pages.is_none() && new_ids == 0 {
                // Without a page count, a page of only repeats means the
                // source is serving the same records again.
                FetchState::Done
            } else {
                FetchState::Fetching { page: page + 1 }
            };
        }
    }

    /// Run one page through the pipeline. Returns how many ids were new to
    /// this walk.
    fn absorb_page(&mut self, items: Vec<Value>, seen: &BTreeSet<i64>) -> usize {
        let mut new_ids = 0;
        for record in items {
            self.stats.records += 1;
            let Some(id) = record_id(&record) else {
                self.rejected
                    .push(format!("{} record without integer id skipped", self.kind.singular()));
                continue;
            };

            if let Some(observe) = self.opts.observer {
                observe(&record);
            }

            if !self.encountered.insert(id) {
                self.stats.duplicates_skipped += 1;
                continue;
            }
            new_ids += 1;

            if seen.contains(&id) {
                self.stats.duplicates_skipped += 1;
                continue;
            }

            if let Some(since) = self.opts.since {
                if record_updated_at(&record).is_some_and(|updated| updated <= since) {
                    self.stats.filtered_by_since += 1;
                    continue;
                }
            }

            self.buffer.push_back((id, record));
        }
        new_ids
    }

    fn release(&mut self, n: usize, seen: &mut BTreeSet<i64>) -> Vec<Value> {
        let batch: Vec<Value> = self
            .buffer
            .drain(..n)
            .map(|(id, record)| {
                seen.insert(id);
                record
            })
            .collect();
        self.stats.emitted += batch.len() as u64;
        batch
    }
}

/// Every id currently present in `kind`, in page order.
///
/// Used by the pruning pass to find records deleted at the source.
pub async fn collect_ids(
    source: &dyn SourceApi,
    kind: EntityKind,
    cancel: Cancellation,
    per_page: Option<u32>,
) -> Result<Vec<i64>> {
    let opts = FetchOptions {
        batch_size: 500,
        per_page,
        ..FetchOptions::default()
    };
    let mut fetch = PagedFetch::new(source, kind, opts, cancel);
    let mut seen = BTreeSet::new();
    let mut ids = Vec::new();
    while let Some(batch) = fetch.next_batch(&mut seen).await? {
        ids.extend(batch.iter().filter_map(record_id));
    }
    Ok(ids)
}
