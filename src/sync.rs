//! Sync orchestration.
//!
//! [`SyncEngine::run`] drives one sync: it loads the checkpoint, decides
//! between a full and a poll run, walks every entity kind in
//! [`EntityKind::SYNC_ORDER`] and delivers documents batch by batch.
//!
//! # Ordering
//!
//! Customers come first and assets second. While their pages are walked
//! every record is dropped into the [`EntityCache`], so tickets, invoices
//! and asset documents are enriched from memory instead of a request per
//! record. The walk still runs for kinds that are excluded or already
//! complete when a later kind needs them for enrichment; their documents
//! are not emitted in that case.
//!
//! # Checkpointing
//!
//! After each batch is handed to the sink the checkpoint is saved. A kind
//! is marked complete only when its walk ends without error. A failed
//! kind is logged into the checkpoint and the run moves on; an auth
//! failure or a checkpoint write failure aborts the run. Cancellation
//! stops the run between pages and leaves the checkpoint resumable.
//!
//! # Resume
//!
//! When the previous run of the same type never finished, the next run
//! keeps its per-kind progress: completed kinds are not emitted again and
//! ids already emitted are skipped. Excluded kinds are never marked
//! complete and do not count toward completion, so a kind enabled after an
//! interruption is walked when the run resumes.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::{CacheStats, EntityCache};
use crate::checkpoint::{needs_full_sync, CheckpointStore, SyncCheckpoint, SyncType};
use crate::config::Config;
use crate::document::{Document, DocumentBuilder};
use crate::error::{BridgeError, Result};
use crate::fetch::{collect_ids, Cancellation, FetchOptions, PagedFetch, RecordObserver};
use crate::models::{
    parse_record, record_id, Asset, Customer, EntityKind, Invoice, Ticket,
};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::rate_limiter::{RateLimiter, RateLimiterStats};
use crate::sink::DocumentSink;
use crate::source::SourceApi;

/// Batch size for walks that only feed the cache.
const PRELOAD_BATCH: usize = 500;

/// How many checkpoint errors a report carries.
const REPORT_ERRORS: usize = 10;

/// Requested run type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Full when [`needs_full_sync`] says so, otherwise poll.
    Auto,
    Full,
    Poll,
}

/// Per-kind outcome of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct KindReport {
    pub kind: EntityKind,
    pub enabled: bool,
    pub complete: bool,
    pub pages: u32,
    pub emitted: u64,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub sync_type: SyncType,
    pub since: Option<DateTime<Utc>>,
    pub resumed: bool,
    /// The run was cancelled before every kind completed.
    pub interrupted: bool,
    /// Every kind completed and the run was stamped as the last success.
    pub completed: bool,
    pub documents_processed: u64,
    pub sent: usize,
    pub failed: usize,
    pub kinds: Vec<KindReport>,
    pub error_count: usize,
    pub errors: Vec<String>,
    pub customer_cache: CacheStats,
    pub asset_cache: CacheStats,
    pub rate_limiter: Option<RateLimiterStats>,
}

/// Counts from one delivered batch.
#[derive(Debug, Default)]
struct BatchOutcome {
    built: u64,
    sent: usize,
    failed: usize,
}

/// Outcome of walking one kind.
enum Walk {
    Finished,
    Failed,
    Cancelled,
}

pub struct SyncEngine {
    config: Config,
    source: Arc<dyn SourceApi>,
    sink: Arc<dyn DocumentSink>,
    store: CheckpointStore,
    cache: EntityCache,
    builder: DocumentBuilder,
    progress: Box<dyn SyncProgressReporter>,
    limiter: Option<Arc<RateLimiter>>,
}

impl SyncEngine {
    pub fn new(config: &Config, source: Arc<dyn SourceApi>, sink: Arc<dyn DocumentSink>) -> Self {
        Self {
            store: CheckpointStore::new(&config.sync.state_path),
            cache: EntityCache::new(
                config.cache.customer_max_size,
                config.cache.asset_max_size,
                config.cache.ttl_secs,
            ),
            builder: DocumentBuilder::new(&config.source.subdomain)
                .with_internal_comments(config.sync.include_internal_comments),
            config: config.clone(),
            source,
            sink,
            progress: Box::new(NoProgress),
            limiter: None,
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Include this limiter's counters in reports.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Run one sync.
    pub async fn run(&self, mode: SyncMode, cancel: &Cancellation) -> Result<SyncReport> {
        let mut cp = self.store.load();
        let sync_type = match mode {
            SyncMode::Full => SyncType::Full,
            SyncMode::Poll => SyncType::Poll,
            SyncMode::Auto if needs_full_sync(&cp, self.config.sync.max_age_hours) => SyncType::Full,
            SyncMode::Auto => SyncType::Poll,
        };

        let resumed = cp.is_interrupted() && cp.sync_type == Some(sync_type);
        if !resumed {
            cp.reset_for_new_sync(sync_type, Utc::now());
        }
        cp.set_enabled_kinds(
            EntityKind::SYNC_ORDER
                .into_iter()
                .filter(|k| self.config.sync.includes(*k)),
        );
        let since = match sync_type {
            SyncType::Full => None,
            SyncType::Poll => cp.poll_watermark(),
        };

        tracing::info!(
            sync_type = %sync_type,
            resumed,
            since = ?since,
            state = %self.store.path().display(),
            "starting sync"
        );
        self.store.save(&cp)?;
        self.cache.clear_all();

        let mut totals = BatchOutcome::default();
        let mut kinds = Vec::new();
        let mut interrupted = false;

        for kind in EntityKind::SYNC_ORDER {
            let enabled = self.config.sync.includes(kind);
            let emit = enabled && !cp.progress(kind).complete;
            let preload = !emit && self.needed_for_enrichment(kind, &cp);

            let mut report = KindReport {
                kind,
                enabled,
                complete: cp.progress(kind).complete,
                pages: 0,
                emitted: 0,
            };

            let walk = if emit {
                self.emit_kind(kind, since, &mut cp, cancel, &mut totals, &mut report)
                    .await?
            } else if preload {
                self.preload_kind(kind, &mut cp, cancel, &mut report).await?
            } else {
                tracing::debug!(kind = %kind, "skipping");
                Walk::Finished
            };

            report.complete = cp.progress(kind).complete;
            kinds.push(report);

            let swept = self.cache.cleanup_expired();
            if swept > 0 {
                tracing::debug!(swept, "dropped expired cache entries");
            }

            if let Walk::Cancelled = walk {
                interrupted = true;
                break;
            }
        }

        let completed = !interrupted && cp.all_complete();
        if completed {
            cp.mark_complete(Utc::now());
            self.store.save(&cp)?;
        }

        let report = SyncReport {
            sync_type,
            since,
            resumed,
            interrupted,
            completed,
            documents_processed: cp.documents_processed,
            sent: totals.sent,
            failed: totals.failed,
            kinds,
            error_count: cp.errors.len(),
            errors: cp.errors.iter().take(REPORT_ERRORS).cloned().collect(),
            customer_cache: self.cache.customers.stats(),
            asset_cache: self.cache.assets.stats(),
            rate_limiter: self.limiter.as_ref().map(|l| l.stats()),
        };

        tracing::info!(
            sync_type = %sync_type,
            documents = report.documents_processed,
            sent = report.sent,
            failed = report.failed,
            errors = report.error_count,
            interrupted,
            completed,
            "sync finished"
        );
        Ok(report)
    }

    /// Whether a later kind in this run needs `kind` in the cache.
    fn needed_for_enrichment(&self, kind: EntityKind, cp: &SyncCheckpoint) -> bool {
        let pending = |k: EntityKind| self.config.sync.includes(k) && !cp.progress(k).complete;
        match kind {
            EntityKind::Customer => {
                pending(EntityKind::Asset)
                    || pending(EntityKind::Ticket)
                    || pending(EntityKind::Invoice)
            }
            EntityKind::Asset => pending(EntityKind::Ticket),
            EntityKind::Ticket | EntityKind::Invoice => false,
        }
    }

    fn filters(&self, kind: EntityKind) -> Vec<(String, String)> {
        match (kind, self.config.sync.ticket_statuses.as_slice()) {
            (EntityKind::Ticket, [only]) => vec![("status".to_string(), only.clone())],
            _ => Vec::new(),
        }
    }

    fn report_page(&self, kind: EntityKind, fetch: &PagedFetch<'_>, last_page: &mut u32) {
        let stats = fetch.stats();
        if stats.pages != *last_page {
            *last_page = stats.pages;
            self.progress.report(SyncProgressEvent::Fetching {
                kind,
                page: stats.pages,
                total_pages: stats.total_pages,
            });
        }
    }

    /// Walk `kind` and emit its documents.
    async fn emit_kind(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        cp: &mut SyncCheckpoint,
        cancel: &Cancellation,
        totals: &mut BatchOutcome,
        report: &mut KindReport,
    ) -> Result<Walk> {
        let observer: RecordObserver<'_> = &|record: &Value| self.cache.absorb(kind, record);
        let opts = FetchOptions {
            since,
            filters: self.filters(kind),
            batch_size: self.config.sync.batch_size,
            per_page: self.config.source.per_page,
            observer: matches!(kind, EntityKind::Customer | EntityKind::Asset).then_some(observer),
        };
        let mut fetch = PagedFetch::new(self.source.as_ref(), kind, opts, cancel.clone());
        let mut last_page = 0;

        let walk = loop {
            let next = fetch.next_batch(&mut cp.progress_mut(kind).seen_ids).await;
            for rejected in fetch.take_rejections() {
                cp.record_error(rejected);
            }
            self.report_page(kind, &fetch, &mut last_page);

            match next {
                Ok(Some(batch)) => {
                    let outcome = self.emit_batch(kind, batch, cp).await?;
                    cp.documents_processed += outcome.built;
                    self.store.save(cp)?;

                    report.emitted += outcome.built;
                    totals.built += outcome.built;
                    totals.sent += outcome.sent;
                    totals.failed += outcome.failed;
                    self.progress.report(SyncProgressEvent::Batch {
                        kind,
                        n: outcome.built,
                        total_processed: cp.documents_processed,
                    });
                }
                Ok(None) => {
                    cp.progress_mut(kind).complete = true;
                    self.store.save(cp)?;
                    self.progress.report(SyncProgressEvent::KindComplete { kind });
                    tracing::info!(kind = %kind, emitted = report.emitted, "kind complete");
                    break Walk::Finished;
                }
                Err(BridgeError::Cancelled) => {
                    self.store.save(cp)?;
                    break Walk::Cancelled;
                }
                Err(e) if e.is_fatal() => {
                    cp.record_error(format!("{}: {}", kind, e));
                    if let Err(save_err) = self.store.save(cp) {
                        tracing::error!(error = %save_err, "could not save checkpoint after fatal error");
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "kind left incomplete");
                    cp.record_error(format!("{}: {}", kind, e));
                    self.store.save(cp)?;
                    break Walk::Failed;
                }
            }
        };

        report.pages = fetch.stats().pages;
        Ok(walk)
    }

    /// Walk `kind` only to fill the cache.
    async fn preload_kind(
        &self,
        kind: EntityKind,
        cp: &mut SyncCheckpoint,
        cancel: &Cancellation,
        report: &mut KindReport,
    ) -> Result<Walk> {
        tracing::info!(kind = %kind, "preloading for enrichment");
        let observer: RecordObserver<'_> = &|record: &Value| self.cache.absorb(kind, record);
        let opts = FetchOptions {
            batch_size: PRELOAD_BATCH,
            per_page: self.config.source.per_page,
            observer: Some(observer),
            ..FetchOptions::default()
        };
        let mut fetch = PagedFetch::new(self.source.as_ref(), kind, opts, cancel.clone());
        let mut scratch = BTreeSet::new();
        let mut last_page = 0;

        let walk = loop {
            let next = fetch.next_batch(&mut scratch).await;
            self.report_page(kind, &fetch, &mut last_page);
            match next {
                Ok(Some(_)) => {}
                Ok(None) => break Walk::Finished,
                Err(BridgeError::Cancelled) => {
                    self.store.save(cp)?;
                    break Walk::Cancelled;
                }
                Err(e) if e.is_fatal() => {
                    cp.record_error(format!("{} preload: {}", kind, e));
                    if let Err(save_err) = self.store.save(cp) {
                        tracing::error!(error = %save_err, "could not save checkpoint after fatal error");
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "preload failed; enrichment will be partial");
                    cp.record_error(format!("{} preload: {}", kind, e));
                    self.store.save(cp)?;
                    break Walk::Failed;
                }
            }
        };

        report.pages = fetch.stats().pages;
        Ok(walk)
    }

    /// Build and deliver one batch. Bad records are logged and skipped.
    async fn emit_batch(
        &self,
        kind: EntityKind,
        batch: Vec<Value>,
        cp: &mut SyncCheckpoint,
    ) -> Result<BatchOutcome> {
        let mut docs = Vec::with_capacity(batch.len());
        for raw in &batch {
            match self.build(kind, raw).await {
                Ok(Some(doc)) => docs.push(doc),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let id = record_id(raw).map(|i| i.to_string()).unwrap_or_default();
                    tracing::warn!(kind = %kind, id = %id, error = %e, "skipping record");
                    cp.record_error(format!("{} {}: {}", kind.singular(), id, e));
                }
            }
        }

        if docs.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let delivered = self.sink.send_batch(&docs).await;
        for error in &delivered.errors {
            cp.record_error(error.clone());
        }
        tracing::info!(
            kind = %kind,
            built = docs.len(),
            sent = delivered.sent,
            failed = delivered.failed,
            "batch delivered"
        );

        Ok(BatchOutcome {
            built: docs.len() as u64,
            sent: delivered.sent,
            failed: delivered.failed,
        })
    }

    /// Turn one raw record into a document. `Ok(None)` means filtered out.
    async fn build(&self, kind: EntityKind, raw: &Value) -> Result<Option<Document>> {
        match kind {
            EntityKind::Customer => {
                let customer: Customer = parse_record(kind, raw)?;
                Ok(Some(self.builder.customer(&customer)))
            }
            EntityKind::Asset => {
                let asset: Asset = parse_record(kind, raw)?;
                let owner = self.customer(asset.customer_id).await?;
                Ok(Some(self.builder.asset(&asset, owner.as_deref())))
            }
            EntityKind::Ticket => {
                let mut ticket: Ticket = parse_record(kind, raw)?;
                if !self.wants_status(&ticket.status) {
                    return Ok(None);
                }
                if self.config.sync.fetch_comments {
                    let comments = self.source.ticket_comments(ticket.id).await?;
                    if !comments.is_empty() {
                        ticket.comments = comments;
                    }
                }
                let customer = self.customer(ticket.customer_id).await?;
                let asset = match ticket.customer_id {
                    Some(cid) if ticket.assets.is_empty() => self.cache.primary_asset_for(cid),
                    _ => None,
                };
                Ok(Some(self.builder.ticket(
                    &ticket,
                    customer.as_deref(),
                    asset.as_deref(),
                )))
            }
            EntityKind::Invoice => {
                let invoice: Invoice = parse_record(kind, raw)?;
                let customer = self.customer(invoice.customer_id).await?;
                Ok(Some(self.builder.invoice(&invoice, customer.as_deref())))
            }
        }
    }

    fn wants_status(&self, status: &str) -> bool {
        let wanted = &self.config.sync.ticket_statuses;
        wanted.is_empty() || wanted.iter().any(|s| s.eq_ignore_ascii_case(status))
    }

    /// Customer from the cache, or from the source when lookups are enabled.
    async fn customer(&self, id: Option<i64>) -> Result<Option<Arc<Customer>>> {
        let Some(id) = id else {
            return Ok(None);
        };
        if !self.config.sync.fetch_missing_related {
            return Ok(self.cache.customers.get(&id));
        }
        self.cache
            .customers
            .get_or_load(id, || async move {
                let raw = self.source.get_record(EntityKind::Customer, id).await?;
                let customer = raw.and_then(|raw| {
                    match parse_record::<Customer>(EntityKind::Customer, &raw) {
                        Ok(customer) => Some(Arc::new(customer)),
                        Err(e) => {
                            tracing::warn!(customer_id = id, error = %e, "related customer unreadable");
                            None
                        }
                    }
                });
                Ok::<_, BridgeError>(customer)
            })
            .await
    }

    /// Document ids of every record currently in the source, for enabled
    /// tickets, customers and assets.
    pub async fn prune_ids(&self, cancel: &Cancellation) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for kind in [EntityKind::Ticket, EntityKind::Customer, EntityKind::Asset] {
            if !self.config.sync.includes(kind) {
                continue;
            }
            let found = collect_ids(
                self.source.as_ref(),
                kind,
                cancel.clone(),
                self.config.source.per_page,
            )
            .await?;
            tracing::info!(kind = %kind, count = found.len(), "collected ids");
            ids.extend(found.into_iter().map(|id| kind.doc_id(id)));
        }
        Ok(ids)
    }
}
