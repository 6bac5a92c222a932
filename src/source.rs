//! RepairShopr API access.
//!
//! [`SourceApi`] is the seam between the sync engine and the REST API, so
//! fetch and sync logic can be exercised against in-memory sources.
//! [`RepairShoprClient`] is the production implementation.
//!
//! # Request policy
//!
//! Every request first takes a token from the shared [`RateLimiter`], then
//! sends. Failures are classified by [`classify`]:
//!
//! - 401 / 403 → [`BridgeError::Auth`], never retried
//! - 404 → [`BridgeError::NotFound`], mapped to "absent" by the lookups
//! - 429 → [`BridgeError::RateLimited`], honouring `Retry-After`
//! - 5xx → [`BridgeError::Server`]
//! - other 4xx → [`BridgeError::Client`], never retried
//!
//! Retryable errors back off exponentially (2s, 4s, 8s, capped at 16s)
//! for up to `max_retries` extra attempts.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SourceConfig;
use crate::error::{BridgeError, Result};
use crate::models::{Comment, EntityKind};
use crate::rate_limiter::{RateLimiter, RateLimiterStats};

/// Query for one page of a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageQuery {
    /// 1-based page number.
    pub page: u32,
    pub per_page: Option<u32>,
    /// Extra query parameters such as `customer_id` or `status`.
    pub filters: Vec<(String, String)>,
}

/// One page of raw records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub page: u32,
    pub total_pages: Option<u32>,
    pub total_entries: Option<u64>,
}

impl Page {
    /// Normalise a list response. Records live under the kind's list key;
    /// pagination fields are read from the top level or from `meta`.
    pub fn from_response(kind: EntityKind, body: &Value, requested_page: u32) -> Result<Self> {
        let items = match body.get(kind.list_key()) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None if body.is_array() => {
                body.as_array().cloned().unwrap_or_default()
            }
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(BridgeError::Validation(format!(
                    "{} list is not an array: {}",
                    kind,
                    truncate(&other.to_string(), 80)
                )))
            }
        };

        let field = |name: &str| {
            body.get(name)
                .or_else(|| body.get("meta").and_then(|m| m.get(name)))
                .and_then(Value::as_u64)
        };

        Ok(Page {
            items,
            page: field("page")
                .and_then(|p| u32::try_from(p).ok())
                .unwrap_or(requested_page),
            total_pages: field("total_pages").and_then(|p| u32::try_from(p).ok()),
            total_entries: field("total_entries"),
        })
    }
}

/// Read access to the source system.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Fetch one page of `kind`.
    async fn list_page(&self, kind: EntityKind, query: &PageQuery) -> Result<Page>;

    /// Fetch a single record. A missing record is `Ok(None)`.
    async fn get_record(&self, kind: EntityKind, id: i64) -> Result<Option<Value>>;

    /// Comments on a ticket. A missing ticket yields no comments.
    async fn ticket_comments(&self, ticket_id: i64) -> Result<Vec<Comment>>;

    /// The authenticated user, used as a connectivity check.
    async fn whoami(&self) -> Result<Value>;
}

/// Exponential backoff schedule between retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(16),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Map a failed HTTP status to an error.
pub fn classify(status: u16, body: &str, retry_after: Option<Duration>) -> BridgeError {
    let body = truncate(body, 200);
    match status {
        401 | 403 => BridgeError::Auth(format!("HTTP {}: {}", status, body)),
        404 => BridgeError::NotFound(body),
        429 => BridgeError::RateLimited { retry_after },
        500..=599 => BridgeError::Server { status, body },
        _ => BridgeError::Client { status, body },
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Request counters for the `stats` command.
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub request_count: u64,
    pub error_count: u64,
    pub rate_limiter: RateLimiterStats,
}

/// HTTP client for the RepairShopr v1 API.
pub struct RepairShoprClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    per_page: Option<u32>,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
    backoff: BackoffPolicy,
    retry_after_cap: Duration,
    request_count: AtomicU64,
    error_count: AtomicU64,
}

impl RepairShoprClient {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| BridgeError::Auth("RepairShopr API key not configured".into()))?;

        let base_url = match config.base_url {
            Some(ref url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.repairshopr.com/api/v1", config.subdomain),
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url,
            api_key,
            per_page: config.per_page,
            limiter: Arc::new(RateLimiter::new(
                config.requests_per_minute,
                config.burst_capacity,
            )),
            max_retries: config.max_retries,
            backoff: BackoffPolicy::default(),
            retry_after_cap: Duration::from_secs(60),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.retry_after_cap = backoff.max;
        self.backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            rate_limiter: self.limiter.stats(),
        }
    }

    /// GET `path` with retry, returning the parsed JSON body.
    async fn get_json(&self, path: &str, params: &[(String, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err: Option<BridgeError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = match last_err {
                    Some(BridgeError::RateLimited {
                        retry_after: Some(wait),
                    }) => wait.min(self.retry_after_cap),
                    _ => self.backoff.delay(attempt),
                };
                tracing::warn!(
                    path,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_err.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    "retrying source request"
                );
                tokio::time::sleep(delay).await;
            }

            self.limiter.acquire(None).await;
            self.request_count.fetch_add(1, Ordering::Relaxed);

            let resp = self
                .http
                .get(&url)
                .bearer_auth(&self.api_key)
                .header("Accept", "application/json")
                .query(params)
                .send()
                .await;

            let response = match resp {
                Ok(response) => response,
                Err(e) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    last_err = Some(e.into());
                    continue;
                }
            };

            let status = response.status();
            let wait = retry_after(response.headers());
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    last_err = Some(e.into());
                    continue;
                }
            };

            if status.is_success() {
                return Ok(serde_json::from_str(&body)?);
            }

            self.error_count.fetch_add(1, Ordering::Relaxed);
            let err = classify(status.as_u16(), &body, wait);
            if !err.is_retryable() {
                return Err(err);
            }
            last_err = Some(err);
        }

        Err(last_err.unwrap_or_else(|| BridgeError::Transport("request failed after retries".into())))
    }
}

#[async_trait]
impl SourceApi for RepairShoprClient {
    async fn list_page(&self, kind: EntityKind, query: &PageQuery) -> Result<Page> {
        let mut params = vec![("page".to_string(), query.page.to_string())];
        if let Some(per_page) = query.per_page.or(self.per_page) {
            params.push(("per_page".to_string(), per_page.to_string()));
        }
        params.extend(query.filters.iter().cloned());

        let body = self
            .get_json(&format!("/{}", kind.collection()), &params)
            .await?;
        Page::from_response(kind, &body, query.page)
    }

    async fn get_record(&self, kind: EntityKind, id: i64) -> Result<Option<Value>> {
        match self
            .get_json(&format!("/{}/{}", kind.collection(), id), &[])
            .await
        {
            Ok(mut body) => Ok(Some(
                body.get_mut(kind.singular())
                    .map(Value::take)
                    .unwrap_or(body),
            )),
            Err(BridgeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn ticket_comments(&self, ticket_id: i64) -> Result<Vec<Comment>> {
        let body = match self
            .get_json(&format!("/tickets/{}/comments", ticket_id), &[])
            .await
        {
            Ok(body) => body,
            Err(BridgeError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let raw = match body {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("comments") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        Ok(raw
            .into_iter()
            .filter_map(|c| match serde_json::from_value::<Comment>(c) {
                Ok(comment) => Some(comment),
                Err(e) => {
                    tracing::warn!(ticket_id, error = %e, "skipping malformed comment");
                    None
                }
            })
            .collect())
    }

    async fn whoami(&self) -> Result<Value> {
        self.get_json("/me", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_doubles_and_caps() {
        let b = BackoffPolicy::default();
        let secs: Vec<u64> = (1..=5).map(|a| b.delay(a).as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 16]);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(classify(401, "", None), BridgeError::Auth(_)));
        assert!(matches!(classify(403, "", None), BridgeError::Auth(_)));
        assert!(matches!(classify(404, "", None), BridgeError::NotFound(_)));
        assert!(matches!(
            classify(429, "", Some(Duration::from_secs(3))),
            BridgeError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(3)
        ));
        assert!(matches!(classify(503, "", None), BridgeError::Server { status: 503, .. }));
        assert!(matches!(classify(422, "", None), BridgeError::Client { status: 422, .. }));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        match classify(500, &body, None) {
            BridgeError::Server { body, .. } => assert_eq!(body.len(), 200),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn page_reads_meta_pagination() {
        let body = json!({
            "assets": [{"id": 1}, {"id": 2}],
            "meta": {"total_pages": 3, "total_entries": 5, "page": 1}
        });
        let page = Page::from_response(EntityKind::Asset, &body, 1).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total_pages, Some(3));
        assert_eq!(page.total_entries, Some(5));
    }

    #[test]
    fn page_reads_top_level_pagination() {
        let body = json!({"tickets": [{"id": 1}], "total_pages": 1, "page": 1});
        let page = Page::from_response(EntityKind::Ticket, &body, 1).unwrap();
        assert_eq!(page.total_pages, Some(1));
        assert_eq!(page.page, 1);
    }

    #[test]
    fn page_without_list_is_empty() {
        let page = Page::from_response(EntityKind::Invoice, &json!({}), 4).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.page, 4);
        assert_eq!(page.total_pages, None);

        let bad = json!({"invoices": "nope"});
        assert!(matches!(
            Page::from_response(EntityKind::Invoice, &bad, 1),
            Err(BridgeError::Validation(_))
        ));
    }

    #[test]
    fn oversized_pagination_is_ignored() {
        let body = json!({"tickets": [], "page": 5_000_000_000u64, "total_pages": 5_000_000_000u64});
        let page = Page::from_response(EntityKind::Ticket, &body, 2).unwrap();
        assert_eq!(page.page, 2);
        assert_eq!(page.total_pages, None);
    }

    fn headers_with_retry_after(value: &str) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::RETRY_AFTER,
            reqwest::header::HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn retry_after_parses_whole_seconds() {
        assert_eq!(
            retry_after(&headers_with_retry_after(" 7 ")),
            Some(Duration::from_secs(7))
        );
        assert_eq!(retry_after(&reqwest::header::HeaderMap::new()), None);
    }

    #[test]
    fn unusable_retry_after_is_treated_as_absent() {
        assert_eq!(retry_after(&headers_with_retry_after("99999999999999999999")), None);
        assert_eq!(retry_after(&headers_with_retry_after("soon")), None);
        assert_eq!(retry_after(&headers_with_retry_after("-3")), None);
        assert_eq!(
            retry_after(&headers_with_retry_after("Wed, 21 Oct 2015 07:28:00 GMT")),
            None
        );
    }
}
