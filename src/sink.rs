//! Document delivery.
//!
//! [`DocumentSink`] receives each finished batch. [`OnyxSink`] posts the
//! documents one at a time to the Onyx ingestion endpoint;
//! [`NullSink`] only counts them, for dry runs and unconfigured sinks.
//!
//! # Retry policy
//!
//! - 2xx → sent
//! - 429 → wait `Retry-After` seconds, or `min(2^attempt, 30)`s, then retry
//! - 5xx, timeouts, connection errors → wait `2^attempt`s, then retry
//! - any other status → permanent failure, `"{doc_id}: HTTP {status}: {body}"`
//!
//! Delivery failures never abort a sync; they are returned in the
//! [`SinkReport`] and recorded in the checkpoint's error log.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::SinkConfig;
use crate::document::Document;
use crate::error::{BridgeError, Result};

/// Outcome of delivering one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkReport {
    pub sent: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn send_batch(&self, docs: &[Document]) -> SinkReport;

    /// Short description for logs and the `stats` command.
    fn describe(&self) -> String;
}

/// Counts documents without sending them.
#[derive(Debug, Default)]
pub struct NullSink {
    received: AtomicU64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DocumentSink for NullSink {
    async fn send_batch(&self, docs: &[Document]) -> SinkReport {
        self.received.fetch_add(docs.len() as u64, Ordering::Relaxed);
        SinkReport {
            sent: docs.len(),
            ..SinkReport::default()
        }
    }

    fn describe(&self) -> String {
        "dry run (documents are not sent)".to_string()
    }
}

/// Client for `POST {url}/onyx-api/ingestion`.
pub struct OnyxSink {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    max_retries: u32,
    /// Unit for backoff waits; one second in production.
    backoff_unit: Duration,
}

impl OnyxSink {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| BridgeError::Validation("sink.url is not configured".into()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            endpoint: format!("{}/onyx-api/ingestion", url.trim_end_matches('/')),
            api_key: config.api_key.clone().unwrap_or_default().trim().to_string(),
            max_retries: config.max_retries,
            backoff_unit: Duration::from_secs(1),
        })
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(1u32 << attempt.min(16))
    }

    /// Deliver one document, retrying transient failures.
    async fn send_one(&self, doc: &Document) -> std::result::Result<(), String> {
        let payload = serde_json::json!({ "document": doc });
        let mut attempt = 1u32;

        loop {
            let resp = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .await;

            let response = match resp {
                Ok(response) => response,
                Err(e) => {
                    if attempt > self.max_retries {
                        return Err(if e.is_timeout() {
                            format!("Timeout after {} retries", self.max_retries)
                        } else {
                            format!("Request error: {}", e)
                        });
                    }
                    let wait = self.backoff(attempt);
                    tracing::warn!(doc_id = %doc.id, attempt, error = %e, "sink request failed, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            if status.as_u16() == 429 {
                if attempt > self.max_retries {
                    return Err(format!("Rate limited after {} retries", self.max_retries));
                }
                let wait = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u32>().ok())
                    .map(|secs| self.backoff_unit.saturating_mul(secs))
                    .unwrap_or_else(|| self.backoff(attempt).min(self.backoff_unit * 30));
                tracing::warn!(doc_id = %doc.id, attempt, wait_ms = wait.as_millis() as u64, "sink rate limited");
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }

            if status.is_server_error() {
                if attempt > self.max_retries {
                    return Err(format!(
                        "Server error {} after {} retries",
                        status.as_u16(),
                        self.max_retries
                    ));
                }
                tracing::warn!(doc_id = %doc.id, attempt, status = status.as_u16(), "sink server error, retrying");
                tokio::time::sleep(self.backoff(attempt)).await;
                attempt += 1;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            let detail = if body.is_empty() {
                "No response body".to_string()
            } else {
                body.chars().take(200).collect()
            };
            return Err(format!("HTTP {}: {}", status.as_u16(), detail));
        }
    }
}

#[async_trait]
impl DocumentSink for OnyxSink {
    async fn send_batch(&self, docs: &[Document]) -> SinkReport {
        let mut report = SinkReport::default();

        if self.api_key.is_empty() {
            tracing::error!("Onyx API key is empty; nothing will be delivered");
            report.failed = docs.len();
            if !docs.is_empty() {
                report.errors.push("Missing API key".to_string());
            }
            return report;
        }

        for doc in docs {
            match self.send_one(doc).await {
                Ok(()) => report.sent += 1,
                Err(msg) => {
                    let full = format!("{}: {}", doc.id, msg);
                    if report.failed < 3 {
                        tracing::error!(error = %full, "document delivery failed");
                    }
                    report.failed += 1;
                    report.errors.push(full);
                }
            }
        }
        report
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// Sink selected by configuration: Onyx when a URL is set, otherwise a dry run.
pub fn from_config(config: &SinkConfig, dry_run: bool) -> Result<Box<dyn DocumentSink>> {
    if dry_run || config.url.is_none() {
        return Ok(Box::new(NullSink::new()));
    }
    Ok(Box::new(OnyxSink::new(config)?))
}
