use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Account subdomain: `acme` for `acme.repairshopr.com`.
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Overrides the subdomain-derived API root.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default)]
    pub burst_capacity: Option<u32>,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub per_page: Option<u32>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            subdomain: String::new(),
            api_key: None,
            base_url: None,
            requests_per_minute: default_requests_per_minute(),
            burst_capacity: None,
            timeout_secs: default_source_timeout_secs(),
            max_retries: default_max_retries(),
            per_page: None,
        }
    }
}

// RepairShopr allows 180/min; stay under it.
fn default_requests_per_minute() -> u32 {
    150
}
fn default_source_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    /// Onyx base URL. Without it documents are built but not sent.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_sink_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: default_sink_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_sink_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub include_tickets: bool,
    #[serde(default = "default_true")]
    pub include_customers: bool,
    #[serde(default = "default_true")]
    pub include_assets: bool,
    #[serde(default)]
    pub include_invoices: bool,
    #[serde(default)]
    pub include_internal_comments: bool,
    /// Fetch each ticket's comments with a follow-up request.
    #[serde(default)]
    pub fetch_comments: bool,
    /// Fetch customers missing from the cache one by one.
    #[serde(default)]
    pub fetch_missing_related: bool,
    /// Only emit tickets in these statuses. Empty means all.
    #[serde(default)]
    pub ticket_statuses: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            include_tickets: true,
            include_customers: true,
            include_assets: true,
            include_invoices: false,
            include_internal_comments: false,
            fetch_comments: false,
            fetch_missing_related: false,
            ticket_statuses: Vec::new(),
            batch_size: default_batch_size(),
            max_age_hours: default_max_age_hours(),
            state_path: default_state_path(),
        }
    }
}

impl SyncConfig {
    pub fn includes(&self, kind: crate::models::EntityKind) -> bool {
        use crate::models::EntityKind;
        match kind {
            EntityKind::Ticket => self.include_tickets,
            EntityKind::Customer => self.include_customers,
            EntityKind::Asset => self.include_assets,
            EntityKind::Invoice => self.include_invoices,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    50
}
fn default_max_age_hours() -> u64 {
    24
}
fn default_state_path() -> PathBuf {
    PathBuf::from("./data/state.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_customer_max_size")]
    pub customer_max_size: usize,
    #[serde(default = "default_asset_max_size")]
    pub asset_max_size: usize,
    /// Entry lifetime; 0 disables expiry.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            customer_max_size: default_customer_max_size(),
            asset_max_size: default_asset_max_size(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_customer_max_size() -> usize {
    10_000
}
fn default_asset_max_size() -> usize {
    50_000
}
fn default_ttl_secs() -> u64 {
    600
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Build a config from environment variables alone.
    pub fn from_env_only() -> Result<Config> {
        let mut config = Config {
            source: SourceConfig::default(),
            sink: SinkConfig::default(),
            sync: SyncConfig::default(),
            cache: CacheConfig::default(),
        };
        config.apply_env_overrides(|k| std::env::var(k).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `RS_*` and `ONYX_*` variables onto the parsed file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RS_SUBDOMAIN") {
            self.source.subdomain = v;
        }
        if let Some(v) = get("RS_API_KEY") {
            self.source.api_key = Some(v);
        }
        if let Some(v) = get("ONYX_API_URL") {
            self.sink.url = Some(v);
        }
        if let Some(v) = get("ONYX_API_KEY") {
            self.sink.api_key = Some(v);
        }

        let flags: [(&str, &mut bool); 5] = [
            ("RS_INCLUDE_TICKETS", &mut self.sync.include_tickets),
            ("RS_INCLUDE_CUSTOMERS", &mut self.sync.include_customers),
            ("RS_INCLUDE_ASSETS", &mut self.sync.include_assets),
            ("RS_INCLUDE_INVOICES", &mut self.sync.include_invoices),
            (
                "RS_INCLUDE_INTERNAL_COMMENTS",
                &mut self.sync.include_internal_comments,
            ),
        ];
        for (name, slot) in flags {
            if let Some(raw) = get(name) {
                *slot = parse_flag(&raw)
                    .with_context(|| format!("{} must be true/false, got '{}'", name, raw))?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.source.subdomain.trim().is_empty() && self.source.base_url.is_none() {
            anyhow::bail!("source.subdomain is required (or set RS_SUBDOMAIN)");
        }
        if self.source.requests_per_minute == 0 {
            anyhow::bail!("source.requests_per_minute must be > 0");
        }
        if self.source.burst_capacity == Some(0) {
            anyhow::bail!("source.burst_capacity must be > 0 when set");
        }
        if self.source.per_page == Some(0) {
            anyhow::bail!("source.per_page must be > 0 when set");
        }
        if self.sync.batch_size == 0 {
            anyhow::bail!("sync.batch_size must be > 0");
        }
        if self.cache.customer_max_size == 0 || self.cache.asset_max_size == 0 {
            anyhow::bail!("cache sizes must be > 0");
        }
        if let Some(ref url) = self.sink.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("sink.url must start with http:// or https://, got '{}'", url);
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.apply_env_overrides(|k| std::env::var(k).ok())?;
    config.validate()?;

    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to the environment.
pub fn load_or_env(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Config::from_env_only().with_context(|| {
            format!(
                "No config file at {} and environment is incomplete",
                path.display()
            )
        })
    }
}

/// Commented template written by `rs-onyx init`.
pub const CONFIG_TEMPLATE: &str = r#"# rs-onyx configuration
#
# Environment variables override values here:
#   RS_SUBDOMAIN, RS_API_KEY, ONYX_API_URL, ONYX_API_KEY,
#   RS_INCLUDE_TICKETS / CUSTOMERS / ASSETS / INVOICES / INTERNAL_COMMENTS

[source]
subdomain = "your-shop"
# api_key = "..."               # prefer RS_API_KEY
requests_per_minute = 150       # hard limit is 180
# burst_capacity = 15
timeout_secs = 30
max_retries = 3

[sink]
# url = "https://onyx.example.com"
# api_key = "..."               # prefer ONYX_API_KEY
timeout_secs = 120
max_retries = 3

[sync]
include_tickets = true
include_customers = true
include_assets = true
include_invoices = false
include_internal_comments = false
fetch_comments = false          # one extra request per ticket
fetch_missing_related = false   # look up customers the cache lacks
ticket_statuses = []
batch_size = 50
max_age_hours = 24
state_path = "./data/state.json"

[cache]
customer_max_size = 10000
asset_max_size = 50000
ttl_secs = 600
"#;
