use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::classify::DEFAULT_GEMINI_BASE_URL;
use crate::errors::{SyncError, SyncResult};

/// Which `IndexStore` backs the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreBackend {
    Elastic,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = SyncError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "elastic" | "elasticsearch" => Ok(StoreBackend::Elastic),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(SyncError::Config(format!("unknown store backend {other:?}"))),
        }
    }
}

#[derive(Clone)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub folder: String,
}

impl std::fmt::Debug for ImapSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("folder", &self.folder)
            .finish()
    }
}

/// Process configuration. Everything comes from the environment (a `.env`
/// file is loaded by `main`); only the IMAP credentials are required.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub imap: ImapSettings,
    pub backfill_days: u32,
    pub keepalive_interval: Duration,
    pub reconnect_delay: Duration,
    pub pipeline_concurrency: usize,
    pub store: StoreBackend,
    pub elastic_host: String,
    pub elastic_index: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub classify_timeout: Duration,
    pub slack_webhook_url: Option<String>,
    pub webhook_url: Option<String>,
}

impl AppConfig {
    pub fn load() -> SyncResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `load` passes the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SyncResult<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| get(key).ok_or_else(|| SyncError::Config(format!("{key} is not set")));

        let imap = ImapSettings {
            host: required("IMAP_HOST")?,
            port: parse_or(get("IMAP_PORT"), "IMAP_PORT", 993)?,
            user: required("IMAP_USER")?,
            password: required("IMAP_PASSWORD")?,
            folder: get("IMAP_FOLDER").unwrap_or_else(|| "INBOX".to_string()),
        };

        let keepalive_secs: u64 = parse_or(get("SYNC_KEEPALIVE_SECS"), "SYNC_KEEPALIVE_SECS", 29 * 60)?;
        if keepalive_secs == 0 {
            return Err(SyncError::Config("SYNC_KEEPALIVE_SECS must be positive".into()));
        }

        let elastic_host = get("ELASTICSEARCH_HOST").unwrap_or_else(|| "http://localhost:9200".to_string());
        validate_url("ELASTICSEARCH_HOST", &elastic_host)?;

        let gemini_base_url =
            get("GEMINI_BASE_URL").unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string());
        validate_url("GEMINI_BASE_URL", &gemini_base_url)?;

        let slack_webhook_url = get("SLACK_WEBHOOK_URL");
        if let Some(url) = &slack_webhook_url {
            validate_url("SLACK_WEBHOOK_URL", url)?;
        }
        let webhook_url = get("WEBHOOK_SITE_URL");
        if let Some(url) = &webhook_url {
            validate_url("WEBHOOK_SITE_URL", url)?;
        }

        Ok(Self {
            imap,
            backfill_days: parse_or(get("SYNC_BACKFILL_DAYS"), "SYNC_BACKFILL_DAYS", 1)?,
            keepalive_interval: Duration::from_secs(keepalive_secs),
            reconnect_delay: Duration::from_secs(parse_or(
                get("SYNC_RECONNECT_DELAY_SECS"),
                "SYNC_RECONNECT_DELAY_SECS",
                10,
            )?),
            pipeline_concurrency: parse_or(get("PIPELINE_CONCURRENCY"), "PIPELINE_CONCURRENCY", 8)?,
            store: get("MAILPIPE_STORE")
                .map(|v| v.parse::<StoreBackend>())
                .transpose()?
                .unwrap_or(StoreBackend::Elastic),
            elastic_host,
            elastic_index: get("ELASTICSEARCH_INDEX").unwrap_or_else(|| "emails".to_string()),
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| "gemini-2.5-flash".to_string()),
            gemini_base_url,
            classify_timeout: Duration::from_secs(parse_or(
                get("CLASSIFY_TIMEOUT_SECS"),
                "CLASSIFY_TIMEOUT_SECS",
                30,
            )?),
            slack_webhook_url,
            webhook_url,
        })
    }

    /// The account every document is filed under.
    pub fn account_id(&self) -> &str {
        &self.imap.user
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> SyncResult<T> {
    match raw {
        Some(v) => v
            .parse::<T>()
            .map_err(|_| SyncError::Config(format!("{key} has invalid value {v:?}"))),
        None => Ok(default),
    }
}

fn validate_url(key: &str, raw: &str) -> SyncResult<()> {
    Url::parse(raw)
        .map(|_| ())
        .map_err(|e| SyncError::Config(format!("{key} is not a valid URL: {e}")))
}
