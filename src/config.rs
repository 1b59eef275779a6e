//! TOML configuration parsing and validation.
//!
//! ```toml
//! [db]
//! path = "./data/threatfeed.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:8088"
//!
//! [ingest]
//! tick_secs = 60
//! manual_cooldown_secs = 120
//! max_parallel_runs = 4
//!
//! [rate_limits.NVD]
//! requests_per_sec = 0.16
//! burst = 5
//!
//! [[sources]]
//! kind = "RSS"
//! label = "CISA current activity"
//! config = { feed_url = "https://www.cisa.gov/uscert/ncas/current-activity.xml" }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::SourceSettings;
use crate::fetch::RetryPolicy;
use crate::models::{SourceKind, MAX_INTERVAL_MINUTES};
use crate::rate_limiter::RateLimitConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub rate_limits: HashMap<SourceKind, RateLimitSettings>,
    #[serde(default)]
    pub hook: HookConfig,
    #[serde(default)]
    pub sources: Vec<SeedSource>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8088".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_org_id")]
    pub org_id: String,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_interval_minutes")]
    pub default_interval_minutes: i64,
    #[serde(default = "default_manual_cooldown_secs")]
    pub manual_cooldown_secs: u64,
    #[serde(default = "default_max_parallel_runs")]
    pub max_parallel_runs: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_stale_run_secs")]
    pub stale_run_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            org_id: default_org_id(),
            tick_secs: default_tick_secs(),
            default_interval_minutes: default_interval_minutes(),
            manual_cooldown_secs: default_manual_cooldown_secs(),
            max_parallel_runs: default_max_parallel_runs(),
            queue_capacity: default_queue_capacity(),
            run_timeout_secs: default_run_timeout_secs(),
            stale_run_secs: default_stale_run_secs(),
        }
    }
}

fn default_org_id() -> String {
    "default_org".to_string()
}
fn default_tick_secs() -> u64 {
    60
}
fn default_interval_minutes() -> i64 {
    8 * 60
}
fn default_manual_cooldown_secs() -> u64 {
    120
}
fn default_max_parallel_runs() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    64
}
fn default_run_timeout_secs() -> u64 {
    30 * 60
}
fn default_stale_run_secs() -> u64 {
    2 * 60 * 60
}

impl IngestConfig {
    pub fn manual_cooldown(&self) -> Duration {
        Duration::from_secs(self.manual_cooldown_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_run_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            jitter: default_jitter(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    4
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_secs() -> u64 {
    30
}
fn default_jitter() -> f64 {
    0.2
}
fn default_user_agent() -> String {
    format!("threatfeed/{}", env!("CARGO_PKG_VERSION"))
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_initial_backoff(Duration::from_millis(self.initial_backoff_ms))
            .with_max_backoff(Duration::from_secs(self.max_backoff_secs))
            .with_jitter(self.jitter)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RateLimitSettings {
    pub requests_per_sec: f64,
    pub burst: u32,
}

impl Config {
    /// Token-bucket settings for a kind: configured override or built-in default.
    pub fn rate_limit_for(&self, kind: SourceKind) -> RateLimitConfig {
        if let Some(s) = self.rate_limits.get(&kind) {
            return RateLimitConfig::new(s.requests_per_sec, s.burst);
        }
        match kind {
            // Public NVD API allows 5 requests per rolling 30 seconds.
            SourceKind::Nvd => RateLimitConfig::new(0.16, 5),
            SourceKind::Ghsa => RateLimitConfig::new(1.0, 5),
            SourceKind::Osv => RateLimitConfig::new(5.0, 10),
            _ => RateLimitConfig::new(2.0, 4),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HookConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_hook_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            queue_capacity: default_hook_queue_capacity(),
        }
    }
}

fn default_hook_queue_capacity() -> usize {
    256
}

/// A data source declared in the config file, created at startup if absent.
#[derive(Debug, Deserialize, Clone)]
pub struct SeedSource {
    pub kind: SourceKind,
    pub label: String,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
    #[serde(default)]
    pub interval_minutes: Option<i64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}
fn default_enabled() -> bool {
    true
}

impl Config {
    /// A config with every default and the given database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: path.into(),
                max_connections: default_max_connections(),
            },
            server: ServerConfig::default(),
            ingest: IngestConfig::default(),
            http: HttpConfig::default(),
            rate_limits: HashMap::new(),
            hook: HookConfig::default(),
            sources: Vec::new(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }

    let ingest = &config.ingest;
    if ingest.org_id.trim().is_empty() {
        anyhow::bail!("ingest.org_id must not be empty");
    }
    if ingest.tick_secs == 0 {
        anyhow::bail!("ingest.tick_secs must be > 0");
    }
    if !(1..=MAX_INTERVAL_MINUTES).contains(&ingest.default_interval_minutes) {
        anyhow::bail!(
            "ingest.default_interval_minutes must be between 1 and {}",
            MAX_INTERVAL_MINUTES
        );
    }
    if ingest.max_parallel_runs == 0 {
        anyhow::bail!("ingest.max_parallel_runs must be >= 1");
    }
    if ingest.queue_capacity == 0 {
        anyhow::bail!("ingest.queue_capacity must be >= 1");
    }
    // Staleness is measured from admission, so queue wait and the final
    // upsert both count against it.
    if ingest.stale_run_secs < ingest.run_timeout_secs.saturating_mul(2) {
        anyhow::bail!("ingest.stale_run_secs must be at least twice ingest.run_timeout_secs");
    }

    if config.http.max_attempts == 0 {
        anyhow::bail!("http.max_attempts must be >= 1");
    }
    if config.http.timeout_secs == 0 {
        anyhow::bail!("http.timeout_secs must be > 0");
    }
    if !(0.0..=1.0).contains(&config.http.jitter) {
        anyhow::bail!("http.jitter must be in [0.0, 1.0]");
    }

    for (kind, limit) in &config.rate_limits {
        if !(limit.requests_per_sec > 0.0) || limit.burst == 0 {
            anyhow::bail!(
                "rate_limits.{}: requests_per_sec and burst must be > 0",
                kind
            );
        }
    }

    if config.hook.queue_capacity == 0 {
        anyhow::bail!("hook.queue_capacity must be >= 1");
    }

    for seed in &config.sources {
        SourceSettings::parse(seed.kind, &seed.config)
            .with_context(|| format!("invalid [[sources]] entry '{}'", seed.label))?;
        if matches!(seed.interval_minutes, Some(m) if !(1..=MAX_INTERVAL_MINUTES).contains(&m)) {
            anyhow::bail!(
                "sources '{}': interval_minutes must be between 1 and {}",
                seed.label,
                MAX_INTERVAL_MINUTES
            );
        }
    }

    Ok(())
}
