//! Source adapters: one per upstream feed family.
//!
//! Every adapter implements [`SourceAdapter`], which covers cursor parsing,
//! page planning, fetching one raw page, and normalizing one raw item. The
//! [`Adapter`] enum is the tagged dispatch point: the coordinator builds it
//! from a [`SourceKind`] plus the source's validated [`SourceSettings`] and
//! never inspects concrete adapter types.
//!
//! # Pages and chains
//!
//! A [`FetchPlan`] lists one or more *chains*. Pages within a chain are
//! dependent (NVD `startIndex`, GHSA `endCursor`), so a failed page ends its
//! chain. Separate chains are independent (one per OSV ecosystem, one per
//! RSS feed) and keep going when a sibling fails.
//!
//! # Configuration
//!
//! | Kind | Keys |
//! |------|------|
//! | NVD | `base_url`, `results_per_page`, `api_key` (else `NVD_API_KEY`) |
//! | OSV | `base_url`, `ecosystems` |
//! | GHSA | `base_url`, `page_size`, `token` (else `GITHUB_TOKEN`) |
//! | CISA_KEV | `url` |
//! | RSS | `feed_url` + optional `label`, or `feeds` |
//! | MSRC | same as RSS; defaults to the MSRC update guide feed |

pub mod ghsa;
pub mod kev;
pub mod nvd;
pub mod osv;
pub mod rss;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cursor::Cursor;
use crate::error::{FetchError, IngestError, ParseError};
use crate::fetch::FetchExecutor;
use crate::models::{CanonicalRecord, SourceKind};

pub use ghsa::{GhsaAdapter, GhsaSettings};
pub use kev::{KevAdapter, KevSettings};
pub use nvd::{NvdAdapter, NvdSettings};
pub use osv::{OsvAdapter, OsvSettings};
pub use rss::{Feed, FeedAdapter, FeedSettings};

/// Overlap applied to timestamp cursors to absorb upstream clock skew.
pub const CURSOR_OVERLAP_MINUTES: i64 = 5;

/// Time range covered by a delta query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl Window {
    /// Build the window for a timestamp cursor.
    ///
    /// Starts [`CURSOR_OVERLAP_MINUTES`] before the committed cursor, or
    /// `first_lookback` before `now` when there is none. When `max_span` is
    /// set the window end is pulled in so the range never exceeds it; the
    /// next run continues from there.
    pub fn for_cursor(
        cursor: &Cursor,
        now: DateTime<Utc>,
        first_lookback: Duration,
        max_span: Option<Duration>,
    ) -> Window {
        let since = match cursor.timestamp() {
            Some(at) => (at - Duration::minutes(CURSOR_OVERLAP_MINUTES)).min(now),
            None => now - first_lookback,
        };
        let until = match max_span {
            Some(span) if now - since > span => since + span,
            _ => now,
        };
        Window { since, until }
    }

    pub fn since_iso(&self) -> String {
        self.since.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn until_iso(&self) -> String {
        self.until.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Address of one page: which chain, and the continuation token within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub chain: String,
    pub token: Option<String>,
}

impl PageRequest {
    pub fn first(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            token: None,
        }
    }

    pub fn next(&self, token: impl Into<String>) -> Self {
        Self {
            chain: self.chain.clone(),
            token: Some(token.into()),
        }
    }
}

/// What a run will fetch.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    /// The committed cursor the plan was built from.
    pub cursor: Cursor,
    pub window: Option<Window>,
    pub chains: Vec<PageRequest>,
}

/// One fetched page of raw items.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Value>,
    pub next: Option<PageRequest>,
    /// Cursor progress this page contributes once its records are persisted.
    pub cursor: Cursor,
}

/// Capabilities every source kind provides.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Decode the committed cursor string for this source.
    fn parse_cursor(&self, raw: Option<&str>) -> Result<Cursor, ParseError> {
        Cursor::decode(raw).map_err(|reason| ParseError::new(self.kind(), reason))
    }

    fn plan(&self, cursor: &Cursor, now: DateTime<Utc>) -> FetchPlan;

    async fn fetch_page(
        &self,
        exec: &FetchExecutor,
        plan: &FetchPlan,
        page: &PageRequest,
    ) -> Result<Page, FetchError>;

    fn normalize(&self, raw: &Value) -> Result<CanonicalRecord, ParseError>;
}

/// Validated per-kind configuration of a data source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSettings {
    Nvd(NvdSettings),
    Osv(OsvSettings),
    Ghsa(GhsaSettings),
    CisaKev(KevSettings),
    Feed(FeedSettings),
}

impl SourceSettings {
    /// Validate a source's opaque JSON configuration against its kind.
    pub fn parse(kind: SourceKind, config: &Value) -> Result<SourceSettings, IngestError> {
        let config = match config {
            Value::Null => Value::Object(Default::default()),
            Value::Object(_) => config.clone(),
            _ => {
                return Err(IngestError::Invalid(format!(
                    "{} config must be a JSON object",
                    kind
                )))
            }
        };
        let parsed = match kind {
            SourceKind::Nvd => from_config(config).map(SourceSettings::Nvd),
            SourceKind::Osv => from_config::<OsvSettings>(config)
                .and_then(OsvSettings::validated)
                .map(SourceSettings::Osv),
            SourceKind::Ghsa => from_config(config).map(SourceSettings::Ghsa),
            SourceKind::CisaKev => from_config(config).map(SourceSettings::CisaKev),
            SourceKind::Rss => FeedSettings::from_config(config, None).map(SourceSettings::Feed),
            SourceKind::Msrc => {
                FeedSettings::from_config(config, Some(rss::MSRC_FEED_URL)).map(SourceSettings::Feed)
            }
        };
        parsed.map_err(|reason| IngestError::Invalid(format!("{} config: {}", kind, reason)))
    }
}

fn from_config<T: DeserializeOwned>(config: Value) -> Result<T, String> {
    serde_json::from_value(config).map_err(|e| e.to_string())
}

/// Tagged adapter dispatch.
pub enum Adapter {
    Nvd(NvdAdapter),
    Osv(OsvAdapter),
    Ghsa(GhsaAdapter),
    CisaKev(KevAdapter),
    Feed(FeedAdapter),
}

impl Adapter {
    /// Build the adapter for `kind` from its raw configuration.
    pub fn for_source(kind: SourceKind, config: &Value) -> Result<Adapter, IngestError> {
        let settings = SourceSettings::parse(kind, config)?;
        Ok(match settings {
            SourceSettings::Nvd(s) => Adapter::Nvd(NvdAdapter::new(s)),
            SourceSettings::Osv(s) => Adapter::Osv(OsvAdapter::new(s)),
            SourceSettings::Ghsa(s) => Adapter::Ghsa(GhsaAdapter::new(s)),
            SourceSettings::CisaKev(s) => Adapter::CisaKev(KevAdapter::new(s)),
            SourceSettings::Feed(s) => Adapter::Feed(FeedAdapter::new(kind, s)),
        })
    }

    pub fn as_source(&self) -> &dyn SourceAdapter {
        match self {
            Adapter::Nvd(a) => a,
            Adapter::Osv(a) => a,
            Adapter::Ghsa(a) => a,
            Adapter::CisaKev(a) => a,
            Adapter::Feed(a) => a,
        }
    }
}

/// Read a string field, treating blanks as absent.
pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
