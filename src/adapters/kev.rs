//! CISA Known Exploited Vulnerabilities catalog.
//!
//! The catalog is one JSON document. The cursor is the high-water mark of
//! `dateAdded`; entries added on or after the cursor's date are emitted, so
//! the boundary day is re-sent and de-duplicated by fingerprint.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::{str_field, FetchPlan, Page, PageRequest, SourceAdapter};
use crate::cursor::Cursor;
use crate::error::{FetchError, ParseError};
use crate::fetch::FetchExecutor;
use crate::models::{CanonicalRecord, SourceKind};
use crate::normalize;

pub const KEV_CATALOG_URL: &str =
    "https://www.cisa.gov/sites/default/files/feeds/known_exploited_vulnerabilities.json";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KevSettings {
    #[serde(default = "default_url")]
    pub url: String,
}

fn default_url() -> String {
    KEV_CATALOG_URL.to_string()
}

pub struct KevAdapter {
    settings: KevSettings,
}

impl KevAdapter {
    pub fn new(settings: KevSettings) -> Self {
        Self { settings }
    }
}

fn date_added(entry: &Value) -> Option<NaiveDate> {
    str_field(entry, "dateAdded").and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
}

/// Select catalog entries at or after the cursor date.
pub fn parse_catalog(body: &Value, cursor: &Cursor) -> Result<Page, FetchError> {
    let entries = body
        .get("vulnerabilities")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::permanent("KEV catalog has no 'vulnerabilities' array"))?;

    let since = cursor.timestamp().map(|t| t.date_naive());
    let items = entries
        .iter()
        .filter(|e| match (since, date_added(e)) {
            (Some(since), Some(added)) => added >= since,
            _ => true,
        })
        .cloned()
        .collect();

    let high_water = entries
        .iter()
        .filter_map(date_added)
        .max()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| Cursor::Timestamp { at: n.and_utc() })
        .unwrap_or_default();

    Ok(Page {
        items,
        next: None,
        cursor: high_water,
    })
}

#[async_trait]
impl SourceAdapter for KevAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::CisaKev
    }

    fn plan(&self, cursor: &Cursor, _now: DateTime<Utc>) -> FetchPlan {
        FetchPlan {
            cursor: cursor.clone(),
            window: None,
            chains: vec![PageRequest::first("catalog")],
        }
    }

    #[tracing::instrument(skip_all)]
    async fn fetch_page(
        &self,
        exec: &FetchExecutor,
        plan: &FetchPlan,
        _page: &PageRequest,
    ) -> Result<Page, FetchError> {
        let body = exec.get_json(&self.settings.url, &[], &[]).await?;
        parse_catalog(&body, &plan.cursor)
    }

    fn normalize(&self, raw: &Value) -> Result<CanonicalRecord, ParseError> {
        normalize::kev(raw)
    }
}
