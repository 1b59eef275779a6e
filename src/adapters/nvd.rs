//! NVD CVE API 2.0.
//!
//! Delta query on `lastModStartDate`/`lastModEndDate`, paged by
//! `startIndex` until `totalResults` is reached. The API rejects windows
//! longer than 120 days, so long gaps are caught up over several runs.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::{FetchPlan, Page, PageRequest, SourceAdapter, Window};
use crate::cursor::Cursor;
use crate::error::{FetchError, ParseError};
use crate::fetch::FetchExecutor;
use crate::models::{CanonicalRecord, SourceKind};
use crate::normalize;

pub const NVD_API_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

const FIRST_RUN_LOOKBACK_DAYS: i64 = 2;
const MAX_WINDOW_DAYS: i64 = 120;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvdSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_results_per_page")]
    pub results_per_page: u32,
    /// Falls back to the `NVD_API_KEY` environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    NVD_API_URL.to_string()
}

fn default_results_per_page() -> u32 {
    2000
}

pub struct NvdAdapter {
    settings: NvdSettings,
}

impl NvdAdapter {
    pub fn new(settings: NvdSettings) -> Self {
        Self { settings }
    }

    fn api_key(&self) -> Option<String> {
        self.settings
            .api_key
            .clone()
            .or_else(|| std::env::var("NVD_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// Interpret one response body.
pub fn parse_page(
    body: &Value,
    start_index: u64,
    window: &Window,
    request: &PageRequest,
) -> Result<Page, FetchError> {
    let vulns = body
        .get("vulnerabilities")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::permanent("NVD response has no 'vulnerabilities' array"))?;
    let total = body.get("totalResults").and_then(Value::as_u64).unwrap_or(0);

    let items: Vec<Value> = vulns
        .iter()
        .map(|v| v.get("cve").cloned().unwrap_or_else(|| v.clone()))
        .collect();

    let consumed = start_index + items.len() as u64;
    let next = (!items.is_empty() && consumed < total).then(|| request.next(consumed.to_string()));

    Ok(Page {
        items,
        next,
        cursor: Cursor::Timestamp { at: window.until },
    })
}

#[async_trait]
impl SourceAdapter for NvdAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Nvd
    }

    fn plan(&self, cursor: &Cursor, now: DateTime<Utc>) -> FetchPlan {
        FetchPlan {
            cursor: cursor.clone(),
            window: Some(Window::for_cursor(
                cursor,
                now,
                Duration::days(FIRST_RUN_LOOKBACK_DAYS),
                Some(Duration::days(MAX_WINDOW_DAYS)),
            )),
            chains: vec![PageRequest::first("cves")],
        }
    }

    #[tracing::instrument(skip_all, fields(start = page.token.as_deref().unwrap_or("0")))]
    async fn fetch_page(
        &self,
        exec: &FetchExecutor,
        plan: &FetchPlan,
        page: &PageRequest,
    ) -> Result<Page, FetchError> {
        let window = plan
            .window
            .ok_or_else(|| FetchError::permanent("NVD plan has no time window"))?;
        let start_index: u64 = page
            .token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);

        let query = [
            ("lastModStartDate", window.since_iso()),
            ("lastModEndDate", window.until_iso()),
            ("startIndex", start_index.to_string()),
            ("resultsPerPage", self.settings.results_per_page.to_string()),
        ];
        let headers: Vec<(&str, String)> = self
            .api_key()
            .map(|key| vec![("apiKey", key)])
            .unwrap_or_default();

        let body = exec
            .get_json(&self.settings.base_url, &query, &headers)
            .await?;
        parse_page(&body, start_index, &window, page)
    }

    fn normalize(&self, raw: &Value) -> Result<CanonicalRecord, ParseError> {
        normalize::nvd(raw)
    }
}
