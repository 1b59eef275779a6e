//! OSV query API, one independent chain per ecosystem.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{str_field, FetchPlan, Page, PageRequest, SourceAdapter, Window};
use crate::cursor::Cursor;
use crate::error::{FetchError, ParseError};
use crate::fetch::FetchExecutor;
use crate::models::{CanonicalRecord, SourceKind};
use crate::normalize::{self, parse_timestamp};

pub const OSV_QUERY_URL: &str = "https://api.osv.dev/v1/query";

const FIRST_RUN_LOOKBACK_HOURS: i64 = 10;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OsvSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ecosystems")]
    pub ecosystems: Vec<String>,
}

fn default_base_url() -> String {
    OSV_QUERY_URL.to_string()
}

fn default_ecosystems() -> Vec<String> {
    ["PyPI", "npm", "Maven", "Go", "RubyGems", "crates.io"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl OsvSettings {
    pub(crate) fn validated(self) -> Result<Self, String> {
        if self.ecosystems.iter().all(|e| e.trim().is_empty()) {
            return Err("`ecosystems` must list at least one ecosystem".to_string());
        }
        Ok(self)
    }
}

pub struct OsvAdapter {
    settings: OsvSettings,
}

impl OsvAdapter {
    pub fn new(settings: OsvSettings) -> Self {
        Self { settings }
    }
}

/// Interpret one response body, dropping vulns last modified before the
/// window start. Items without a parseable `modified` are kept.
pub fn parse_page(body: &Value, window: &Window, request: &PageRequest) -> Result<Page, FetchError> {
    if !body.is_object() {
        return Err(FetchError::permanent("OSV response is not a JSON object"));
    }
    let items = body
        .get("vulns")
        .and_then(Value::as_array)
        .map(|vulns| {
            vulns
                .iter()
                .filter(|v| {
                    str_field(v, "modified")
                        .and_then(parse_timestamp)
                        .map_or(true, |m| m >= window.since)
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let next = str_field(body, "next_page_token").map(|t| request.next(t));

    Ok(Page {
        items,
        next,
        cursor: Cursor::Timestamp { at: window.until },
    })
}

#[async_trait]
impl SourceAdapter for OsvAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Osv
    }

    fn plan(&self, cursor: &Cursor, now: DateTime<Utc>) -> FetchPlan {
        FetchPlan {
            cursor: cursor.clone(),
            window: Some(Window::for_cursor(
                cursor,
                now,
                Duration::hours(FIRST_RUN_LOOKBACK_HOURS),
                None,
            )),
            chains: self
                .settings
                .ecosystems
                .iter()
                .map(|e| e.trim())
                .filter(|e| !e.is_empty())
                .map(PageRequest::first)
                .collect(),
        }
    }

    #[tracing::instrument(skip_all, fields(ecosystem = %page.chain))]
    async fn fetch_page(
        &self,
        exec: &FetchExecutor,
        plan: &FetchPlan,
        page: &PageRequest,
    ) -> Result<Page, FetchError> {
        let window = plan
            .window
            .ok_or_else(|| FetchError::permanent("OSV plan has no time window"))?;

        let mut payload = json!({
            "package": { "ecosystem": page.chain },
            "modified": window.since_iso(),
        });
        if let Some(token) = &page.token {
            payload["page_token"] = json!(token);
        }

        let body = exec.post_json(&self.settings.base_url, &payload, &[]).await?;
        parse_page(&body, &window, page)
    }

    fn normalize(&self, raw: &Value) -> Result<CanonicalRecord, ParseError> {
        normalize::osv(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> Window {
        Window {
            since: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            until: Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_filters_items_older_than_window() {
        let body = json!({"vulns": [
            {"id": "A", "modified": "2024-06-01T05:00:00Z"},
            {"id": "B", "modified": "2024-05-01T05:00:00Z"},
            {"id": "C"}
        ]});
        let page = parse_page(&body, &window(), &PageRequest::first("PyPI")).unwrap();
        let ids: Vec<&str> = page.items.iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["A", "C"]);
        assert!(page.next.is_none());
    }

    #[test]
    fn test_follows_page_token() {
        let body = json!({"vulns": [], "next_page_token": "abc"});
        let req = PageRequest::first("npm");
        let page = parse_page(&body, &window(), &req).unwrap();
        assert_eq!(page.next, Some(req.next("abc")));
    }

    #[test]
    fn test_empty_response_is_empty_page() {
        let page = parse_page(&json!({}), &window(), &PageRequest::first("Go")).unwrap();
        assert!(page.items.is_empty());
    }

    #[test]
    fn test_one_chain_per_ecosystem() {
        let adapter = OsvAdapter::new(OsvSettings {
            base_url: OSV_QUERY_URL.into(),
            ecosystems: vec!["PyPI".into(), " ".into(), "npm".into()],
        });
        let plan = adapter.plan(&Cursor::Empty, Utc::now());
        let chains: Vec<&str> = plan.chains.iter().map(|c| c.chain.as_str()).collect();
        assert_eq!(chains, vec!["PyPI", "npm"]);
    }

    #[test]
    fn test_default_ecosystems() {
        let settings: OsvSettings = serde_json::from_value(json!({})).unwrap();
        assert!(settings.ecosystems.contains(&"crates.io".to_string()));
        assert!(OsvSettings {
            ecosystems: vec![],
            ..settings
        }
        .validated()
        .is_err());
    }
}
