//! GitHub Security Advisories via the GraphQL API.
//!
//! Requires a token (`token` setting or `GITHUB_TOKEN`). Pages are chained
//! by `pageInfo.endCursor`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{str_field, FetchPlan, Page, PageRequest, SourceAdapter, Window};
use crate::cursor::Cursor;
use crate::error::{FetchError, ParseError};
use crate::fetch::FetchExecutor;
use crate::models::{CanonicalRecord, SourceKind};
use crate::normalize;

pub const GITHUB_GRAPHQL_URL: &str = "https://api.github.com/graphql";

const FIRST_RUN_LOOKBACK_HOURS: i64 = 24;

const ADVISORIES_QUERY: &str = r#"
query($since: DateTime!, $first: Int!, $after: String) {
  securityAdvisories(first: $first, after: $after, updatedSince: $since,
                     orderBy: {field: UPDATED_AT, direction: ASC}) {
    pageInfo { hasNextPage endCursor }
    nodes {
      ghsaId summary description severity publishedAt updatedAt permalink
      identifiers { type value }
      references { url }
      vulnerabilities(first: 25) { nodes { package { ecosystem name } } }
    }
  }
}
"#;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GhsaSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_base_url() -> String {
    GITHUB_GRAPHQL_URL.to_string()
}

fn default_page_size() -> u32 {
    100
}

pub struct GhsaAdapter {
    settings: GhsaSettings,
}

impl GhsaAdapter {
    pub fn new(settings: GhsaSettings) -> Self {
        Self { settings }
    }

    fn token(&self) -> Result<String, FetchError> {
        self.settings
            .token
            .clone()
            .or_else(|| std::env::var("GITHUB_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| FetchError::permanent("GITHUB_TOKEN is not set"))
    }
}

pub fn parse_page(body: &Value, window: &Window, request: &PageRequest) -> Result<Page, FetchError> {
    let connection = body
        .get("data")
        .and_then(|d| d.get("securityAdvisories"))
        .filter(|c| c.is_object());

    let Some(connection) = connection else {
        return Err(graphql_error(body));
    };

    let items = connection
        .get("nodes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let page_info = connection.get("pageInfo").unwrap_or(&Value::Null);
    let has_next = page_info
        .get("hasNextPage")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let next = match (has_next, str_field(page_info, "endCursor")) {
        (true, Some(end)) if !items.is_empty() => Some(request.next(end)),
        _ => None,
    };

    Ok(Page {
        items,
        next,
        cursor: Cursor::Timestamp { at: window.until },
    })
}

fn graphql_error(body: &Value) -> FetchError {
    let errors: Vec<&Value> = body
        .get("errors")
        .and_then(Value::as_array)
        .map(|e| e.iter().collect())
        .unwrap_or_default();
    if errors
        .iter()
        .any(|e| str_field(e, "type") == Some("RATE_LIMITED"))
    {
        return FetchError::Throttled { retry_after: None };
    }
    let message = errors
        .iter()
        .filter_map(|e| str_field(e, "message"))
        .collect::<Vec<_>>()
        .join("; ");
    if message.is_empty() {
        FetchError::permanent("GraphQL response has no securityAdvisories")
    } else {
        FetchError::permanent(format!("GraphQL error: {}", message))
    }
}

#[async_trait]
impl SourceAdapter for GhsaAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Ghsa
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
            chains: vec![PageRequest::first("advisories")],
        }
    }

    #[tracing::instrument(skip_all, fields(after = page.token.as_deref().unwrap_or("")))]
    async fn fetch_page(
        &self,
        exec: &FetchExecutor,
        plan: &FetchPlan,
        page: &PageRequest,
    ) -> Result<Page, FetchError> {
        let window = plan
            .window
            .ok_or_else(|| FetchError::permanent("GHSA plan has no time window"))?;
        let token = self.token()?;

        let payload = json!({
            "query": ADVISORIES_QUERY,
            "variables": {
                "since": window.since_iso(),
                "first": self.settings.page_size,
                "after": page.token,
            }
        });
        let headers = [("Authorization", format!("bearer {}", token))];

        let body = exec
            .post_json(&self.settings.base_url, &payload, &headers)
            .await?;
        parse_page(&body, &window, page)
    }

    fn normalize(&self, raw: &Value) -> Result<CanonicalRecord, ParseError> {
        normalize::ghsa(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> Window {
        Window {
            since: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            until: Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_parse_page_with_next_cursor() {
        let body = json!({"data": {"securityAdvisories": {
            "pageInfo": {"hasNextPage": true, "endCursor": "Y3Vyc29y"},
            "nodes": [{"ghsaId": "GHSA-1111-2222-3333"}]
        }}});
        let req = PageRequest::first("advisories");
        let page = parse_page(&body, &window(), &req).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next, Some(req.next("Y3Vyc29y")));
    }

    #[test]
    fn test_parse_page_last() {
        let body = json!({"data": {"securityAdvisories": {
            "pageInfo": {"hasNextPage": false, "endCursor": null},
            "nodes": []
        }}});
        let page = parse_page(&body, &window(), &PageRequest::first("advisories")).unwrap();
        assert!(page.next.is_none());
    }

    #[test]
    fn test_graphql_errors_classified() {
        let limited = json!({"errors": [{"type": "RATE_LIMITED", "message": "slow down"}]});
        assert_eq!(
            parse_page(&limited, &window(), &PageRequest::first("a")).unwrap_err(),
            FetchError::Throttled { retry_after: None }
        );

        let bad = json!({"data": null, "errors": [{"message": "Field 'x' doesn't exist"}]});
        let err = parse_page(&bad, &window(), &PageRequest::first("a")).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn test_configured_token_wins() {
        let adapter = GhsaAdapter::new(GhsaSettings {
            base_url: GITHUB_GRAPHQL_URL.into(),
            page_size: 100,
            token: Some("ghp_test".into()),
        });
        assert_eq!(adapter.token().unwrap(), "ghp_test");
    }
}
