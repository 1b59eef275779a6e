//! RSS 2.0 / Atom feed polling (kinds RSS and MSRC).
//!
//! Feeds have no server-side delta filter, so every poll returns the whole
//! feed. Each feed is its own chain. The cursor is a GUID seen-set of the
//! items whose records have been committed; repeated items still flow to
//! the upsert engine, where a fingerprint match turns them into no-ops.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesStart, Event};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{FetchPlan, Page, PageRequest, SourceAdapter};
use crate::cursor::Cursor;
use crate::error::{FetchError, ParseError};
use crate::fetch::FetchExecutor;
use crate::models::{CanonicalRecord, SourceKind};
use crate::normalize::{self, advisory_key, parse_timestamp};

pub const MSRC_FEED_URL: &str = "https://api.msrc.microsoft.com/update-guide/rss";

#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedSettings {
    pub feeds: Vec<Feed>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFeedConfig {
    #[serde(default)]
    feed_url: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    feeds: Vec<RawFeed>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFeed {
    Url(String),
    Named {
        url: String,
        #[serde(default)]
        label: Option<String>,
    },
}

impl FeedSettings {
    /// Accepts `feed_url` (+ `label`) and/or a `feeds` list of URLs or
    /// `{ url, label }` tables.
    pub(crate) fn from_config(config: Value, default_url: Option<&str>) -> Result<Self, String> {
        let raw: RawFeedConfig = serde_json::from_value(config).map_err(|e| e.to_string())?;

        let mut candidates: Vec<(String, Option<String>)> = Vec::new();
        if let Some(url) = raw.feed_url {
            candidates.push((url, raw.label));
        }
        for feed in raw.feeds {
            match feed {
                RawFeed::Url(url) => candidates.push((url, None)),
                RawFeed::Named { url, label } => candidates.push((url, label)),
            }
        }
        if candidates.is_empty() {
            match default_url {
                Some(url) => candidates.push((url.to_string(), Some("MSRC".to_string()))),
                None => return Err("`feed_url` is required (or a non-empty `feeds` list)".into()),
            }
        }

        let mut feeds = Vec::with_capacity(candidates.len());
        for (url, label) in candidates {
            let parsed = reqwest::Url::parse(url.trim())
                .map_err(|e| format!("invalid feed URL '{}': {}", url, e))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(format!("feed URL '{}' must be http or https", url));
            }
            let label = label
                .filter(|l| !l.trim().is_empty())
                .or_else(|| parsed.host_str().map(str::to_string))
                .unwrap_or_else(|| url.clone());
            feeds.push(Feed {
                label,
                url: parsed.to_string(),
            });
        }
        Ok(FeedSettings { feeds })
    }
}

pub struct FeedAdapter {
    kind: SourceKind,
    settings: FeedSettings,
}

impl FeedAdapter {
    pub fn new(kind: SourceKind, settings: FeedSettings) -> Self {
        Self { kind, settings }
    }
}

/// One entry of an RSS `<item>` or Atom `<entry>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub guid: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

impl FeedItem {
    pub fn to_raw(&self, feed_label: &str) -> Value {
        json!({
            "guid": self.guid,
            "title": self.title,
            "link": self.link,
            "summary": self.summary,
            "published": self
                .published
                .map(|p| p.to_rfc3339_opts(SecondsFormat::Secs, true)),
            "feed": feed_label,
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Guid,
    Title,
    Link,
    Summary,
    Published,
}

fn field_for(name: &[u8]) -> Option<Field> {
    match name {
        b"guid" | b"id" => Some(Field::Guid),
        b"title" => Some(Field::Title),
        b"link" => Some(Field::Link),
        b"description" | b"summary" | b"content" => Some(Field::Summary),
        b"pubDate" | b"published" | b"updated" | b"date" => Some(Field::Published),
        _ => None,
    }
}

fn atom_href(e: &BytesStart<'_>) -> Option<String> {
    let mut href = None;
    let mut rel = None;
    for attr in e.attributes().flatten() {
        match attr.key.local_name().as_ref() {
            b"href" => href = attr.unescape_value().ok().map(|v| v.into_owned()),
            b"rel" => rel = attr.unescape_value().ok().map(|v| v.into_owned()),
            _ => {}
        }
    }
    match rel.as_deref() {
        None | Some("alternate") => href,
        _ => None,
    }
}

fn assign(item: &mut FeedItem, field: Field, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    let slot = match field {
        Field::Guid => &mut item.guid,
        Field::Title => &mut item.title,
        Field::Link => &mut item.link,
        Field::Summary => &mut item.summary,
        Field::Published => {
            if item.published.is_none() {
                item.published = parse_timestamp(text);
            }
            return;
        }
    };
    if slot.is_none() {
        *slot = Some(text.to_string());
    }
}

/// Parse an RSS 2.0, RSS 1.0 (RDF), or Atom document into items.
pub fn parse_feed(xml: &[u8]) -> Result<Vec<FeedItem>, FetchError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut items = Vec::new();
    let mut current: Option<FeedItem> = None;
    let mut field: Option<Field> = None;
    // Nesting depth below the current field element, for inline markup.
    let mut depth = 0usize;
    let mut text = String::new();
    let mut saw_root = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"rss" | b"feed" | b"RDF" => saw_root = true,
                    b"item" | b"entry" => {
                        current = Some(FeedItem::default());
                        field = None;
                    }
                    n if current.is_some() && field.is_none() => {
                        field = field_for(n);
                        depth = 0;
                        text.clear();
                        if field == Some(Field::Link) {
                            if let (Some(item), Some(href)) = (current.as_mut(), atom_href(&e)) {
                                assign(item, Field::Link, &href);
                            }
                        }
                    }
                    _ if field.is_some() => depth += 1,
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"link" && field.is_none() {
                    if let (Some(item), Some(href)) = (current.as_mut(), atom_href(&e)) {
                        assign(item, Field::Link, &href);
                    }
                }
            }
            Ok(Event::Text(t)) if field.is_some() => {
                let unescaped = t
                    .unescape()
                    .map_err(|e| FetchError::permanent(format!("malformed feed text: {}", e)))?;
                text.push_str(&unescaped);
            }
            Ok(Event::CData(c)) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&c));
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"item" | b"entry" => {
                        if let Some(item) = current.take() {
                            items.push(item);
                        }
                        field = None;
                    }
                    _ if field.is_some() && depth > 0 => depth -= 1,
                    _ => {
                        if let (Some(f), Some(item)) = (field.take(), current.as_mut()) {
                            assign(item, f, &text);
                        }
                        text.clear();
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FetchError::permanent(format!("malformed feed XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(FetchError::permanent("document is not an RSS or Atom feed"));
    }
    Ok(items)
}

/// Build the page for one feed: raw items plus the GUIDs they carry.
pub fn feed_page(items: &[FeedItem], feed_label: &str) -> Page {
    let raw: Vec<Value> = items.iter().map(|i| i.to_raw(feed_label)).collect();
    let guids = raw.iter().filter_map(advisory_key).collect();
    Page {
        items: raw,
        next: None,
        cursor: Cursor::SeenSet { guids },
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn plan(&self, cursor: &Cursor, _now: DateTime<Utc>) -> FetchPlan {
        FetchPlan {
            cursor: cursor.clone(),
            window: None,
            chains: self
                .settings
                .feeds
                .iter()
                .map(|f| PageRequest::first(f.url.clone()))
                .collect(),
        }
    }

    #[tracing::instrument(skip_all, fields(feed = %page.chain))]
    async fn fetch_page(
        &self,
        exec: &FetchExecutor,
        plan: &FetchPlan,
        page: &PageRequest,
    ) -> Result<Page, FetchError> {
        let label = self
            .settings
            .feeds
            .iter()
            .find(|f| f.url == page.chain)
            .map(|f| f.label.clone())
            .unwrap_or_else(|| page.chain.clone());

        let body = exec.get_text(&page.chain, &[]).await?;
        let items = parse_feed(body.as_bytes())?;
        let page = feed_page(&items, &label);

        let unseen = page
            .cursor
            .seen()
            .iter()
            .filter(|g| !plan.cursor.has_seen(g))
            .count();
        debug!(items = page.items.len(), unseen, "parsed feed");
        Ok(page)
    }

    fn normalize(&self, raw: &Value) -> Result<CanonicalRecord, ParseError> {
        normalize::advisory(raw, self.kind)
    }
}
