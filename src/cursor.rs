//! Delta cursors and the tracker that decides when they may advance.
//!
//! A [`Cursor`] is persisted as JSON in `data_sources.last_success_cursor`.
//! Timestamp cursors drive delta queries (NVD, OSV, GHSA, CISA KEV); the
//! GUID seen-set is used by RSS-style feeds that have no server-side
//! filtering.
//!
//! The [`DeltaTracker`] only hands back a cursor to commit once every page
//! of a run has been fetched and durably upserted. Merges are monotonic, so
//! a committed cursor never moves backwards.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of GUIDs retained in a seen-set cursor.
pub const SEEN_SET_CAP: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cursor {
    #[default]
    Empty,
    Timestamp { at: DateTime<Utc> },
    /// Oldest first; the most recently committed GUIDs sit at the end.
    SeenSet { guids: Vec<String> },
}

impl Cursor {
    /// Decode a persisted cursor. A bare RFC 3339 string is accepted as a
    /// timestamp cursor.
    pub fn decode(raw: Option<&str>) -> Result<Cursor, String> {
        let raw = match raw.map(str::trim) {
            None | Some("") => return Ok(Cursor::Empty),
            Some(s) => s,
        };
        if let Ok(cursor) = serde_json::from_str::<Cursor>(raw) {
            return Ok(cursor);
        }
        DateTime::parse_from_rfc3339(raw)
            .map(|at| Cursor::Timestamp {
                at: at.with_timezone(&Utc),
            })
            .map_err(|_| format!("unrecognized cursor: {}", raw))
    }

    pub fn encode(&self) -> String {
        // Serializing a tagged enum of strings and timestamps cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Cursor::Empty => true,
            Cursor::SeenSet { guids } => guids.is_empty(),
            Cursor::Timestamp { .. } => false,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Cursor::Timestamp { at } => Some(*at),
            _ => None,
        }
    }

    pub fn seen(&self) -> &[String] {
        match self {
            Cursor::SeenSet { guids } => guids,
            _ => &[],
        }
    }

    pub fn has_seen(&self, guid: &str) -> bool {
        self.seen().iter().any(|g| g == guid)
    }

    /// Combine `self` (older) with `newer`, never regressing.
    ///
    /// Timestamps take the maximum. Seen-sets are unioned, keeping the
    /// newest [`SEEN_SET_CAP`] entries. A cursor of a different shape
    /// replaces an empty one and otherwise leaves `self` untouched.
    pub fn merge(self, newer: Cursor) -> Cursor {
        match (self, newer) {
            (old, Cursor::Empty) => old,
            (Cursor::Empty, new) => new,
            (Cursor::Timestamp { at: a }, Cursor::Timestamp { at: b }) => {
                Cursor::Timestamp { at: a.max(b) }
            }
            (Cursor::SeenSet { guids: old }, Cursor::SeenSet { guids: new }) => {
                let incoming: HashSet<&String> = new.iter().collect();
                let mut merged: Vec<String> = old
                    .into_iter()
                    .filter(|g| !incoming.contains(g))
                    .collect();
                let mut seen_new = HashSet::new();
                for g in new {
                    if seen_new.insert(g.clone()) {
                        merged.push(g);
                    }
                }
                if merged.len() > SEEN_SET_CAP {
                    merged.drain(..merged.len() - SEEN_SET_CAP);
                }
                Cursor::SeenSet { guids: merged }
            }
            (old, _) => old,
        }
    }
}

/// Accumulates per-page cursor progress for one run.
#[derive(Debug)]
pub struct DeltaTracker {
    committed: Cursor,
    progress: Cursor,
    pages: usize,
    complete: bool,
}

impl DeltaTracker {
    pub fn new(committed: Cursor) -> Self {
        Self {
            committed,
            progress: Cursor::Empty,
            pages: 0,
            complete: true,
        }
    }

    pub fn committed(&self) -> &Cursor {
        &self.committed
    }

    /// Record the cursor contributed by a page whose records are persisted.
    pub fn page_persisted(&mut self, page_cursor: Cursor) {
        let progress = std::mem::take(&mut self.progress);
        self.progress = progress.merge(page_cursor);
        self.pages += 1;
    }

    /// A page failed or the run stopped early; the window is not covered.
    pub fn mark_incomplete(&mut self) {
        self.complete = false;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The cursor to commit, if the run covered its whole window and moved
    /// the cursor forward.
    pub fn finish(self) -> Option<Cursor> {
        if !self.complete || self.pages == 0 {
            return None;
        }
        let merged = self.committed.clone().merge(self.progress);
        (merged != self.committed).then_some(merged)
    }
}
