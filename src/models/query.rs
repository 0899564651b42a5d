use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UsageEvent;

/// Default page size for event queries.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Largest page size a single query may request.
pub const MAX_QUERY_LIMIT: usize = 1000;

/// Filters and pagination for point queries against stored events.
///
/// Filters are conjunctive; `None` leaves a dimension unrestricted.
/// `time_from` is inclusive, `time_to` exclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageQuery {
    pub project: Option<String>,
    pub request_type: Option<String>,
    pub time_from: Option<DateTime<Utc>>,
    pub time_to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    /// Opaque cursor returned as `next_cursor` by a previous page.
    pub cursor: Option<String>,
}

impl UsageQuery {
    pub fn for_project(project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            ..Default::default()
        }
    }

    pub fn request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = Some(request_type.into());
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.time_from = from;
        self.time_to = to;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Page size after applying the default and clamping to `1..=MAX_QUERY_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT)
    }

    /// Whether an event satisfies every filter (cursor excluded).
    pub fn matches(&self, event: &UsageEvent) -> bool {
        self.project.as_ref().is_none_or(|p| *p == event.project)
            && self
                .request_type
                .as_ref()
                .is_none_or(|t| *t == event.request_type)
            && self.time_from.is_none_or(|from| event.timestamp >= from)
            && self.time_to.is_none_or(|to| event.timestamp < to)
    }
}

/// One page of query results, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsagePage {
    pub events: Vec<UsageEvent>,
    /// Cursor for the next (older) page, if more events match.
    pub next_cursor: Option<String>,
}

impl UsagePage {
    pub fn into_parts(self) -> (Vec<UsageEvent>, Option<String>) {
        (self.events, self.next_cursor)
    }
}
