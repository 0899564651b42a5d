//! Keyset pagination cursors.
//!
//! A cursor names the last event of a page by `(timestamp, id)`. The next page
//! holds events strictly older in that order, so results stay stable while new
//! events are written.
//!
//! # Timestamp Precision
//!
//! Cursors encode timestamps as milliseconds. Events are stamped with
//! millisecond precision at creation, so a decoded cursor compares exactly
//! against stored values in every backend.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{UsageEvent, UsagePage};

/// Error type for cursor operations.
#[derive(Debug, Error)]
pub enum CursorError {
    #[error("invalid cursor format")]
    InvalidFormat,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid timestamp in cursor")]
    InvalidTimestamp,
    #[error("invalid UUID in cursor")]
    InvalidUuid,
}

/// A position in a newest-first result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn new(timestamp: DateTime<Utc>, id: Uuid) -> Self {
        Self { timestamp, id }
    }

    /// Cursor pointing at an event.
    pub fn for_event(event: &UsageEvent) -> Self {
        Self::new(event.timestamp, event.id)
    }

    /// Encode the cursor as a URL-safe base64 string.
    ///
    /// Format: `{timestamp_millis}:{uuid}` encoded as base64.
    pub fn encode(&self) -> String {
        let raw = format!("{}:{}", self.timestamp.timestamp_millis(), self.id);
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    /// Decode a cursor from a base64 string.
    pub fn decode(encoded: &str) -> Result<Self, CursorError> {
        let bytes = URL_SAFE_NO_PAD.decode(encoded)?;
        let raw = String::from_utf8(bytes).map_err(|_| CursorError::InvalidFormat)?;

        // UUIDs use hyphens not colons, so ':' cleanly separates the two parts.
        let (timestamp_str, uuid_str) = raw.split_once(':').ok_or(CursorError::InvalidFormat)?;

        let timestamp_millis: i64 = timestamp_str
            .parse()
            .map_err(|_| CursorError::InvalidTimestamp)?;

        let timestamp = DateTime::from_timestamp_millis(timestamp_millis)
            .ok_or(CursorError::InvalidTimestamp)?;

        let id = Uuid::parse_str(uuid_str).map_err(|_| CursorError::InvalidUuid)?;

        Ok(Self { timestamp, id })
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Whether an event sorts strictly after this position (i.e. is older).
    pub fn precedes(&self, event: &UsageEvent) -> bool {
        (event.timestamp, event.id) < (self.timestamp, self.id)
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Decode the optional cursor carried by a query.
pub(crate) fn decode_opt(cursor: Option<&str>) -> Result<Option<Cursor>, CursorError> {
    cursor.map(Cursor::decode).transpose()
}

/// Build a page from rows fetched newest first with `limit + 1` as the fetch size.
///
/// The extra row only signals that another page exists; it is not returned.
pub(crate) fn page_from_rows(mut rows: Vec<UsageEvent>, limit: usize) -> UsagePage {
    let has_more = rows.len() > limit;
    rows.truncate(limit);

    let next_cursor = if has_more {
        rows.last().map(|event| Cursor::for_event(event).encode())
    } else {
        None
    };

    UsagePage {
        events: rows,
        next_cursor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewUsageEvent;

    #[test]
    fn test_cursor_encode_decode_roundtrip() {
        let timestamp = DateTime::from_timestamp_millis(1_704_067_200_123).unwrap();
        let id = Uuid::new_v4();
        let cursor = Cursor::new(timestamp, id);

        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
        assert_eq!(decoded.timestamp_millis(), 1_704_067_200_123);
    }

    #[test]
    fn test_cursor_encode_is_url_safe() {
        let cursor = Cursor::new(Utc::now(), Uuid::new_v4());
        let encoded = cursor.encode();
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('='));
    }

    #[test]
    fn test_cursor_decode_errors() {
        assert!(matches!(
            Cursor::decode("not base64!!"),
            Err(CursorError::Base64(_))
        ));
        assert!(matches!(
            Cursor::decode(&URL_SAFE_NO_PAD.encode("no-separator")),
            Err(CursorError::InvalidFormat)
        ));
        assert!(matches!(
            Cursor::decode(&URL_SAFE_NO_PAD.encode("abc:00000000-0000-0000-0000-000000000000")),
            Err(CursorError::InvalidTimestamp)
        ));
        assert!(matches!(
            Cursor::decode(&URL_SAFE_NO_PAD.encode("1704067200000:not-a-uuid")),
            Err(CursorError::InvalidUuid)
        ));
    }

    #[test]
    fn test_page_from_rows() {
        let rows: Vec<UsageEvent> = (0..3)
            .map(|_| NewUsageEvent::new("p", "chat", 1, 1).into_event().unwrap())
            .collect();
        let last_kept = rows[1].clone();

        let page = page_from_rows(rows.clone(), 2);
        assert_eq!(page.events.len(), 2);
        let cursor = Cursor::decode(page.next_cursor.as_deref().unwrap()).unwrap();
        assert_eq!(cursor, Cursor::for_event(&last_kept));

        let page = page_from_rows(rows, 3);
        assert_eq!(page.events.len(), 3);
        assert!(page.next_cursor.is_none());
    }
}
