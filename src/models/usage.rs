use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::validators::validate_not_blank;
use crate::error::ValidationError;

/// Arbitrary per-event annotations (model name, user, ...).
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A scalar metadata value.
///
/// Serializes as the bare JSON scalar so stored metadata stays readable by
/// other tools querying the backend directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for MetadataValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Largest token count accepted for either side of a single event.
pub const MAX_TOKENS_PER_EVENT: i64 = u32::MAX as i64;

/// Input for a usage event before it is accepted into the buffer.
///
/// Token counts are signed so that bad caller input can be rejected instead of
/// silently wrapping. Each count must lie in `0..=MAX_TOKENS_PER_EVENT`.
#[derive(Debug, Clone, Default, Validate)]
pub struct NewUsageEvent {
    #[validate(length(min = 1, max = 255), custom(function = "validate_not_blank"))]
    pub project: String,
    #[validate(length(min = 1, max = 255), custom(function = "validate_not_blank"))]
    pub request_type: String,
    #[validate(range(min = 0_i64, max = 4_294_967_295_i64))]
    pub input_tokens: i64,
    #[validate(range(min = 0_i64, max = 4_294_967_295_i64))]
    pub output_tokens: i64,
    pub metadata: Metadata,
}

impl NewUsageEvent {
    pub fn new(
        project: impl Into<String>,
        request_type: impl Into<String>,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Self {
        Self {
            project: project.into(),
            request_type: request_type.into(),
            input_tokens,
            output_tokens,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validate the input and stamp it with an id and creation time.
    pub fn into_event(self) -> Result<UsageEvent, ValidationError> {
        self.validate()?;
        Ok(UsageEvent {
            id: Uuid::new_v4(),
            project: self.project,
            request_type: self.request_type,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            metadata: self.metadata,
            timestamp: truncate_to_millis(Utc::now()),
        })
    }
}

/// A recorded unit of token consumption.
///
/// Created by the client once input validation passes; never mutated afterwards.
/// The timestamp carries millisecond precision so keyset cursors compare exactly
/// against stored values in every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub project: String,
    pub request_type: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Truncate a timestamp to millisecond precision.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}
