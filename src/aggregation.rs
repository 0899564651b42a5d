//! Grouping semantics shared by every storage backend.
//!
//! Time groupings (`hour`, `day`) truncate the event timestamp to the bucket
//! boundary in UTC. Dimension groupings (`project`, `type`) group by exact
//! string equality. Backends that aggregate in SQL feed their per-group totals
//! through [`AggregateBucket::from_totals`]; backends without server-side
//! aggregation fold events through an [`Aggregator`]. Either way the buckets
//! carry the same metric names and the same ordering.

use std::{collections::BTreeMap, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AggregateBucket, UsageEvent};

pub const METRIC_COUNT_REQUESTS: &str = "count_requests";
pub const METRIC_SUM_INPUT: &str = "sum_input";
pub const METRIC_SUM_OUTPUT: &str = "sum_output";
pub const METRIC_SUM_TOTAL: &str = "sum_total";
pub const METRIC_AVG_TOTAL_PER_REQUEST: &str = "avg_total_per_request";

pub const KEY_PROJECT_NAME: &str = "project_name";
pub const KEY_REQUEST_TYPE: &str = "request_type";

const MILLIS_PER_HOUR: i64 = 3_600_000;
const MILLIS_PER_DAY: i64 = 86_400_000;

/// Dimension an aggregate query groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    Hour,
    Day,
    Project,
    #[serde(rename = "type", alias = "request_type")]
    RequestType,
}

#[derive(Debug, Error)]
#[error("Unsupported group_by '{0}' (expected hour, day, project or type)")]
pub struct ParseGroupByError(String);

impl FromStr for GroupBy {
    type Err = ParseGroupByError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(GroupBy::Hour),
            "day" => Ok(GroupBy::Day),
            "project" => Ok(GroupBy::Project),
            "type" | "request_type" => Ok(GroupBy::RequestType),
            _ => Err(ParseGroupByError(s.to_string())),
        }
    }
}

impl GroupBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupBy::Hour => "hour",
            GroupBy::Day => "day",
            GroupBy::Project => "project",
            GroupBy::RequestType => "type",
        }
    }

    /// Whether buckets carry `start`/`end` bounds.
    pub fn is_time(&self) -> bool {
        self.bucket_millis().is_some()
    }

    /// Bucket width in milliseconds for time groupings.
    pub fn bucket_millis(&self) -> Option<i64> {
        match self {
            GroupBy::Hour => Some(MILLIS_PER_HOUR),
            GroupBy::Day => Some(MILLIS_PER_DAY),
            GroupBy::Project | GroupBy::RequestType => None,
        }
    }

    /// Name of the group key for dimension groupings.
    pub fn key_name(&self) -> Option<&'static str> {
        match self {
            GroupBy::Project => Some(KEY_PROJECT_NAME),
            GroupBy::RequestType => Some(KEY_REQUEST_TYPE),
            GroupBy::Hour | GroupBy::Day => None,
        }
    }

    /// Start of the bucket containing `ts`, for time groupings.
    pub fn truncate(&self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let width = self.bucket_millis()?;
        let millis = ts.timestamp_millis();
        DateTime::from_timestamp_millis(millis.div_euclid(width) * width)
    }

    /// Bucket key an event falls into.
    pub fn key_for(&self, event: &UsageEvent) -> Option<BucketKey> {
        match self {
            GroupBy::Hour | GroupBy::Day => self.truncate(event.timestamp).map(BucketKey::Time),
            GroupBy::Project => Some(BucketKey::Dimension(event.project.clone())),
            GroupBy::RequestType => Some(BucketKey::Dimension(event.request_type.clone())),
        }
    }
}

impl std::fmt::Display for GroupBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one aggregate bucket. Ordering matches result ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum BucketKey {
    /// Bucket start for time groupings.
    Time(DateTime<Utc>),
    /// Exact `project` or `request_type` value.
    Dimension(String),
}

/// Running sums for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketTotals {
    pub count: i64,
    pub sum_input: i64,
    pub sum_output: i64,
}

impl BucketTotals {
    /// Sums saturate at `i64::MAX` instead of wrapping.
    pub fn add(&mut self, event: &UsageEvent) {
        self.count = self.count.saturating_add(1);
        self.sum_input = self.sum_input.saturating_add(event.input_tokens);
        self.sum_output = self.sum_output.saturating_add(event.output_tokens);
    }

    /// Fold in totals computed elsewhere for the same bucket.
    pub fn merge(&mut self, other: BucketTotals) {
        self.count = self.count.saturating_add(other.count);
        self.sum_input = self.sum_input.saturating_add(other.sum_input);
        self.sum_output = self.sum_output.saturating_add(other.sum_output);
    }

    pub fn sum_total(&self) -> i64 {
        self.sum_input.saturating_add(self.sum_output)
    }
}

impl AggregateBucket {
    /// Build a bucket from per-group totals.
    ///
    /// Returns `None` for a bucket without events, so callers never emit an
    /// average computed over zero requests.
    pub fn from_totals(group_by: GroupBy, key: BucketKey, totals: BucketTotals) -> Option<Self> {
        if totals.count <= 0 {
            return None;
        }

        let (start, end, group_keys) = match key {
            BucketKey::Time(start) => {
                let width = TimeDelta::milliseconds(group_by.bucket_millis().unwrap_or(0));
                (Some(start), Some(start + width), BTreeMap::new())
            }
            BucketKey::Dimension(value) => {
                let mut group_keys = BTreeMap::new();
                if let Some(name) = group_by.key_name() {
                    group_keys.insert(name.to_string(), value);
                }
                (None, None, group_keys)
            }
        };

        let count = totals.count as f64;
        let sum_total = totals.sum_total() as f64;
        let metrics = BTreeMap::from([
            (METRIC_COUNT_REQUESTS.to_string(), count),
            (METRIC_SUM_INPUT.to_string(), totals.sum_input as f64),
            (METRIC_SUM_OUTPUT.to_string(), totals.sum_output as f64),
            (METRIC_SUM_TOTAL.to_string(), sum_total),
            (METRIC_AVG_TOTAL_PER_REQUEST.to_string(), sum_total / count),
        ]);

        Some(Self {
            start,
            end,
            group_keys,
            metrics,
        })
    }
}

/// In-process aggregation over a stream of events.
///
/// Events outside `[from, to)` are ignored. Buckets come out ascending by
/// start time for time groupings and by key for dimension groupings.
#[derive(Debug)]
pub struct Aggregator {
    group_by: GroupBy,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    totals: BTreeMap<BucketKey, BucketTotals>,
}

impl Aggregator {
    pub fn new(group_by: GroupBy, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        Self {
            group_by,
            from,
            to,
            totals: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, event: &UsageEvent) {
        if self.from.is_some_and(|from| event.timestamp < from)
            || self.to.is_some_and(|to| event.timestamp >= to)
        {
            return;
        }
        if let Some(key) = self.group_by.key_for(event) {
            self.totals.entry(key).or_default().add(event);
        }
    }

    pub fn finish(self) -> Vec<AggregateBucket> {
        let group_by = self.group_by;
        self.totals
            .into_iter()
            .filter_map(|(key, totals)| AggregateBucket::from_totals(group_by, key, totals))
            .collect()
    }
}

impl<'a> Extend<&'a UsageEvent> for Aggregator {
    fn extend<I: IntoIterator<Item = &'a UsageEvent>>(&mut self, iter: I) {
        for event in iter {
            self.push(event);
        }
    }
}

/// Build ordered buckets from per-group totals computed by a backend.
///
/// Rows sharing a key are merged, so backends may return groups in any order
/// or split across several result sets.
pub fn buckets_from_totals(
    group_by: GroupBy,
    rows: impl IntoIterator<Item = (BucketKey, BucketTotals)>,
) -> Vec<AggregateBucket> {
    let mut merged: BTreeMap<BucketKey, BucketTotals> = BTreeMap::new();
    for (key, totals) in rows {
        merged.entry(key).or_default().merge(totals);
    }
    merged
        .into_iter()
        .filter_map(|(key, totals)| AggregateBucket::from_totals(group_by, key, totals))
        .collect()
}

/// Aggregate a slice of events in one call.
pub fn aggregate_events<'a>(
    events: impl IntoIterator<Item = &'a UsageEvent>,
    group_by: GroupBy,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Vec<AggregateBucket> {
    let mut aggregator = Aggregator::new(group_by, from, to);
    aggregator.extend(events);
    aggregator.finish()
}
