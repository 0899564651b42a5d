use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary metrics for one group of stored events.
///
/// `start`/`end` are present only for time groupings. `group_keys` maps a
/// dimension name (`project_name`, `request_type`) to this bucket's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub group_keys: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
}

impl AggregateBucket {
    /// Look up a metric by name.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    /// Look up a group key by dimension name.
    pub fn key(&self, dimension: &str) -> Option<&str> {
        self.group_keys.get(dimension).map(String::as_str)
    }
}
