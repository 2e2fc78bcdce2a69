//! Hour-partitioned time-series store with TTL pruning.
//!
//! Samples are appended per series into hour partitions; partitions
//! older than the TTL are pruned on write. Reads address a time range
//! and return samples in timestamp order.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// One recorded observation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub value: f64,
}

/// Hour bucket key: hours since the Unix epoch.
type HourKey = i64;

fn hour_key(at: DateTime<Utc>) -> HourKey {
    at.timestamp() / 3600
}

pub struct MetricsStore {
    series: RwLock<HashMap<String, BTreeMap<HourKey, Vec<Sample>>>>,
    ttl: Duration,
}

impl MetricsStore {
    pub fn new(ttl_hours: i64) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            ttl: Duration::hours(ttl_hours),
        }
    }

    /// Append one sample at the current time.
    pub fn record(&self, series: &str, value: f64) {
        self.record_at(series, value, Utc::now());
    }

    /// Append one sample with an explicit timestamp.
    pub fn record_at(&self, series: &str, value: f64, at: DateTime<Utc>) {
        let mut all = self.series.write();
        let partitions = all.entry(series.to_string()).or_default();
        partitions.entry(hour_key(at)).or_default().push(Sample { at, value });

        // TTL prune: drop whole partitions older than the horizon.
        let horizon = hour_key(Utc::now() - self.ttl);
        while let Some((&oldest, _)) = partitions.first_key_value() {
            if oldest >= horizon {
                break;
            }
            partitions.pop_first();
        }
    }

    /// Samples for `series` within `[from, to)`, timestamp order.
    pub fn query(
        &self,
        series: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Sample> {
        let all = self.series.read();
        let Some(partitions) = all.get(series) else {
            return Vec::new();
        };
        let mut out: Vec<Sample> = partitions
            .range(hour_key(from)..=hour_key(to))
            .flat_map(|(_, samples)| samples.iter().copied())
            .filter(|s| s.at >= from && s.at < to)
            .collect();
        out.sort_by_key(|s| s.at);
        out
    }

    /// All series names currently held.
    pub fn series_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Most recent sample for a series, if any.
    pub fn latest(&self, series: &str) -> Option<Sample> {
        let all = self.series.read();
        all.get(series)?
            .last_key_value()?
            .1
            .last()
            .copied()
    }
}
