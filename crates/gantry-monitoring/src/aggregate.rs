//! Aggregation over fixed-width time buckets.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Sample;

/// Supported bucket widths for aggregation queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketWidth {
    #[serde(rename = "5s")]
    FiveSeconds,
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

impl BucketWidth {
    pub fn seconds(self) -> i64 {
        match self {
            BucketWidth::FiveSeconds => 5,
            BucketWidth::OneMinute => 60,
            BucketWidth::FiveMinutes => 300,
            BucketWidth::OneHour => 3600,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "5s" => Some(BucketWidth::FiveSeconds),
            "1m" => Some(BucketWidth::OneMinute),
            "5m" => Some(BucketWidth::FiveMinutes),
            "1h" => Some(BucketWidth::OneHour),
            _ => None,
        }
    }
}

/// Aggregated statistics for one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct Aggregation {
    pub bucket_start: DateTime<Utc>,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Group samples into `width` buckets and aggregate each.
///
/// Percentiles use the nearest-rank method; buckets with no samples
/// are omitted rather than zero-filled.
pub fn aggregate(samples: &[Sample], width: BucketWidth) -> Vec<Aggregation> {
    let secs = width.seconds();
    let mut buckets: std::collections::BTreeMap<i64, Vec<f64>> = std::collections::BTreeMap::new();
    for sample in samples {
        let key = sample.at.timestamp().div_euclid(secs);
        buckets.entry(key).or_default().push(sample.value);
    }

    buckets
        .into_iter()
        .map(|(key, mut values)| {
            values.sort_by(|a, b| a.total_cmp(b));
            let count = values.len();
            let sum: f64 = values.iter().sum();
            Aggregation {
                bucket_start: Utc
                    .timestamp_opt(key * secs, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                count,
                min: values[0],
                max: values[count - 1],
                avg: sum / count as f64,
                p95: nearest_rank(&values, 0.95),
                p99: nearest_rank(&values, 0.99),
            }
        })
        .collect()
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn nearest_rank(sorted: &[f64], quantile: f64) -> f64 {
    let rank = ((quantile * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}
