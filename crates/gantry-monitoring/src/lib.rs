//! Gantry Monitoring - operational telemetry.
//!
//! A small in-process time-series store partitioned by hour with a
//! short TTL, percentile aggregation over fixed bucket widths, and the
//! background samplers that feed it every few seconds.

pub mod aggregate;
pub mod sampler;
pub mod store;

pub use aggregate::{Aggregation, BucketWidth};
pub use sampler::MetricsSampler;
pub use store::{MetricsStore, Sample};
