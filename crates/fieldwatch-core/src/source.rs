//! Backend collaborators consumed by the telemetry core
//!
//! These traits are the only way the core talks to the farm backend. They
//! say nothing about HTTP, cookies or JSON; an implementation may be a REST
//! client, a replay file or a test double.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::sensors::{SensorDescriptor, SensorId, SensorTypeId};
use crate::storage::{AggregationBucket, Interval, Reading, Timestamp};

/// Failure of a single backend call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Transport failure: {0}")]
    Transport(heapless::String<64>),
    #[error("Backend rejected the request with status {0}")]
    Rejected(u16),
    #[error("Unknown sensor")]
    NotFound,
    #[error("Malformed response: {0}")]
    Decode(heapless::String<64>),
}

impl FetchError {
    /// Build a transport error, truncating the detail to fit
    pub fn transport(detail: &str) -> Self {
        Self::Transport(truncated(detail))
    }

    pub fn decode(detail: &str) -> Self {
        Self::Decode(truncated(detail))
    }
}

/// Copy as much of `detail` as fits into a fixed-capacity string
pub(crate) fn truncated<const N: usize>(detail: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for ch in detail.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Filters for a raw reading fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadingQuery {
    pub limit: Option<usize>,
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
}

/// Parameters of a bulk pre-aggregated fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketQuery {
    pub from: Timestamp,
    pub to: Timestamp,
    pub interval: Interval,
}

/// A value together with when it was observed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatedValue {
    pub value: f64,
    pub timestamp: Timestamp,
}

/// Summary computed by the backend for one sensor type over a range
///
/// Any part may be missing; only a summary with all three parts is used in
/// place of local computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DelegatedSummary {
    pub avg: Option<f64>,
    pub min: Option<DatedValue>,
    pub max: Option<DatedValue>,
}

impl DelegatedSummary {
    pub fn is_complete(&self) -> bool {
        self.avg.is_some() && self.min.is_some() && self.max.is_some()
    }
}

/// Historical query API of the backend
pub trait ReadingSource {
    /// Raw readings of one sensor, oldest first
    fn fetch_readings(
        &self,
        sensor: SensorId,
        query: ReadingQuery,
    ) -> impl Future<Output = Result<Vec<Reading>, FetchError>>;

    /// Pre-aggregated buckets for many sensors in a single request
    fn fetch_bulk_aggregated(
        &self,
        sensors: &[SensorId],
        query: BucketQuery,
    ) -> impl Future<Output = Result<BTreeMap<SensorId, Vec<AggregationBucket>>, FetchError>>;

    /// Authoritative summary for a sensor type; `Ok(None)` when the backend has none
    fn fetch_summary(
        &self,
        sensor_type: SensorTypeId,
        from: Timestamp,
        to: Timestamp,
    ) -> impl Future<Output = Result<Option<DelegatedSummary>, FetchError>>;
}

/// Sensor configuration API of the backend
pub trait CatalogSource {
    fn list_sensors(&self) -> impl Future<Output = Result<Vec<SensorDescriptor>, FetchError>>;
}

/// Interpret a value as delivered by a device
///
/// Gateways report numbers as text often enough that parsing is part of
/// ingestion. Anything that does not parse to a finite float is "no value".
pub fn parse_value(raw: &str) -> Option<f64> {
    f64::from_str(raw.trim()).ok().filter(|value| value.is_finite())
}
