//! Bootstrap fetch planning: raw readings or server-side buckets
//!
//! Raw fetch cost grows with both the number of sensors and the length of
//! the range, bucket fetch cost only with the resolution. Short ranges are
//! therefore fetched raw (one request per sensor, a bounded number in
//! flight) and long ranges as a single bulk request whose bucket size grows
//! with the range.
//!
//! | Range length           | Request                         |
//! |------------------------|---------------------------------|
//! | no range (live)        | raw, newest `live_bootstrap_limit` inside the retention horizon |
//! | up to `raw_max`        | raw, whole range                |
//! | up to `hourly_max`     | one bulk request, hourly        |
//! | up to `daily_max`      | one bulk request, daily         |
//! | longer                 | one bulk request, weekly        |

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use core::cell::Cell;

use embassy_futures::join::join_array;
use log::{debug, warn};

use crate::config::{FetchConfig, RetentionConfig};
use crate::sensors::{SensorId, SensorTypeId};
use crate::source::{BucketQuery, DelegatedSummary, FetchError, ReadingQuery, ReadingSource};
use crate::storage::{Interval, Reading, TimeRange, Timestamp};

/// Upper bound on raw fetches in flight at once
pub const MAX_CONCURRENT_FETCHES: usize = 8;

/// How a bootstrap fetch will be issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPlan {
    /// One request per sensor
    Raw(ReadingQuery),
    /// A single request covering every sensor
    Bucketed(BucketQuery),
}

/// Fetched data of one sensor
///
/// A failed fetch yields an empty, degraded series instead of failing the
/// whole batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorSeries {
    pub readings: Vec<Reading>,
    pub error: Option<FetchError>,
}

impl SensorSeries {
    pub fn loaded(readings: Vec<Reading>) -> Self {
        Self { readings, error: None }
    }

    pub fn degraded(error: FetchError) -> Self {
        Self {
            readings: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of [`AggregationResolver::resolve`]
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSeries {
    pub plan: FetchPlan,
    pub per_sensor: BTreeMap<SensorId, SensorSeries>,
}

impl ResolvedSeries {
    pub fn degraded(&self) -> impl Iterator<Item = SensorId> + '_ {
        self.per_sensor
            .iter()
            .filter(|(_, series)| series.is_degraded())
            .map(|(id, _)| *id)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AggregationResolver {
    config: FetchConfig,
    live_horizon_secs: u64,
}

impl AggregationResolver {
    pub fn new(config: FetchConfig, retention: &RetentionConfig) -> Self {
        Self {
            config,
            live_horizon_secs: retention.live_max_age_secs,
        }
    }

    /// Choose raw or bucketed fetching for `range`
    pub fn plan(&self, range: Option<TimeRange>, now: Timestamp) -> FetchPlan {
        let Some(range) = range else {
            return FetchPlan::Raw(ReadingQuery {
                limit: Some(self.config.live_bootstrap_limit),
                from: Some(now.saturating_sub(self.live_horizon_secs)),
                to: None,
            });
        };

        let length = range.duration_secs();
        if length <= self.config.raw_max_secs {
            return FetchPlan::Raw(ReadingQuery {
                limit: None,
                from: Some(range.start),
                to: Some(range.end),
            });
        }

        let interval = if length <= self.config.hourly_max_secs {
            Interval::Hour
        } else if length <= self.config.daily_max_secs {
            Interval::Day
        } else {
            Interval::Week
        };

        FetchPlan::Bucketed(BucketQuery {
            from: range.start,
            to: range.end,
            interval,
        })
    }

    /// Fetch bootstrap series for every sensor in `sensors`
    ///
    /// Never fails as a whole: per-sensor failures are recorded on the
    /// corresponding [`SensorSeries`].
    pub async fn resolve<S: ReadingSource>(
        &self,
        source: &S,
        sensors: &[SensorId],
        range: Option<TimeRange>,
        now: Timestamp,
    ) -> ResolvedSeries {
        let unique: Vec<SensorId> = sensors.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let plan = self.plan(range, now);
        debug!("Resolving {} sensors with {:?}", unique.len(), plan);

        let per_sensor = match plan {
            FetchPlan::Raw(query) => fetch_raw(source, &unique, query).await,
            FetchPlan::Bucketed(query) => fetch_bucketed(source, &unique, query).await,
        };

        ResolvedSeries { plan, per_sensor }
    }

    /// Fetch the backend summary of each sensor type over the same window
    ///
    /// Types whose summary is unavailable (or whose request failed) are left
    /// out; callers fall back to local computation for them.
    pub async fn resolve_summaries<S: ReadingSource>(
        &self,
        source: &S,
        sensor_types: &[SensorTypeId],
        range: Option<TimeRange>,
        now: Timestamp,
    ) -> BTreeMap<SensorTypeId, DelegatedSummary> {
        let window = range.unwrap_or(TimeRange::ending_at(now, self.live_horizon_secs));
        let mut summaries = BTreeMap::new();

        for sensor_type in sensor_types.iter().copied().collect::<BTreeSet<_>>() {
            match source.fetch_summary(sensor_type, window.start, window.end).await {
                Ok(Some(summary)) => {
                    summaries.insert(sensor_type, summary);
                }
                Ok(None) => {}
                Err(e) => warn!("Summary for sensor type {:?} unavailable: {}", sensor_type, e),
            }
        }

        summaries
    }
}

/// Raw fetch with at most [`MAX_CONCURRENT_FETCHES`] requests in flight
///
/// Each worker claims the next sensor index, fetches it and keeps the result
/// in its own lane; lanes are merged once every worker is done.
async fn fetch_raw<S: ReadingSource>(
    source: &S,
    sensors: &[SensorId],
    query: ReadingQuery,
) -> BTreeMap<SensorId, SensorSeries> {
    let cursor = Cell::new(0);
    let lanes = join_array(core::array::from_fn::<_, MAX_CONCURRENT_FETCHES, _>(|_| {
        fetch_lane(source, sensors, query, &cursor)
    }))
    .await;

    lanes.into_iter().flatten().collect()
}

async fn fetch_lane<S: ReadingSource>(
    source: &S,
    sensors: &[SensorId],
    query: ReadingQuery,
    cursor: &Cell<usize>,
) -> Vec<(SensorId, SensorSeries)> {
    let mut lane = Vec::new();

    loop {
        let index = cursor.get();
        let Some(&sensor) = sensors.get(index) else {
            break;
        };
        cursor.set(index + 1);

        let series = match source.fetch_readings(sensor, query).await {
            Ok(readings) => SensorSeries::loaded(readings),
            Err(e) => {
                warn!("Fetch for sensor {:?} failed, degrading to empty: {}", sensor, e);
                SensorSeries::degraded(e)
            }
        };
        lane.push((sensor, series));
    }

    lane
}

async fn fetch_bucketed<S: ReadingSource>(
    source: &S,
    sensors: &[SensorId],
    query: BucketQuery,
) -> BTreeMap<SensorId, SensorSeries> {
    match source.fetch_bulk_aggregated(sensors, query).await {
        Ok(mut buckets) => sensors
            .iter()
            .map(|sensor| {
                let mut readings: Vec<Reading> = buckets
                    .remove(sensor)
                    .unwrap_or_default()
                    .iter()
                    .map(|bucket| bucket.to_reading())
                    .collect();
                readings.sort_by_key(|reading| reading.timestamp);
                (*sensor, SensorSeries::loaded(readings))
            })
            .collect(),
        Err(e) => {
            warn!("Bulk {} fetch failed for {} sensors: {}", query.interval.as_str(), sensors.len(), e);
            sensors
                .iter()
                .map(|sensor| (*sensor, SensorSeries::degraded(e.clone())))
                .collect()
        }
    }
}
