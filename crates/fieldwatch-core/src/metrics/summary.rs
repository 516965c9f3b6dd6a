//! Per-sensor avg/min/max/last, from a delegated summary or the local buffer

use crate::sensors::SensorId;
use crate::source::{DatedValue, DelegatedSummary};
use crate::storage::{Reading, ReadingStore, TimeRange, Timestamp};

/// Where the avg/min/max of a summary came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryOrigin {
    /// Backend-computed summary, used verbatim
    Delegated,
    /// Computed from the local reading buffer
    Local,
}

/// Display statistics of one sensor over the requested range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSummary {
    pub avg: f64,
    pub min: DatedValue,
    pub max: DatedValue,
    /// Value of the most recent reading, if that reading carried one
    pub last: Option<f64>,
    pub last_timestamp: Option<Timestamp>,
    /// Readings with a value that were folded locally
    pub samples: usize,
    pub origin: SummaryOrigin,
}

impl SensorSummary {
    /// Compute a summary from ordered readings
    ///
    /// Readings without a value are skipped. Returns `None` when no reading
    /// carries a value, so an empty buffer never turns into a zero summary.
    pub fn from_readings<'a>(readings: impl IntoIterator<Item = &'a Reading>) -> Option<Self> {
        let mut sum = 0.0;
        let mut samples = 0usize;
        let mut min: Option<DatedValue> = None;
        let mut max: Option<DatedValue> = None;
        let mut latest: Option<&Reading> = None;

        for reading in readings {
            latest = Some(reading);

            if let Some(low) = reading.low() {
                if min.is_none_or(|min| low < min.value) {
                    min = Some(DatedValue {
                        value: low,
                        timestamp: reading.timestamp,
                    });
                }
            }
            if let Some(high) = reading.high() {
                if max.is_none_or(|max| high > max.value) {
                    max = Some(DatedValue {
                        value: high,
                        timestamp: reading.timestamp,
                    });
                }
            }
            if let Some(value) = reading.value {
                sum += value;
                samples += 1;
            }
        }

        if samples == 0 {
            return None;
        }

        Some(Self {
            avg: sum / samples as f64,
            min: min?,
            max: max?,
            last: latest.and_then(|reading| reading.value),
            last_timestamp: latest.map(|reading| reading.timestamp),
            samples,
            origin: SummaryOrigin::Local,
        })
    }

    /// Take avg/min/max from a complete backend summary, last from the buffer
    pub fn from_delegated<'a>(
        delegated: &DelegatedSummary,
        readings: impl IntoIterator<Item = &'a Reading>,
    ) -> Option<Self> {
        let (Some(avg), Some(min), Some(max)) = (delegated.avg, delegated.min, delegated.max) else {
            return None;
        };

        let mut samples = 0usize;
        let mut latest: Option<&Reading> = None;
        for reading in readings {
            if reading.value.is_some() {
                samples += 1;
            }
            latest = Some(reading);
        }

        Some(Self {
            avg,
            min,
            max,
            last: latest.and_then(|reading| reading.value),
            last_timestamp: latest.map(|reading| reading.timestamp),
            samples,
            origin: SummaryOrigin::Delegated,
        })
    }
}

/// Summary of `sensor` over `range`, preferring a complete delegated summary
///
/// Falls back to computing from the store when the delegated summary is
/// missing or incomplete. `None` means "no data".
pub fn summarize(
    store: &ReadingStore,
    sensor: SensorId,
    range: Option<TimeRange>,
    delegated: Option<&DelegatedSummary>,
) -> Option<SensorSummary> {
    delegated
        .and_then(|delegated| SensorSummary::from_delegated(delegated, store.iter_in(sensor, range)))
        .or_else(|| SensorSummary::from_readings(store.iter_in(sensor, range)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AggregationBucket, Spread};

    const S1: SensorId = SensorId(1);

    fn store_with(readings: &[Reading]) -> ReadingStore {
        let mut store = ReadingStore::new();
        store.extend(S1, readings.iter().copied());
        store
    }

    #[test]
    fn test_empty_buffer_has_no_summary() {
        let store = ReadingStore::new();
        assert_eq!(summarize(&store, S1, None, None), None, "absent, not zero-filled");
    }

    #[test]
    fn test_local_summary_skips_missing_values() {
        let store = store_with(&[
            Reading::new(0, 4.0),
            Reading::missing(10),
            Reading::new(20, 10.0),
            Reading::new(30, 1.0),
        ]);

        let summary = summarize(&store, S1, None, None).unwrap();
        assert_eq!(summary.origin, SummaryOrigin::Local);
        assert_eq!(summary.avg, 5.0, "(4 + 10 + 1) / 3, the gap is not a zero");
        assert_eq!(summary.min, DatedValue { value: 1.0, timestamp: 30 });
        assert_eq!(summary.max, DatedValue { value: 10.0, timestamp: 20 });
        assert_eq!(summary.last, Some(1.0));
        assert_eq!(summary.last_timestamp, Some(30));
        assert_eq!(summary.samples, 3);
    }

    #[test]
    fn test_only_missing_values_has_no_summary() {
        let store = store_with(&[Reading::missing(0), Reading::missing(10)]);
        assert_eq!(summarize(&store, S1, None, None), None);
    }

    #[test]
    fn test_last_reading_without_value_is_reported_as_such() {
        let store = store_with(&[Reading::new(0, 4.0), Reading::missing(10)]);

        let summary = summarize(&store, S1, None, None).unwrap();
        assert_eq!(summary.last, None);
        assert_eq!(summary.last_timestamp, Some(10));
    }

    #[test]
    fn test_complete_delegated_summary_wins() {
        let store = store_with(&[Reading::new(0, 4.0), Reading::new(10, 6.0)]);
        let delegated = DelegatedSummary {
            avg: Some(42.0),
            min: Some(DatedValue { value: -1.0, timestamp: 3 }),
            max: Some(DatedValue { value: 99.0, timestamp: 7 }),
        };

        let summary = summarize(&store, S1, None, Some(&delegated)).unwrap();
        assert_eq!(summary.origin, SummaryOrigin::Delegated);
        assert_eq!(summary.avg, 42.0);
        assert_eq!(summary.max.value, 99.0);
        assert_eq!(summary.last, Some(6.0), "last always comes from the buffer");
    }

    #[test]
    fn test_delegated_summary_without_local_readings() {
        let store = ReadingStore::new();
        let delegated = DelegatedSummary {
            avg: Some(1.0),
            min: Some(DatedValue { value: 0.5, timestamp: 3 }),
            max: Some(DatedValue { value: 2.0, timestamp: 7 }),
        };

        let summary = summarize(&store, S1, None, Some(&delegated)).unwrap();
        assert_eq!(summary.last, None);
        assert_eq!(summary.samples, 0);
    }

    #[test]
    fn test_incomplete_delegated_summary_falls_back() {
        let store = store_with(&[Reading::new(0, 4.0), Reading::new(10, 6.0)]);
        let delegated = DelegatedSummary {
            avg: Some(42.0),
            min: None,
            max: Some(DatedValue { value: 99.0, timestamp: 7 }),
        };

        let summary = summarize(&store, S1, None, Some(&delegated)).unwrap();
        assert_eq!(summary.origin, SummaryOrigin::Local);
        assert_eq!(summary.avg, 5.0);
    }

    #[test]
    fn test_bucket_extremes_feed_min_max() {
        let bucket = AggregationBucket {
            sensor_id: S1,
            bucket_start: 3_600,
            avg: Some(5.0),
            min: Some(1.0),
            max: Some(9.0),
        };
        let store = store_with(&[bucket.to_reading(), Reading::new(7_200, 6.0)]);

        let summary = summarize(&store, S1, None, None).unwrap();
        assert_eq!(summary.avg, 5.5);
        assert_eq!(summary.min, DatedValue { value: 1.0, timestamp: 3_600 });
        assert_eq!(summary.max, DatedValue { value: 9.0, timestamp: 3_600 });
        assert_eq!(store.snapshot(S1)[0].spread, Some(Spread { min: 1.0, max: 9.0 }));
    }

    #[test]
    fn test_range_restricts_readings() {
        let store = store_with(&[Reading::new(0, 100.0), Reading::new(10, 2.0), Reading::new(20, 4.0)]);

        let summary = summarize(&store, S1, Some(TimeRange::new(5, 25)), None).unwrap();
        assert_eq!(summary.avg, 3.0);
        assert_eq!(summary.samples, 2);
    }
}
