pub mod retention;
pub mod store;

pub use retention::*;
pub use store::*;

use serde::{Deserialize, Serialize};

use crate::sensors::SensorId;
use crate::time::{SECONDS_PER_DAY, SECONDS_PER_HOUR, SECONDS_PER_WEEK};

/// Seconds since the Unix epoch
pub type Timestamp = u64;

/// Connection-state tag reported by a field device alongside (or instead of) a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Online,
    Offline,
    /// The gateway answered but the probe did not
    NoSignal,
    LowBattery,
}

/// Minimum and maximum retained by a bucketed reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    pub min: f64,
    pub max: f64,
}

/// A single timestamped scalar in a sensor buffer
///
/// `value` is `None` when the device sent nothing usable. That is kept apart
/// from zero all the way through: it is skipped by averages and extremes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: Timestamp,
    pub value: Option<f64>,
    pub state: Option<LinkState>,
    /// Present only when this reading stands in for an aggregation bucket
    pub spread: Option<Spread>,
}

impl Reading {
    pub const fn new(timestamp: Timestamp, value: f64) -> Self {
        Self {
            timestamp,
            value: Some(value),
            state: None,
            spread: None,
        }
    }

    /// A reading that arrived without a usable value
    pub const fn missing(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            value: None,
            state: None,
            spread: None,
        }
    }

    pub const fn with_state(mut self, state: LinkState) -> Self {
        self.state = Some(state);
        self
    }

    /// Lowest value this reading represents (bucket minimum when bucketed)
    pub fn low(&self) -> Option<f64> {
        match self.spread {
            Some(spread) => Some(spread.min),
            None => self.value,
        }
    }

    /// Highest value this reading represents (bucket maximum when bucketed)
    pub fn high(&self) -> Option<f64> {
        match self.spread {
            Some(spread) => Some(spread.max),
            None => self.value,
        }
    }
}

/// Inclusive time range requested by a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub const fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// A range of `secs` seconds ending at `end`
    pub const fn ending_at(end: Timestamp, secs: u64) -> Self {
        Self {
            start: end.saturating_sub(secs),
            end,
        }
    }

    pub const fn duration_secs(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub const fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts <= self.end
    }
}

/// Resolution of server-side pre-aggregated buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interval {
    Hour,
    Day,
    Week,
}

impl Interval {
    /// Name used by the backend's bulk aggregation endpoint
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
        }
    }

    pub const fn duration_secs(self) -> u64 {
        match self {
            Self::Hour => SECONDS_PER_HOUR,
            Self::Day => SECONDS_PER_DAY,
            Self::Week => SECONDS_PER_WEEK,
        }
    }
}

/// Server-computed summary of one sensor over one interval slice
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregationBucket {
    pub sensor_id: SensorId,
    pub bucket_start: Timestamp,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AggregationBucket {
    /// Charting stand-in for the bucket: value is the average, extremes are kept
    pub fn to_reading(&self) -> Reading {
        let spread = match (self.min, self.max) {
            (Some(min), Some(max)) => Some(Spread { min, max }),
            _ => None,
        };

        Reading {
            timestamp: self.bucket_start,
            value: self.avg,
            state: None,
            spread,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_reading_keeps_extremes() {
        let bucket = AggregationBucket {
            sensor_id: SensorId(3),
            bucket_start: 3_600,
            avg: Some(12.5),
            min: Some(4.0),
            max: Some(20.0),
        };

        let reading = bucket.to_reading();
        assert_eq!(reading.value, Some(12.5));
        assert_eq!(reading.low(), Some(4.0));
        assert_eq!(reading.high(), Some(20.0));
    }

    #[test]
    fn test_bucket_without_average_has_no_value() {
        let bucket = AggregationBucket {
            sensor_id: SensorId(3),
            bucket_start: 0,
            avg: None,
            min: None,
            max: Some(1.0),
        };

        let reading = bucket.to_reading();
        assert_eq!(reading.value, None, "missing average must not become zero");
        assert_eq!(reading.spread, None);
    }

    #[test]
    fn test_time_range_bounds() {
        let range = TimeRange::ending_at(100, 40);
        assert_eq!(range, TimeRange::new(60, 100));
        assert!(range.contains(60));
        assert!(range.contains(100));
        assert!(!range.contains(101));
        assert_eq!(TimeRange::ending_at(10, 40).start, 0);
    }
}
