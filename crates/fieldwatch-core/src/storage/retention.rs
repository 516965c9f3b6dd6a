//! Live vs historical window handling and buffer retention

use log::debug;

use crate::config::RetentionConfig;
use crate::sensors::SensorId;

use super::{ReadingStore, TimeRange, Timestamp};

/// How the current view relates to "now"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    /// No explicit range: the view follows the newest readings
    Live,
    /// An explicit range that contains "now"
    Spanning(TimeRange),
    /// An explicit range entirely in the past (or the future)
    Historical(TimeRange),
}

impl ViewMode {
    pub fn of(range: Option<TimeRange>, now: Timestamp) -> Self {
        match range {
            None => Self::Live,
            Some(range) if range.contains(now) => Self::Spanning(range),
            Some(range) => Self::Historical(range),
        }
    }

    /// Live when no explicit range is requested or when `now` falls inside it
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Historical(_))
    }
}

/// Bounds applied to one sensor buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Drop readings older than this timestamp
    pub horizon: Option<Timestamp>,
    /// Keep at most this many readings, dropping the oldest first
    pub max_count: Option<usize>,
}

impl RetentionPolicy {
    /// Apply both bounds to a buffer, returning how many readings were evicted
    pub fn apply(&self, store: &mut ReadingStore, sensor: SensorId) -> usize {
        let evicted = self
            .horizon
            .map_or(0, |horizon| store.evict(sensor, |reading| reading.timestamp >= horizon));
        evicted + self.apply_cap(store, sensor)
    }

    /// Apply only the count bound
    pub fn apply_cap(&self, store: &mut ReadingStore, sensor: SensorId) -> usize {
        self.max_count.map_or(0, |max| store.cap(sensor, max))
    }
}

/// Decides the view mode and keeps buffers inside their retention window
///
/// ## Policies
///
/// - **Live** (no range): a periodic sweep evicts readings past the
///   retention horizon and every ingest enforces the hard count cap, so
///   memory stays bounded whatever the sampling rate.
/// - **Spanning** (a range containing now): the sweep only evicts readings
///   that slid out of the start of the range, under a looser count cap.
/// - **Historical**: readings inside the range are never evicted. Live events
///   landing outside it are kept under a soft cap, oldest dropped first.
#[derive(Debug, Clone)]
pub struct WindowManager {
    live_max_age_secs: u64,
    live_max_count: usize,
    spanning_max_count: usize,
    historical_max_count: usize,
    sweep_interval_secs: u64,
    last_sweep: Option<Timestamp>,
}

impl WindowManager {
    pub fn new(config: &RetentionConfig) -> Self {
        Self {
            live_max_age_secs: config.live_max_age_secs,
            live_max_count: config.live_max_count,
            spanning_max_count: config.spanning_max_count,
            historical_max_count: config.historical_max_count,
            sweep_interval_secs: config.sweep_interval_secs,
            last_sweep: None,
        }
    }

    /// Policy the sweep enforces at `now`; `None` when nothing is swept
    pub fn policy(&self, mode: ViewMode, now: Timestamp) -> Option<RetentionPolicy> {
        match mode {
            ViewMode::Live => Some(RetentionPolicy {
                horizon: Some(now.saturating_sub(self.live_max_age_secs)),
                max_count: Some(self.live_max_count),
            }),
            ViewMode::Spanning(range) => Some(RetentionPolicy {
                horizon: Some(range.start),
                max_count: Some(self.spanning_max_count),
            }),
            ViewMode::Historical(_) => None,
        }
    }

    /// Bound a buffer right after readings were ingested into it
    pub fn on_ingest(&self, store: &mut ReadingStore, sensor: SensorId, mode: ViewMode) -> usize {
        match mode {
            ViewMode::Live => store.cap(sensor, self.live_max_count),
            ViewMode::Spanning(_) => store.cap(sensor, self.spanning_max_count),
            ViewMode::Historical(range) => store.cap_outside(sensor, range, self.historical_max_count),
        }
    }

    pub fn sweep_due(&self, now: Timestamp) -> bool {
        self.last_sweep
            .is_none_or(|last| now.saturating_sub(last) >= self.sweep_interval_secs)
    }

    /// Evict stale readings from every buffer; a no-op for historical views
    pub fn sweep(&mut self, store: &mut ReadingStore, mode: ViewMode, now: Timestamp) -> usize {
        self.last_sweep = Some(now);
        let Some(policy) = self.policy(mode, now) else {
            return 0;
        };

        let sensors: alloc::vec::Vec<SensorId> = store.sensors().collect();
        let evicted = sensors
            .into_iter()
            .map(|sensor| policy.apply(store, sensor))
            .sum();
        if evicted > 0 {
            debug!("Retention sweep at {} evicted {} readings", now, evicted);
        }
        evicted
    }

    /// Forget when the last sweep ran (after a selection change)
    pub fn reset(&mut self) {
        self.last_sweep = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Reading;

    const S1: SensorId = SensorId(1);

    fn config() -> RetentionConfig {
        RetentionConfig {
            live_max_age_secs: 300,
            live_max_count: 50,
            spanning_max_count: 200,
            historical_max_count: 20,
            sweep_interval_secs: 30,
        }
    }

    #[test]
    fn test_mode_follows_range_and_now() {
        let spanning = TimeRange::new(900, 1_100);
        let past = TimeRange::new(100, 500);

        assert_eq!(ViewMode::of(None, 1_000), ViewMode::Live);
        assert_eq!(ViewMode::of(Some(spanning), 1_000), ViewMode::Spanning(spanning));
        assert_eq!(ViewMode::of(Some(past), 1_000), ViewMode::Historical(past));
        assert!(ViewMode::Spanning(spanning).is_live());
        assert!(!ViewMode::of(Some(TimeRange::new(2_000, 3_000)), 1_000).is_live());
    }

    #[test]
    fn test_live_sweep_enforces_horizon_and_cap() {
        let mut manager = WindowManager::new(&config());
        let mut store = ReadingStore::new();
        // One reading per second for ten minutes
        store.extend(S1, (0..600).map(|ts| Reading::new(ts, 1.0)));

        let now = 600;
        manager.sweep(&mut store, ViewMode::Live, now);

        let snapshot = store.snapshot(S1);
        assert!(snapshot.iter().all(|r| r.timestamp >= now - 300), "nothing older than the horizon");
        assert!(snapshot.len() <= 50, "count cap applies on top of the horizon");
        assert_eq!(snapshot.last().map(|r| r.timestamp), Some(599), "newest readings survive");
    }

    #[test]
    fn test_spanning_sweep_only_evicts_before_range_start() {
        let mut manager = WindowManager::new(&config());
        let mut store = ReadingStore::new();
        // One reading per minute over the last two hours
        let now = 7_200;
        store.extend(S1, (0..120).map(|minute| Reading::new(minute * 60, 1.0)));
        let mode = ViewMode::of(Some(TimeRange::new(now - 3_600, now + 600)), now);

        assert_eq!(manager.sweep(&mut store, mode, now), 60, "the hour before the range goes");
        let snapshot = store.snapshot(S1);
        assert_eq!(snapshot.len(), 60, "far beyond the live horizon, still kept");
        assert_eq!(snapshot[0].timestamp, now - 3_600);
        assert_eq!(manager.on_ingest(&mut store, S1, mode), 0, "looser cap than live");
    }

    #[test]
    fn test_historical_sweep_keeps_everything() {
        let mut manager = WindowManager::new(&config());
        let mut store = ReadingStore::new();
        store.extend(S1, (0..10).map(|ts| Reading::new(ts, 1.0)));
        let mode = ViewMode::Historical(TimeRange::new(0, 100));

        assert_eq!(manager.sweep(&mut store, mode, 1_000_000), 0);
        assert_eq!(store.len(S1), 10);
    }

    #[test]
    fn test_historical_cap_spares_the_range() {
        let manager = WindowManager::new(&config());
        let mut store = ReadingStore::new();
        let range = TimeRange::new(0, 999);
        // Far more in-range readings than the soft cap, plus stray events after the range
        store.extend(S1, (0..1_000).map(|ts| Reading::new(ts, 1.0)));
        store.extend(S1, (5_000..5_030).map(|ts| Reading::new(ts, 2.0)));

        assert_eq!(manager.on_ingest(&mut store, S1, ViewMode::Historical(range)), 10);
        assert_eq!(store.iter_in(S1, Some(range)).count(), 1_000, "the requested window stays whole");
        assert_eq!(store.len(S1), 1_020);
        assert_eq!(store.snapshot(S1)[1_000].timestamp, 5_010, "oldest strays dropped first");
    }

    #[test]
    fn test_ingest_applies_mode_cap() {
        let manager = WindowManager::new(&config());
        let mut store = ReadingStore::new();
        store.extend(S1, (0..230).map(|ts| Reading::new(ts, 1.0)));

        let spanning = ViewMode::Spanning(TimeRange::new(0, 1_000));
        assert_eq!(manager.on_ingest(&mut store, S1, spanning), 30);
        assert_eq!(manager.on_ingest(&mut store, S1, ViewMode::Live), 150);
        assert_eq!(store.snapshot(S1)[0].timestamp, 180, "cap drops the oldest first");
    }

    #[test]
    fn test_sweep_cadence() {
        let mut manager = WindowManager::new(&config());
        let mut store = ReadingStore::new();

        assert!(manager.sweep_due(0), "first sweep is always due");
        manager.sweep(&mut store, ViewMode::Live, 100);
        assert!(!manager.sweep_due(129));
        assert!(manager.sweep_due(130));
        manager.reset();
        assert!(manager.sweep_due(101));
    }
}
