use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::sensors::SensorId;

use super::{Reading, TimeRange, Timestamp};

/// Result of placing a reading into a sensor buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The reading extended the buffer or was slotted in at its sorted position
    Inserted,
    /// A reading with the same timestamp was already present and was overwritten
    Replaced,
}

/// Per-sensor, timestamp-ordered reading buffers
///
/// Every buffer is kept sorted by timestamp with at most one reading per
/// timestamp. Writers only go through [`ReadingStore::append`],
/// [`ReadingStore::evict`] and [`ReadingStore::cap`], and all of them take
/// `&mut self`, so a snapshot can never observe a half-placed reading.
///
/// ## Placement
///
/// Live data is append-mostly, so the common case is a push onto the back.
/// Late or re-delivered readings are located with a binary search and either
/// inserted in place or overwrite the reading with the same timestamp
/// (last write wins).
#[derive(Debug, Default)]
pub struct ReadingStore {
    buffers: BTreeMap<SensorId, VecDeque<Reading>>,
}

impl ReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a reading at its timestamp position, replacing a same-timestamp entry
    pub fn append(&mut self, sensor: SensorId, reading: Reading) -> AppendOutcome {
        let buffer = self.buffers.entry(sensor).or_default();

        let tail = buffer.back().map(|last| last.timestamp);
        if tail.is_none_or(|ts| ts < reading.timestamp) {
            buffer.push_back(reading);
            return AppendOutcome::Inserted;
        }

        match buffer.binary_search_by_key(&reading.timestamp, |r| r.timestamp) {
            Ok(index) => {
                buffer[index] = reading;
                AppendOutcome::Replaced
            }
            Err(index) => {
                buffer.insert(index, reading);
                AppendOutcome::Inserted
            }
        }
    }

    /// Append a batch of readings (bootstrap seeding), returning how many were new
    pub fn extend(&mut self, sensor: SensorId, readings: impl IntoIterator<Item = Reading>) -> usize {
        let mut inserted = 0;
        // Make sure the sensor has a (possibly empty) buffer even for an empty batch
        self.buffers.entry(sensor).or_default();
        for reading in readings {
            if self.append(sensor, reading) == AppendOutcome::Inserted {
                inserted += 1;
            }
        }
        inserted
    }

    /// Remove every reading for which `keep` returns false
    pub fn evict<F>(&mut self, sensor: SensorId, keep: F) -> usize
    where
        F: FnMut(&Reading) -> bool,
    {
        let Some(buffer) = self.buffers.get_mut(&sensor) else {
            return 0;
        };
        let before = buffer.len();
        buffer.retain(keep);
        before - buffer.len()
    }

    /// Drop the oldest readings until at most `max` remain
    pub fn cap(&mut self, sensor: SensorId, max: usize) -> usize {
        let Some(buffer) = self.buffers.get_mut(&sensor) else {
            return 0;
        };
        let excess = buffer.len().saturating_sub(max);
        buffer.drain(..excess);
        excess
    }

    /// Drop the oldest readings outside `range` until at most `max` of them
    /// remain; readings inside `range` are never touched
    pub fn cap_outside(&mut self, sensor: SensorId, range: TimeRange, max: usize) -> usize {
        let Some(buffer) = self.buffers.get_mut(&sensor) else {
            return 0;
        };
        let outside = buffer.iter().filter(|r| !range.contains(r.timestamp)).count();
        let mut excess = outside.saturating_sub(max);
        let dropped = excess;
        // `retain` visits oldest first
        buffer.retain(|reading| {
            if excess > 0 && !range.contains(reading.timestamp) {
                excess -= 1;
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Ordered copy of a sensor's buffer
    pub fn snapshot(&self, sensor: SensorId) -> Vec<Reading> {
        self.iter(sensor).copied().collect()
    }

    /// Ordered view of a sensor's buffer without copying
    pub fn iter(&self, sensor: SensorId) -> impl Iterator<Item = &Reading> {
        self.buffers.get(&sensor).into_iter().flatten()
    }

    /// Ordered readings of a sensor restricted to `range` (everything when `None`)
    pub fn iter_in(&self, sensor: SensorId, range: Option<TimeRange>) -> impl Iterator<Item = &Reading> {
        self.iter(sensor)
            .filter(move |reading| range.is_none_or(|range| range.contains(reading.timestamp)))
    }

    pub fn latest(&self, sensor: SensorId) -> Option<&Reading> {
        self.buffers.get(&sensor).and_then(|buffer| buffer.back())
    }

    pub fn latest_timestamp(&self, sensor: SensorId) -> Option<Timestamp> {
        self.latest(sensor).map(|reading| reading.timestamp)
    }

    pub fn len(&self, sensor: SensorId) -> usize {
        self.buffers.get(&sensor).map_or(0, VecDeque::len)
    }

    /// Sensors that currently own a buffer
    pub fn sensors(&self) -> impl Iterator<Item = SensorId> + '_ {
        self.buffers.keys().copied()
    }

    /// Forget a single sensor's buffer
    pub fn remove(&mut self, sensor: SensorId) -> bool {
        self.buffers.remove(&sensor).is_some()
    }

    /// Full reset, used when the active sensor set changes
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const S1: SensorId = SensorId(1);

    fn timestamps(store: &ReadingStore, sensor: SensorId) -> Vec<Timestamp> {
        store.iter(sensor).map(|r| r.timestamp).collect()
    }

    #[test]
    fn test_out_of_order_arrival_is_sorted() {
        let mut store = ReadingStore::new();
        for ts in [50, 10, 40, 20, 30, 60, 0] {
            store.append(S1, Reading::new(ts, ts as f64));
        }

        assert_eq!(timestamps(&store, S1), vec![0, 10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn test_late_live_event_lands_between_polled_readings() {
        let mut store = ReadingStore::new();
        store.extend(S1, [Reading::new(0, 5.0), Reading::new(60, 7.0), Reading::new(120, 9.0)]);

        store.append(S1, Reading::new(90, 11.0));

        let snapshot: Vec<_> = store.snapshot(S1).iter().map(|r| (r.timestamp, r.value)).collect();
        assert_eq!(
            snapshot,
            vec![(0, Some(5.0)), (60, Some(7.0)), (90, Some(11.0)), (120, Some(9.0))]
        );
    }

    #[test]
    fn test_duplicate_timestamp_replaces_value() {
        let mut store = ReadingStore::new();
        assert_eq!(store.append(S1, Reading::new(10, 1.0)), AppendOutcome::Inserted);
        assert_eq!(store.append(S1, Reading::new(20, 2.0)), AppendOutcome::Inserted);
        assert_eq!(store.append(S1, Reading::new(10, 3.0)), AppendOutcome::Replaced);
        assert_eq!(store.append(S1, Reading::new(20, 2.0)), AppendOutcome::Replaced);

        assert_eq!(store.len(S1), 2, "re-delivery must not add entries");
        assert_eq!(store.snapshot(S1)[0].value, Some(3.0), "last write wins");
    }

    #[test]
    fn test_missing_value_is_kept_distinct_from_zero() {
        let mut store = ReadingStore::new();
        store.append(S1, Reading::missing(10));
        store.append(S1, Reading::new(20, 0.0));

        let snapshot = store.snapshot(S1);
        assert_eq!(snapshot[0].value, None);
        assert_eq!(snapshot[1].value, Some(0.0));
    }

    #[test]
    fn test_evict_and_cap() {
        let mut store = ReadingStore::new();
        store.extend(S1, (0..10).map(|ts| Reading::new(ts * 10, 1.0)));

        assert_eq!(store.evict(S1, |r| r.timestamp >= 30), 3);
        assert_eq!(store.cap(S1, 4), 3);
        assert_eq!(timestamps(&store, S1), vec![60, 70, 80, 90], "oldest dropped first");
        assert_eq!(store.cap(SensorId(99), 4), 0);
    }

    #[test]
    fn test_range_filter_and_latest() {
        let mut store = ReadingStore::new();
        store.extend(S1, [Reading::new(10, 1.0), Reading::new(20, 2.0), Reading::new(30, 3.0)]);

        let in_range: Vec<_> = store
            .iter_in(S1, Some(TimeRange::new(15, 30)))
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(in_range, vec![20, 30]);
        assert_eq!(store.iter_in(S1, None).count(), 3);
        assert_eq!(store.latest_timestamp(S1), Some(30));
        assert_eq!(store.latest_timestamp(SensorId(2)), None);
    }

    #[test]
    fn test_cap_outside_spares_the_range() {
        let mut store = ReadingStore::new();
        // 0, 5 and 95 fall outside, 10..=90 inside
        store.extend(S1, (0..100).step_by(5).map(|ts| Reading::new(ts, 1.0)));
        let range = TimeRange::new(10, 90);

        assert_eq!(store.cap_outside(S1, range, 1), 2);
        let kept: Vec<_> = store.iter(S1).map(|r| r.timestamp).collect();
        assert_eq!(kept.len(), 18);
        assert_eq!(kept[0], 10, "oldest strays dropped first");
        assert_eq!(&kept[16..], &[90, 95]);
        assert_eq!(store.cap_outside(S1, range, 1), 0, "already within the cap");
        assert_eq!(store.cap_outside(SensorId(9), range, 0), 0);
    }

    #[test]
    fn test_clear_and_remove() {
        let mut store = ReadingStore::new();
        store.extend(SensorId(1), [Reading::new(1, 1.0)]);
        store.extend(SensorId(2), Vec::new());

        assert_eq!(store.sensors().count(), 2, "empty batches still register the sensor");
        assert!(store.remove(SensorId(2)));
        store.clear();
        assert_eq!(store.sensors().count(), 0);
    }
}
