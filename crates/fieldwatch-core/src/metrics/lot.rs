//! Flat fold of every member reading into lot-level metrics

use crate::sensors::{LotId, SensorCatalog};
use crate::storage::{ReadingStore, TimeRange};

/// Group-level statistics over every reading of every sensor in a lot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LotMetrics {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    /// Readings folded into the metrics
    pub count: usize,
    /// Member sensors that contributed at least one reading
    pub sensors: usize,
}

/// Fold the readings of all active members of `lot` (optionally one sub-lot)
///
/// This is a flat fold: every reading weighs the same, so a sensor sampling
/// twice as often contributes twice as much to the average. It is not an
/// average of per-sensor averages. Returns `None` when no member has a
/// reading with a value inside `range`.
pub fn aggregate_lot(
    catalog: &SensorCatalog,
    store: &ReadingStore,
    lot: LotId,
    sub_lot: Option<LotId>,
    range: Option<TimeRange>,
) -> Option<LotMetrics> {
    let mut sum = 0.0;
    let mut count = 0usize;
    let mut sensors = 0usize;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;

    for member in catalog.members(lot, sub_lot) {
        let before = count;
        for reading in store.iter_in(member.id, range) {
            let Some(value) = reading.value else {
                continue;
            };
            sum += value;
            count += 1;
            min = min.min(reading.low().unwrap_or(value));
            max = max.max(reading.high().unwrap_or(value));
        }
        if count > before {
            sensors += 1;
        }
    }

    if count == 0 {
        return None;
    }

    Some(LotMetrics {
        avg: sum / count as f64,
        min,
        max,
        count,
        sensors,
    })
}
