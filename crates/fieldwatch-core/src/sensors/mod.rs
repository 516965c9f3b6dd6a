//! Sensor identity and static metadata

mod catalog;

pub use catalog::*;

use alloc::string::String;
use serde::{Deserialize, Serialize};

/// Backend-assigned sensor identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SensorId(pub u32);

/// Physical grouping of sensors (a field or sub-field area)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LotId(pub u32);

/// Backend identifier of a sensor type (shared by sensors measuring the same quantity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SensorTypeId(pub u32);

/// How readings for a sensor reach the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// The device gateway pushes readings over the live channel
    Push,
    /// Readings only show up when the backend is polled
    Poll,
}

/// Closed interval of values a quantity is physically expected to take
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// Measured quantity shared by many sensors (soil moisture, air temperature, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorType {
    pub id: SensorTypeId,
    pub name: String,
    pub unit: String,
    /// Range the hardware can report; values outside are treated as faults
    pub nominal: Option<ValueRange>,
    /// Agronomic comfort band; values outside deserve attention
    pub thresholds: Option<ValueRange>,
}

/// Identity and static metadata of one field sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub id: SensorId,
    pub name: String,
    pub sensor_type: SensorType,
    pub lot: LotId,
    pub sub_lot: Option<LotId>,
    pub transport: TransportKind,
    pub active: bool,
}

impl SensorDescriptor {
    /// Whether this sensor belongs to `lot` and, when given, to `sub_lot`
    pub fn in_scope(&self, lot: LotId, sub_lot: Option<LotId>) -> bool {
        self.lot == lot && sub_lot.is_none_or(|sub| self.sub_lot == Some(sub))
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::sensor;
    use super::*;

    #[test]
    fn test_scope_matches_lot_and_optional_sub_lot() {
        let probe = sensor(1, 10, Some(11));

        assert!(probe.in_scope(LotId(10), None));
        assert!(probe.in_scope(LotId(10), Some(LotId(11))));
        assert!(!probe.in_scope(LotId(10), Some(LotId(12))));
        assert!(!probe.in_scope(LotId(20), None));
    }
}
