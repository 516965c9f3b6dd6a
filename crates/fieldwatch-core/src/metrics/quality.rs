//! Threshold assessment of sensor values

use crate::sensors::SensorType;

/// How a value sits relative to its sensor type's ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityLevel {
    /// Inside the agronomic thresholds (or no thresholds configured)
    Normal,
    /// Physically plausible but outside the thresholds
    Warning,
    /// Outside what the hardware can report; most likely a faulty probe
    OutOfRange,
}

impl QualityLevel {
    pub fn assess(sensor_type: &SensorType, value: f64) -> Self {
        if sensor_type.nominal.is_some_and(|nominal| !nominal.contains(value)) {
            Self::OutOfRange
        } else if sensor_type.thresholds.is_some_and(|band| !band.contains(value)) {
            Self::Warning
        } else {
            Self::Normal
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
            Self::OutOfRange => "Out of range",
        }
    }
}
