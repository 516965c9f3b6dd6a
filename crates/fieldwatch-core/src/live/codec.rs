//! Binary framing of push channel events
//!
//! Frames are `postcard`-encoded [`WireFrame`]s. Values travel as the device
//! reported them; turning them into numbers (or "no value") happens here so
//! the rest of the core only ever sees `Option<f64>`.

use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::sensors::{CatalogEvent, SensorDescriptor, SensorId};
use crate::source::{parse_value, truncated};
use crate::storage::{LinkState, Timestamp};

use super::ChannelEvent;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Malformed(heapless::String<64>),
    #[error("Could not encode frame: {0}")]
    Encode(heapless::String<64>),
}

/// A value exactly as sent by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Number(f64),
    Text(String),
    Null,
}

impl WireValue {
    /// The numeric value, or `None` when nothing usable was sent
    pub fn resolve(&self) -> Option<f64> {
        match self {
            Self::Number(value) if value.is_finite() => Some(*value),
            Self::Number(_) | Self::Null => None,
            Self::Text(text) => parse_value(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireFrame {
    Reading {
        sensor_id: SensorId,
        value: WireValue,
        timestamp: Timestamp,
        state: Option<LinkState>,
    },
    Status {
        sensor_id: SensorId,
        state: LinkState,
        timestamp: Timestamp,
    },
    Alert {
        sensor_id: SensorId,
        value: WireValue,
        timestamp: Timestamp,
        message: String,
    },
    SensorUpdated(SensorDescriptor),
    SensorRemoved(SensorId),
}

impl From<WireFrame> for ChannelEvent {
    fn from(frame: WireFrame) -> Self {
        match frame {
            WireFrame::Reading {
                sensor_id,
                value,
                timestamp,
                state,
            } => ChannelEvent::Reading {
                sensor: sensor_id,
                value: value.resolve(),
                timestamp,
                state,
            },
            WireFrame::Status {
                sensor_id,
                state,
                timestamp,
            } => ChannelEvent::Status {
                sensor: sensor_id,
                state,
                timestamp,
            },
            WireFrame::Alert {
                sensor_id,
                value,
                timestamp,
                message,
            } => ChannelEvent::Alert {
                sensor: sensor_id,
                value: value.resolve(),
                timestamp,
                message,
            },
            WireFrame::SensorUpdated(descriptor) => {
                ChannelEvent::Catalog(CatalogEvent::SensorUpdated(descriptor))
            }
            WireFrame::SensorRemoved(id) => ChannelEvent::Catalog(CatalogEvent::SensorRemoved(id)),
        }
    }
}

pub fn encode_frame(frame: &WireFrame) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(frame).map_err(|e| CodecError::Encode(truncated(&alloc::format!("{e}"))))
}

pub fn decode_frame(bytes: &[u8]) -> Result<ChannelEvent, CodecError> {
    postcard::from_bytes::<WireFrame>(bytes)
        .map(ChannelEvent::from)
        .map_err(|e| CodecError::Malformed(truncated(&alloc::format!("{e}"))))
}
