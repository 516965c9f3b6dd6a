//! Push channel adapter
//!
//! One shared connection carries readings, status changes and alerts for
//! every sensor on the topic. The adapter tracks the connection state,
//! demultiplexes events to the sensors currently in view and keeps a
//! side-channel of per-sensor link state and last alert.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Connecting ──> Connected ──> Disconnected ──┐
//!     │              │                        │
//!     └──────────────┴───────> Error ─────────┴──> Connecting (retry)
//! ```

mod codec;

pub use codec::*;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::sensors::{CatalogEvent, SensorId};
use crate::storage::{AppendOutcome, LinkState, Reading, ReadingStore, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Connected)
                | (Self::Connecting, Self::Error)
                | (Self::Connecting, Self::Disconnected)
                | (Self::Connected, Self::Disconnected)
                | (Self::Connected, Self::Error)
                | (Self::Disconnected, Self::Connecting)
                | (Self::Error, Self::Connecting)
        )
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

/// Failure of the push channel itself
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Could not connect: {0}")]
    Connect(heapless::String<64>),
    #[error("Connection lost: {0}")]
    Lost(heapless::String<64>),
}

/// The long-lived push connection, as seen by the core
pub trait LiveTransport {
    /// Open the connection and subscribe to `topic`
    fn connect(&mut self, topic: &str) -> impl Future<Output = Result<(), TransportError>>;

    /// Wait for the next frame; `Ok(None)` means the server closed the channel
    fn next_frame(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>>;
}

/// Decoded event from the push channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Reading {
        sensor: SensorId,
        value: Option<f64>,
        timestamp: Timestamp,
        state: Option<LinkState>,
    },
    Status {
        sensor: SensorId,
        state: LinkState,
        timestamp: Timestamp,
    },
    Alert {
        sensor: SensorId,
        value: Option<f64>,
        timestamp: Timestamp,
        message: String,
    },
    Catalog(CatalogEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub value: Option<f64>,
    pub timestamp: Timestamp,
    pub message: String,
}

/// Latest non-numeric information known about a sensor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorStatus {
    pub state: Option<LinkState>,
    pub last_alert: Option<Alert>,
    pub updated_at: Timestamp,
}

/// Counters for what the adapter did with inbound events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub stored: u32,
    pub replaced: u32,
    pub dropped: u32,
    pub status: u32,
    pub malformed: u32,
}

/// What happened to one routed event
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Stored(SensorId, AppendOutcome),
    StatusUpdated(SensorId),
    /// Sensor not in the active subscription set
    Dropped(SensorId),
    /// Catalog changes are handed back to the owner of the catalog
    Catalog(CatalogEvent),
    /// Arrived while the channel was not connected
    Ignored,
}

/// Demultiplexes the shared push channel into per-sensor state
#[derive(Debug)]
pub struct LiveChannelAdapter {
    topic: String,
    state: ConnectionState,
    subscribed: bool,
    interest: BTreeSet<SensorId>,
    status: BTreeMap<SensorId, SensorStatus>,
    stats: IngestStats,
}

impl LiveChannelAdapter {
    pub fn new(topic: String) -> Self {
        Self {
            topic,
            state: ConnectionState::Disconnected,
            subscribed: false,
            interest: BTreeSet::new(),
            status: BTreeMap::new(),
            stats: IngestStats::default(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Register interest in `sensors` on the shared connection
    ///
    /// Replaces the previous interest set; side-channel state of sensors
    /// leaving the set is forgotten.
    pub fn subscribe(&mut self, sensors: impl IntoIterator<Item = SensorId>) {
        self.interest = sensors.into_iter().collect();
        self.status.retain(|sensor, _| self.interest.contains(sensor));
        self.subscribed = true;
        info!("Subscribed to '{}' for {} sensors", self.topic, self.interest.len());
    }

    pub fn unsubscribe(&mut self) {
        self.interest.clear();
        self.status.clear();
        self.subscribed = false;
        info!("Unsubscribed from '{}'", self.topic);
    }

    pub fn is_interested(&self, sensor: SensorId) -> bool {
        self.subscribed && self.interest.contains(&sensor)
    }

    /// Drop a sensor from the interest set (catalog removal)
    pub fn forget(&mut self, sensor: SensorId) {
        self.interest.remove(&sensor);
        self.status.remove(&sensor);
    }

    pub fn status(&self, sensor: SensorId) -> Option<&SensorStatus> {
        self.status.get(&sensor)
    }

    /// Move the connection state machine; returns whether the state changed
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            warn!(
                "Ignoring connection transition {} -> {}",
                self.state.label(),
                next.label()
            );
            return false;
        }
        info!("Live channel '{}': {} -> {}", self.topic, self.state.label(), next.label());
        self.state = next;
        true
    }

    pub fn record_malformed(&mut self) {
        self.stats.malformed += 1;
    }

    /// Route one inbound event into the store or the side-channel
    pub fn route(&mut self, event: ChannelEvent, store: &mut ReadingStore) -> RouteOutcome {
        if self.state != ConnectionState::Connected {
            debug!("Event while {}: ignored", self.state.label());
            return RouteOutcome::Ignored;
        }

        match event {
            ChannelEvent::Catalog(change) => RouteOutcome::Catalog(change),
            ChannelEvent::Reading {
                sensor,
                value,
                timestamp,
                state,
            } => {
                if !self.is_interested(sensor) {
                    self.stats.dropped += 1;
                    return RouteOutcome::Dropped(sensor);
                }

                let reading = Reading {
                    timestamp,
                    value,
                    state,
                    spread: None,
                };
                if let Some(state) = state {
                    self.side_channel(sensor, timestamp).state = Some(state);
                }

                let outcome = store.append(sensor, reading);
                match outcome {
                    AppendOutcome::Inserted => self.stats.stored += 1,
                    AppendOutcome::Replaced => self.stats.replaced += 1,
                }
                debug!("Reading {:?}@{} -> {:?}", sensor, timestamp, outcome);
                RouteOutcome::Stored(sensor, outcome)
            }
            ChannelEvent::Status {
                sensor,
                state,
                timestamp,
            } => {
                if !self.is_interested(sensor) {
                    self.stats.dropped += 1;
                    return RouteOutcome::Dropped(sensor);
                }
                self.side_channel(sensor, timestamp).state = Some(state);
                self.stats.status += 1;
                RouteOutcome::StatusUpdated(sensor)
            }
            ChannelEvent::Alert {
                sensor,
                value,
                timestamp,
                message,
            } => {
                if !self.is_interested(sensor) {
                    self.stats.dropped += 1;
                    return RouteOutcome::Dropped(sensor);
                }
                warn!("Alert from sensor {:?}: {}", sensor, message);
                self.side_channel(sensor, timestamp).last_alert = Some(Alert {
                    value,
                    timestamp,
                    message,
                });
                self.stats.status += 1;
                RouteOutcome::StatusUpdated(sensor)
            }
        }
    }

    fn side_channel(&mut self, sensor: SensorId, timestamp: Timestamp) -> &mut SensorStatus {
        let status = self.status.entry(sensor).or_default();
        status.updated_at = status.updated_at.max(timestamp);
        status
    }
}
