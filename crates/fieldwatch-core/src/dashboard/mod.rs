//! Consumer-facing view over the telemetry pipeline
//!
//! A [`Dashboard`] owns one reading store per active selection together with
//! the catalog, retention, resolver and live adapter that feed it. Every
//! mutation is synchronous; the only awaits (bootstrap fetch, poll refresh,
//! reconnect backoff) live in [`tasks`] and never hold the dashboard while
//! waiting on the backend.
//!
//! ## Epochs
//!
//! Each call to [`Dashboard::select`] bumps the [`Epoch`]. Fetch requests
//! carry the epoch they were issued under and their results are rejected
//! when the selection moved on in the meantime, so data for a view the user
//! already left never lands in the new one.
//!
//! ## Change notifications
//!
//! Consumers subscribe to a [`DashboardChannel`] and re-read whatever they
//! display when a [`DashboardEvent`] arrives. The dashboard publishes with
//! an immediate publisher: a slow consumer loses the oldest notifications
//! instead of stalling ingestion.

pub mod tasks;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pubsub::{ImmediatePublisher, PubSubChannel};
use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::config::PipelineConfig;
use crate::live::{
    decode_frame, ChannelEvent, CodecError, ConnectionState, IngestStats, LiveChannelAdapter, RouteOutcome,
    SensorStatus,
};
use crate::metrics::{aggregate_lot, summarize, LotMetrics, QualityLevel, SensorSummary};
use crate::resolver::{AggregationResolver, ResolvedSeries};
use crate::sensors::{
    CatalogChange, CatalogEvent, LotId, SensorCatalog, SensorDescriptor, SensorId, SensorTypeId, TransportKind,
};
use crate::source::{DelegatedSummary, FetchError, ReadingQuery, ReadingSource};
use crate::storage::{Reading, ReadingStore, TimeRange, Timestamp, ViewMode, WindowManager};
use crate::time::Clock;

pub const EVENT_CHANNEL_CAPACITY: usize = 32;
pub const EVENT_SUBSCRIBERS: usize = 4;
pub const EVENT_PUBLISHERS: usize = 1;

/// "Data changed" notifications for rendering layers
#[derive(Debug, Clone, PartialEq)]
pub enum DashboardEvent {
    /// A new selection was made; everything displayed is stale
    SelectionChanged { epoch: Epoch },
    /// Bootstrap data for `epoch` was merged; `degraded` sensors failed to load
    BootstrapApplied { epoch: Epoch, degraded: usize },
    SeriesChanged(SensorId),
    StatusChanged(SensorId),
    ConnectionChanged(ConnectionState),
    CatalogChanged,
    /// The retention sweep dropped readings
    Evicted { readings: usize },
}

pub type DashboardChannel = PubSubChannel<
    CriticalSectionRawMutex,
    DashboardEvent,
    EVENT_CHANNEL_CAPACITY,
    EVENT_SUBSCRIBERS,
    EVENT_PUBLISHERS,
>;

pub type DashboardPublisher<'a> = ImmediatePublisher<
    'a,
    CriticalSectionRawMutex,
    DashboardEvent,
    EVENT_CHANNEL_CAPACITY,
    EVENT_SUBSCRIBERS,
    EVENT_PUBLISHERS,
>;

/// Generation counter of the active selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Epoch(pub u64);

impl Epoch {
    const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DashboardError {
    #[error("Unknown sensor {0:?}")]
    UnknownSensor(SensorId),
    #[error("Range ends before it starts")]
    InvalidRange,
    #[error("Result for epoch {stale:?} arrived after the selection moved to {current:?}")]
    StaleEpoch { stale: Epoch, current: Epoch },
}

/// Sensors in view and the requested time range (`None` follows "now")
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub sensors: Vec<SensorId>,
    pub range: Option<TimeRange>,
}

/// Everything needed to fetch bootstrap data without holding the dashboard
#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub epoch: Epoch,
    pub sensors: Vec<SensorId>,
    /// Types whose backend summary should be fetched; empty for live views
    pub sensor_types: Vec<SensorTypeId>,
    pub range: Option<TimeRange>,
    pub now: Timestamp,
    resolver: AggregationResolver,
}

impl BootstrapRequest {
    pub async fn fetch<S: ReadingSource>(&self, source: &S) -> Bootstrap {
        let series = self.resolver.resolve(source, &self.sensors, self.range, self.now).await;
        let summaries = if self.sensor_types.is_empty() {
            BTreeMap::new()
        } else {
            self.resolver
                .resolve_summaries(source, &self.sensor_types, self.range, self.now)
                .await
        };

        Bootstrap {
            epoch: self.epoch,
            series,
            summaries,
        }
    }
}

/// Bootstrap fetch result, tagged with the epoch it was requested under
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub epoch: Epoch,
    pub series: ResolvedSeries,
    pub summaries: BTreeMap<SensorTypeId, DelegatedSummary>,
}

/// Catch-up fetch for poll-only sensors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub epoch: Epoch,
    pub queries: Vec<(SensorId, ReadingQuery)>,
}

impl PollRequest {
    pub async fn fetch<S: ReadingSource>(&self, source: &S) -> PollResult {
        let mut per_sensor = Vec::with_capacity(self.queries.len());
        for &(sensor, query) in &self.queries {
            per_sensor.push((sensor, source.fetch_readings(sensor, query).await));
        }
        PollResult {
            epoch: self.epoch,
            per_sensor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollResult {
    pub epoch: Epoch,
    pub per_sensor: Vec<(SensorId, Result<Vec<Reading>, FetchError>)>,
}

/// One dashboard view: selection, buffered readings and derived values
pub struct Dashboard<'a, C> {
    config: PipelineConfig,
    clock: C,
    catalog: SensorCatalog,
    store: ReadingStore,
    window: WindowManager,
    resolver: AggregationResolver,
    live: LiveChannelAdapter,
    selection: Selection,
    epoch: Epoch,
    /// Epoch whose bootstrap has been merged, if any
    applied: Option<Epoch>,
    delegated: BTreeMap<SensorTypeId, DelegatedSummary>,
    degraded: BTreeSet<SensorId>,
    events: DashboardPublisher<'a>,
}

impl<'a, C: Clock> Dashboard<'a, C> {
    pub fn new(config: PipelineConfig, clock: C, catalog: SensorCatalog, events: DashboardPublisher<'a>) -> Self {
        Self {
            window: WindowManager::new(&config.retention),
            resolver: AggregationResolver::new(config.fetch, &config.retention),
            live: LiveChannelAdapter::new(config.topic.clone()),
            config,
            clock,
            catalog,
            store: ReadingStore::new(),
            selection: Selection::default(),
            epoch: Epoch::default(),
            applied: None,
            delegated: BTreeMap::new(),
            degraded: BTreeSet::new(),
            events,
        }
    }

    /// Switch the view to `sensors` over `range`, discarding all buffered state
    ///
    /// Returns the new epoch; fetches issued under any earlier epoch will be
    /// rejected when they complete.
    pub fn select(
        &mut self,
        sensors: impl IntoIterator<Item = SensorId>,
        range: Option<TimeRange>,
    ) -> Result<Epoch, DashboardError> {
        let sensors: Vec<SensorId> = sensors.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        if let Some(&unknown) = sensors.iter().find(|id| !self.catalog.contains(**id)) {
            return Err(DashboardError::UnknownSensor(unknown));
        }
        if range.is_some_and(|range| range.start > range.end) {
            return Err(DashboardError::InvalidRange);
        }

        self.epoch = self.epoch.next();
        self.applied = None;
        self.store.clear();
        self.window.reset();
        self.delegated.clear();
        self.degraded.clear();
        self.live.subscribe(sensors.iter().copied());
        self.selection = Selection { sensors, range };

        info!(
            "Selection {:?}: {} sensors, {}",
            self.epoch,
            self.selection.sensors.len(),
            if self.is_live() { "live" } else { "historical" }
        );
        self.publish(DashboardEvent::SelectionChanged { epoch: self.epoch });
        Ok(self.epoch)
    }

    pub fn bootstrap_request(&self) -> BootstrapRequest {
        let sensor_types = if self.is_live() {
            Vec::new()
        } else {
            self.selection
                .sensors
                .iter()
                .filter_map(|id| self.catalog.get(*id))
                .map(|descriptor| descriptor.sensor_type.id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };

        BootstrapRequest {
            epoch: self.epoch,
            sensors: self.selection.sensors.clone(),
            sensor_types,
            range: self.selection.range,
            now: self.clock.now(),
            resolver: self.resolver,
        }
    }

    /// Seed the store with bootstrap data; returns how many readings were new
    pub fn apply_bootstrap(&mut self, bootstrap: Bootstrap) -> Result<usize, DashboardError> {
        self.check_epoch(bootstrap.epoch)?;

        let mode = self.mode();
        let mut seeded = 0;
        for (sensor, series) in bootstrap.series.per_sensor {
            if series.is_degraded() {
                self.degraded.insert(sensor);
            } else {
                self.degraded.remove(&sensor);
            }
            seeded += self.store.extend(sensor, series.readings);
            self.window.on_ingest(&mut self.store, sensor, mode);
        }
        self.delegated = bootstrap.summaries;
        self.applied = Some(self.epoch);

        info!(
            "Bootstrap {:?} seeded {} readings ({} sensors degraded)",
            self.epoch,
            seeded,
            self.degraded.len()
        );
        self.publish(DashboardEvent::BootstrapApplied {
            epoch: self.epoch,
            degraded: self.degraded.len(),
        });
        Ok(seeded)
    }

    /// Route one push channel event into the view
    pub fn ingest(&mut self, event: ChannelEvent) -> RouteOutcome {
        let outcome = self.live.route(event, &mut self.store);
        match &outcome {
            RouteOutcome::Stored(sensor, _) => {
                let mode = self.mode();
                self.window.on_ingest(&mut self.store, *sensor, mode);
                self.publish(DashboardEvent::SeriesChanged(*sensor));
            }
            RouteOutcome::StatusUpdated(sensor) => self.publish(DashboardEvent::StatusChanged(*sensor)),
            RouteOutcome::Catalog(change) => {
                self.apply_catalog_event(change.clone());
            }
            RouteOutcome::Dropped(_) | RouteOutcome::Ignored => {}
        }
        outcome
    }

    /// Decode and route a raw frame; malformed frames are counted and skipped
    pub fn ingest_frame(&mut self, bytes: &[u8]) -> Result<RouteOutcome, CodecError> {
        match decode_frame(bytes) {
            Ok(event) => Ok(self.ingest(event)),
            Err(e) => {
                warn!("Skipping frame of {} bytes: {}", bytes.len(), e);
                self.live.record_malformed();
                Err(e)
            }
        }
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) -> bool {
        let changed = self.live.transition(state);
        if changed {
            self.publish(DashboardEvent::ConnectionChanged(state));
        }
        changed
    }

    /// Absorb a catalog change; removed sensors release their buffers
    pub fn apply_catalog_event(&mut self, event: CatalogEvent) -> CatalogChange {
        let removed = match &event {
            CatalogEvent::SensorRemoved(id) => Some(*id),
            CatalogEvent::SensorUpdated(_) => None,
        };

        let change = self.catalog.apply(event);
        match change {
            CatalogChange::Unchanged => return change,
            CatalogChange::Removed => {
                if let Some(id) = removed {
                    self.release(id);
                }
            }
            CatalogChange::Added | CatalogChange::Replaced | CatalogChange::Regrouped => {}
        }
        self.publish(DashboardEvent::CatalogChanged);
        change
    }

    /// Replace the catalog with a full listing; returns the sensors that disappeared
    pub fn refresh_catalog(&mut self, descriptors: impl IntoIterator<Item = SensorDescriptor>) -> Vec<SensorId> {
        let gone = self.catalog.refresh(descriptors);
        for &id in &gone {
            self.release(id);
        }
        self.publish(DashboardEvent::CatalogChanged);
        gone
    }

    /// Run the retention sweep when due; returns how many readings were evicted
    pub fn tick(&mut self) -> usize {
        let now = self.clock.now();
        if !self.window.sweep_due(now) {
            return 0;
        }

        let mode = self.mode();
        let evicted = self.window.sweep(&mut self.store, mode, now);
        if evicted > 0 {
            self.publish(DashboardEvent::Evicted { readings: evicted });
        }
        evicted
    }

    /// Catch-up queries for poll-only sensors in view; `None` outside live mode
    pub fn poll_request(&self) -> Option<PollRequest> {
        let now = self.clock.now();
        let horizon = self.window.policy(self.mode(), now)?.horizon?;
        let queries: Vec<_> = self
            .selection
            .sensors
            .iter()
            .filter(|id| {
                self.catalog
                    .get(**id)
                    .is_some_and(|sensor| sensor.active && sensor.transport == TransportKind::Poll)
            })
            .map(|&id| {
                // Re-fetching the newest known reading is harmless, the store dedups it
                let from = self.store.latest_timestamp(id).unwrap_or(horizon);
                let query = ReadingQuery {
                    limit: Some(self.config.fetch.live_bootstrap_limit),
                    from: Some(from),
                    to: None,
                };
                (id, query)
            })
            .collect();

        (!queries.is_empty()).then_some(PollRequest {
            epoch: self.epoch,
            queries,
        })
    }

    /// Merge polled readings; returns how many were new
    pub fn apply_poll(&mut self, polled: PollResult) -> Result<usize, DashboardError> {
        self.check_epoch(polled.epoch)?;

        let mode = self.mode();
        let mut inserted = 0;
        for (sensor, result) in polled.per_sensor {
            match result {
                Ok(readings) => {
                    let fresh = self.store.extend(sensor, readings);
                    self.window.on_ingest(&mut self.store, sensor, mode);
                    if fresh > 0 {
                        inserted += fresh;
                        self.publish(DashboardEvent::SeriesChanged(sensor));
                    }
                }
                Err(e) => warn!("Poll of sensor {:?} failed: {}", sensor, e),
            }
        }
        Ok(inserted)
    }

    /// Ordered readings of `sensor` inside the selected range
    pub fn series(&self, sensor: SensorId) -> Vec<Reading> {
        self.store.iter_in(sensor, self.selection.range).copied().collect()
    }

    pub fn summary(&self, sensor: SensorId) -> Option<SensorSummary> {
        let delegated = self
            .catalog
            .get(sensor)
            .and_then(|descriptor| self.delegated.get(&descriptor.sensor_type.id));
        summarize(&self.store, sensor, self.selection.range, delegated)
    }

    pub fn lot_metrics(&self, lot: LotId, sub_lot: Option<LotId>) -> Option<LotMetrics> {
        aggregate_lot(&self.catalog, &self.store, lot, sub_lot, self.selection.range)
    }

    /// Threshold assessment of the most recent value of `sensor`
    pub fn quality(&self, sensor: SensorId) -> Option<QualityLevel> {
        let descriptor = self.catalog.get(sensor)?;
        let value = self.store.latest(sensor)?.value?;
        Some(QualityLevel::assess(&descriptor.sensor_type, value))
    }

    pub fn mode(&self) -> ViewMode {
        ViewMode::of(self.selection.range, self.clock.now())
    }

    pub fn is_live(&self) -> bool {
        self.mode().is_live()
    }

    /// Whether the bootstrap of the current selection is still outstanding
    pub fn is_loading(&self) -> bool {
        self.applied != Some(self.epoch)
    }

    pub fn is_degraded(&self, sensor: SensorId) -> bool {
        self.degraded.contains(&sensor)
    }

    pub fn status(&self, sensor: SensorId) -> Option<&SensorStatus> {
        self.live.status(sensor)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.live.state()
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.live.stats()
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn catalog(&self) -> &SensorCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn check_epoch(&self, epoch: Epoch) -> Result<(), DashboardError> {
        if epoch == self.epoch {
            return Ok(());
        }
        info!("Discarding result for {:?}, selection is at {:?}", epoch, self.epoch);
        Err(DashboardError::StaleEpoch {
            stale: epoch,
            current: self.epoch,
        })
    }

    fn release(&mut self, sensor: SensorId) {
        self.store.remove(sensor);
        self.live.forget(sensor);
        self.degraded.remove(&sensor);
        self.selection.sensors.retain(|id| *id != sensor);
        debug!("Released sensor {:?}", sensor);
    }

    fn publish(&self, event: DashboardEvent) {
        self.events.publish_immediate(event);
    }
}
