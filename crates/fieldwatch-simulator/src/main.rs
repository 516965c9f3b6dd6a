//! Desktop simulator for the fieldwatch live telemetry core.
//!
//! Drives `fieldwatch-core` with a synthetic farm: two lots with sub-lots,
//! push and poll-only probes, a fake backend that serves raw readings,
//! buckets and summaries, and a fake push gateway that misbehaves the way
//! real ones do (late deliveries, duplicates, unparseable values, periodic
//! disconnects). Summaries and lot metrics are logged while it runs, then a
//! historical view is loaded and reported once before exiting.
//!
//! # Environment
//!
//! Read after loading an optional `.env` file.
//!
//! | Variable                    | Default | Meaning                                  |
//! |-----------------------------|---------|------------------------------------------|
//! | `RUST_LOG`                  | unset   | `env_logger` filter                      |
//! | `FIELDWATCH_TOPIC`          | `iot`   | Push channel topic                       |
//! | `FIELDWATCH_RUN_SECS`       | 60      | How long the live phase runs             |
//! | `FIELDWATCH_REPORT_SECS`    | 5       | Interval between live reports            |
//! | `FIELDWATCH_SWEEP_SECS`     | 10      | Retention sweep interval                 |
//! | `FIELDWATCH_POLL_SECS`      | 15      | Poll-only sensor refresh interval        |
//! | `FIELDWATCH_MAX_RECONNECTS` | unset   | Give up after this many failed attempts  |
//! | `FIELDWATCH_HISTORY_DAYS`   | 10      | Length of the final historical view      |

use std::cell::Cell;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use embassy_futures::join::join;
use embassy_futures::select::{Either, select, select4};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pubsub::{PubSubChannel, Subscriber};
use embassy_sync::signal::Signal;
use embassy_time::{Delay, Duration, Ticker, Timer};
use log::{debug, error, info, warn};

use fieldwatch_core::config::PipelineConfig;
use fieldwatch_core::dashboard::tasks::{
    SharedDashboard, bootstrap, refresh_catalog, run_live, run_poller, run_sweeper,
};
use fieldwatch_core::dashboard::{
    Dashboard, DashboardChannel, DashboardEvent, EVENT_CHANNEL_CAPACITY, EVENT_PUBLISHERS,
    EVENT_SUBSCRIBERS,
};
use fieldwatch_core::live::{LiveTransport, TransportError, WireFrame, WireValue, encode_frame};
use fieldwatch_core::sensors::{
    LotId, SensorCatalog, SensorDescriptor, SensorId, SensorType, SensorTypeId, TransportKind,
    ValueRange,
};
use fieldwatch_core::source::{
    BucketQuery, CatalogSource, DatedValue, DelegatedSummary, FetchError, ReadingQuery,
    ReadingSource,
};
use fieldwatch_core::storage::{AggregationBucket, LinkState, Reading, TimeRange, Timestamp};
use fieldwatch_core::time::{Clock, SECONDS_PER_DAY, SECONDS_PER_HOUR};

// ---------------------------------------------------------------------------
// Farm layout
// ---------------------------------------------------------------------------

const LOT_NORTH: LotId = LotId(1);
const SUB_NORTH_A: LotId = LotId(11);
const SUB_NORTH_B: LotId = LotId(12);
const LOT_SOUTH: LotId = LotId(2);

const SOIL_MOISTURE: SensorTypeId = SensorTypeId(1);
const AIR_TEMPERATURE: SensorTypeId = SensorTypeId(2);

/// Sensor the gateway reports on although no dashboard knows it
const STRAY_SENSOR: SensorId = SensorId(99);

/// Spacing of synthetic raw readings served by the backend.
const SAMPLE_SPACING_SECS: u64 = 60;

/// Simulated backend round trip.
const FETCH_LATENCY_MS: u64 = 40;

/// Interval between frames on the synthetic push channel.
const FRAME_INTERVAL_MS: u64 = 250;

/// Frames after which the gateway drops the connection.
const FRAMES_PER_SESSION: u32 = 80;

static EVENTS: DashboardChannel = PubSubChannel::new();
static STOP: Signal<CriticalSectionRawMutex, ()> = Signal::new();

type EventSubscriber = Subscriber<
    'static,
    CriticalSectionRawMutex,
    DashboardEvent,
    EVENT_CHANNEL_CAPACITY,
    EVENT_SUBSCRIBERS,
    EVENT_PUBLISHERS,
>;

fn soil_moisture() -> SensorType {
    SensorType {
        id: SOIL_MOISTURE,
        name: "Soil moisture".into(),
        unit: "%".into(),
        nominal: Some(ValueRange::new(0.0, 100.0)),
        thresholds: Some(ValueRange::new(25.0, 55.0)),
    }
}

fn air_temperature() -> SensorType {
    SensorType {
        id: AIR_TEMPERATURE,
        name: "Air temperature".into(),
        unit: "°C".into(),
        nominal: Some(ValueRange::new(-40.0, 85.0)),
        thresholds: Some(ValueRange::new(5.0, 24.0)),
    }
}

fn probe(
    id: u32,
    name: &str,
    sensor_type: SensorType,
    lot: LotId,
    sub_lot: Option<LotId>,
    transport: TransportKind,
) -> SensorDescriptor {
    SensorDescriptor {
        id: SensorId(id),
        name: name.into(),
        sensor_type,
        lot,
        sub_lot,
        transport,
        active: true,
    }
}

fn build_catalog() -> Vec<SensorDescriptor> {
    use TransportKind::{Poll, Push};

    let mut spare = probe(7, "north-spare", soil_moisture(), LOT_NORTH, None, Push);
    spare.active = false;

    vec![
        probe(1, "north-a-moisture", soil_moisture(), LOT_NORTH, Some(SUB_NORTH_A), Push),
        probe(2, "north-a-air", air_temperature(), LOT_NORTH, Some(SUB_NORTH_A), Push),
        probe(3, "north-b-moisture", soil_moisture(), LOT_NORTH, Some(SUB_NORTH_B), Push),
        probe(4, "south-moisture", soil_moisture(), LOT_SOUTH, None, Push),
        probe(5, "south-air", air_temperature(), LOT_SOUTH, None, Push),
        probe(6, "south-well-moisture", soil_moisture(), LOT_SOUTH, None, Poll),
        spare,
    ]
}

/// Deterministic value of a sensor at a point in time.
fn synthetic_value(sensor_type: SensorTypeId, sensor: SensorId, ts: Timestamp) -> f64 {
    let t = ts as f64;
    let phase = f64::from(sensor.0);

    if sensor_type == SOIL_MOISTURE {
        // 20–60 % with a slow irrigation cycle
        40.0 + 18.0 * (t / 5_400.0 + phase).sin() + 2.0 * (t / 700.0).cos()
    } else {
        // Day/night swing around 19 °C
        19.0 + 7.0 * (t / 13_751.0 + phase).sin() + 0.8 * (t / 900.0).cos()
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

// ---------------------------------------------------------------------------
// Synthetic backend
// ---------------------------------------------------------------------------

/// Serves history computed from [`synthetic_value`].
///
/// The first raw fetch for `flaky` fails so the degraded path gets
/// exercised.
struct MockBackend {
    sensors: Vec<SensorDescriptor>,
    flaky: SensorId,
    flaky_calls: Cell<u32>,
}

impl MockBackend {
    fn new(sensors: Vec<SensorDescriptor>, flaky: SensorId) -> Self {
        Self {
            sensors,
            flaky,
            flaky_calls: Cell::new(0),
        }
    }

    fn type_of(&self, sensor: SensorId) -> Option<SensorTypeId> {
        self.sensors
            .iter()
            .find(|descriptor| descriptor.id == sensor)
            .map(|descriptor| descriptor.sensor_type.id)
    }

    fn bucket(
        sensor_type: SensorTypeId,
        sensor: SensorId,
        start: Timestamp,
        width: u64,
    ) -> AggregationBucket {
        let samples: Vec<f64> = (0..12)
            .map(|i| synthetic_value(sensor_type, sensor, start + i * width / 12))
            .collect();
        let avg = samples.iter().sum::<f64>() / samples.len() as f64;

        AggregationBucket {
            sensor_id: sensor,
            bucket_start: start,
            avg: Some(avg),
            min: samples.iter().copied().reduce(f64::min),
            max: samples.iter().copied().reduce(f64::max),
        }
    }
}

impl ReadingSource for MockBackend {
    async fn fetch_readings(
        &self,
        sensor: SensorId,
        query: ReadingQuery,
    ) -> Result<Vec<Reading>, FetchError> {
        Timer::after_millis(FETCH_LATENCY_MS).await;

        let sensor_type = self.type_of(sensor).ok_or(FetchError::NotFound)?;
        if sensor == self.flaky {
            let calls = self.flaky_calls.get();
            self.flaky_calls.set(calls + 1);
            if calls == 0 {
                return Err(FetchError::transport("upstream timeout"));
            }
        }

        let to = query.to.unwrap_or_else(|| SystemClock.now());
        let from = query.from.unwrap_or(to.saturating_sub(SECONDS_PER_DAY));
        let first = from.div_ceil(SAMPLE_SPACING_SECS) * SAMPLE_SPACING_SECS;

        let mut readings: Vec<Reading> = (first..=to)
            .step_by(SAMPLE_SPACING_SECS as usize)
            .map(|ts| {
                // Every so often the probe reported nothing usable
                if (ts / SAMPLE_SPACING_SECS) % 37 == 0 {
                    Reading::missing(ts)
                } else {
                    Reading::new(ts, synthetic_value(sensor_type, sensor, ts))
                }
            })
            .collect();

        if let Some(limit) = query.limit {
            let excess = readings.len().saturating_sub(limit);
            readings.drain(..excess);
        }
        Ok(readings)
    }

    async fn fetch_bulk_aggregated(
        &self,
        sensors: &[SensorId],
        query: BucketQuery,
    ) -> Result<BTreeMap<SensorId, Vec<AggregationBucket>>, FetchError> {
        Timer::after_millis(FETCH_LATENCY_MS * 4).await;

        let width = query.interval.duration_secs();
        let first = query.from - query.from % width;
        let mut out = BTreeMap::new();
        for &sensor in sensors {
            let Some(sensor_type) = self.type_of(sensor) else {
                continue;
            };
            let buckets = (first..query.to)
                .step_by(width as usize)
                .map(|start| Self::bucket(sensor_type, sensor, start, width))
                .collect();
            out.insert(sensor, buckets);
        }
        Ok(out)
    }

    async fn fetch_summary(
        &self,
        sensor_type: SensorTypeId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Option<DelegatedSummary>, FetchError> {
        Timer::after_millis(FETCH_LATENCY_MS).await;

        // Only moisture has a server-side summary; temperature falls back to local
        if sensor_type != SOIL_MOISTURE {
            return Ok(None);
        }

        let mut sum = 0.0;
        let mut count = 0usize;
        let mut min: Option<DatedValue> = None;
        let mut max: Option<DatedValue> = None;
        let members = self
            .sensors
            .iter()
            .filter(|descriptor| descriptor.active && descriptor.sensor_type.id == sensor_type);
        for descriptor in members {
            for ts in (from..=to).step_by(SECONDS_PER_HOUR as usize) {
                let value = synthetic_value(sensor_type, descriptor.id, ts);
                sum += value;
                count += 1;
                if min.is_none_or(|min| value < min.value) {
                    min = Some(DatedValue { value, timestamp: ts });
                }
                if max.is_none_or(|max| value > max.value) {
                    max = Some(DatedValue { value, timestamp: ts });
                }
            }
        }

        Ok(Some(DelegatedSummary {
            avg: (count > 0).then(|| sum / count as f64),
            min,
            max,
        }))
    }
}

impl CatalogSource for MockBackend {
    async fn list_sensors(&self) -> Result<Vec<SensorDescriptor>, FetchError> {
        Timer::after_millis(FETCH_LATENCY_MS).await;
        Ok(self.sensors.clone())
    }
}

// ---------------------------------------------------------------------------
// Synthetic push gateway
// ---------------------------------------------------------------------------

/// Streams readings for the push-capable probes, with the usual defects.
struct MockTransport {
    sensors: Vec<(SensorId, SensorTypeId)>,
    sent: u64,
    session_frames: u32,
    connects: u32,
    last_frame: Option<Vec<u8>>,
}

impl MockTransport {
    fn new(catalog: &[SensorDescriptor]) -> Self {
        let sensors = catalog
            .iter()
            .filter(|descriptor| descriptor.active && descriptor.transport == TransportKind::Push)
            .map(|descriptor| (descriptor.id, descriptor.sensor_type.id))
            .collect();

        Self {
            sensors,
            sent: 0,
            session_frames: 0,
            connects: 0,
            last_frame: None,
        }
    }

    fn next_wire_frame(&self) -> Option<WireFrame> {
        let n = self.sent;
        let (sensor, sensor_type) = *self.sensors.get((n as usize) % self.sensors.len().max(1))?;
        let now = SystemClock.now();
        let value = synthetic_value(sensor_type, sensor, now);

        let frame = if n % 17 == 0 {
            WireFrame::Status {
                sensor_id: sensor,
                state: LinkState::LowBattery,
                timestamp: now,
            }
        } else if n % 19 == 0 {
            WireFrame::Alert {
                sensor_id: sensor,
                value: WireValue::Number(value),
                timestamp: now,
                message: format!("{} reading {:.1} needs attention", sensor.0, value),
            }
        } else if n % 23 == 0 {
            WireFrame::Reading {
                sensor_id: STRAY_SENSOR,
                value: WireValue::Number(1.0),
                timestamp: now,
                state: None,
            }
        } else {
            // Late delivery: the reading belongs before ones already sent
            let timestamp = if n % 11 == 0 { now.saturating_sub(45) } else { now };
            let value = if n % 13 == 0 {
                WireValue::Text("ERR".into())
            } else if n % 5 == 0 {
                WireValue::Text(format!("{value:.2}"))
            } else {
                WireValue::Number(value)
            };
            WireFrame::Reading {
                sensor_id: sensor,
                value,
                timestamp,
                state: Some(LinkState::Online),
            }
        };
        Some(frame)
    }
}

fn transport_error(detail: &str) -> heapless::String<64> {
    heapless::String::try_from(detail).unwrap_or_default()
}

impl LiveTransport for MockTransport {
    async fn connect(&mut self, topic: &str) -> Result<(), TransportError> {
        Timer::after_millis(100).await;
        self.connects += 1;
        if self.connects % 4 == 3 {
            return Err(TransportError::Connect(transport_error("gateway busy")));
        }
        info!("Gateway accepted subscription to '{}'", topic);
        self.session_frames = 0;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Timer::after_millis(FRAME_INTERVAL_MS).await;

        self.session_frames += 1;
        if self.session_frames > FRAMES_PER_SESSION {
            return Err(TransportError::Lost(transport_error("gateway reset")));
        }

        self.sent += 1;
        if self.sent % 9 == 0 {
            // Re-deliver the previous frame as-is
            if let Some(last) = &self.last_frame {
                return Ok(Some(last.clone()));
            }
        }
        if self.sent % 29 == 0 {
            return Ok(Some(vec![0xde, 0xad, 0xbe, 0xef]));
        }

        let Some(frame) = self.next_wire_frame() else {
            return Ok(None);
        };
        let bytes = encode_frame(&frame)
            .map_err(|e| TransportError::Lost(transport_error(&e.to_string())))?;
        self.last_frame = Some(bytes.clone());
        Ok(Some(bytes))
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

struct Settings {
    run_for: Duration,
    report_every: Duration,
    history_days: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable {}={}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn load_settings() -> (Settings, PipelineConfig) {
    let mut config = PipelineConfig::default();
    config.topic = env_or("FIELDWATCH_TOPIC", config.topic);
    config.retention.sweep_interval_secs = env_or("FIELDWATCH_SWEEP_SECS", 10);
    config.poll_interval_secs = env_or("FIELDWATCH_POLL_SECS", 15);
    config.reconnect.initial_backoff_ms = 500;
    config.reconnect.max_backoff_ms = 5_000;
    config.reconnect.max_attempts = std::env::var("FIELDWATCH_MAX_RECONNECTS")
        .ok()
        .and_then(|raw| raw.parse().ok());

    let settings = Settings {
        run_for: Duration::from_secs(env_or("FIELDWATCH_RUN_SECS", 60)),
        report_every: Duration::from_secs(env_or("FIELDWATCH_REPORT_SECS", 5)),
        history_days: env_or("FIELDWATCH_HISTORY_DAYS", 10),
    };
    (settings, config)
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

fn log_report<C: Clock>(dashboard: &Dashboard<'_, C>, updates: u32) {
    let stats = dashboard.ingest_stats();
    info!(
        "=== {} view, {} | {} updates | stored {} replaced {} dropped {} malformed {}",
        if dashboard.is_live() { "live" } else { "historical" },
        dashboard.connection_state().label(),
        updates,
        stats.stored,
        stats.replaced,
        stats.dropped,
        stats.malformed,
    );

    for &sensor in &dashboard.selection().sensors {
        let name = dashboard
            .catalog()
            .get(sensor)
            .map_or("?", |descriptor| descriptor.name.as_str());
        let quality = dashboard.quality(sensor).map_or("-", |q| q.label());

        match dashboard.summary(sensor) {
            Some(summary) => info!(
                "{:<20} avg {:6.2}  min {:6.2}  max {:6.2}  last {:>8}  {:?}/{} samples  {}",
                name,
                summary.avg,
                summary.min.value,
                summary.max.value,
                summary
                    .last
                    .map_or_else(|| "no value".to_string(), |v| format!("{v:.2}")),
                summary.origin,
                summary.samples,
                quality,
            ),
            None if dashboard.is_degraded(sensor) => info!("{:<20} no data (fetch failed)", name),
            None => info!("{:<20} no data", name),
        }
        if let Some(alert) = dashboard.status(sensor).and_then(|s| s.last_alert.as_ref()) {
            info!("{:<20} last alert: {}", "", alert.message);
        }
    }

    for (label, lot, sub_lot) in [
        ("north", LOT_NORTH, None),
        ("north/a", LOT_NORTH, Some(SUB_NORTH_A)),
        ("north/b", LOT_NORTH, Some(SUB_NORTH_B)),
        ("south", LOT_SOUTH, None),
    ] {
        match dashboard.lot_metrics(lot, sub_lot) {
            Some(m) => info!(
                "lot {:<8} avg {:6.2}  min {:6.2}  max {:6.2}  ({} readings from {} sensors)",
                label, m.avg, m.min, m.max, m.count, m.sensors
            ),
            None => info!("lot {:<8} no data", label),
        }
    }
}

async fn report<C: Clock>(
    shared: &SharedDashboard<'_, C>,
    mut events: EventSubscriber,
    every: Duration,
) {
    let mut ticker = Ticker::every(every);
    let mut updates = 0u32;

    loop {
        match select(events.next_message_pure(), ticker.next()).await {
            Either::First(DashboardEvent::SeriesChanged(_)) => updates += 1,
            Either::First(DashboardEvent::ConnectionChanged(state)) => {
                info!("Connection {}", state.label())
            }
            Either::First(DashboardEvent::Evicted { readings }) => {
                debug!("Sweep evicted {} readings", readings)
            }
            Either::First(DashboardEvent::CatalogChanged) => info!("Catalog changed"),
            Either::First(_) => {}
            Either::Second(()) => {
                log_report(&*shared.lock().await, updates);
                updates = 0;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

async fn run(settings: Settings, config: PipelineConfig) {
    let descriptors = build_catalog();
    let backend = MockBackend::new(descriptors.clone(), SensorId(5));
    let mut transport = MockTransport::new(&descriptors);

    let events = match EVENTS.subscriber() {
        Ok(events) => events,
        Err(e) => {
            error!("No event subscriber slot left: {:?}", e);
            return;
        }
    };

    let shared: SharedDashboard<'static, SystemClock> = SharedDashboard::new(Dashboard::new(
        config,
        SystemClock,
        SensorCatalog::new(),
        EVENTS.immediate_publisher(),
    ));

    if let Err(e) = refresh_catalog(&shared, &backend).await {
        error!("Catalog unavailable: {}", e);
        return;
    }
    let sensors: Vec<SensorId> = descriptors
        .iter()
        .filter(|descriptor| descriptor.active)
        .map(|descriptor| descriptor.id)
        .collect();

    // Live phase
    if let Err(e) = shared.lock().await.select(sensors.iter().copied(), None) {
        error!("Live selection rejected: {}", e);
        return;
    }
    match bootstrap(&shared, &backend).await {
        Ok(epoch) => info!("Live view bootstrapped ({:?})", epoch),
        Err(e) => warn!("Live bootstrap dropped: {}", e),
    }
    log_report(&*shared.lock().await, 0);

    let live = async {
        let cause = run_live(&shared, &mut transport, &mut Delay).await;
        error!("Live channel gave up: {}", cause);
        STOP.signal(());
    };
    let deadline = async {
        Timer::after(settings.run_for).await;
        info!("Live phase over after {} s", settings.run_for.as_secs());
        STOP.signal(());
    };
    let mut sweep_delay = Delay;
    let mut poll_delay = Delay;

    select(
        STOP.wait(),
        select4(
            live,
            run_sweeper(&shared, &mut sweep_delay),
            run_poller(&shared, &backend, &mut poll_delay),
            join(report(&shared, events, settings.report_every), deadline),
        ),
    )
    .await;

    // Historical phase: a closed range ending yesterday
    let end = SystemClock.now().saturating_sub(SECONDS_PER_DAY);
    let range = TimeRange::ending_at(end, settings.history_days * SECONDS_PER_DAY);
    if let Err(e) = shared.lock().await.select(sensors.iter().copied(), Some(range)) {
        error!("Historical selection rejected: {}", e);
        return;
    }
    match bootstrap(&shared, &backend).await {
        Ok(epoch) => info!(
            "Historical view of {} days bootstrapped ({:?})",
            settings.history_days, epoch
        ),
        Err(e) => warn!("Historical bootstrap dropped: {}", e),
    }
    log_report(&*shared.lock().await, 0);
}

fn main() {
    // .env may carry RUST_LOG, so it is loaded before the logger
    let dotenv = dotenvy::dotenv();
    env_logger::init();
    match dotenv {
        Ok(path) => info!("Loaded overrides from {}", path.display()),
        Err(e) => debug!("No .env overrides: {}", e),
    }

    let (settings, config) = load_settings();
    info!(
        "Starting fieldwatch simulator on topic '{}' for {} s",
        config.topic,
        settings.run_for.as_secs()
    );

    embassy_futures::block_on(run(settings, config));

    info!("Simulator exiting");
}
