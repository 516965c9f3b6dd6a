//! Async drivers around a shared [`Dashboard`]
//!
//! The dashboard lives behind an async mutex. Tasks lock it only for the
//! synchronous part of their work (building a request, applying a result,
//! routing a frame) and release it across every await on the backend, the
//! push channel or a delay.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embedded_hal_async::delay::DelayNs;
use log::{debug, error, info, warn};

use crate::live::{ConnectionState, LiveTransport, TransportError};
use crate::source::{truncated, CatalogSource, FetchError, ReadingSource};
use crate::time::Clock;

use super::{Dashboard, DashboardError, Epoch};

pub type SharedDashboard<'a, C> = AsyncMutex<CriticalSectionRawMutex, Dashboard<'a, C>>;

/// Fetch and merge bootstrap data for the current selection
///
/// Fails with [`DashboardError::StaleEpoch`] when the selection changed
/// while the fetch was in flight; the fetched data is then dropped.
pub async fn bootstrap<C: Clock, S: ReadingSource>(
    shared: &SharedDashboard<'_, C>,
    source: &S,
) -> Result<Epoch, DashboardError> {
    let request = shared.lock().await.bootstrap_request();
    let fetched = request.fetch(source).await;

    let mut dashboard = shared.lock().await;
    dashboard.apply_bootstrap(fetched)?;
    Ok(request.epoch)
}

/// One catch-up round for poll-only sensors; returns how many readings were new
pub async fn refresh_polled<C: Clock, S: ReadingSource>(
    shared: &SharedDashboard<'_, C>,
    source: &S,
) -> Result<usize, DashboardError> {
    let Some(request) = shared.lock().await.poll_request() else {
        return Ok(0);
    };
    let polled = request.fetch(source).await;
    shared.lock().await.apply_poll(polled)
}

/// Replace the catalog with the backend's current listing
pub async fn refresh_catalog<C: Clock, S: CatalogSource>(
    shared: &SharedDashboard<'_, C>,
    source: &S,
) -> Result<usize, FetchError> {
    let descriptors = source.list_sensors().await?;
    let gone = shared.lock().await.refresh_catalog(descriptors);
    if !gone.is_empty() {
        info!("{} sensors left the catalog", gone.len());
    }
    Ok(gone.len())
}

/// Keep the push channel connected and feed every frame into the dashboard
///
/// Reconnects with exponential backoff after a failed connect, a lost
/// connection or a server-side close. A successful connect resets the
/// backoff. Returns the last error once the configured attempt budget is
/// spent; with no budget it never returns.
pub async fn run_live<C: Clock, T: LiveTransport, D: DelayNs>(
    shared: &SharedDashboard<'_, C>,
    transport: &mut T,
    delay: &mut D,
) -> TransportError {
    let (topic, reconnect) = {
        let dashboard = shared.lock().await;
        (dashboard.config().topic.clone(), dashboard.config().reconnect)
    };
    let mut failures: u32 = 0;

    loop {
        shared.lock().await.set_connection_state(ConnectionState::Connecting);

        let (state, cause) = match transport.connect(&topic).await {
            Ok(()) => {
                shared.lock().await.set_connection_state(ConnectionState::Connected);
                failures = 0;
                pump(shared, transport).await
            }
            Err(e) => (ConnectionState::Error, e),
        };

        match state {
            ConnectionState::Error => error!("Live channel '{}': {}", topic, cause),
            _ => info!("Live channel '{}' closed: {}", topic, cause),
        }
        shared.lock().await.set_connection_state(state);

        failures += 1;
        if reconnect.exhausted(failures) {
            warn!("Giving up on '{}' after {} consecutive failures", topic, failures);
            return cause;
        }

        let backoff = reconnect.backoff(failures);
        debug!("Reconnecting to '{}' in {} ms", topic, backoff.as_millis());
        delay
            .delay_ms(u32::try_from(backoff.as_millis()).unwrap_or(u32::MAX))
            .await;
    }
}

/// Route frames until the connection ends; returns the state it ended in
async fn pump<C: Clock, T: LiveTransport>(
    shared: &SharedDashboard<'_, C>,
    transport: &mut T,
) -> (ConnectionState, TransportError) {
    loop {
        match transport.next_frame().await {
            Ok(Some(frame)) => {
                // Malformed frames are counted and logged by the dashboard
                if let Ok(outcome) = shared.lock().await.ingest_frame(&frame) {
                    debug!("Frame routed: {:?}", outcome);
                }
            }
            Ok(None) => {
                return (
                    ConnectionState::Disconnected,
                    TransportError::Lost(truncated("closed by server")),
                );
            }
            Err(e) => return (ConnectionState::Error, e),
        }
    }
}

/// Periodically run the retention sweep
pub async fn run_sweeper<C: Clock, D: DelayNs>(shared: &SharedDashboard<'_, C>, delay: &mut D) {
    let interval = shared.lock().await.config().retention.sweep_interval();
    loop {
        delay
            .delay_ms(u32::try_from(interval.as_millis()).unwrap_or(u32::MAX))
            .await;
        shared.lock().await.tick();
    }
}

/// Periodically refresh poll-only sensors
pub async fn run_poller<C: Clock, S: ReadingSource, D: DelayNs>(
    shared: &SharedDashboard<'_, C>,
    source: &S,
    delay: &mut D,
) {
    let interval = shared.lock().await.config().poll_interval();
    loop {
        delay
            .delay_ms(u32::try_from(interval.as_millis()).unwrap_or(u32::MAX))
            .await;
        match refresh_polled(shared, source).await {
            Ok(0) => {}
            Ok(fresh) => debug!("Poll refresh added {} readings", fresh),
            Err(e) => debug!("Poll refresh discarded: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::{DashboardChannel, DashboardEvent};
    use super::*;
    use crate::config::{PipelineConfig, ReconnectConfig};
    use crate::live::{encode_frame, WireFrame, WireValue};
    use crate::sensors::{CatalogEvent, SensorDescriptor, SensorId};
    use crate::storage::{LinkState, Reading};
    use crate::time::ManualClock;
    use alloc::collections::VecDeque;
    use alloc::string::String;
    use alloc::vec;
    use alloc::vec::Vec;
    use embassy_futures::join::join;
    use embassy_futures::{block_on, yield_now};

    /// Records requested waits without sleeping
    #[derive(Default)]
    struct RecordingDelay {
        waits_ms: Vec<u32>,
    }

    impl DelayNs for RecordingDelay {
        async fn delay_ns(&mut self, _ns: u32) {}

        async fn delay_ms(&mut self, ms: u32) {
            self.waits_ms.push(ms);
        }
    }

    /// Plays back connect results and frames; runs dry as a failed connect
    #[derive(Default)]
    struct ScriptedTransport {
        connects: VecDeque<Result<(), TransportError>>,
        frames: VecDeque<Result<Option<Vec<u8>>, TransportError>>,
        topics: Vec<String>,
    }

    impl LiveTransport for ScriptedTransport {
        async fn connect(&mut self, topic: &str) -> Result<(), TransportError> {
            self.topics.push(String::from(topic));
            self.connects
                .pop_front()
                .unwrap_or(Err(TransportError::Connect(truncated("script exhausted"))))
        }

        async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            self.frames.pop_front().unwrap_or(Ok(None))
        }
    }

    struct StaticCatalog(Vec<SensorDescriptor>);

    impl CatalogSource for StaticCatalog {
        async fn list_sensors(&self) -> Result<Vec<SensorDescriptor>, FetchError> {
            Ok(self.0.clone())
        }
    }

    fn frame(sensor: SensorId, timestamp: u64, value: f64) -> Result<Option<Vec<u8>>, TransportError> {
        let wire = WireFrame::Reading {
            sensor_id: sensor,
            value: WireValue::Number(value),
            timestamp,
            state: Some(LinkState::Online),
        };
        Ok(Some(encode_frame(&wire).unwrap()))
    }

    fn lost() -> TransportError {
        TransportError::Lost(truncated("reset by peer"))
    }

    #[test]
    fn test_selection_change_during_fetch_discards_result() {
        let channel = DashboardChannel::new();
        let clock = ManualClock::new(200);
        let mut dashboard = Dashboard::new(PipelineConfig::default(), &clock, catalog(), channel.immediate_publisher());
        dashboard.select([S1], None).unwrap();
        let shared = SharedDashboard::new(dashboard);
        let backend = FixedBackend::with(S1, &[(100, 1.0)]);

        let navigate = async {
            // The fetch yields while in flight; navigate away meanwhile
            yield_now().await;
            shared.lock().await.select([S2], None).unwrap()
        };
        let (result, new_epoch) = block_on(join(bootstrap(&shared, &backend), navigate));

        assert!(matches!(result, Err(DashboardError::StaleEpoch { current, .. }) if current == new_epoch));
        let dashboard = block_on(shared.lock());
        assert!(dashboard.series(S1).is_empty());
        assert!(dashboard.is_loading());
    }

    #[test]
    fn test_bootstrap_task_applies_current_selection() {
        let channel = DashboardChannel::new();
        let clock = ManualClock::new(200);
        let mut dashboard = Dashboard::new(PipelineConfig::default(), &clock, catalog(), channel.immediate_publisher());
        let epoch = dashboard.select([S1], None).unwrap();
        let shared = SharedDashboard::new(dashboard);
        let backend = FixedBackend::with(S1, &[(100, 1.0), (150, 2.0)]);

        assert_eq!(block_on(bootstrap(&shared, &backend)), Ok(epoch));
        assert_eq!(block_on(shared.lock()).series(S1).len(), 2);
    }

    #[test]
    fn test_live_runner_reconnects_and_gives_up() {
        let channel = DashboardChannel::new();
        let mut events = channel.subscriber().unwrap();
        let clock = ManualClock::new(200);
        let config = PipelineConfig {
            reconnect: ReconnectConfig {
                max_attempts: Some(3),
                ..ReconnectConfig::default()
            },
            ..PipelineConfig::default()
        };
        let mut dashboard = Dashboard::new(config, &clock, catalog(), channel.immediate_publisher());
        dashboard.select([S1], None).unwrap();
        let shared = SharedDashboard::new(dashboard);

        let mut transport = ScriptedTransport {
            connects: VecDeque::from([Ok(()), Err(TransportError::Connect(truncated("refused"))), Ok(())]),
            frames: VecDeque::from([
                frame(S1, 10, 1.0),
                Ok(Some(vec![0xff, 0xff, 0xff])),
                frame(S2, 10, 5.0),
                Err(lost()),
                // Replay after reconnect overlaps what was already delivered
                frame(S1, 10, 1.5),
                frame(S1, 20, 2.0),
                Ok(None),
            ]),
            topics: Vec::new(),
        };
        let mut delay = RecordingDelay::default();

        let cause = block_on(run_live(&shared, &mut transport, &mut delay));

        assert_eq!(cause, TransportError::Connect(truncated("script exhausted")));
        assert_eq!(delay.waits_ms, vec![1_000, 2_000, 1_000, 2_000], "backoff resets after a good connect");
        assert_eq!(transport.topics.len(), 5);
        assert!(transport.topics.iter().all(|topic| topic == "iot"));

        let dashboard = block_on(shared.lock());
        assert_eq!(
            dashboard.series(S1),
            vec![
                Reading::new(10, 1.5).with_state(LinkState::Online),
                Reading::new(20, 2.0).with_state(LinkState::Online),
            ]
        );
        let stats = dashboard.ingest_stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.replaced, 1);
        assert_eq!(dashboard.connection_state(), ConnectionState::Error);

        let states: Vec<_> = core::iter::from_fn(|| events.try_next_message_pure())
            .filter_map(|event| match event {
                DashboardEvent::ConnectionChanged(state) => Some(state),
                _ => None,
            })
            .take(4)
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Error,
                ConnectionState::Connecting,
            ]
        );
    }

    #[test]
    fn test_catalog_frames_reach_the_catalog() {
        let channel = DashboardChannel::new();
        let clock = ManualClock::new(200);
        let config = PipelineConfig {
            reconnect: ReconnectConfig {
                max_attempts: Some(1),
                ..ReconnectConfig::default()
            },
            ..PipelineConfig::default()
        };
        let mut dashboard = Dashboard::new(config, &clock, catalog(), channel.immediate_publisher());
        dashboard.select([S1, S2], None).unwrap();
        let shared = SharedDashboard::new(dashboard);

        let mut transport = ScriptedTransport {
            connects: VecDeque::from([Ok(())]),
            frames: VecDeque::from([Ok(Some(encode_frame(&WireFrame::SensorRemoved(S2)).unwrap()))]),
            topics: Vec::new(),
        };
        block_on(run_live(&shared, &mut transport, &mut RecordingDelay::default()));

        let dashboard = block_on(shared.lock());
        assert!(!dashboard.catalog().contains(S2));
        assert_eq!(dashboard.selection().sensors, vec![S1]);
        assert_eq!(dashboard.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_refresh_tasks() {
        let channel = DashboardChannel::new();
        let clock = ManualClock::new(2_000);
        let mut dashboard = Dashboard::new(PipelineConfig::default(), &clock, catalog(), channel.immediate_publisher());
        dashboard.select([S1, POLLED], None).unwrap();
        let shared = SharedDashboard::new(dashboard);

        let backend = FixedBackend::with(POLLED, &[(1_950, 3.0)]);
        assert_eq!(block_on(refresh_polled(&shared, &backend)), Ok(1));

        let listing = StaticCatalog(catalog().iter().filter(|s| s.id != S1).cloned().collect());
        assert_eq!(block_on(refresh_catalog(&shared, &listing)), Ok(1));
        assert!(!block_on(shared.lock()).catalog().contains(S1));

        // Removal over the channel and a later full listing agree
        block_on(shared.lock()).apply_catalog_event(CatalogEvent::SensorRemoved(POLLED));
        assert_eq!(block_on(refresh_polled(&shared, &backend)), Ok(0));
    }
}
