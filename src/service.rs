//! Async host around [`VerticalTracker`].
//!
//! A single task owns the tracker and consumes one channel carrying both
//! sensor events and commands, so every state transition happens in arrival
//! order on one thread of control. Snapshots go out over a `watch` channel.

use crate::calibration::{CalibrationState, CalibrationStore};
use crate::config::TrackerConfig;
use crate::error::{ensure_finite, Persisted, TrackerError, TrackerResult};
use crate::store::KeyValueStore;
use crate::sync::{DeviceDiscovery, DeviceRecord};
use crate::tracker::{AcquisitionMode, SensorEvent, TrackerSnapshot, VerticalTracker};
use crate::types::{Clock, HistoryPoint};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Queue depth between sensor producers and the tracker task.
pub const EVENT_QUEUE_CAPACITY: usize = 500;

type Reply<T> = oneshot::Sender<T>;

pub enum Command {
    /// Calibrate at the current location from the latest barometer reading
    Calibrate {
        known_height: f64,
        reply: Reply<TrackerResult<Persisted<CalibrationState>>>,
    },
    CalibrateWith {
        pressure: f64,
        temperature: f64,
        known_height: f64,
        reply: Reply<TrackerResult<Persisted<CalibrationState>>>,
    },
    ClearCalibration {
        reply: Reply<Persisted<()>>,
    },
    /// Result of the background calibration load at startup
    CalibrationLoaded(TrackerResult<Option<CalibrationState>>),
    ManualSync {
        remote_height: f64,
        reply: Reply<TrackerResult<Persisted<f64>>>,
    },
    RegisterDevice {
        id: String,
        height: f64,
        reply: Reply<TrackerResult<Persisted<DeviceRecord>>>,
    },
    UpdateDeviceHeight {
        id: String,
        height: f64,
    },
    ConnectedDevices {
        reply: Reply<Vec<DeviceRecord>>,
    },
    GroupSync {
        reply: Reply<f64>,
    },
    History {
        reply: Reply<Vec<HistoryPoint>>,
    },
    ModeChanged(AcquisitionMode),
    Reset,
    Shutdown,
}

pub enum Message {
    Sensor(SensorEvent),
    Command(Command),
}

/// Producer side of the tracker queue, handed to sensor sources.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Message>,
}

impl EventSink {
    /// A sink and the receiving end, for driving a tracker loop by hand.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a sample without blocking.
    ///
    /// A full queue drops the sample. Returns false once the tracker is gone.
    pub fn emit(&self, event: SensorEvent) -> bool {
        match self.tx.try_send(Message::Sensor(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Tracker queue full, dropping sample");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn notify_mode(&self, mode: AcquisitionMode) -> bool {
        match self.tx.try_send(Message::Command(Command::ModeChanged(mode))) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Tracker queue full, mode change to {:?} not delivered", mode);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct TrackerService;

impl TrackerService {
    /// Spawn the tracker task.
    ///
    /// Sync state is loaded before the task starts. The calibration is read
    /// on a blocking thread and applied when it arrives, unless the user has
    /// calibrated in the meantime. The join handle yields the tracker back
    /// after shutdown.
    pub fn start(
        mut tracker: VerticalTracker,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: &TrackerConfig,
    ) -> (TrackerHandle, JoinHandle<VerticalTracker>) {
        if let Err(e) = tracker.load_sync_state() {
            warn!("Could not load sync state: {}", e);
        }

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (snapshots, snapshot_rx) = watch::channel(tracker.snapshot());

        let loader_tx = tx.clone();
        tokio::spawn(async move {
            let loader = CalibrationStore::new(store, clock);
            let loaded = match tokio::task::spawn_blocking(move || loader.load()).await {
                Ok(result) => result,
                Err(e) => Err(TrackerError::Internal(format!("calibration load task failed: {e}"))),
            };
            let _ = loader_tx
                .send(Message::Command(Command::CalibrationLoaded(loaded)))
                .await;
        });

        let sweep_every = Duration::from_millis(config.sync.sweep_interval_ms);
        let task = tokio::spawn(run(tracker, rx, snapshots, sweep_every));

        let handle = TrackerHandle {
            tx,
            snapshots: snapshot_rx,
        };
        (handle, task)
    }
}

async fn run(
    mut tracker: VerticalTracker,
    mut rx: mpsc::Receiver<Message>,
    snapshots: watch::Sender<TrackerSnapshot>,
    sweep_every: Duration,
) -> VerticalTracker {
    let mut sweep = interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut rejected = 0u64;

    info!("Tracker task started");
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else {
                    debug!("All tracker senders dropped");
                    break;
                };
                match message {
                    Message::Sensor(event) => match tracker.handle(event) {
                        Ok(snapshot) => {
                            snapshots.send_replace(snapshot);
                        }
                        Err(e) => {
                            rejected += 1;
                            if rejected % 100 == 1 {
                                warn!("Rejected sensor event ({} so far): {}", rejected, e);
                            }
                        }
                    },
                    Message::Command(Command::Shutdown) => break,
                    Message::Command(command) => {
                        apply_command(&mut tracker, command);
                        snapshots.send_replace(tracker.snapshot());
                    }
                }
            }
            _ = sweep.tick() => {
                // Staleness depends on the clock alone, so re-derive and publish on change
                let next = tracker.snapshot();
                snapshots.send_if_modified(|current| {
                    if current.connected_devices == next.connected_devices
                        && current.group_height == next.group_height
                    {
                        return false;
                    }
                    debug!("Device sweep: {} connected", next.connected_devices);
                    *current = next;
                    true
                });
            }
        }
    }
    info!("Tracker task stopped ({} rejected events)", rejected);
    tracker
}

fn apply_command(tracker: &mut VerticalTracker, command: Command) {
    // Reply errors only mean the caller stopped waiting
    match command {
        Command::Calibrate { known_height, reply } => {
            let _ = reply.send(tracker.calibrate_here(known_height));
        }
        Command::CalibrateWith {
            pressure,
            temperature,
            known_height,
            reply,
        } => {
            let _ = reply.send(tracker.calibrate(pressure, temperature, known_height));
        }
        Command::ClearCalibration { reply } => {
            let _ = reply.send(tracker.clear_calibration());
        }
        Command::CalibrationLoaded(loaded) => tracker.restore_calibration(loaded),
        Command::ManualSync { remote_height, reply } => {
            let _ = reply.send(tracker.apply_manual_sync(remote_height));
        }
        Command::RegisterDevice { id, height, reply } => {
            let _ = reply.send(tracker.register_device(&id, height));
        }
        Command::UpdateDeviceHeight { id, height } => match tracker.update_device_height(&id, height) {
            Ok(true) => {}
            Ok(false) => debug!("Height update for unknown device {}", id),
            Err(e) => warn!("Bad height for device {}: {}", id, e),
        },
        Command::ConnectedDevices { reply } => {
            let _ = reply.send(tracker.connected_devices());
        }
        Command::GroupSync { reply } => {
            let _ = reply.send(tracker.sync().compute_group_sync());
        }
        Command::History { reply } => {
            let _ = reply.send(tracker.history().to_vec());
        }
        Command::ModeChanged(mode) => tracker.set_mode(mode),
        Command::Reset => tracker.reset(),
        Command::Shutdown => {}
    }
}

/// Cloneable client for a running tracker task.
#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<Message>,
    snapshots: watch::Receiver<TrackerSnapshot>,
}

impl TrackerHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> TrackerResult<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Message::Command(make(reply)))
            .await
            .map_err(|_| TrackerError::ChannelClosed)?;
        response.await.map_err(|_| TrackerError::ChannelClosed)
    }

    async fn send(&self, command: Command) -> TrackerResult<()> {
        self.tx
            .send(Message::Command(command))
            .await
            .map_err(|_| TrackerError::ChannelClosed)
    }

    pub async fn calibrate(&self, known_height: f64) -> TrackerResult<Persisted<CalibrationState>> {
        self.request(|reply| Command::Calibrate { known_height, reply })
            .await?
    }

    pub async fn calibrate_with(
        &self,
        pressure: f64,
        temperature: f64,
        known_height: f64,
    ) -> TrackerResult<Persisted<CalibrationState>> {
        self.request(|reply| Command::CalibrateWith {
            pressure,
            temperature,
            known_height,
            reply,
        })
        .await?
    }

    pub async fn clear_calibration(&self) -> TrackerResult<Persisted<()>> {
        self.request(|reply| Command::ClearCalibration { reply }).await
    }

    pub async fn manual_sync(&self, remote_height: f64) -> TrackerResult<Persisted<f64>> {
        self.request(|reply| Command::ManualSync { remote_height, reply })
            .await?
    }

    /// Read a nearby device's height and sync to it.
    ///
    /// The connection is awaited here, outside the tracker task, so sensor
    /// processing continues while the transport is busy.
    pub async fn sync_with_device(
        &self,
        discovery: &dyn DeviceDiscovery,
        id: &str,
    ) -> TrackerResult<Persisted<f64>> {
        let remote_height = ensure_finite("remote height", discovery.connect(id).await?)?;
        self.register_device(id, remote_height).await?;
        self.manual_sync(remote_height).await
    }

    pub async fn register_device(&self, id: &str, height: f64) -> TrackerResult<Persisted<DeviceRecord>> {
        let id = id.to_string();
        self.request(|reply| Command::RegisterDevice { id, height, reply })
            .await?
    }

    pub async fn update_device_height(&self, id: &str, height: f64) -> TrackerResult<()> {
        self.send(Command::UpdateDeviceHeight {
            id: id.to_string(),
            height,
        })
        .await
    }

    pub async fn connected_devices(&self) -> TrackerResult<Vec<DeviceRecord>> {
        self.request(|reply| Command::ConnectedDevices { reply }).await
    }

    pub async fn group_sync(&self) -> TrackerResult<f64> {
        self.request(|reply| Command::GroupSync { reply }).await
    }

    pub async fn history(&self) -> TrackerResult<Vec<HistoryPoint>> {
        self.request(|reply| Command::History { reply }).await
    }

    pub async fn reset(&self) -> TrackerResult<()> {
        self.send(Command::Reset).await
    }

    pub async fn shutdown(&self) -> TrackerResult<()> {
        self.send(Command::Shutdown).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> TrackerSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackerSnapshot> {
        self.snapshots.clone()
    }

    pub fn sink(&self) -> EventSink {
        EventSink { tx: self.tx.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{save_json, MemoryStore, CALIBRATION_KEY};
    use crate::sync::NearbyDevice;
    use crate::types::{AccelSample, ManualClock, SensorSample, GRAVITY};
    use futures::future::BoxFuture;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn start_with(store: Arc<MemoryStore>) -> (TrackerHandle, JoinHandle<VerticalTracker>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        start_configured(store, clock, TrackerConfig::default())
    }

    fn start_configured(
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        config: TrackerConfig,
    ) -> (TrackerHandle, JoinHandle<VerticalTracker>) {
        let clock: Arc<dyn Clock> = clock;
        let tracker = VerticalTracker::new(&config, store.clone(), clock.clone());
        TrackerService::start(tracker, store, clock, &config)
    }

    fn feed(sink: &EventSink, pressure: f64, timestamp: i64) {
        assert!(sink.emit(SensorEvent::Accel(AccelSample::new(0.0, 0.0, GRAVITY, timestamp))));
        assert!(sink.emit(SensorEvent::Barometer(SensorSample::new(
            pressure,
            Some(20.0),
            timestamp
        ))));
    }

    async fn wait_for(
        handle: &TrackerHandle,
        f: impl FnMut(&TrackerSnapshot) -> bool,
    ) -> TrackerSnapshot {
        let mut rx = handle.subscribe();
        let snapshot = timeout(WAIT, rx.wait_for(f))
            .await
            .expect("timed out waiting for snapshot")
            .expect("tracker task ended")
            .clone();
        snapshot
    }

    #[tokio::test]
    async fn test_restores_persisted_calibration() {
        let store = Arc::new(MemoryStore::new());
        let state = CalibrationState {
            reference_pressure: 1000.0,
            reference_height: 50.0,
            reference_temperature: 15.0,
            timestamp: 1,
        };
        save_json(store.as_ref(), CALIBRATION_KEY, &state).unwrap();

        let (handle, _task) = start_with(store);
        let snapshot = wait_for(&handle, |s| s.calibrated).await;
        assert!(!snapshot.has_estimate);
    }

    #[tokio::test]
    async fn test_events_produce_fused_height() {
        let (handle, _task) = start_with(Arc::new(MemoryStore::new()));
        handle.calibrate_with(1013.25, 20.0, 0.0).await.unwrap();

        let sink = handle.sink();
        feed(&sink, 1011.0, 1_000);
        feed(&sink, 1011.0, 1_050);

        let snapshot = wait_for(&handle, |s| s.has_estimate && s.timestamp == 1_050).await;
        assert!(snapshot.height > 15.0 && snapshot.height < 25.0);
        assert_eq!(handle.history().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_calibrate_without_pressure_fails() {
        let (handle, _task) = start_with(Arc::new(MemoryStore::new()));
        let result = handle.calibrate(10.0).await;
        assert!(matches!(result, Err(TrackerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_manual_sync_round_trip() {
        let (handle, _task) = start_with(Arc::new(MemoryStore::new()));
        assert!(handle.manual_sync(5.0).await.is_err());

        handle.sink().emit(SensorEvent::Barometer(SensorSample::new(1013.25, Some(20.0), 0)));
        handle.calibrate(0.0).await.unwrap();
        feed(&handle.sink(), 1013.25, 100);

        let synced = handle.manual_sync(5.0).await.unwrap();
        assert!(synced.is_durable());
        let snapshot = wait_for(&handle, |s| s.sync_offset != 0.0).await;
        assert!((snapshot.height - 5.0).abs() < 1e-9);
        assert_eq!(handle.connected_devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_reported_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let (handle, _task) = start_with(store);

        let calibrated = handle.calibrate_with(1013.25, 20.0, 3.0).await.unwrap();
        assert!(!calibrated.is_durable());
        wait_for(&handle, |s| s.calibrated).await;
    }

    struct FixedDiscovery(f64);

    impl DeviceDiscovery for FixedDiscovery {
        fn scan(&self, on_devices: Box<dyn Fn(Vec<NearbyDevice>) + Send + Sync>) {
            on_devices(Vec::new());
        }

        fn stop_scan(&self) {}

        fn connect(&self, _id: &str) -> BoxFuture<'_, TrackerResult<f64>> {
            let height = self.0;
            Box::pin(async move { Ok(height) })
        }
    }

    #[tokio::test]
    async fn test_sync_with_device() {
        let (handle, _task) = start_with(Arc::new(MemoryStore::new()));
        handle.calibrate_with(1013.25, 20.0, 10.0).await.unwrap();
        feed(&handle.sink(), 1013.25, 0);

        let synced = handle
            .sync_with_device(&FixedDiscovery(12.0), "peer")
            .await
            .unwrap();
        assert!((synced.value - 2.0).abs() < 1e-9);
        assert_eq!(handle.connected_devices().await.unwrap().len(), 2);
        assert!((handle.group_sync().await.unwrap() - 11.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sweep_publishes_stale_devices() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let mut config = TrackerConfig::default();
        config.sync.sweep_interval_ms = 20;
        let (handle, _task) = start_configured(Arc::new(MemoryStore::new()), clock.clone(), config);

        handle.register_device("peer", 4.0).await.unwrap();
        let snapshot = wait_for(&handle, |s| s.connected_devices == 1).await;
        assert!((snapshot.group_height - 4.0).abs() < 1e-9);

        // No event or command follows, only the sweep can notice
        clock.advance(61_000);
        let snapshot = wait_for(&handle, |s| s.connected_devices == 0).await;
        assert_eq!(snapshot.group_height, 0.0);
        assert!(handle.connected_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_returns_tracker() {
        let (handle, task) = start_with(Arc::new(MemoryStore::new()));
        handle.sink().notify_mode(AcquisitionMode::Simulated);
        handle.shutdown().await.unwrap();

        let tracker = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(tracker.snapshot().mode, AcquisitionMode::Simulated);
        assert!(matches!(
            handle.history().await,
            Err(TrackerError::ChannelClosed)
        ));
        assert!(!handle.sink().emit(SensorEvent::Steps { count: 1, timestamp: 0 }));
    }
}
