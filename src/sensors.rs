//! Sensor acquisition.
//!
//! Platform sensors sit behind [`SensorSource`] and [`LocationSource`]. Every
//! stream they open is a [`Subscription`] that is cancelled when dropped, so
//! teardown cannot leak a polling task whichever path led there.
//! [`SensorHub`] chooses between real sensors and the simulated fallback.

use crate::config::AcquisitionConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::service::EventSink;
use crate::tracker::{AcquisitionMode, SensorEvent};
use crate::types::{AccelSample, Clock, GpsSample, SensorSample, GRAVITY};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Handle to one live sensor stream. Cancels the stream on drop.
pub struct Subscription {
    name: String,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(name: impl Into<String>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription backed by a polling task; cancelling aborts it.
    pub fn from_task(name: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self::new(name, move || task.abort())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    /// Stop the stream. Safe to call more than once.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            debug!("Unsubscribing {}", self.name);
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Barometer and accelerometer provider.
pub trait SensorSource: Send + Sync {
    fn is_barometer_available(&self) -> bool;

    /// Start streaming into `sink`. On error nothing may keep running.
    fn subscribe(&self, sink: EventSink, config: &AcquisitionConfig) -> TrackerResult<Vec<Subscription>>;
}

/// GPS provider. Dropping or cancelling the subscription clears the watch.
pub trait LocationSource: Send + Sync {
    fn watch(&self, sink: EventSink, config: &AcquisitionConfig) -> TrackerResult<Subscription>;
}

/// Start the synthetic sensor stream.
///
/// Emits raw barometer and accelerometer samples every `interval_ms`, so
/// the filter and motion classifier run on them like on real data. The
/// signal is deterministic: a slow pressure swing of about ±4 m around sea
/// level with a small hand-held wobble on the accelerometer.
pub fn simulate(sink: EventSink, interval_ms: u64, clock: Arc<dyn Clock>) -> Subscription {
    let task = tokio::spawn(async move {
        use std::f64::consts::PI;

        let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let step = interval_ms.max(1) as f64 / 1000.0;
        let mut tick = 0u64;

        loop {
            ticker.tick().await;
            let t = tick as f64 * step;
            let timestamp = clock.now_ms();

            let accel = AccelSample::new(
                (t * 2.0 * PI).sin() * 0.5,
                (t * 2.0 * PI).cos() * 0.3,
                GRAVITY + (t * PI).sin() * 0.1,
                timestamp,
            );
            // ~0.12 hPa per metre near sea level
            let pressure = 1013.25 - 0.5 * (t * 2.0 * PI / 60.0).sin();
            let temperature = 20.0 + 0.25 * (t * 2.0 * PI / 300.0).sin();
            let baro = SensorSample::new(pressure, Some(temperature), timestamp).with_humidity(45.0);

            if !sink.emit(SensorEvent::Accel(accel)) || !sink.emit(SensorEvent::Barometer(baro)) {
                debug!("[sim] Tracker gone after {} ticks", tick);
                break;
            }
            tick += 1;
        }
    });
    Subscription::from_task("simulated sensors", task)
}

/// Owns the acquisition lifecycle: real sensors when the barometer works,
/// the simulator otherwise, never both.
pub struct SensorHub {
    source: Arc<dyn SensorSource>,
    location: Option<Arc<dyn LocationSource>>,
    sink: EventSink,
    config: AcquisitionConfig,
    clock: Arc<dyn Clock>,
    mode: AcquisitionMode,
    subscriptions: Vec<Subscription>,
    gps: Option<Subscription>,
}

impl SensorHub {
    pub fn new(
        source: Arc<dyn SensorSource>,
        location: Option<Arc<dyn LocationSource>>,
        sink: EventSink,
        config: AcquisitionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            location,
            sink,
            config,
            clock,
            mode: AcquisitionMode::Idle,
            subscriptions: Vec::new(),
            gps: None,
        }
    }

    pub fn mode(&self) -> AcquisitionMode {
        self.mode
    }

    /// Sensor subscriptions currently open, GPS included.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.iter().filter(|s| s.is_active()).count() + usize::from(self.gps.is_some())
    }

    /// Start acquisition. A second call while running changes nothing.
    ///
    /// Falls back to simulation when the barometer is missing or the
    /// subscription fails.
    pub fn start(&mut self) -> AcquisitionMode {
        if self.mode != AcquisitionMode::Idle {
            debug!("Acquisition already running ({:?})", self.mode);
            return self.mode;
        }

        if !self.source.is_barometer_available() {
            warn!("Barometer unavailable, switching to simulated sensors");
            return self.start_simulated();
        }

        match self.source.subscribe(self.sink.clone(), &self.config) {
            Ok(subscriptions) => {
                info!("Real sensors started ({} streams)", subscriptions.len());
                self.subscriptions = subscriptions;
                self.set_mode(AcquisitionMode::Real);
                self.start_location();
                self.mode
            }
            Err(e) => {
                warn!("Sensor subscription failed, switching to simulated sensors: {}", e);
                self.start_simulated()
            }
        }
    }

    /// Run on synthetic data. Replaces real sensors if they are running.
    pub fn start_simulated(&mut self) -> AcquisitionMode {
        match self.mode {
            AcquisitionMode::Simulated => return self.mode,
            AcquisitionMode::Real => self.cancel_sensors(),
            AcquisitionMode::Idle => {}
        }

        info!("Simulated sensors started ({} ms)", self.config.simulation_interval_ms);
        self.subscriptions.push(simulate(
            self.sink.clone(),
            self.config.simulation_interval_ms,
            self.clock.clone(),
        ));
        self.set_mode(AcquisitionMode::Simulated);
        self.start_location();
        self.mode
    }

    /// Cancel every subscription. Idempotent.
    pub fn stop(&mut self) {
        self.cancel_sensors();
        if let Some(mut gps) = self.gps.take() {
            gps.cancel();
        }
        if self.mode != AcquisitionMode::Idle {
            info!("Acquisition stopped");
            self.set_mode(AcquisitionMode::Idle);
        }
    }

    // GPS is independent of the barometer path and runs in both modes
    fn start_location(&mut self) {
        if self.gps.is_some() {
            return;
        }
        let Some(location) = &self.location else {
            return;
        };
        match location.watch(self.sink.clone(), &self.config) {
            Ok(subscription) => self.gps = Some(subscription),
            Err(e) => warn!("GPS unavailable, fusing without it: {}", e),
        }
    }

    fn cancel_sensors(&mut self) {
        for mut subscription in self.subscriptions.drain(..) {
            subscription.cancel();
        }
    }

    fn set_mode(&mut self, mode: AcquisitionMode) {
        self.mode = mode;
        self.sink.notify_mode(mode);
    }
}

impl Drop for SensorHub {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sensors read through the Termux:API command line tools.
///
/// The sensor listing is read once, when the source is built, so the
/// availability check never blocks the runtime.
pub struct TermuxSensorSource {
    clock: Arc<dyn Clock>,
    barometer: bool,
}

impl TermuxSensorSource {
    /// Run `termux-sensor -l` and remember whether a pressure sensor is listed.
    pub async fn detect(clock: Arc<dyn Clock>) -> Self {
        let listing = match Command::new("termux-sensor").arg("-l").output().await {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout).into_owned(),
            Ok(output) => {
                debug!("termux-sensor -l exited with {}", output.status);
                String::new()
            }
            Err(e) => {
                debug!("termux-sensor not runnable: {}", e);
                String::new()
            }
        };
        Self::from_listing(clock, &listing)
    }

    pub fn from_listing(clock: Arc<dyn Clock>, listing: &str) -> Self {
        let barometer = has_pressure_sensor(listing);
        debug!("Termux barometer listed: {}", barometer);
        Self { clock, barometer }
    }
}

impl SensorSource for TermuxSensorSource {
    fn is_barometer_available(&self) -> bool {
        self.barometer
    }

    fn subscribe(&self, sink: EventSink, config: &AcquisitionConfig) -> TrackerResult<Vec<Subscription>> {
        if sink.is_closed() {
            return Err(TrackerError::ChannelClosed);
        }
        let baro = tokio::spawn(poll_sensor(
            "pressure",
            config.baro_interval_ms,
            sink.clone(),
            self.clock.clone(),
            pressure_event,
        ));
        let accel = tokio::spawn(poll_sensor(
            "accelerometer",
            config.accel_interval_ms,
            sink,
            self.clock.clone(),
            accel_event,
        ));
        Ok(vec![
            Subscription::from_task("barometer", baro),
            Subscription::from_task("accelerometer", accel),
        ])
    }
}

fn pressure_event(values: &[f64], timestamp: i64) -> Option<SensorEvent> {
    let pressure = *values.first()?;
    Some(SensorEvent::Barometer(SensorSample::new(pressure, None, timestamp)))
}

fn accel_event(values: &[f64], timestamp: i64) -> Option<SensorEvent> {
    match values {
        [x, y, z, ..] => Some(SensorEvent::Accel(AccelSample::new(*x, *y, *z, timestamp))),
        _ => None,
    }
}

async fn poll_sensor(
    sensor: &'static str,
    interval_ms: u64,
    sink: EventSink,
    clock: Arc<dyn Clock>,
    to_event: fn(&[f64], i64) -> Option<SensorEvent>,
) {
    let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sample_count = 0u64;

    loop {
        ticker.tick().await;
        let output = match Command::new("termux-sensor")
            .args(["-s", sensor, "-n", "1"])
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                debug!("[{}] read failed: {}", sensor, e);
                continue;
            }
        };

        let text = String::from_utf8_lossy(&output.stdout);
        let Some(event) = parse_sensor_values(&text).and_then(|v| to_event(&v, clock.now_ms())) else {
            continue;
        };
        if !sink.emit(event) {
            debug!("[{}] Tracker gone after {} samples", sensor, sample_count);
            break;
        }
        sample_count += 1;
        if sample_count % 100 == 0 {
            debug!("[{}] {} samples", sensor, sample_count);
        }
    }
}

/// GPS fixes from `termux-location`.
pub struct TermuxLocationSource {
    clock: Arc<dyn Clock>,
}

impl TermuxLocationSource {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl LocationSource for TermuxLocationSource {
    fn watch(&self, sink: EventSink, config: &AcquisitionConfig) -> TrackerResult<Subscription> {
        if sink.is_closed() {
            return Err(TrackerError::ChannelClosed);
        }
        let clock = self.clock.clone();
        let interval_ms = config.gps_interval_ms.max(1);
        let task = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut fixes = 0u64;

            loop {
                ticker.tick().await;
                let output = match Command::new("termux-location")
                    .args(["-p", "gps", "-r", "once"])
                    .output()
                    .await
                {
                    Ok(output) => output,
                    Err(e) => {
                        debug!("[gps] read failed: {}", e);
                        continue;
                    }
                };
                let Some(fix) = parse_location(&String::from_utf8_lossy(&output.stdout), clock.now_ms()) else {
                    continue;
                };
                if !sink.emit(SensorEvent::Gps(fix)) {
                    debug!("[gps] Tracker gone after {} fixes", fixes);
                    break;
                }
                fixes += 1;
            }
        });
        Ok(Subscription::from_task("gps", task))
    }
}

/// `termux-sensor -l` output: `{"sensors": ["...", ...]}`
fn has_pressure_sensor(output: &str) -> bool {
    let Ok(json) = serde_json::from_str::<Value>(output) else {
        return false;
    };
    json.get("sensors")
        .and_then(Value::as_array)
        .map(|names| {
            names.iter().filter_map(Value::as_str).any(|name| {
                let name = name.to_lowercase();
                name.contains("pressure") || name.contains("barometer")
            })
        })
        .unwrap_or(false)
}

/// `termux-sensor -n 1` output: `{"<sensor name>": {"values": [..]}}`
fn parse_sensor_values(output: &str) -> Option<Vec<f64>> {
    let json: Value = serde_json::from_str(output.trim()).ok()?;
    json.as_object()?
        .values()
        .find_map(|sensor| sensor.get("values")?.as_array().cloned())
        .map(|values| values.iter().filter_map(Value::as_f64).collect())
        .filter(|values: &Vec<f64>| !values.is_empty())
}

/// `termux-location` output. A fix without altitude is still a fix.
fn parse_location(output: &str, timestamp: i64) -> Option<GpsSample> {
    let json: Value = serde_json::from_str(output.trim()).ok()?;
    json.get("latitude")?.as_f64()?;
    Some(GpsSample {
        altitude: json.get("altitude").and_then(Value::as_f64),
        vertical_accuracy: json.get("vertical_accuracy").and_then(Value::as_f64),
        accuracy: json.get("accuracy").and_then(Value::as_f64),
        timestamp,
    })
}
