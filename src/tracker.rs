//! Event-driven vertical tracking core.
//!
//! `VerticalTracker` owns every piece of mutable state (calibration, filter,
//! motion classifier, sync registry, history, latest sensor values) and is
//! driven through [`VerticalTracker::handle`], one event at a time. Hosts
//! read [`TrackerSnapshot`]s instead of holding state themselves.

use crate::altitude::AltitudeConverter;
use crate::calibration::{CalibrationState, CalibrationStore};
use crate::confidence;
use crate::config::TrackerConfig;
use crate::error::{ensure_finite, Persisted, TrackerError, TrackerResult};
use crate::filters::{UpdateOutcome, VerticalFilter};
use crate::history::HistoryBuffer;
use crate::motion::MotionClassifier;
use crate::store::KeyValueStore;
use crate::sync::{DeviceRecord, DeviceSyncCoordinator};
use crate::types::{AccelSample, Clock, GpsSample, HistoryPoint, MagSample, SensorSample, SensorSet};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SensorEvent {
    Barometer(SensorSample),
    Accel(AccelSample),
    Gps(GpsSample),
    Magnetometer(MagSample),
    Light { lux: f64, timestamp: i64 },
    Steps { count: u32, timestamp: i64 },
}

impl SensorEvent {
    pub fn timestamp(&self) -> i64 {
        match self {
            SensorEvent::Barometer(s) => s.timestamp,
            SensorEvent::Accel(s) => s.timestamp,
            SensorEvent::Gps(s) => s.timestamp,
            SensorEvent::Magnetometer(s) => s.timestamp,
            SensorEvent::Light { timestamp, .. } | SensorEvent::Steps { timestamp, .. } => *timestamp,
        }
    }
}

/// Where samples currently come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionMode {
    Idle,
    Real,
    Simulated,
}

/// Derived state after the latest event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub timestamp: i64,
    /// Fused height with the sync offset applied
    pub height: f64,
    pub fused_height: f64,
    pub velocity: f64,
    pub baro_height: Option<f64>,
    pub gps_height: Option<f64>,
    pub gps_accuracy: Option<f64>,
    pub pressure: Option<f64>,
    pub temperature: Option<f64>,
    pub is_moving: bool,
    pub confidence: u8,
    pub calibrated: bool,
    /// False until the filter has produced an estimate
    pub has_estimate: bool,
    pub baro_bias: f64,
    pub sync_offset: f64,
    /// Devices synced within the stale window
    pub connected_devices: usize,
    /// Mean height of the connected devices, 0 when there are none
    pub group_height: f64,
    pub mode: AcquisitionMode,
}

pub struct VerticalTracker {
    converter: AltitudeConverter,
    calibration: CalibrationStore,
    filter: VerticalFilter,
    motion: MotionClassifier,
    sync: DeviceSyncCoordinator,
    history: HistoryBuffer,
    sensors: SensorSet,
    baro_height: Option<f64>,
    last_event_ms: i64,
    mode: AcquisitionMode,
    skipped_ticks: u64,
}

impl VerticalTracker {
    pub fn new(config: &TrackerConfig, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            converter: AltitudeConverter::new(config.default_temperature_c),
            calibration: CalibrationStore::new(store.clone(), clock.clone()),
            filter: VerticalFilter::new(config.filter),
            motion: MotionClassifier::new(config.motion.window_size, config.motion.threshold),
            sync: DeviceSyncCoordinator::new(store, clock, config.sync.stale_window_ms),
            history: HistoryBuffer::new(config.history_capacity),
            sensors: SensorSet::default(),
            baro_height: None,
            last_event_ms: 0,
            mode: AcquisitionMode::Idle,
            skipped_ticks: 0,
        }
    }

    /// Apply one sensor event and return the resulting state.
    ///
    /// A rejected event (validation error) leaves the state untouched.
    pub fn handle(&mut self, event: SensorEvent) -> TrackerResult<TrackerSnapshot> {
        match event {
            SensorEvent::Barometer(sample) => self.on_barometer(sample)?,
            SensorEvent::Accel(sample) => {
                for (axis, v) in [("accel x", sample.x), ("accel y", sample.y), ("accel z", sample.z)] {
                    ensure_finite(axis, v)?;
                }
                self.motion.add_sample(sample);
                self.sensors.accel = Some(sample);
            }
            SensorEvent::Gps(sample) => {
                if let Some(altitude) = sample.altitude {
                    ensure_finite("gps altitude", altitude)?;
                }
                self.sensors.record_gps(&sample);
            }
            SensorEvent::Magnetometer(sample) => self.sensors.magnetometer = Some(sample),
            SensorEvent::Light { lux, .. } => self.sensors.light_lux = Some(ensure_finite("light", lux)?),
            SensorEvent::Steps { count, .. } => self.sensors.step_count = count,
        }
        self.last_event_ms = self.last_event_ms.max(event.timestamp());
        Ok(self.snapshot())
    }

    fn on_barometer(&mut self, sample: SensorSample) -> TrackerResult<()> {
        // Fill channels this sample lacks from the last known values
        let effective = SensorSample {
            temperature: sample.temperature.or(self.sensors.temperature),
            humidity: sample.humidity.or(self.sensors.humidity),
            ..sample
        };
        let baro_height = self.converter.convert(&effective, self.calibration.current())?;
        self.sensors.record_barometer(&sample);

        let Some(baro_height) = baro_height else {
            return Ok(());
        };
        self.baro_height = Some(baro_height);

        let Some(accel) = self.sensors.accel else {
            self.skipped_ticks += 1;
            debug!("No accelerometer sample yet, skipping fusion tick");
            return Ok(());
        };

        let gps_height = self.sensors.gps_altitude;
        let outcome = self.filter.update(baro_height, gps_height, accel.linear_z(), sample.timestamp);
        if let UpdateOutcome::Reseeded(reason) = outcome {
            debug!("Filter reseeded at {} ({:?})", sample.timestamp, reason);
        }

        self.history.push(HistoryPoint {
            height: baro_height,
            gps_height,
            fused_height: self.filter.altitude(),
            velocity: self.filter.vertical_velocity(),
            timestamp: sample.timestamp,
            is_moving: self.motion.is_moving(),
        });
        Ok(())
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let fused = self.filter.altitude();
        TrackerSnapshot {
            timestamp: self.last_event_ms,
            height: self.sync.apply_sync_offset(fused),
            fused_height: fused,
            velocity: self.filter.vertical_velocity(),
            baro_height: self.baro_height,
            gps_height: self.sensors.gps_altitude,
            gps_accuracy: self.sensors.gps_accuracy,
            pressure: self.sensors.pressure,
            temperature: self.sensors.temperature,
            is_moving: self.motion.is_moving(),
            confidence: confidence::score(&self.sensors),
            calibrated: self.calibration.is_calibrated(),
            has_estimate: self.filter.is_seeded(),
            baro_bias: self.filter.baro_bias(),
            sync_offset: self.sync.sync_offset(),
            connected_devices: self.sync.connected_devices().len(),
            group_height: self.sync.compute_group_sync(),
            mode: self.mode,
        }
    }

    /// Calibrate against explicit readings.
    pub fn calibrate(
        &mut self,
        pressure: f64,
        temperature: f64,
        known_height: f64,
    ) -> TrackerResult<Persisted<CalibrationState>> {
        let result = self.calibration.calibrate(pressure, temperature, known_height)?;
        self.on_reference_changed();
        Ok(result)
    }

    /// Calibrate at the current location using the latest barometer reading.
    pub fn calibrate_here(&mut self, known_height: f64) -> TrackerResult<Persisted<CalibrationState>> {
        let pressure = self
            .sensors
            .pressure
            .ok_or_else(|| TrackerError::Validation("no pressure reading to calibrate against".into()))?;
        let temperature = self
            .sensors
            .temperature
            .unwrap_or(self.converter.default_temperature());
        self.calibrate(pressure, temperature, known_height)
    }

    /// Apply the result of the startup calibration load.
    pub fn restore_calibration(&mut self, loaded: TrackerResult<Option<CalibrationState>>) {
        match loaded {
            Ok(state) => {
                let was_calibrated = self.calibration.is_calibrated();
                self.calibration.restore(state);
                if !was_calibrated && self.calibration.is_calibrated() {
                    self.on_reference_changed();
                }
            }
            Err(e) => warn!("Could not load calibration, running uncalibrated: {}", e),
        }
    }

    pub fn clear_calibration(&mut self) -> Persisted<()> {
        let result = self.calibration.clear();
        self.on_reference_changed();
        result
    }

    // A new reference shifts every height at once; restart the filter rather
    // than letting it glide to the new level.
    fn on_reference_changed(&mut self) {
        self.filter.reset();
        self.baro_height = None;
    }

    /// Sync the displayed height to a reference read from another device.
    pub fn apply_manual_sync(&mut self, remote_height: f64) -> TrackerResult<Persisted<f64>> {
        ensure_finite("remote height", remote_height)?;
        if !self.filter.is_seeded() {
            return Err(TrackerError::Validation("no height estimate to sync yet".into()));
        }
        self.sync.apply_manual_sync(remote_height, self.filter.altitude())
    }

    pub fn register_device(&mut self, id: &str, height: f64) -> TrackerResult<Persisted<DeviceRecord>> {
        ensure_finite("device height", height)?;
        Ok(self.sync.register_device(id, height))
    }

    pub fn update_device_height(&mut self, id: &str, height: f64) -> TrackerResult<bool> {
        ensure_finite("device height", height)?;
        Ok(self.sync.update_device_height(id, height))
    }

    /// Devices still considered connected. Older records stay registered.
    pub fn connected_devices(&self) -> Vec<DeviceRecord> {
        self.sync.connected_devices()
    }

    pub fn load_sync_state(&mut self) -> TrackerResult<()> {
        self.sync.load()
    }

    pub fn set_mode(&mut self, mode: AcquisitionMode) {
        if self.mode != mode {
            info!("Acquisition mode: {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
        }
    }

    /// Drop filter, motion and history state. Calibration and sync are kept.
    pub fn reset(&mut self) {
        self.filter.reset();
        self.motion.clear();
        self.history.clear();
        self.baro_height = None;
    }

    pub fn sync(&self) -> &DeviceSyncCoordinator {
        &self.sync
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn calibration(&self) -> Option<&CalibrationState> {
        self.calibration.current()
    }

    pub fn sensors(&self) -> &SensorSet {
        &self.sensors
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks
    }
}
