use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Standard gravity subtracted from the device z axis to get linear vertical acceleration.
pub const GRAVITY: f64 = 9.81;

/// Barometer reading from the platform sensor layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// hPa
    pub pressure: Option<f64>,
    /// °C
    pub temperature: Option<f64>,
    /// Relative humidity in percent, `None` when the sensor does not report it
    #[serde(default)]
    pub humidity: Option<f64>,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl SensorSample {
    pub fn new(pressure: f64, temperature: Option<f64>, timestamp: i64) -> Self {
        Self {
            pressure: Some(pressure),
            temperature,
            humidity: None,
            timestamp,
        }
    }

    pub fn with_humidity(mut self, humidity: f64) -> Self {
        self.humidity = Some(humidity);
        self
    }
}

/// Accelerometer sample in the device frame (m/s²)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: i64,
}

impl AccelSample {
    pub fn new(x: f64, y: f64, z: f64, timestamp: i64) -> Self {
        Self { x, y, z, timestamp }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Vertical acceleration with gravity removed, assuming z is aligned with the vertical axis.
    pub fn linear_z(&self) -> f64 {
        self.z - GRAVITY
    }
}

/// GPS fix. Every field but the timestamp is optional because the location
/// provider may be unavailable or permission-denied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsSample {
    pub altitude: Option<f64>,
    pub vertical_accuracy: Option<f64>,
    /// Horizontal accuracy, used when the provider reports no vertical accuracy
    pub accuracy: Option<f64>,
    pub timestamp: i64,
}

impl GpsSample {
    pub fn new(altitude: Option<f64>, vertical_accuracy: Option<f64>, timestamp: i64) -> Self {
        Self {
            altitude,
            vertical_accuracy,
            accuracy: None,
            timestamp,
        }
    }

    /// Best available accuracy estimate for the altitude.
    pub fn altitude_accuracy(&self) -> Option<f64> {
        self.vertical_accuracy.or(self.accuracy)
    }
}

/// Magnetometer sample (µT)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MagSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: i64,
}

/// Latest value seen on every sensor channel.
///
/// One record for every device capability: channels the platform never
/// reports stay `None`, and consumers work over whichever subset is populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSet {
    pub pressure: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub accel: Option<AccelSample>,
    pub gps_altitude: Option<f64>,
    pub gps_accuracy: Option<f64>,
    pub magnetometer: Option<MagSample>,
    pub light_lux: Option<f64>,
    pub step_count: u32,
}

impl SensorSet {
    pub fn record_barometer(&mut self, sample: &SensorSample) {
        if let Some(pressure) = sample.pressure {
            self.pressure = Some(pressure);
        }
        if let Some(temperature) = sample.temperature {
            self.temperature = Some(temperature);
        }
        if let Some(humidity) = sample.humidity {
            self.humidity = Some(humidity);
        }
    }

    pub fn record_gps(&mut self, sample: &GpsSample) {
        self.gps_altitude = sample.altitude;
        self.gps_accuracy = sample.altitude_accuracy();
    }
}

/// One diagnostic point per fused estimate. Never fed back into the filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub height: f64,
    pub gps_height: Option<f64>,
    pub fused_height: f64,
    pub velocity: f64,
    pub timestamp: i64,
    pub is_moving: bool,
}

/// Source of epoch-millisecond wall time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used by tests and simulated devices.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accel_magnitude() {
        let accel = AccelSample::new(3.0, 4.0, 0.0, 0);
        assert_eq!(accel.magnitude(), 5.0);
    }

    #[test]
    fn test_linear_z_removes_gravity() {
        let accel = AccelSample::new(0.0, 0.0, GRAVITY + 0.5, 0);
        assert!((accel.linear_z() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_gps_accuracy_fallback() {
        let mut gps = GpsSample::new(Some(120.0), None, 0);
        assert_eq!(gps.altitude_accuracy(), None);

        gps.accuracy = Some(12.0);
        assert_eq!(gps.altitude_accuracy(), Some(12.0));

        gps.vertical_accuracy = Some(4.0);
        assert_eq!(gps.altitude_accuracy(), Some(4.0));
    }

    #[test]
    fn test_sensor_set_keeps_last_known_temperature() {
        let mut set = SensorSet::default();
        set.record_barometer(&SensorSample::new(1000.0, Some(18.0), 0));
        set.record_barometer(&SensorSample::new(1001.0, None, 50));

        assert_eq!(set.pressure, Some(1001.0));
        assert_eq!(set.temperature, Some(18.0));
    }

    #[test]
    fn test_sensor_set_records_dry_reading() {
        let mut set = SensorSet::default();
        set.record_barometer(&SensorSample::new(1000.0, Some(18.0), 0).with_humidity(60.0));
        set.record_barometer(&SensorSample::new(1000.0, Some(18.0), 50));
        assert_eq!(set.humidity, Some(60.0));

        set.record_barometer(&SensorSample::new(1000.0, Some(18.0), 100).with_humidity(0.0));
        assert_eq!(set.humidity, Some(0.0));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }
}
