// Vertical tracking library: barometric altitude, accelerometer/GPS fusion
// and multi-device height sync. The binary in main.rs hosts it on tokio.

pub mod altitude;
pub mod calibration;
pub mod config;
pub mod confidence;
pub mod error;
pub mod filters;
pub mod history;
pub mod live_status;
pub mod motion;
pub mod sensors;
pub mod service;
pub mod store;
pub mod sync;
pub mod tracker;
pub mod types;

pub use altitude::AltitudeConverter;
pub use calibration::{CalibrationState, CalibrationStore};
pub use config::TrackerConfig;
pub use error::{Persisted, TrackerError, TrackerResult};
pub use filters::{VerticalFilter, VerticalFilterConfig, VerticalFilterState};
pub use motion::MotionClassifier;
pub use service::{EventSink, TrackerHandle, TrackerService};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use sync::{DeviceDiscovery, DeviceRecord, DeviceSyncCoordinator, NearbyDevice};
pub use tracker::{AcquisitionMode, SensorEvent, TrackerSnapshot, VerticalTracker};
pub use types::{AccelSample, Clock, GpsSample, HistoryPoint, ManualClock, SensorSample, SystemClock};
