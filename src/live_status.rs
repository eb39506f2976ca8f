use crate::tracker::{AcquisitionMode, TrackerSnapshot};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub mode: AcquisitionMode,
    // Heights (m)
    pub height: f64,
    pub fused_height: f64,
    pub baro_height: Option<f64>,
    pub gps_height: Option<f64>,
    pub gps_accuracy: Option<f64>,
    pub vertical_velocity: f64,
    // Raw readings
    pub pressure_hpa: Option<f64>,
    pub temperature_c: Option<f64>,
    pub is_moving: bool,
    pub confidence: u8,
    pub calibrated: bool,
    pub has_estimate: bool,
    pub baro_bias: f64,
    // Sync
    pub sync_offset: f64,
    pub connected_devices: usize,
    pub group_height: f64,
    pub history_points: usize,
}

impl LiveStatus {
    pub fn from_snapshot(snapshot: &TrackerSnapshot, uptime_seconds: u64) -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds,
            mode: snapshot.mode,
            height: snapshot.height,
            fused_height: snapshot.fused_height,
            baro_height: snapshot.baro_height,
            gps_height: snapshot.gps_height,
            gps_accuracy: snapshot.gps_accuracy,
            vertical_velocity: snapshot.velocity,
            pressure_hpa: snapshot.pressure,
            temperature_c: snapshot.temperature,
            is_moving: snapshot.is_moving,
            confidence: snapshot.confidence,
            calibrated: snapshot.calibrated,
            has_estimate: snapshot.has_estimate,
            baro_bias: snapshot.baro_bias,
            sync_offset: snapshot.sync_offset,
            connected_devices: snapshot.connected_devices,
            group_height: snapshot.group_height,
            history_points: 0,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// One-line summary for the periodic log
    pub fn summary(&self) -> String {
        let height = if self.has_estimate {
            format!("{:.2} m", self.height)
        } else if self.calibrated {
            "waiting for accel".to_string()
        } else {
            "uncalibrated".to_string()
        };
        format!(
            "[{:?}] height {} | v {:+.2} m/s | {} | conf {}% | p {} | devices {}",
            self.mode,
            height,
            self.vertical_velocity,
            if self.is_moving { "moving" } else { "still" },
            self.confidence,
            self.pressure_hpa
                .map(|p| format!("{p:.2} hPa"))
                .unwrap_or_else(|| "-".to_string()),
            self.connected_devices,
        )
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::store::MemoryStore;
    use crate::tracker::VerticalTracker;
    use crate::types::ManualClock;
    use std::sync::Arc;

    #[test]
    fn test_save_writes_json() {
        let tracker = VerticalTracker::new(
            &TrackerConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(0)),
        );
        let mut status = LiveStatus::from_snapshot(&tracker.snapshot(), 12);
        status.history_points = 3;
        assert!(status.summary().contains("uncalibrated"));

        let path = std::env::temp_dir().join(format!(
            "live_status_{}.json",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        status.save(&path).unwrap();

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["uptime_seconds"], 12);
        assert_eq!(json["history_points"], 3);
        assert_eq!(json["mode"], "Idle");
        fs::remove_file(&path).unwrap();
    }
}
